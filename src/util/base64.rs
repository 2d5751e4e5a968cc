use base64::engine::general_purpose::STANDARD;
use base64::engine::Engine as _;

/// Encodes raw bytes with the standard, padded base64 alphabet.
pub fn base64_encode_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
