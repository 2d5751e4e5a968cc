use sha1::{Digest, Sha1};

use crate::util::base64::base64_encode_bytes;

pub fn sha1_digest(data: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data.as_ref());
    let result = hasher.finalize();
    let mut buf = [0u8; 20];
    buf.copy_from_slice(&result);
    buf
}

/// SHA-1 digest encoded with the standard base64 alphabet, the format used for
/// node hashes sent alongside conditional writes.
pub fn sha1_base64(data: impl AsRef<[u8]>) -> String {
    base64_encode_bytes(&sha1_digest(data))
}
