pub mod base64;
pub mod sha1;

pub use base64::base64_encode_bytes;
pub use sha1::{sha1_base64, sha1_digest};
