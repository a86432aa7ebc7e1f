//! Short content digests used to detect drift between index and disk.

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the full SHA-256 digest.
pub const SHORT_HASH_LEN: usize = 16;

/// First [`SHORT_HASH_LEN`] hex chars of the SHA-256 of `content`.
pub fn short_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(digest)[..SHORT_HASH_LEN].to_string()
}
