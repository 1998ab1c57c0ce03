use rand::RngCore;
use sha2::{Digest, Sha256};

/// Opaque identifier such as `prop-3f9c0a1b2d4e5f60`.
pub fn new_id(prefix: &str) -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}-{}", prefix, hex::encode(bytes))
}

/// Hex SHA-256 over the given parts, separated by `|`.
pub fn chain_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
