use sha2::{Digest, Sha256};

/// Hash a string with SHA256, hex encoded
pub fn hash_data(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
