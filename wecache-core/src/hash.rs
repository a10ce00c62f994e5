//! Content hashing for ETags.

use sha2::{Digest, Sha256};

/// Raw SHA-256 digest.
pub type ContentHash = [u8; 32];

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// ETag for a serialized value: lowercase hex SHA-256 of the bytes.
///
/// Depends only on content, never on when it was cached.
pub fn compute_etag(serialized: &[u8]) -> String {
    hex::encode(compute_content_hash(serialized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_is_content_addressed() {
        let a = compute_etag(b"{\"title\":\"WE-0042\"}");
        let b = compute_etag(b"{\"title\":\"WE-0042\"}");
        let c = compute_etag(b"{\"title\":\"WE-0043\"}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_empty_content_hash() {
        assert_eq!(
            compute_etag(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
