//! Content-addressing primitives.
//!
//! `phash` identifies a single MIME payload; `chash` identifies an
//! assembled message as a whole. Both are uppercase hex SHA-256 digests.

use sha2::{Digest, Sha256};

/// Payload hash of a single MIME part's raw bytes.
pub fn phash(payload: &[u8]) -> String {
    digest_hex(payload)
}

/// Content hash of an assembled canonical message (headers tree + bodies).
/// Callers feed in the canonical byte representation they want to dedupe on;
/// for a full message this is normally its raw RFC-822 bytes.
pub fn chash(canonical: &[u8]) -> String {
    digest_hex(canonical)
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    hex::encode_upper(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(phash(b"hello"), phash(b"hello"));
        assert_ne!(phash(b"hello"), phash(b"world"));
    }

    #[test]
    fn hash_is_uppercase_hex() {
        let h = phash(b"hello");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }
}
