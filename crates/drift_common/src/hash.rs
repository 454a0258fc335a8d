//! Content checksums used for drift comparison and rollback verification.

use sha2::{Digest, Sha256};

/// SHA-256 of raw content, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of content with all ASCII whitespace removed, lowercase hex.
///
/// Two files whose normalized hashes agree differ only in whitespace, which
/// the classifier treats as low severity.
pub fn normalized_sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for chunk in bytes.split(|b| b.is_ascii_whitespace()) {
        hasher.update(chunk);
    }
    hex::encode(hasher.finalize())
}

/// True when `s` looks like a SHA-256 hex digest.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_value() {
        // sha256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_normalized_ignores_whitespace() {
        let a = normalized_sha256_hex(b"server {\n  listen 80;\n}\n");
        let b = normalized_sha256_hex(b"server{listen 80;}");
        assert_eq!(a, b);

        let c = normalized_sha256_hex(b"server{listen 8080;}");
        assert_ne!(a, c);
    }

    #[test]
    fn test_normalized_differs_from_plain() {
        let content = b"hello world";
        assert_ne!(sha256_hex(content), normalized_sha256_hex(content));
    }

    #[test]
    fn test_is_sha256_hex() {
        assert!(is_sha256_hex(&sha256_hex(b"x")));
        assert!(!is_sha256_hex("abc123"));
        assert!(!is_sha256_hex(&"g".repeat(64)));
    }
}
