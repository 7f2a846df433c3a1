//! Fingerprint generation.
//!
//! A fingerprint is the first 16 hex characters of a SHA-256 digest over the
//! prompt and, when present, a delimiter followed by the context. Truncation
//! keeps keys compact; collisions at 64 bits are an accepted risk and are not
//! handled.

use sha2::{Digest, Sha256};

/// Separator placed between prompt and context before hashing.
pub const CONTEXT_DELIMITER: &str = "\n---CONTEXT---\n";

/// Number of hex characters kept from the digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Fingerprint of a prompt and optional context. Pure and deterministic.
pub fn fingerprint(prompt: &str, context: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    if let Some(ctx) = context.filter(|c| !c.is_empty()) {
        hasher.update(CONTEXT_DELIMITER.as_bytes());
        hasher.update(ctx.as_bytes());
    }
    hex_prefix(&hasher.finalize())
}

/// Fingerprint of a context on its own, stored alongside records so callers
/// can tell which context a cached answer was produced under.
pub fn context_fingerprint(context: Option<&str>) -> Option<String> {
    context
        .filter(|c| !c.is_empty())
        .map(|c| fingerprint(c, None))
}

fn hex_prefix(digest: &[u8]) -> String {
    let mut out: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    out.truncate(FINGERPRINT_LEN);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint("explain fib(n)", Some("rust"));
        let b = fingerprint("explain fib(n)", Some("rust"));
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_depends_on_context() {
        let none = fingerprint("explain fib(n)", None);
        let py = fingerprint("explain fib(n)", Some("python"));
        let rs = fingerprint("explain fib(n)", Some("rust"));
        assert_ne!(none, py);
        assert_ne!(py, rs);
    }

    #[test]
    fn test_empty_context_matches_absent_context() {
        assert_eq!(fingerprint("hi", Some("")), fingerprint("hi", None));
        assert_eq!(context_fingerprint(Some("")), None);
    }

    #[test]
    fn test_known_digest_prefix() {
        // sha256("abc") = ba7816bf8f01cfea...
        assert_eq!(fingerprint("abc", None), "ba7816bf8f01cfea");
    }

    #[test]
    fn test_context_fingerprint() {
        assert_eq!(
            context_fingerprint(Some("shared ctx")),
            Some(fingerprint("shared ctx", None))
        );
        assert_eq!(context_fingerprint(None), None);
    }
}
