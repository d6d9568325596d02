//! Content fingerprints for mutable text fields.
//!
//! Cache entries keep a fingerprint of display names and cards instead of the
//! text itself, so "did this change" is a single integer comparison.

use serde::{Deserialize, Serialize};
use std::fmt;

/// First eight bytes of the BLAKE3 digest of a text value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprint of the empty string. Absent text fingerprints the same.
    pub const EMPTY: Fingerprint = Fingerprint(0xaf13_49b9_f5f9_a1a6);

    pub fn of(text: &str) -> Self {
        let digest = blake3::hash(text.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        Fingerprint(u64::from_be_bytes(head))
    }

    pub fn of_opt(text: Option<&str>) -> Self {
        text.map(Self::of).unwrap_or(Self::EMPTY)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_constant_matches_digest() {
        assert_eq!(Fingerprint::of(""), Fingerprint::EMPTY);
        assert_eq!(Fingerprint::of_opt(None), Fingerprint::of(""));
    }

    #[test]
    fn test_distinct_text_distinct_fingerprint() {
        assert_ne!(Fingerprint::of("Alice"), Fingerprint::of("alice"));
        assert_eq!(Fingerprint::of("Alice"), Fingerprint::of_opt(Some("Alice")));
    }

    #[test]
    fn test_display_is_fixed_width_hex() {
        assert_eq!(Fingerprint::EMPTY.to_string().len(), 16);
    }
}
