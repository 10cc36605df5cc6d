//! Batch Digests
//!
//! SHA-256 over (provider, direction, sorted symbol set). Symbol order and
//! duplicates do not change the digest, so reordered duplicate requests land
//! on the same L3 entry and the same in-flight query.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::{Direction, ProviderId};
use crate::error::{Error, Result};

const DIGEST_DOMAIN: &[u8] = b"symbol-cache/batch/v1";
const FIELD_SEP: u8 = 0x1f;
const SYMBOL_SEP: u8 = 0x1e;
const DIGEST_HEX_LEN: usize = 64;

/// Stable hex digest identifying a batch request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchDigest(String);

impl BatchDigest {
    /// Digest of a request; `symbols` may be unsorted and contain duplicates
    pub fn compute<S: AsRef<str>>(
        provider: &ProviderId,
        direction: Direction,
        symbols: &[S],
    ) -> Self {
        let mut sorted: Vec<&str> = symbols.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut hasher = Sha256::new();
        hasher.update(DIGEST_DOMAIN);
        hasher.update([FIELD_SEP]);
        hasher.update(provider.as_str().as_bytes());
        hasher.update([FIELD_SEP]);
        hasher.update(direction.as_str().as_bytes());
        hasher.update([FIELD_SEP]);
        for symbol in sorted {
            hasher.update(symbol.as_bytes());
            hasher.update([SYMBOL_SEP]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a digest previously handed out to a caller
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.len() != DIGEST_HEX_LEN {
            return Err(Error::InvalidDigest(format!(
                "expected {} hex characters, got {}",
                DIGEST_HEX_LEN,
                trimmed.len()
            )));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidDigest(format!(
                "'{}' is not hexadecimal",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deduplication key for this batch under a provider epoch
    pub fn dedup_key(&self, epoch: u64) -> String {
        format!("batch:{}@{}", self.0, epoch)
    }
}

impl std::fmt::Display for BatchDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn acme() -> ProviderId {
        ProviderId::from("acme")
    }

    #[test]
    fn test_digest_is_order_and_duplicate_insensitive() {
        let a = BatchDigest::compute(&acme(), Direction::ToStandard, &["AAA", "BBB", "CCC"]);
        let b = BatchDigest::compute(&acme(), Direction::ToStandard, &["CCC", "AAA", "BBB", "AAA"]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_digest_distinguishes_inputs() {
        let base = BatchDigest::compute(&acme(), Direction::ToStandard, &["AAA"]);
        assert_ne!(
            base,
            BatchDigest::compute(&acme(), Direction::FromStandard, &["AAA"])
        );
        assert_ne!(
            base,
            BatchDigest::compute(&ProviderId::from("beta"), Direction::ToStandard, &["AAA"])
        );
        // Separators keep ["AB"] and ["A", "B"] apart
        assert_ne!(
            BatchDigest::compute(&acme(), Direction::ToStandard, &["AB"]),
            BatchDigest::compute(&acme(), Direction::ToStandard, &["A", "B"])
        );
    }

    #[test]
    fn test_parse_roundtrip_and_rejection() {
        let digest = BatchDigest::compute(&acme(), Direction::ToStandard, &["AAA"]);
        assert_eq!(BatchDigest::parse(digest.as_str()).unwrap(), digest);
        assert_eq!(
            BatchDigest::parse(&digest.as_str().to_ascii_uppercase()).unwrap(),
            digest
        );

        assert_matches!(BatchDigest::parse("abc"), Err(Error::InvalidDigest(_)));
        assert_matches!(
            BatchDigest::parse(&"z".repeat(64)),
            Err(Error::InvalidDigest(_))
        );
    }

    #[test]
    fn test_dedup_key_includes_epoch() {
        let digest = BatchDigest::compute(&acme(), Direction::ToStandard, &["AAA"]);
        assert_ne!(digest.dedup_key(0), digest.dedup_key(1));
        assert!(digest.dedup_key(3).ends_with("@3"));
    }
}
