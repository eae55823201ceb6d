//! Content-derived block identifiers.

use std::fmt;
use std::str::FromStr;

use replicore_error::{ReplicoreError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 128-bit block identifier.
///
/// The canonical text form is the lowercase hyphenated hex string
/// (`8-4-4-4-12`). Parsing also accepts the 32-digit unhyphenated form and
/// uppercase digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockName(Uuid);

impl BlockName {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parse the canonical or compact hex form.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if !(trimmed.len() == 32 || trimmed.len() == 36) {
            return Err(ReplicoreError::integrity(format!(
                "malformed block name {trimmed:?}: expected 32 hex digits"
            )));
        }
        Uuid::try_parse(trimmed).map(Self).map_err(|error| {
            ReplicoreError::integrity(format!("malformed block name {trimmed:?}: {error}"))
        })
    }

    /// Canonical hyphenated form.
    #[must_use]
    pub fn to_hyphenated(&self) -> String {
        self.0.hyphenated().to_string()
    }

    /// Full `<dataset>#<block>` name.
    #[must_use]
    pub fn full_name(&self, dataset: &str) -> String {
        format!("{dataset}#{}", self.to_hyphenated())
    }
}

impl fmt::Display for BlockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for BlockName {
    type Err = ReplicoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BlockName {
    type Error = ReplicoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BlockName> for String {
    fn from(value: BlockName) -> Self {
        value.to_hyphenated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9";

    #[test]
    fn test_parse_canonical_and_compact() {
        let canonical = BlockName::parse(CANONICAL).unwrap();
        let compact = BlockName::parse("0A1B2C3D4E5F60718293A4B5C6D7E8F9").unwrap();
        assert_eq!(canonical, compact);
        assert_eq!(canonical.to_hyphenated(), CANONICAL);
        assert_eq!(canonical.as_bytes()[0], 0x0a);
        assert_eq!(canonical.as_bytes()[15], 0xf9);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(BlockName::parse("xyz").is_err());
        assert!(BlockName::parse("0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8fz").is_err());
        // urn and braced forms are not block names
        assert!(BlockName::parse(&format!("{{{CANONICAL}}}")).is_err());
    }

    #[test]
    fn test_full_name() {
        let name = BlockName::parse(CANONICAL).unwrap();
        let full = name.full_name("/A/B/RAW");
        assert_eq!(full, format!("/A/B/RAW#{CANONICAL}"));
        assert_eq!(full.rsplit('#').next().unwrap().parse::<BlockName>().unwrap(), name);
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let name = BlockName::parse(CANONICAL).unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, format!("\"{CANONICAL}\""));
        let back: BlockName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }
}
