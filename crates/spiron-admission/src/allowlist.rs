//! Peer allowlist.

use regex::Regex;

use crate::error::{Error, Result};

/// Permits peers whose identity matches a configured pattern.
///
/// The pattern must match the whole identity string. An empty pattern
/// permits everyone.
#[derive(Debug, Clone)]
pub struct PeerAllowlist {
    pattern: Option<Regex>,
}

impl PeerAllowlist {
    /// Build from a pattern string; empty or blank means permit all.
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Ok(Self::permit_all());
        }
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored).map_err(|source| Error::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: Some(regex),
        })
    }

    pub fn permit_all() -> Self {
        Self { pattern: None }
    }

    /// Whether `peer` may send broadcasts.
    pub fn permits(&self, peer: &str) -> bool {
        self.pattern.as_ref().map_or(true, |re| re.is_match(peer))
    }

    /// Whether any restriction is configured.
    pub fn is_restricted(&self) -> bool {
        self.pattern.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pattern_permits_everyone() {
        let list = PeerAllowlist::new("").unwrap();
        assert!(!list.is_restricted());
        assert!(list.permits("10.0.0.1"));
        assert!(list.permits(""));
    }

    #[test]
    fn pattern_must_match_whole_identity() {
        let list = PeerAllowlist::new(r"10\.0\.0\.\d+").unwrap();
        assert!(list.permits("10.0.0.7"));
        assert!(!list.permits("10.0.0.7.evil"));
        assert!(!list.permits("192.168.1.1"));
    }

    #[test]
    fn alternation_is_anchored_as_a_whole() {
        let list = PeerAllowlist::new("a|b").unwrap();
        assert!(list.permits("a"));
        assert!(list.permits("b"));
        assert!(!list.permits("ab"));
    }

    #[test]
    fn bad_pattern_is_an_error() {
        assert!(matches!(
            PeerAllowlist::new("("),
            Err(Error::InvalidPattern { .. })
        ));
    }
}
