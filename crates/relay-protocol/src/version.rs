//! Protocol version negotiation.
//!
//! Clients announce their protocol revision with the `protocol` query
//! parameter of the connection URL.

use serde::{Deserialize, Serialize};

/// Newest protocol revision spoken by this server.
pub const PROTOCOL_VERSION: Version = Version(7);

/// Oldest protocol revision still accepted.
pub const MIN_PROTOCOL_VERSION: Version = Version(5);

/// A protocol revision number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u8);

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(revision: u8) -> Self {
        Self(revision)
    }

    /// Parse the value of a `protocol` query parameter.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse().ok().map(Self)
    }

    /// Check whether this server can talk to a client using this version.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(self)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_support() {
        assert!(Version::new(5).is_supported());
        assert!(Version::new(7).is_supported());
        assert!(!Version::new(4).is_supported());
        assert!(!Version::new(8).is_supported());
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(Version::parse("7"), Some(Version::new(7)));
        assert_eq!(Version::parse(" 6 "), Some(Version::new(6)));
        assert_eq!(Version::parse("seven"), None);
        assert_eq!(Version::parse("700"), None);
    }

    #[test]
    fn test_version_display() {
        assert_eq!(Version::new(7).to_string(), "7");
    }
}
