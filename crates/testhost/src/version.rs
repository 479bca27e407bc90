//! Version information advertised during the handshake.

use std::fmt;
use std::str::FromStr;

/// testhost version from Cargo.toml
pub const TESTHOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Default protocol family name.
pub const PROTOCOL_FAMILY: &str = "testhost";

/// `major.minor` protocol version. Peers are compatible when the majors are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid protocol version '{0}', expected major.minor")]
pub struct InvalidProtocolVersion(pub String);

impl FromStr for ProtocolVersion {
    type Err = InvalidProtocolVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidProtocolVersion(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}
