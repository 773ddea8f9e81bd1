//! Protocol version tags and negotiation.

use std::fmt;

/// The version tags this implementation understands, in ascending order.
///
/// Tags are compared byte-wise on the wire, so the ordering of this table and
/// the byte ordering of the tags must agree.
pub const VERSION_TAGS: [&[u8]; 5] = [b"BRW0", b"BRW1", b"BRW2", b"BRW3", b"BRW4"];

/// A negotiated protocol version.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion(&'static [u8]);

impl ProtocolVersion {
    /// The highest version this implementation speaks.
    pub const LATEST: ProtocolVersion = ProtocolVersion(VERSION_TAGS[4]);

    /// The raw tag bytes of this version.
    pub fn tag(&self) -> &'static [u8] {
        self.0
    }

    /// Negotiates against the tag advertised by a server.
    ///
    /// The chosen version is `min(server, LATEST)`: a server that is ahead of
    /// us is clamped to our maximum, a server that is behind picks its own
    /// tag. The result must still be a member of [`VERSION_TAGS`]; anything
    /// else is an unknown dialect and registration must not proceed.
    pub fn negotiate(server_tag: &[u8]) -> Result<ProtocolVersion, UnknownVersion> {
        let clamped = if server_tag > Self::LATEST.0 {
            Self::LATEST.0
        } else {
            server_tag
        };
        VERSION_TAGS
            .iter()
            .position(|tag| *tag == clamped)
            .map(|index| ProtocolVersion(VERSION_TAGS[index]))
            .ok_or_else(|| UnknownVersion(server_tag.to_vec()))
    }
}

impl fmt::Debug for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolVersion({})", String::from_utf8_lossy(self.0))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.0))
    }
}

/// The server advertised a version tag outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVersion(pub Vec<u8>);

impl fmt::Display for UnknownVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown protocol version {:?}",
            String::from_utf8_lossy(&self.0)
        )
    }
}

impl std::error::Error for UnknownVersion {}
