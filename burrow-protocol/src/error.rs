//! Error taxonomy: failures reported by the server inside reply frames, and
//! failures of the codec itself.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// A failure reported by the server for a single call.
///
/// Remote errors travel inside reply frames as the failure arm of a tagged
/// result. Older dialects of the protocol shipped an exception class as the
/// first element of the reply tuple instead; the tag replaces that shape, and
/// [`RemoteErrorKind`] carries the class name where one still matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// What category of failure the server reported.
    pub kind: RemoteErrorKind,
    /// Human-readable detail from the server.
    pub message: String,
}

impl RemoteError {
    /// Convenience constructor.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> RemoteError {
        RemoteError {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Categories of server-reported failure.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// The requested object or revision does not exist.
    KeyNotFound,
    /// The transaction lost an optimistic-concurrency race.
    Conflict,
    /// The server refused a writable session.
    ReadOnly,
    /// Any other server-side failure, carrying the server's class name.
    Server(String),
}

impl RemoteErrorKind {
    /// Whether this kind is an expected data error.
    ///
    /// Expected errors (missing keys, optimistic conflicts) are part of
    /// normal operation and are surfaced to the caller without being logged;
    /// everything else indicates a server-side anomaly worth recording.
    pub fn is_expected(&self) -> bool {
        matches!(self, RemoteErrorKind::KeyNotFound | RemoteErrorKind::Conflict)
    }

    /// The class name of this kind as reported in logs.
    pub fn name(&self) -> &str {
        match self {
            RemoteErrorKind::KeyNotFound => "KeyNotFound",
            RemoteErrorKind::Conflict => "Conflict",
            RemoteErrorKind::ReadOnly => "ReadOnly",
            RemoteErrorKind::Server(class) => class,
        }
    }
}

/// A failure of the codec layer: a frame that cannot be encoded, decoded or
/// transported.
#[non_exhaustive]
#[derive(Debug)]
pub enum WireError {
    /// A frame exceeded [`MAX_FRAME_LEN`](crate::MAX_FRAME_LEN).
    FrameTooLarge {
        /// The offending frame length.
        length: usize,
        /// The configured maximum.
        max: usize,
    },
    /// A value could not be serialized into a frame body.
    Encode(String),
    /// A frame body did not decode as the expected type.
    Decode(String),
    /// The underlying stream failed.
    Io(io::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::FrameTooLarge { length, max } => {
                write!(f, "frame of {length} bytes exceeds the {max} byte limit")
            }
            WireError::Encode(detail) => write!(f, "could not encode frame: {detail}"),
            WireError::Decode(detail) => write!(f, "could not decode frame: {detail}"),
            WireError::Io(err) => write!(f, "stream failure: {err}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> WireError {
        WireError::Io(err)
    }
}
