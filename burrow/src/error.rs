use std::io;

use thiserror::Error;

use burrow_protocol::{RemoteError, WireError};

/// An error produced by the client engine.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ClientError {
    /// The session the call depended on is gone, or was never there.
    ///
    /// Outstanding calls on a lost connection all fail with this; so do
    /// calls issued before the first connection, and calls issued after
    /// [`close`](crate::ClientThread::close).
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The server advertised a protocol version outside the supported set.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),

    /// The peer broke the framing or dispatch rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A failure the server reported for this call.
    #[error(transparent)]
    Server(#[from] RemoteError),

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The call did not complete within its deadline.
    #[error("request timed out")]
    Timeout,
}

impl ClientError {
    pub(crate) fn disconnected(reason: impl Into<String>) -> ClientError {
        ClientError::Disconnected(reason.into())
    }
}
