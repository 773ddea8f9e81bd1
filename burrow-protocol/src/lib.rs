//! # burrow-protocol
//!
//! Wire model for the Burrow object-store protocol: version tags and
//! negotiation, the framed message model with its length-delimited codec,
//! typed payloads for the fixed method repertoire, and the error taxonomy
//! that crosses the wire.
//!
//! The protocol is a framed binary RPC stream. After the transport is
//! established the server sends a single raw version tag frame; every frame
//! after that is an encoded [`Frame`]. Replies are matched to calls by
//! message id; asynchronous frames never receive a reply.

#![warn(missing_docs)]
#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]

use std::fmt;

use serde::{Deserialize, Serialize};

mod error;
pub use error::{RemoteError, RemoteErrorKind, WireError};

mod frame;
pub use frame::{
    heartbeat_frame, read_frame, write_frame, Frame, FrameCodec, MsgId, HEARTBEAT_MSG_ID,
    MAX_FRAME_LEN, REPLY_METHOD,
};

pub mod message;
pub use message::{InfoMap, Revision};

mod version;
pub use version::{ProtocolVersion, UnknownVersion, VERSION_TAGS};

/// Identifier of a persistent object, opaque to the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid(pub u64);

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Identifier of a committed transaction.
///
/// Tids are opaque tokens with a total order; a store hands them out in
/// non-decreasing order, so comparing two tids answers "which state is
/// newer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tid(pub u64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
