//! Typed payloads for the fixed method repertoire.
//!
//! Frame bodies are bincode-encoded values of the types in this module.
//! Reply payload types, where not a struct of their own: `register` answers
//! `Option<Tid>` (a server may defer to a follow-up `last_transaction`),
//! `last_transaction` and `tpc_finish` answer a bare [`Tid`](crate::Tid),
//! `get_invalidations` answers `Option<Invalidations>`, `load_before`
//! answers `Option<Revision>`, and `get_info` answers an [`InfoMap`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, WireError};
use crate::{Oid, Tid};


/// Wire method names.
pub mod method {
    /// Registers a session for a storage; the reply carries the server's
    /// last committed tid when it has one at hand.
    pub const REGISTER: &str = "register";
    /// Asks for the server's last committed tid.
    pub const LAST_TRANSACTION: &str = "last_transaction";
    /// Asks for every object invalidated since a given tid.
    pub const GET_INVALIDATIONS: &str = "get_invalidations";
    /// Fetches the server's info mapping.
    pub const GET_INFO: &str = "get_info";
    /// Reads the revision of an object visible before a tid.
    pub const LOAD_BEFORE: &str = "load_before";
    /// Finishes a two-phase commit.
    pub const TPC_FINISH: &str = "tpc_finish";

    /// Server call: objects invalidated by a committed transaction.
    pub const INVALIDATE_TRANSACTION: &str = "invalidate_transaction";
    /// Server call: per-object outcomes of a transaction vote.
    pub const SERIALNOS: &str = "serialnos";
    /// Server call: updated info mapping.
    pub const INFO: &str = "info";
    /// Server call: start of a blob stream.
    pub const BLOB_START: &str = "blob_start";
    /// Server call: one chunk of a blob stream.
    pub const BLOB_CHUNK: &str = "blob_chunk";
    /// Server call: end of a blob stream.
    pub const BLOB_STOP: &str = "blob_stop";
}

/// Server info, a flat string mapping.
pub type InfoMap = BTreeMap<String, String>;

/// Arguments of [`method::REGISTER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    /// Which storage on the server to register against.
    pub storage_key: String,
    /// Whether the session should be read-only.
    pub read_only: bool,
}

/// Arguments of [`method::GET_INVALIDATIONS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetInvalidations {
    /// The tid the client's cache currently reflects.
    pub tid: Tid,
}

/// Reply of [`method::GET_INVALIDATIONS`] when the gap is small enough to
/// enumerate. A `None` reply means the requested tid is too far behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidations {
    /// The server's last committed tid.
    pub tid: Tid,
    /// Every object invalidated after the requested tid.
    pub oids: Vec<Oid>,
}

/// Arguments of [`method::LOAD_BEFORE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBefore {
    /// Object to read.
    pub oid: Oid,
    /// Bound: the returned revision must be the one visible before this tid.
    pub tid: Tid,
}

/// One stored object revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Object state.
    pub data: Vec<u8>,
    /// Tid of the transaction that wrote this revision.
    pub start: Tid,
    /// Tid of the transaction that superseded it, if any.
    pub end: Option<Tid>,
}

/// Arguments of [`method::TPC_FINISH`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpcFinish {
    /// The voted transaction to finish.
    pub tid: Tid,
}

/// Arguments of the [`method::INVALIDATE_TRANSACTION`] server call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateTransaction {
    /// Tid of the committed transaction.
    pub tid: Tid,
    /// Objects it wrote.
    pub oids: Vec<Oid>,
}

/// Arguments of the [`method::SERIALNOS`] server call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Serialnos {
    /// Per-object outcome: the assigned serial, or the failure that rejected
    /// the object.
    pub items: Vec<(Oid, Result<Tid, RemoteError>)>,
}

/// Arguments of the [`method::BLOB_START`] server call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStart {
    /// Object the blob belongs to.
    pub oid: Oid,
    /// Serial of the blob revision.
    pub serial: Tid,
}

/// Arguments of the [`method::BLOB_CHUNK`] server call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobChunk {
    /// Object the blob belongs to.
    pub oid: Oid,
    /// Serial of the blob revision.
    pub serial: Tid,
    /// The next run of blob bytes.
    pub chunk: Vec<u8>,
}

/// Arguments of the [`method::BLOB_STOP`] server call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStop {
    /// Object the blob belongs to.
    pub oid: Oid,
    /// Serial of the blob revision.
    pub serial: Tid,
}

/// Encodes a payload value into a frame body.
pub fn encode_args<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    bincode::serialize(value).map_err(|err| WireError::Encode(err.to_string()))
}

/// Decodes a frame body into a payload value.
pub fn decode_args<T: DeserializeOwned>(raw: &[u8]) -> Result<T, WireError> {
    bincode::deserialize(raw).map_err(|err| WireError::Decode(err.to_string()))
}
