//! Frame model and the length-delimited codec.
//!
//! Every frame on the wire is a 4-byte big-endian length prefix followed by
//! the frame body. The first body a server sends is its raw version tag;
//! every body after that is a bincode-encoded [`Frame`].

use std::io::{self, Read, Write};
use std::sync::OnceLock;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{RemoteError, WireError};
use crate::{Oid, Tid};


/// Upper bound on the body of a single frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Size of the length prefix preceding every frame body.
const LENGTH_PREFIX: usize = 4;

/// Method name carried by reply frames.
pub const REPLY_METHOD: &str = ".reply";

/// Message id used by heartbeat frames; never allocated to a real call.
pub const HEARTBEAT_MSG_ID: MsgId = MsgId::Seq(u64::MAX);

/// Identifier of one in-flight message.
///
/// Ordinary calls are numbered sequentially per connection. Coalesced
/// `load_before` reads are instead keyed structurally by `(oid, tid)`, so two
/// concurrent identical reads share one id and therefore one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgId {
    /// Sequentially numbered call.
    Seq(u64),
    /// Structural key of a coalesced read.
    Load {
        /// Object being read.
        oid: Oid,
        /// Read-before bound of the request.
        tid: Tid,
    },
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Message id; replies repeat the id of the call they answer.
    pub id: MsgId,
    /// Whether this frame expects no reply. Server-initiated calls are
    /// always async.
    pub is_async: bool,
    /// Method name, or [`REPLY_METHOD`] for replies.
    pub method: String,
    /// Encoded arguments or reply body.
    pub body: Vec<u8>,
}

impl Frame {
    /// Builds an ordinary call frame.
    pub fn call(id: MsgId, method: &str, body: Vec<u8>) -> Frame {
        Frame {
            id,
            is_async: false,
            method: method.to_owned(),
            body,
        }
    }

    /// Builds a one-way call frame. Async frames never receive a reply.
    pub fn call_async(method: &str, body: Vec<u8>) -> Frame {
        Frame {
            id: MsgId::Seq(0),
            is_async: true,
            method: method.to_owned(),
            body,
        }
    }

    /// Builds a reply frame for `id` carrying a tagged result.
    pub fn reply(id: MsgId, result: Result<Vec<u8>, RemoteError>) -> Result<Frame, WireError> {
        let body = bincode::serialize(&result).map_err(|err| WireError::Encode(err.to_string()))?;
        Ok(Frame {
            id,
            is_async: false,
            method: REPLY_METHOD.to_owned(),
            body,
        })
    }

    /// Whether this frame is a reply.
    pub fn is_reply(&self) -> bool {
        self.method == REPLY_METHOD
    }

    /// Decodes the tagged result out of a reply frame body.
    pub fn reply_body(&self) -> Result<Result<Vec<u8>, RemoteError>, WireError> {
        bincode::deserialize(&self.body).map_err(|err| WireError::Decode(err.to_string()))
    }

    /// Serializes this frame into one wire body.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|err| WireError::Encode(err.to_string()))
    }

    /// Deserializes a frame from one wire body.
    pub fn decode(raw: &[u8]) -> Result<Frame, WireError> {
        bincode::deserialize(raw).map_err(|err| WireError::Decode(err.to_string()))
    }
}

/// The constant keepalive frame: a reply with the sentinel id and an empty
/// body, pre-encoded once.
pub fn heartbeat_frame() -> Bytes {
    static FRAME: OnceLock<Bytes> = OnceLock::new();
    FRAME
        .get_or_init(|| {
            let frame = Frame {
                id: HEARTBEAT_MSG_ID,
                is_async: true,
                method: REPLY_METHOD.to_owned(),
                body: Vec::new(),
            };
            // a constant frame of plain data always encodes
            frame.encode().expect("heartbeat frame encodes")
        })
        .clone()
}

/// Length-delimited codec over raw frame bodies.
///
/// Decoding yields the body bytes without interpreting them, since the first
/// frame of a connection (the version tag) is not a [`Frame`].
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let length = BigEndian::read_u32(&src[..LENGTH_PREFIX]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge {
                length,
                max: MAX_FRAME_LEN,
            });
        }
        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), WireError> {
        if item.len() > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge {
                length: item.len(),
                max: MAX_FRAME_LEN,
            });
        }
        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(u32::try_from(item.len()).expect("length checked against MAX_FRAME_LEN"));
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Writes one length-prefixed frame body to a blocking writer.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame too large",
        ));
    }
    writer.write_u32::<BigEndian>(u32::try_from(body.len()).expect("length checked"))?;
    writer.write_all(body)?;
    writer.flush()
}

/// Reads one length-prefixed frame body from a blocking reader.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let length = match reader.read_u32::<BigEndian>() {
        Ok(length) => length as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    if length > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut body = vec![0; length];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}
