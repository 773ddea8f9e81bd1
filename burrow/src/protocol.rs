//! One connection: dialing with retry, handshake and version negotiation,
//! registration with read-only fallback, then the request/response
//! multiplexer until disconnect.
//!
//! Each connection attempt runs as one worker task. The client drives it
//! through a command channel and hears back through the shared event
//! channel; because a worker sends its events in the order it read the
//! frames, a reply is always delivered to the client before any
//! server-initiated call that followed it on the wire.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use burrow_protocol::{
    heartbeat_frame, message, message::method, Frame, FrameCodec, MsgId, Oid, ProtocolVersion,
    RemoteErrorKind, Revision, Tid, WireError, HEARTBEAT_MSG_ID,
};

use crate::client::{Event, ServerCall, StepToken};
use crate::completion::Resolver;
use crate::error::ClientError;
use crate::transport::{Dialer, IoStream, ServerAddr};
use crate::ReadOnly;

/// Identity of one connection attempt within a client.
pub(crate) type ConnId = u64;

/// Commands the client sends to a connection worker.
pub(crate) enum ProtoCmd {
    /// Ordinary call expecting a reply, delivered per `route`.
    Call {
        method: String,
        body: Vec<u8>,
        route: Route,
    },
    /// One-way call; the server sends no reply.
    CallAsync { method: String, body: Vec<u8> },
    /// Coalesced read. `waiter` is `None` for prefetches, whose only effect
    /// is the cache insertion the client performs on completion.
    LoadBefore {
        oid: Oid,
        tid: Tid,
        waiter: Option<Resolver<Option<Revision>>>,
    },
    /// Deliberate shutdown; pending completions are cancelled, not failed.
    Close,
}

/// Where a reply should be delivered.
pub(crate) enum Route {
    /// Straight back to the outside caller.
    Caller(Resolver<Vec<u8>>),
    /// To the client task, in order with server-initiated calls.
    Step(StepToken),
}

/// The per-connection slice of the client configuration.
#[derive(Clone)]
pub(crate) struct ProtoConfig {
    pub storage_key: String,
    pub read_only: ReadOnly,
    pub connect_poll: Duration,
    pub heartbeat_interval: Duration,
    pub jitter_seed: Option<u64>,
}

/// Client-side handle to a connection worker.
pub(crate) struct ProtocolHandle {
    pub id: ConnId,
    pub addr: ServerAddr,
    cmd: UnboundedSender<ProtoCmd>,
}

impl ProtocolHandle {
    /// Hands a command to the worker; gives it back if the worker is gone.
    pub fn send(&self, cmd: ProtoCmd) -> Result<(), ProtoCmd> {
        self.cmd.send(cmd).map_err(|err| err.0)
    }

    /// Asks the worker to shut down. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.cmd.send(ProtoCmd::Close);
    }
}

/// Spawns a worker for one address and returns its handle.
pub(crate) fn spawn(
    id: ConnId,
    addr: ServerAddr,
    dialer: Dialer,
    config: ProtoConfig,
    events: UnboundedSender<Event>,
) -> ProtocolHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let rng = match config.jitter_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let worker = Worker {
        id,
        addr: addr.clone(),
        dialer,
        config,
        events,
        cmd_rx,
        pending: HashMap::new(),
        next_msg_id: 0,
        rng,
    };
    tokio::spawn(worker.run());
    ProtocolHandle {
        id,
        addr,
        cmd: cmd_tx,
    }
}

enum Pending {
    Route(Route),
    Load {
        oid: Oid,
        tid: Tid,
        waiters: Vec<Resolver<Option<Revision>>>,
    },
}

enum Exit {
    /// Deliberate close; nobody is told.
    Closed,
    /// The connection died underneath us.
    Lost(String),
}

struct Worker {
    id: ConnId,
    addr: ServerAddr,
    dialer: Dialer,
    config: ProtoConfig,
    events: UnboundedSender<Event>,
    cmd_rx: UnboundedReceiver<ProtoCmd>,
    pending: HashMap<MsgId, Pending>,
    next_msg_id: u64,
    rng: StdRng,
}

impl Worker {
    async fn run(mut self) {
        let stream = match self.dial().await {
            Some(stream) => stream,
            None => return,
        };
        let mut framed = Framed::new(stream, FrameCodec);

        match self.run_connection(&mut framed).await {
            // deliberate close: dropping the pending resolvers cancels them
            Exit::Closed => {}
            Exit::Lost(reason) => {
                debug!(conn = self.id, addr = %self.addr, reason = %reason, "connection lost");
                self.fail_pending(&reason);
                let _ = self.events.send(Event::Disconnected { conn: self.id });
            }
        }
    }

    /// Dials until a connection is established or the worker is closed.
    async fn dial(&mut self) -> Option<IoStream> {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ProtoCmd::Close) | None => return None,
                    // calls cannot arrive before registration reports back
                    Some(_) => {}
                },
                dialed = self.dialer.connect(&self.addr) => match dialed {
                    Ok(stream) => return Some(stream),
                    Err(error) => {
                        info!(addr = %self.addr, %error, "connection failed, retrying");
                        time::sleep(self.config.connect_poll + self.jitter()).await;
                    }
                },
            }
        }
    }

    async fn run_connection(&mut self, framed: &mut Framed<IoStream, FrameCodec>) -> Exit {
        // The first inbound frame is the server's version tag, not a reply.
        let server_tag = match framed.next().await {
            Some(Ok(tag)) => tag,
            Some(Err(error)) => return Exit::Lost(format!("handshake failed: {error}")),
            None => return Exit::Lost("connection closed during handshake".to_owned()),
        };
        let version = match ProtocolVersion::negotiate(&server_tag) {
            Ok(version) => version,
            Err(_) => {
                let tag = String::from_utf8_lossy(&server_tag).into_owned();
                let _ = self.events.send(Event::RegisterFailed {
                    conn: self.id,
                    error: ClientError::UnsupportedVersion(tag),
                });
                return Exit::Closed;
            }
        };
        if let Err(reason) = Self::write(framed, Bytes::copy_from_slice(version.tag())).await {
            return Exit::Lost(reason);
        }

        match self.register(framed, version).await {
            Ok(()) => self.multiplex(framed).await,
            Err(exit) => exit,
        }
    }

    /// Issues the registration call, retrying once as read-only when the
    /// server refuses writes under the `Fallback` preference.
    async fn register(
        &mut self,
        framed: &mut Framed<IoStream, FrameCodec>,
        version: ProtocolVersion,
    ) -> Result<(), Exit> {
        let mut read_only = matches!(self.config.read_only, ReadOnly::Yes);
        let mut register_id = self.next_id();
        self.write_register(framed, register_id, read_only).await?;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ProtoCmd::Close) | None => return Err(Exit::Closed),
                    Some(_) => debug!(conn = self.id, "dropping command issued before registration"),
                },
                next = framed.next() => {
                    let frame = Self::decoded(next)?;
                    if frame.is_reply() && frame.id == register_id {
                        let reply = frame
                            .reply_body()
                            .map_err(|error| Exit::Lost(format!("bad reply body: {error}")))?;
                        match reply {
                            Ok(payload) => {
                                let server_tid: Option<Tid> = message::decode_args(&payload)
                                    .map_err(|error| {
                                        Exit::Lost(format!("bad register reply: {error}"))
                                    })?;
                                let _ = self.events.send(Event::Registered {
                                    conn: self.id,
                                    server_tid,
                                    read_only,
                                    version,
                                });
                                return Ok(());
                            }
                            Err(remote)
                                if remote.kind == RemoteErrorKind::ReadOnly
                                    && matches!(self.config.read_only, ReadOnly::Fallback)
                                    && !read_only =>
                            {
                                // the server refuses writes right now; take
                                // what we can get
                                read_only = true;
                                register_id = self.next_id();
                                self.write_register(framed, register_id, true).await?;
                            }
                            Err(remote) => {
                                let _ = self.events.send(Event::RegisterFailed {
                                    conn: self.id,
                                    error: ClientError::Server(remote),
                                });
                                return Err(Exit::Closed);
                            }
                        }
                    } else if frame.is_reply() {
                        warn!(conn = self.id, id = ?frame.id, "unmatched reply during registration");
                    } else {
                        self.dispatch_server_call(frame)?;
                    }
                }
            }
        }
    }

    /// The request/response multiplexer, running until close or loss.
    async fn multiplex(&mut self, framed: &mut Framed<IoStream, FrameCodec>) -> Exit {
        let mut heartbeat = time::interval_at(
            time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ProtoCmd::Close) | None => return Exit::Closed,
                    Some(ProtoCmd::Call { method, body, route }) => {
                        let id = self.next_id();
                        self.pending.insert(id, Pending::Route(route));
                        if let Err(reason) =
                            Self::write_frame(framed, &Frame::call(id, &method, body)).await
                        {
                            return Exit::Lost(reason);
                        }
                    }
                    Some(ProtoCmd::CallAsync { method, body }) => {
                        if let Err(reason) =
                            Self::write_frame(framed, &Frame::call_async(&method, body)).await
                        {
                            return Exit::Lost(reason);
                        }
                    }
                    Some(ProtoCmd::LoadBefore { oid, tid, waiter }) => {
                        if let Err(reason) = self.load_before(framed, oid, tid, waiter).await {
                            return Exit::Lost(reason);
                        }
                    }
                },
                next = framed.next() => match Self::decoded(next) {
                    Ok(frame) => {
                        if let Err(exit) = self.on_frame(frame) {
                            return exit;
                        }
                    }
                    Err(exit) => return exit,
                },
                _ = heartbeat.tick() => {
                    if let Err(reason) = Self::write(framed, heartbeat_frame()).await {
                        return Exit::Lost(reason);
                    }
                }
            }
        }
    }

    /// Issues a coalesced read: an in-flight read with the same structural
    /// key absorbs the new waiter without another frame hitting the wire.
    async fn load_before(
        &mut self,
        framed: &mut Framed<IoStream, FrameCodec>,
        oid: Oid,
        tid: Tid,
        waiter: Option<Resolver<Option<Revision>>>,
    ) -> Result<(), String> {
        let id = MsgId::Load { oid, tid };
        match self.pending.entry(id) {
            Entry::Occupied(mut entry) => {
                if let Pending::Load { waiters, .. } = entry.get_mut() {
                    waiters.extend(waiter);
                }
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(Pending::Load {
                    oid,
                    tid,
                    waiters: waiter.into_iter().collect(),
                });
                let body = message::encode_args(&message::LoadBefore { oid, tid })
                    .map_err(|err| format!("encode failed: {err}"))?;
                Self::write_frame(framed, &Frame::call(id, method::LOAD_BEFORE, body)).await
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), Exit> {
        if frame.is_reply() {
            let Some(pending) = self.pending.remove(&frame.id) else {
                if frame.id != HEARTBEAT_MSG_ID {
                    warn!(conn = self.id, id = ?frame.id, "unmatched reply");
                }
                return Ok(());
            };
            let reply = frame
                .reply_body()
                .map_err(|error| Exit::Lost(format!("bad reply body: {error}")))?;
            if let Err(remote) = &reply {
                if !remote.kind.is_expected() {
                    // anything beyond missing keys and conflicts indicates a
                    // server-side anomaly worth recording
                    error!(
                        addr = %self.addr,
                        class = remote.kind.name(),
                        message = %remote.message,
                        "error from server",
                    );
                }
            }
            match pending {
                Pending::Route(Route::Caller(resolver)) => {
                    resolver.resolve(reply.map_err(ClientError::Server));
                }
                Pending::Route(Route::Step(token)) => {
                    let _ = self.events.send(Event::StepReply {
                        conn: self.id,
                        token,
                        result: reply.map_err(ClientError::Server),
                    });
                }
                Pending::Load { oid, tid, waiters } => {
                    let result = match reply {
                        Ok(payload) => match message::decode_args::<Option<Revision>>(&payload) {
                            Ok(revision) => Ok(revision),
                            Err(error) => {
                                return Err(Exit::Lost(format!("bad load_before reply: {error}")))
                            }
                        },
                        Err(remote) => Err(remote),
                    };
                    let _ = self.events.send(Event::LoadDone {
                        conn: self.id,
                        oid,
                        tid,
                        waiters,
                        result,
                    });
                }
            }
            Ok(())
        } else if !frame.is_async {
            // a synchronous server call would deadlock the executor
            Err(Exit::Lost(format!(
                "synchronous server call {:?}",
                frame.method
            )))
        } else {
            self.dispatch_server_call(frame)
        }
    }

    fn dispatch_server_call(&mut self, frame: Frame) -> Result<(), Exit> {
        let call = match frame.method.as_str() {
            method::INVALIDATE_TRANSACTION => {
                let args: message::InvalidateTransaction = Self::args(&frame)?;
                ServerCall::InvalidateTransaction {
                    tid: args.tid,
                    oids: args.oids,
                }
            }
            method::SERIALNOS => {
                let args: message::Serialnos = Self::args(&frame)?;
                ServerCall::Serialnos { items: args.items }
            }
            method::INFO => {
                let info: message::InfoMap = Self::args(&frame)?;
                ServerCall::Info { info }
            }
            method::BLOB_START => {
                let args: message::BlobStart = Self::args(&frame)?;
                ServerCall::BlobStart {
                    oid: args.oid,
                    serial: args.serial,
                }
            }
            method::BLOB_CHUNK => {
                let args: message::BlobChunk = Self::args(&frame)?;
                ServerCall::BlobChunk {
                    oid: args.oid,
                    serial: args.serial,
                    chunk: args.chunk,
                }
            }
            method::BLOB_STOP => {
                let args: message::BlobStop = Self::args(&frame)?;
                ServerCall::BlobStop {
                    oid: args.oid,
                    serial: args.serial,
                }
            }
            other => return Err(Exit::Lost(format!("unknown server call {other:?}"))),
        };
        let _ = self.events.send(Event::ServerCall {
            conn: self.id,
            call,
        });
        Ok(())
    }

    fn fail_pending(&mut self, reason: &str) {
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Route(Route::Caller(resolver)) => {
                    resolver.err(ClientError::disconnected(reason));
                }
                Pending::Route(Route::Step(token)) => {
                    let _ = self.events.send(Event::StepReply {
                        conn: self.id,
                        token,
                        result: Err(ClientError::disconnected(reason)),
                    });
                }
                Pending::Load { waiters, .. } => {
                    for waiter in waiters {
                        waiter.err(ClientError::disconnected(reason));
                    }
                }
            }
        }
    }

    async fn write_register(
        &mut self,
        framed: &mut Framed<IoStream, FrameCodec>,
        id: MsgId,
        read_only: bool,
    ) -> Result<(), Exit> {
        let args = message::Register {
            storage_key: self.config.storage_key.clone(),
            read_only,
        };
        let body = message::encode_args(&args)
            .map_err(|err| Exit::Lost(format!("encode failed: {err}")))?;
        Self::write_frame(framed, &Frame::call(id, method::REGISTER, body))
            .await
            .map_err(Exit::Lost)
    }

    fn next_id(&mut self) -> MsgId {
        self.next_msg_id += 1;
        MsgId::Seq(self.next_msg_id)
    }

    fn jitter(&mut self) -> Duration {
        Duration::from_secs_f64(self.rng.gen::<f64>())
    }

    fn decoded(next: Option<Result<Bytes, WireError>>) -> Result<Frame, Exit> {
        let raw = match next {
            Some(Ok(raw)) => raw,
            Some(Err(error)) => return Err(Exit::Lost(format!("read failed: {error}"))),
            None => return Err(Exit::Lost("connection lost".to_owned())),
        };
        Frame::decode(&raw).map_err(|error| Exit::Lost(format!("undecodable frame: {error}")))
    }

    fn args<T: DeserializeOwned>(frame: &Frame) -> Result<T, Exit> {
        message::decode_args(&frame.body)
            .map_err(|error| Exit::Lost(format!("bad {} arguments: {error}", frame.method)))
    }

    async fn write(
        framed: &mut Framed<IoStream, FrameCodec>,
        bytes: Bytes,
    ) -> Result<(), String> {
        framed
            .send(bytes)
            .await
            .map_err(|err| format!("write failed: {err}"))
    }

    async fn write_frame(
        framed: &mut Framed<IoStream, FrameCodec>,
        frame: &Frame,
    ) -> Result<(), String> {
        let bytes = frame
            .encode()
            .map_err(|err| format!("encode failed: {err}"))?;
        Self::write(framed, bytes).await
    }
}
