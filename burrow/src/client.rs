//! The client session: registration race across addresses, write-preference
//! upgrade, cache-coherence verification, call routing, and server-call
//! handling.
//!
//! All of this runs as one task on the I/O thread. Connection workers feed
//! it events over one ordered channel, so a reply the verification sequence
//! is waiting on is always handled before an invalidation the server sent
//! after that reply; readiness and `cache.set_last_tid` therefore
//! happen-before any subsequent invalidation is applied, without locks.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time;
use tracing::{debug, error};

use burrow_protocol::{
    message, message::method, InfoMap, Oid, ProtocolVersion, RemoteError, Revision, Tid,
};

use crate::cache::ClientCache;
use crate::completion::Resolver;
use crate::error::ClientError;
use crate::notify::StoreListener;
use crate::protocol::{self, ConnId, ProtoCmd, ProtoConfig, ProtocolHandle, Route};
use crate::transport::{Dialer, ServerAddr};
use crate::{Options, ReadOnly};

/// Token tying an internal reply to its continuation.
pub(crate) type StepToken = u64;

/// Which verification path ran for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The local cache had no objects; nothing to verify.
    EmptyCache,
    /// The cache had objects but no recorded tid; it was dropped.
    MissingTid,
    /// The cache claimed a newer transaction than the server; fatal for the
    /// connection.
    CacheAhead,
    /// The cache was already at the server's tid.
    UpToDate,
    /// The server enumerated the missed invalidations.
    Quick,
    /// The cache was too far behind and was dropped.
    Stale,
}

impl fmt::Display for VerifyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VerifyOutcome::EmptyCache => "empty cache",
            VerifyOutcome::MissingTid => "non-empty cache without tid",
            VerifyOutcome::CacheAhead => "cache newer than server",
            VerifyOutcome::UpToDate => "cache up to date",
            VerifyOutcome::Quick => "quick verification",
            VerifyOutcome::Stale => "cache too old, cleared",
        };
        f.write_str(label)
    }
}

/// Snapshot of the session state, as answered by
/// [`status`](crate::ClientThread::status).
#[derive(Debug, Clone)]
pub struct ClientStatus {
    /// Whether a verified session is up.
    pub ready: bool,
    /// Effective read-only mode of the current connection, if one is
    /// registered.
    pub read_only: Option<bool>,
    /// Verification outcome of the current (or last attempted) session.
    pub verify: Option<VerifyOutcome>,
    /// Negotiated protocol version tag of the current connection.
    pub protocol_version: Option<String>,
}

/// One object written by a finished transaction.
#[derive(Debug, Clone)]
pub struct CommitUpdate {
    /// The object the transaction wrote.
    pub oid: Oid,
    /// Its new state, when the caller has it at hand.
    pub data: Option<Vec<u8>>,
    /// Whether the server resolved a conflict for this object; resolved
    /// state differs from what the caller wrote and is not cached.
    pub resolved: bool,
}

pub(crate) type OnCommit = Box<dyn FnOnce(Tid) + Send>;

/// Commands posted by the runner.
pub(crate) enum Command {
    Call {
        method: String,
        body: Vec<u8>,
        completion: Resolver<Vec<u8>>,
    },
    CallAsync {
        method: String,
        body: Vec<u8>,
        completion: Resolver<()>,
    },
    LoadBefore {
        oid: Oid,
        tid: Tid,
        completion: Resolver<Option<Revision>>,
    },
    Prefetch {
        oids: Vec<Oid>,
        tid: Tid,
        completion: Resolver<()>,
    },
    TpcFinish {
        tid: Tid,
        updates: Vec<CommitUpdate>,
        on_commit: OnCommit,
        completion: Resolver<Tid>,
    },
    AwaitConnected {
        completion: Resolver<()>,
    },
    Status {
        completion: Resolver<ClientStatus>,
    },
    NewAddrs {
        addrs: Vec<ServerAddr>,
        completion: Resolver<()>,
    },
    Close {
        completion: Resolver<()>,
    },
}

/// Events delivered by connection workers (and the retry timer).
pub(crate) enum Event {
    Registered {
        conn: ConnId,
        server_tid: Option<Tid>,
        read_only: bool,
        version: ProtocolVersion,
    },
    RegisterFailed {
        conn: ConnId,
        error: ClientError,
    },
    StepReply {
        conn: ConnId,
        token: StepToken,
        result: Result<Vec<u8>, ClientError>,
    },
    LoadDone {
        conn: ConnId,
        oid: Oid,
        tid: Tid,
        waiters: Vec<Resolver<Option<Revision>>>,
        result: Result<Option<Revision>, RemoteError>,
    },
    ServerCall {
        conn: ConnId,
        call: ServerCall,
    },
    Disconnected {
        conn: ConnId,
    },
    RetryConnect,
}

/// The fixed repertoire of server-initiated calls.
pub(crate) enum ServerCall {
    InvalidateTransaction { tid: Tid, oids: Vec<Oid> },
    Serialnos { items: Vec<(Oid, Result<Tid, RemoteError>)> },
    Info { info: InfoMap },
    BlobStart { oid: Oid, serial: Tid },
    BlobChunk { oid: Oid, serial: Tid, chunk: Vec<u8> },
    BlobStop { oid: Oid, serial: Tid },
}

/// Lock-free session flags shared with the runner for its fast paths.
pub(crate) struct Flags {
    pub ready: AtomicBool,
    pub read_only: AtomicBool,
}

impl Flags {
    pub fn new(read_only: bool) -> Flags {
        Flags {
            ready: AtomicBool::new(false),
            read_only: AtomicBool::new(read_only),
        }
    }
}

/// Connection readiness. `Never` means no session has ever been verified;
/// calls made then fail instead of parking.
enum Readiness {
    Never,
    Ready,
    NotReady,
}

/// Calls waiting for the next `Ready` transition.
enum Parked {
    Call {
        method: String,
        body: Vec<u8>,
        completion: Resolver<Vec<u8>>,
    },
    Load {
        oid: Oid,
        tid: Tid,
        completion: Resolver<Option<Revision>>,
    },
    Await {
        completion: Resolver<()>,
    },
}

/// Continuations awaiting an internal reply, keyed by step token.
enum Step {
    LastTransaction,
    Invalidations {
        server_tid: Tid,
    },
    Info,
    TpcFinish {
        updates: Vec<CommitUpdate>,
        on_commit: OnCommit,
        completion: Resolver<Tid>,
    },
}

struct Current {
    handle: ProtocolHandle,
    read_only: bool,
    version: ProtocolVersion,
}

pub(crate) struct ClientCore {
    options: Options,
    dialer: Dialer,
    notify: Arc<dyn StoreListener>,
    cache: Box<dyn ClientCache>,
    flags: Arc<Flags>,
    commands: UnboundedReceiver<Command>,
    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    candidates: Vec<ProtocolHandle>,
    current: Option<Current>,
    readiness: Readiness,
    parked: Vec<Parked>,
    verify_outcome: Option<VerifyOutcome>,
    steps: HashMap<StepToken, (ConnId, Step)>,
    next_step: u64,
    next_conn: u64,
    rng: StdRng,
    retry_scheduled: bool,
    closed: bool,
}

impl ClientCore {
    pub(crate) fn new(
        options: Options,
        notify: Arc<dyn StoreListener>,
        cache: Box<dyn ClientCache>,
        flags: Arc<Flags>,
        commands: UnboundedReceiver<Command>,
    ) -> ClientCore {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dialer = Dialer::new(&options);
        let rng = match options.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        ClientCore {
            options,
            dialer,
            notify,
            cache,
            flags,
            commands,
            events_tx,
            events_rx,
            candidates: Vec::new(),
            current: None,
            readiness: Readiness::Never,
            parked: Vec::new(),
            verify_outcome: None,
            steps: HashMap::new(),
            next_step: 0,
            next_conn: 0,
            rng,
            retry_scheduled: false,
            closed: false,
        }
    }

    /// Runs until closed. Returns whether the shutdown was deliberate.
    pub(crate) async fn run(mut self) -> bool {
        self.try_connecting();
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Close { completion }) => {
                        self.close();
                        completion.ok(());
                        return true;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        // the runner went away without closing
                        self.close();
                        return false;
                    }
                },
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.on_event(event);
                    }
                },
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call {
                method,
                body,
                completion,
            } => self.dispatch_call(method, body, completion),
            Command::CallAsync {
                method,
                body,
                completion,
            } => {
                // async calls are never queued across reconnects; their
                // idempotency is the caller's problem, not ours to replay
                if !matches!(self.readiness, Readiness::Ready) {
                    completion.err(ClientError::disconnected("not connected"));
                    return;
                }
                match &self.current {
                    Some(current) => {
                        let _ = current.handle.send(ProtoCmd::CallAsync { method, body });
                        completion.ok(());
                    }
                    None => completion.err(ClientError::disconnected("not connected")),
                }
            }
            Command::LoadBefore {
                oid,
                tid,
                completion,
            } => self.dispatch_load(oid, tid, completion),
            Command::Prefetch {
                oids,
                tid,
                completion,
            } => {
                if !matches!(self.readiness, Readiness::Ready) {
                    completion.err(ClientError::disconnected("not connected"));
                    return;
                }
                if let Some(current) = &self.current {
                    for oid in oids {
                        if self.cache.load_before(oid, tid).is_none() {
                            let _ = current.handle.send(ProtoCmd::LoadBefore {
                                oid,
                                tid,
                                waiter: None,
                            });
                        }
                    }
                }
                completion.ok(());
            }
            Command::TpcFinish {
                tid,
                updates,
                on_commit,
                completion,
            } => self.dispatch_tpc(tid, updates, on_commit, completion),
            Command::AwaitConnected { completion } => {
                if matches!(self.readiness, Readiness::Ready) {
                    completion.ok(());
                } else {
                    self.parked.push(Parked::Await { completion });
                }
            }
            Command::Status { completion } => completion.ok(self.status()),
            Command::NewAddrs { addrs, completion } => {
                self.options.addrs = addrs;
                // only disturbs a session we are unhappy with anyway
                if self.trying_to_connect() {
                    self.restart_connecting();
                }
                completion.ok(());
            }
            Command::Close { .. } => unreachable!("close is handled by the run loop"),
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Registered {
                conn,
                server_tid,
                read_only,
                version,
            } => self.on_registered(conn, server_tid, read_only, version),
            Event::RegisterFailed { conn, error } => self.on_register_failed(conn, error),
            Event::StepReply {
                conn,
                token,
                result,
            } => self.on_step_reply(conn, token, result),
            Event::LoadDone {
                conn,
                oid,
                tid,
                waiters,
                result,
            } => self.on_load_done(conn, oid, tid, waiters, result),
            Event::ServerCall { conn, call } => self.on_server_call(conn, call),
            Event::Disconnected { conn } => self.on_disconnected(conn),
            Event::RetryConnect => {
                self.retry_scheduled = false;
                if !self.closed && self.current.is_none() && self.candidates.is_empty() {
                    self.try_connecting();
                }
            }
        }
    }

    // ---- call routing ---------------------------------------------------

    fn dispatch_call(&mut self, method: String, body: Vec<u8>, completion: Resolver<Vec<u8>>) {
        match self.readiness {
            Readiness::Ready => {
                let Some(current) = &self.current else {
                    completion.err(ClientError::disconnected("not connected"));
                    return;
                };
                if let Err(cmd) = current.handle.send(ProtoCmd::Call {
                    method,
                    body,
                    route: Route::Caller(completion),
                }) {
                    if let ProtoCmd::Call {
                        route: Route::Caller(resolver),
                        ..
                    } = cmd
                    {
                        resolver.err(ClientError::disconnected("connection lost"));
                    }
                }
            }
            Readiness::NotReady => self.parked.push(Parked::Call {
                method,
                body,
                completion,
            }),
            Readiness::Never => completion.err(ClientError::disconnected("never connected")),
        }
    }

    fn dispatch_load(&mut self, oid: Oid, tid: Tid, completion: Resolver<Option<Revision>>) {
        if let Some(revision) = self.cache.load_before(oid, tid) {
            completion.ok(Some(revision));
            return;
        }
        match self.readiness {
            Readiness::Ready => {
                let Some(current) = &self.current else {
                    completion.err(ClientError::disconnected("not connected"));
                    return;
                };
                if let Err(cmd) = current.handle.send(ProtoCmd::LoadBefore {
                    oid,
                    tid,
                    waiter: Some(completion),
                }) {
                    if let ProtoCmd::LoadBefore {
                        waiter: Some(resolver),
                        ..
                    } = cmd
                    {
                        resolver.err(ClientError::disconnected("connection lost"));
                    }
                }
            }
            Readiness::NotReady => self.parked.push(Parked::Load {
                oid,
                tid,
                completion,
            }),
            Readiness::Never => completion.err(ClientError::disconnected("never connected")),
        }
    }

    fn dispatch_tpc(
        &mut self,
        tid: Tid,
        updates: Vec<CommitUpdate>,
        on_commit: OnCommit,
        completion: Resolver<Tid>,
    ) {
        if !matches!(self.readiness, Readiness::Ready) {
            completion.err(ClientError::disconnected("not connected"));
            return;
        }
        let Some(conn) = self.current.as_ref().map(|c| c.handle.id) else {
            completion.err(ClientError::disconnected("not connected"));
            return;
        };
        let body = match message::encode_args(&message::TpcFinish { tid }) {
            Ok(body) => body,
            Err(err) => {
                completion.err(err.into());
                return;
            }
        };
        let token = self.new_step(
            conn,
            Step::TpcFinish {
                updates,
                on_commit,
                completion,
            },
        );
        let cmd = ProtoCmd::Call {
            method: method::TPC_FINISH.to_owned(),
            body,
            route: Route::Step(token),
        };
        let sent = self
            .current
            .as_ref()
            .map_or(false, |c| c.handle.send(cmd).is_ok());
        if !sent {
            if let Some((_, Step::TpcFinish { completion, .. })) = self.steps.remove(&token) {
                completion.err(ClientError::disconnected("connection lost"));
            }
        }
    }

    fn release_parked(&mut self) {
        for parked in mem::take(&mut self.parked) {
            match parked {
                Parked::Call {
                    method,
                    body,
                    completion,
                } => self.dispatch_call(method, body, completion),
                Parked::Load {
                    oid,
                    tid,
                    completion,
                } => self.dispatch_load(oid, tid, completion),
                Parked::Await { completion } => completion.ok(()),
            }
        }
    }

    fn fail_parked(&mut self, reason: &str) {
        for parked in mem::take(&mut self.parked) {
            match parked {
                Parked::Call { completion, .. } => {
                    completion.err(ClientError::disconnected(reason));
                }
                Parked::Load { completion, .. } => {
                    completion.err(ClientError::disconnected(reason));
                }
                Parked::Await { completion } => {
                    completion.err(ClientError::disconnected(reason));
                }
            }
        }
    }

    // ---- connection management ------------------------------------------

    fn try_connecting(&mut self) {
        if self.closed {
            return;
        }
        debug!("trying to connect");
        let config = self.proto_config();
        let addrs = self.options.addrs.clone();
        for addr in addrs {
            let id = self.next_conn;
            self.next_conn += 1;
            let handle = protocol::spawn(
                id,
                addr,
                self.dialer.clone(),
                config.clone(),
                self.events_tx.clone(),
            );
            self.candidates.push(handle);
        }
    }

    fn on_registered(
        &mut self,
        conn: ConnId,
        server_tid: Option<Tid>,
        read_only: bool,
        version: ProtocolVersion,
    ) {
        let Some(pos) = self.candidates.iter().position(|c| c.id == conn) else {
            return;
        };
        let fallback = matches!(self.options.read_only, ReadOnly::Fallback);

        if self.current.is_none() {
            let handle = self.candidates.remove(pos);
            debug!(conn, %read_only, addr = %handle.addr, "registered");
            self.current = Some(Current {
                handle,
                read_only,
                version,
            });
            self.flags.read_only.store(read_only, Ordering::SeqCst);
            if !(fallback && read_only) {
                // happy with this one; tell the others to stop trying
                self.close_candidates();
            }
            self.start_verify(server_tid);
        } else if fallback
            && !read_only
            && self.current.as_ref().map_or(false, |c| c.read_only)
        {
            let handle = self.candidates.remove(pos);
            debug!(conn, addr = %handle.addr, "upgrading to writable connection");
            self.upgrade(handle, read_only, version);
            self.start_verify(server_tid);
        } else {
            // too late, we went home with another
            let handle = self.candidates.remove(pos);
            handle.close();
        }
    }

    /// Swaps a writable connection in over a read-only one and re-verifies.
    fn upgrade(&mut self, handle: ProtocolHandle, read_only: bool, version: ProtocolVersion) {
        self.flags.ready.store(false, Ordering::SeqCst);
        if matches!(self.readiness, Readiness::Ready) {
            self.readiness = Readiness::NotReady;
        }
        if let Some(old) = self.current.take() {
            self.drop_steps_for(old.handle.id, "superseded by writable connection");
            old.handle.close();
        }
        self.current = Some(Current {
            handle,
            read_only,
            version,
        });
        self.flags.read_only.store(read_only, Ordering::SeqCst);
        self.close_candidates();
    }

    fn on_register_failed(&mut self, conn: ConnId, error: ClientError) {
        error!(conn, %error, "registration failed");
        if let Some(pos) = self.candidates.iter().position(|c| c.id == conn) {
            let handle = self.candidates.remove(pos);
            handle.close();
        }
        self.schedule_retry();
    }

    fn on_disconnected(&mut self, conn: ConnId) {
        if self.current.as_ref().map_or(false, |c| c.handle.id == conn) {
            self.current = None;
            self.session_lost();
        } else if let Some(pos) = self.candidates.iter().position(|c| c.id == conn) {
            self.candidates.remove(pos);
            if self.current.is_none() && self.candidates.is_empty() && !self.closed {
                self.try_connecting();
            }
        }
    }

    /// The verified session is gone: tell the embedder, then reconnect.
    fn session_lost(&mut self) {
        if matches!(self.readiness, Readiness::Ready) {
            self.notify.notify_disconnected();
            self.readiness = Readiness::NotReady;
        }
        self.flags.ready.store(false, Ordering::SeqCst);
        self.reset_read_only_flag();
        self.close_candidates();
        if !self.closed && self.current.is_none() && self.candidates.is_empty() {
            self.try_connecting();
        }
    }

    fn restart_connecting(&mut self) {
        if let Some(current) = self.current.take() {
            self.drop_steps_for(current.handle.id, "reconnecting");
            current.handle.close();
        }
        if matches!(self.readiness, Readiness::Ready) {
            self.notify.notify_disconnected();
            self.readiness = Readiness::NotReady;
        }
        self.flags.ready.store(false, Ordering::SeqCst);
        self.reset_read_only_flag();
        self.close_candidates();
        self.try_connecting();
    }

    /// Whether we want a different connection than the one we have.
    fn trying_to_connect(&self) -> bool {
        !matches!(self.readiness, Readiness::Ready)
            || (matches!(self.options.read_only, ReadOnly::Fallback)
                && self.current.as_ref().map_or(true, |c| c.read_only))
    }

    fn schedule_retry(&mut self) {
        if self.closed
            || self.retry_scheduled
            || self.current.is_some()
            || !self.candidates.is_empty()
        {
            return;
        }
        self.retry_scheduled = true;
        let delay = self.options.register_failed_poll + self.jitter();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = events.send(Event::RetryConnect);
        });
    }

    fn close_candidates(&mut self) {
        for candidate in self.candidates.drain(..) {
            candidate.close();
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.flags.ready.store(false, Ordering::SeqCst);
        self.readiness = Readiness::NotReady;
        if let Some(current) = self.current.take() {
            self.drop_steps_for(current.handle.id, "closed");
            current.handle.close();
        }
        self.close_candidates();
        let steps: Vec<_> = self.steps.drain().collect();
        for (_, (_, step)) in steps {
            if let Step::TpcFinish { completion, .. } = step {
                completion.err(ClientError::disconnected("closed"));
            }
        }
        self.fail_parked("closed");
        self.cache.close();
    }

    // ---- verification ---------------------------------------------------

    fn start_verify(&mut self, server_tid: Option<Tid>) {
        self.verify_outcome = None;
        match server_tid {
            // a server that did not report its tid at registration answers
            // a follow-up instead
            None => self.send_step(method::LAST_TRANSACTION, &(), Step::LastTransaction),
            Some(tid) => self.verify_with_tid(tid),
        }
    }

    fn verify_with_tid(&mut self, server_tid: Tid) {
        if self.cache.is_empty() {
            self.verify_outcome = Some(VerifyOutcome::EmptyCache);
            self.finish_verify(server_tid);
            return;
        }
        match self.cache.last_tid() {
            None => {
                self.verify_outcome = Some(VerifyOutcome::MissingTid);
                error!("non-empty cache without a recorded tid, clearing");
                self.cache.clear();
                self.notify.invalidate_cache();
                self.finish_verify(server_tid);
            }
            Some(cache_tid) if cache_tid > server_tid => {
                self.verify_outcome = Some(VerifyOutcome::CacheAhead);
                error!(%cache_tid, %server_tid, "cache has seen newer transactions than the server");
                self.verify_failed(ClientError::ProtocolViolation(format!(
                    "server behind client: {server_tid} < {cache_tid}"
                )));
            }
            Some(cache_tid) if cache_tid == server_tid => {
                self.verify_outcome = Some(VerifyOutcome::UpToDate);
                self.finish_verify(server_tid);
            }
            Some(cache_tid) => self.send_step(
                method::GET_INVALIDATIONS,
                &message::GetInvalidations { tid: cache_tid },
                Step::Invalidations { server_tid },
            ),
        }
    }

    /// The cache now reflects `server_tid`: record it, go ready so
    /// subsequent invalidations are applied, and fetch the server info.
    fn finish_verify(&mut self, server_tid: Tid) {
        self.cache.set_last_tid(server_tid);
        self.readiness = Readiness::Ready;
        self.flags.ready.store(true, Ordering::SeqCst);
        self.send_step(method::GET_INFO, &(), Step::Info);
    }

    /// Registration or verification went wrong on the current connection:
    /// drop it and re-enter the connect loop.
    fn verify_failed(&mut self, error: ClientError) {
        error!(%error, "registration failed");
        if let Some(current) = self.current.take() {
            self.drop_steps_for(current.handle.id, "connection abandoned");
            current.handle.close();
        }
        self.flags.ready.store(false, Ordering::SeqCst);
        if matches!(self.readiness, Readiness::Ready) {
            self.readiness = Readiness::NotReady;
        }
        self.schedule_retry();
    }

    // ---- internal replies -----------------------------------------------

    fn new_step(&mut self, conn: ConnId, step: Step) -> StepToken {
        let token = self.next_step;
        self.next_step += 1;
        self.steps.insert(token, (conn, step));
        token
    }

    fn send_step<T: Serialize>(&mut self, method_name: &str, args: &T, step: Step) {
        let Some(conn) = self.current.as_ref().map(|c| c.handle.id) else {
            return;
        };
        let body = match message::encode_args(args) {
            Ok(body) => body,
            Err(err) => {
                self.verify_failed(err.into());
                return;
            }
        };
        let token = self.new_step(conn, step);
        let cmd = ProtoCmd::Call {
            method: method_name.to_owned(),
            body,
            route: Route::Step(token),
        };
        let sent = self
            .current
            .as_ref()
            .map_or(false, |c| c.handle.send(cmd).is_ok());
        if !sent {
            self.steps.remove(&token);
            self.verify_failed(ClientError::disconnected("connection lost"));
        }
    }

    fn on_step_reply(
        &mut self,
        conn: ConnId,
        token: StepToken,
        result: Result<Vec<u8>, ClientError>,
    ) {
        let Some((step_conn, step)) = self.steps.remove(&token) else {
            return;
        };
        if step_conn != conn {
            return;
        }
        match step {
            Step::LastTransaction => match Self::decode_step::<Tid>(result) {
                Ok(tid) => self.verify_with_tid(tid),
                Err(error) => self.verify_failed(error),
            },
            Step::Invalidations { server_tid } => {
                match Self::decode_step::<Option<message::Invalidations>>(result) {
                    Ok(Some(invalidations)) => {
                        self.verify_outcome = Some(VerifyOutcome::Quick);
                        for oid in &invalidations.oids {
                            self.cache.invalidate(*oid, None);
                        }
                        self.notify
                            .invalidate_transaction(invalidations.tid, &invalidations.oids);
                        self.finish_verify(invalidations.tid);
                    }
                    Ok(None) => {
                        self.verify_outcome = Some(VerifyOutcome::Stale);
                        error!("dropping stale cache");
                        self.notify.stale_cache();
                        self.cache.clear();
                        self.notify.invalidate_cache();
                        self.finish_verify(server_tid);
                    }
                    Err(error) => self.verify_failed(error),
                }
            }
            Step::Info => match Self::decode_step::<InfoMap>(result) {
                Ok(info) => {
                    self.notify.notify_connected(&info);
                    self.release_parked();
                }
                // connected and verified, but the info round-trip failed:
                // treated as a registration failure of this connection
                Err(error) => self.verify_failed(error),
            },
            Step::TpcFinish {
                updates,
                on_commit,
                completion,
            } => self.finish_tpc(result, updates, on_commit, completion),
        }
    }

    fn finish_tpc(
        &mut self,
        result: Result<Vec<u8>, ClientError>,
        updates: Vec<CommitUpdate>,
        on_commit: OnCommit,
        completion: Resolver<Tid>,
    ) {
        match Self::decode_step::<Tid>(result) {
            Ok(tid) => {
                for update in updates {
                    self.cache.invalidate(update.oid, Some(tid));
                    if let Some(data) = update.data {
                        if !update.resolved {
                            self.cache.store(update.oid, tid, None, &data);
                        }
                    }
                }
                self.cache.set_last_tid(tid);
                on_commit(tid);
                completion.ok(tid);
            }
            Err(error) => {
                // the commit may or may not have happened; the cache cannot
                // tell. Reconnect and let verification restore coherence.
                completion.err(error);
                if let Some(current) = self.current.take() {
                    self.drop_steps_for(current.handle.id, "closed after failed commit");
                    current.handle.close();
                }
                self.session_lost();
            }
        }
    }

    fn drop_steps_for(&mut self, conn: ConnId, reason: &str) {
        let stale: Vec<StepToken> = self
            .steps
            .iter()
            .filter(|(_, (step_conn, _))| *step_conn == conn)
            .map(|(token, _)| *token)
            .collect();
        for token in stale {
            if let Some((_, step)) = self.steps.remove(&token) {
                if let Step::TpcFinish { completion, .. } = step {
                    completion.err(ClientError::disconnected(reason));
                }
            }
        }
    }

    fn decode_step<T: DeserializeOwned>(result: Result<Vec<u8>, ClientError>) -> Result<T, ClientError> {
        let payload = result?;
        message::decode_args(&payload).map_err(ClientError::from)
    }

    // ---- reads and server calls -----------------------------------------

    fn on_load_done(
        &mut self,
        conn: ConnId,
        oid: Oid,
        tid: Tid,
        waiters: Vec<Resolver<Option<Revision>>>,
        result: Result<Option<Revision>, RemoteError>,
    ) {
        match result {
            Ok(revision) => {
                for waiter in waiters {
                    waiter.ok(revision.clone());
                }
                // a reply from a superseded connection may predate a cache
                // reset; only the current session populates the cache
                if self.is_current(conn) {
                    if let Some(revision) = revision {
                        self.cache
                            .store(oid, revision.start, revision.end, &revision.data);
                    }
                }
            }
            Err(remote) => {
                if waiters.is_empty() {
                    error!(%oid, %tid, error = %remote, "prefetch failed");
                } else {
                    for waiter in waiters {
                        waiter.err(ClientError::Server(remote.clone()));
                    }
                }
            }
        }
    }

    fn on_server_call(&mut self, conn: ConnId, call: ServerCall) {
        match call {
            ServerCall::InvalidateTransaction { tid, oids } => {
                // dropped while not ready: quick verification already
                // reflects anything at or before the verified tid, and the
                // server re-sends anything after it on the next subscription
                if matches!(self.readiness, Readiness::Ready) && self.is_current(conn) {
                    for oid in &oids {
                        self.cache.invalidate(*oid, Some(tid));
                    }
                    self.notify.invalidate_transaction(tid, &oids);
                    self.cache.set_last_tid(tid);
                }
            }
            ServerCall::Serialnos { items } => {
                // an errored entry means the server rejected that object;
                // whatever we have cached for it can no longer be trusted
                for (oid, outcome) in &items {
                    if outcome.is_err() {
                        self.cache.invalidate(*oid, None);
                    }
                }
                self.notify.serials(&items);
            }
            ServerCall::Info { info } => self.notify.info(&info),
            ServerCall::BlobStart { oid, serial } => self.notify.blob_start(oid, serial),
            ServerCall::BlobChunk { oid, serial, chunk } => {
                self.notify.blob_chunk(oid, serial, &chunk)
            }
            ServerCall::BlobStop { oid, serial } => self.notify.blob_stop(oid, serial),
        }
    }

    // ---- misc ------------------------------------------------------------

    fn is_current(&self, conn: ConnId) -> bool {
        self.current.as_ref().map_or(false, |c| c.handle.id == conn)
    }

    fn status(&self) -> ClientStatus {
        ClientStatus {
            ready: matches!(self.readiness, Readiness::Ready),
            read_only: self.current.as_ref().map(|c| c.read_only),
            verify: self.verify_outcome,
            protocol_version: self
                .current
                .as_ref()
                .map(|c| String::from_utf8_lossy(c.version.tag()).into_owned()),
        }
    }

    fn reset_read_only_flag(&self) {
        let fallback = !matches!(self.options.read_only, ReadOnly::No);
        self.flags.read_only.store(fallback, Ordering::SeqCst);
    }

    fn proto_config(&self) -> ProtoConfig {
        ProtoConfig {
            storage_key: self.options.storage_key.clone(),
            read_only: self.options.read_only,
            connect_poll: self.options.connect_poll,
            heartbeat_interval: self.options.heartbeat_interval,
            jitter_seed: self.options.jitter_seed,
        }
    }

    fn jitter(&mut self) -> Duration {
        Duration::from_secs_f64(self.rng.gen::<f64>())
    }
}
