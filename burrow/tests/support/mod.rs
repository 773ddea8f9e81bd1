//! Scripted fake store server and observation doubles shared by the
//! integration tests.

#![allow(dead_code)]

use std::net::{Shutdown, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use burrow::wire::{
    message, read_frame, write_frame, Frame, InfoMap, MsgId, Oid, RemoteError, Tid,
    HEARTBEAT_MSG_ID,
};
use burrow::{ClientCache, MemCache, Options, Revision, ServerAddr, StoreListener};

/// Latest version tag, as the fake server usually advertises it.
pub const LATEST_TAG: &[u8] = b"BRW4";

/// Options tuned for tests: short dial retry, long registration retry (so
/// failure tests observe a quiet client), seeded jitter.
pub fn options(addrs: Vec<ServerAddr>) -> Options {
    let mut options = Options::new(addrs);
    options.timeout = Duration::from_secs(5);
    options.connect_poll = Duration::from_millis(50);
    options.register_failed_poll = Duration::from_secs(30);
    options.jitter_seed = Some(0);
    options
}

/// An address nothing is listening on.
pub fn dead_addr() -> ServerAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    ServerAddr::Tcp("127.0.0.1".to_owned(), port)
}

/// Polls `pred` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// A scripted fake server. Each accepted connection runs `handler` on its
/// own thread with the zero-based connection index; panics inside handlers
/// are collected and re-asserted by [`FakeServer::assert_clean`].
pub struct FakeServer {
    port: u16,
    seen: Arc<Mutex<Vec<Frame>>>,
    failures: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
}

impl FakeServer {
    pub fn start<H>(handler: H) -> FakeServer
    where
        H: Fn(usize, &mut ServerConn) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        let port = listener.local_addr().expect("local addr").port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));

        let handler = Arc::new(handler);
        let accept_seen = seen.clone();
        let accept_failures = failures.clone();
        let accept_active = active.clone();
        thread::spawn(move || {
            for (index, stream) in listener.incoming().enumerate() {
                let Ok(stream) = stream else { break };
                let handler = handler.clone();
                let seen = accept_seen.clone();
                let failures = accept_failures.clone();
                let active = accept_active.clone();
                active.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || {
                    let mut conn = ServerConn { stream, seen };
                    let result = catch_unwind(AssertUnwindSafe(|| (*handler)(index, &mut conn)));
                    if let Err(panic) = result {
                        let message = panic
                            .downcast_ref::<String>()
                            .cloned()
                            .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_owned()))
                            .unwrap_or_else(|| "handler panicked".to_owned());
                        failures.lock().unwrap().push(message);
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        FakeServer {
            port,
            seen,
            failures,
            active,
        }
    }

    pub fn addr(&self) -> ServerAddr {
        ServerAddr::Tcp("127.0.0.1".to_owned(), self.port)
    }

    /// Every non-heartbeat frame received, across all connections.
    pub fn calls(&self) -> Vec<Frame> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count_calls(&self, method: &str) -> usize {
        self.calls().iter().filter(|f| f.method == method).count()
    }

    /// Waits for every in-flight handler to finish, then fails the test if
    /// any of them panicked. Call after the client is closed.
    pub fn assert_clean(&self) {
        assert!(
            eventually(Duration::from_secs(5), || {
                self.active.load(Ordering::SeqCst) == 0
            }),
            "fake server handler still running"
        );
        let failures = self.failures.lock().unwrap();
        assert!(failures.is_empty(), "handler failures: {failures:?}");
    }
}

/// One accepted connection of a [`FakeServer`].
pub struct ServerConn {
    stream: TcpStream,
    seen: Arc<Mutex<Vec<Frame>>>,
}

impl ServerConn {
    pub fn send_version(&mut self, tag: &[u8]) {
        write_frame(&mut self.stream, tag).expect("write version tag");
    }

    pub fn expect_version_echo(&mut self, tag: &[u8]) {
        let echoed = read_frame(&mut self.stream)
            .expect("read version echo")
            .expect("connection closed before version echo");
        assert_eq!(echoed, tag, "unexpected version echo");
    }

    /// Advertises the latest version and consumes the echo.
    pub fn handshake(&mut self) {
        self.send_version(LATEST_TAG);
        self.expect_version_echo(LATEST_TAG);
    }

    /// Next decoded non-heartbeat frame, or `None` once the client is gone.
    pub fn next_call(&mut self) -> Option<Frame> {
        loop {
            let raw = match read_frame(&mut self.stream) {
                Ok(Some(raw)) => raw,
                _ => return None,
            };
            let frame = Frame::decode(&raw).expect("client sent an undecodable frame");
            if frame.id == HEARTBEAT_MSG_ID && frame.is_reply() {
                continue;
            }
            self.seen.lock().unwrap().push(frame.clone());
            return Some(frame);
        }
    }

    pub fn expect_call(&mut self, method: &str) -> Frame {
        let frame = self
            .next_call()
            .unwrap_or_else(|| panic!("connection closed while expecting {method}"));
        assert_eq!(frame.method, method, "unexpected call");
        frame
    }

    pub fn reply_ok<T: Serialize>(&mut self, id: MsgId, value: &T) {
        self.reply_ok_raw(id, message::encode_args(value).expect("encode reply"));
    }

    pub fn reply_ok_raw(&mut self, id: MsgId, payload: Vec<u8>) {
        let frame = Frame::reply(id, Ok(payload)).expect("build reply");
        self.send_frame(&frame);
    }

    pub fn reply_err(&mut self, id: MsgId, error: RemoteError) {
        let frame = Frame::reply(id, Err(error)).expect("build reply");
        self.send_frame(&frame);
    }

    pub fn send_server_call<T: Serialize>(&mut self, method: &str, args: &T) {
        let frame = Frame::call_async(method, message::encode_args(args).expect("encode args"));
        self.send_frame(&frame);
    }

    pub fn send_frame(&mut self, frame: &Frame) {
        let raw = frame.encode().expect("encode frame");
        write_frame(&mut self.stream, &raw).expect("write frame");
    }

    /// Serves a registration plus an empty-cache (or up-to-date) verification
    /// round: handshake, `register` answered with `tid`, `get_info` answered
    /// with an empty mapping.
    pub fn serve_session(&mut self, tid: u64) {
        self.handshake();
        let register = self.expect_call(message::method::REGISTER);
        self.reply_ok(register.id, &Some(Tid(tid)));
        let info = self.expect_call(message::method::GET_INFO);
        self.reply_ok(info.id, &InfoMap::new());
    }

    /// Keeps consuming frames until the client hangs up.
    pub fn hold_open(&mut self) {
        while self.next_call().is_some() {}
    }

    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// What a [`RecordingListener`] observed, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Connected(InfoMap),
    Disconnected,
    InvalidateTransaction(Tid, Vec<Oid>),
    InvalidateCache,
    StaleCache,
    Serials(Vec<(Oid, Result<Tid, RemoteError>)>),
    Info(InfoMap),
}

/// A `StoreListener` that records every hook invocation.
#[derive(Default)]
pub struct RecordingListener {
    seen: Mutex<Vec<Seen>>,
}

impl RecordingListener {
    pub fn new() -> Arc<RecordingListener> {
        Arc::new(RecordingListener::default())
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&[Seen]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred(&self.seen()) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn push(&self, event: Seen) {
        self.seen.lock().unwrap().push(event);
    }
}

impl StoreListener for RecordingListener {
    fn notify_connected(&self, info: &InfoMap) {
        self.push(Seen::Connected(info.clone()));
    }

    fn notify_disconnected(&self) {
        self.push(Seen::Disconnected);
    }

    fn invalidate_transaction(&self, tid: Tid, oids: &[Oid]) {
        self.push(Seen::InvalidateTransaction(tid, oids.to_vec()));
    }

    fn invalidate_cache(&self) {
        self.push(Seen::InvalidateCache);
    }

    fn stale_cache(&self) {
        self.push(Seen::StaleCache);
    }

    fn serials(&self, items: &[(Oid, Result<Tid, RemoteError>)]) {
        self.push(Seen::Serials(items.to_vec()));
    }

    fn info(&self, info: &InfoMap) {
        self.push(Seen::Info(info.clone()));
    }
}

/// A [`MemCache`] behind a shared handle, so tests can observe what the
/// client did to the cache it owns.
#[derive(Clone, Default)]
pub struct SharedCache(Arc<Mutex<MemCache>>);

impl SharedCache {
    pub fn new() -> SharedCache {
        SharedCache::default()
    }

    pub fn handle(&self) -> SharedCache {
        self.clone()
    }

    pub fn peek_last_tid(&self) -> Option<Tid> {
        self.0.lock().unwrap().last_tid()
    }

    pub fn peek(&self, oid: Oid, tid: Tid) -> Option<Revision> {
        self.0.lock().unwrap().load_before(oid, tid)
    }

    pub fn peek_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }

    pub fn preload(&self, oid: Oid, start: Tid, data: &[u8]) {
        self.0.lock().unwrap().store(oid, start, None, data);
    }

    pub fn preload_tid(&self, tid: Tid) {
        self.0.lock().unwrap().set_last_tid(tid);
    }
}

impl ClientCache for SharedCache {
    fn load_before(&self, oid: Oid, tid: Tid) -> Option<Revision> {
        self.0.lock().unwrap().load_before(oid, tid)
    }

    fn store(&mut self, oid: Oid, start: Tid, end: Option<Tid>, data: &[u8]) {
        self.0.lock().unwrap().store(oid, start, end, data);
    }

    fn invalidate(&mut self, oid: Oid, tid: Option<Tid>) {
        self.0.lock().unwrap().invalidate(oid, tid);
    }

    fn last_tid(&self) -> Option<Tid> {
        self.0.lock().unwrap().last_tid()
    }

    fn set_last_tid(&mut self, tid: Tid) {
        self.0.lock().unwrap().set_last_tid(tid);
    }

    fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }

    fn clear(&mut self) {
        self.0.lock().unwrap().clear();
    }
}
