//! The thread host: owns the I/O executor on a dedicated thread and exposes
//! a synchronous, thread-safe call surface with deadlines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::error;

use burrow_protocol::{Oid, Revision, Tid};

use crate::cache::ClientCache;
use crate::client::{ClientCore, ClientStatus, Command, CommitUpdate, Flags};
use crate::completion::{completion, Completion};
use crate::error::ClientError;
use crate::notify::StoreListener;
use crate::transport::ServerAddr;
use crate::{Options, ReadOnly};

/// A client running on its own I/O thread.
///
/// Every method posts work to that thread and blocks the caller until a
/// result, error, or deadline. A deadline that expires while no session is
/// ready reads as [`ClientError::Disconnected`], since the connection is
/// what is overdue rather than the call. After
/// [`close`](ClientThread::close), every call fails immediately.
pub struct ClientThread {
    commands: UnboundedSender<Command>,
    flags: Arc<Flags>,
    timeout: Duration,
    closed: AtomicBool,
    thread: Option<thread::JoinHandle<()>>,
}

impl ClientThread {
    /// Starts the I/O thread and the connect loop.
    ///
    /// Blocks until the executor is up; failures inside the thread during
    /// startup surface here.
    pub fn new(
        options: Options,
        listener: Arc<dyn StoreListener>,
        cache: Box<dyn ClientCache>,
    ) -> Result<ClientThread, ClientError> {
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let read_only = !matches!(options.read_only, ReadOnly::No);
        let flags = Arc::new(Flags::new(read_only));
        let timeout = options.timeout;

        let thread_flags = flags.clone();
        let (started_tx, started_rx) = std_mpsc::sync_channel::<Result<(), String>>(1);
        let name = format!("burrow-io-{}", options.storage_key);
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => {
                        let _ = started_tx.send(Ok(()));
                        runtime
                    }
                    Err(err) => {
                        let _ = started_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                let core = ClientCore::new(options, listener, cache, thread_flags.clone(), cmd_rx);
                let deliberate = runtime.block_on(core.run());
                thread_flags.ready.store(false, Ordering::SeqCst);
                if !deliberate {
                    // no recovery path from here; callers observe Disconnected
                    error!("client I/O thread stopped unexpectedly");
                }
            })
            .map_err(ClientError::Io)?;

        match started_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(ClientError::disconnected(format!(
                    "client thread failed to start: {err}"
                )));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(ClientError::disconnected("client thread died during startup"));
            }
        }

        Ok(ClientThread {
            commands: cmd_tx,
            flags,
            timeout,
            closed: AtomicBool::new(false),
            thread: Some(thread),
        })
    }

    /// Calls `method` with an opaque payload and blocks for the reply
    /// payload.
    pub fn call(
        &self,
        method: &str,
        body: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, ClientError> {
        let (waiter, resolver) = completion();
        self.send(Command::Call {
            method: method.to_owned(),
            body,
            completion: resolver,
        })?;
        self.wait(waiter, timeout)
    }

    /// Writes a one-way call. Fails immediately when no session is ready;
    /// async calls are never queued across reconnects.
    pub fn call_async(&self, method: &str, body: Vec<u8>) -> Result<(), ClientError> {
        let (waiter, resolver) = completion();
        self.send(Command::CallAsync {
            method: method.to_owned(),
            body,
            completion: resolver,
        })?;
        self.wait(waiter, None)
    }

    /// Reads the revision of `oid` visible before `tid`, from the local
    /// cache when possible.
    pub fn load_before(&self, oid: Oid, tid: Tid) -> Result<Option<Revision>, ClientError> {
        let (waiter, resolver) = completion();
        self.send(Command::LoadBefore {
            oid,
            tid,
            completion: resolver,
        })?;
        self.wait(waiter, None)
    }

    /// Starts background reads for every listed object not already cached.
    /// Returns as soon as the reads are queued; failures are logged, not
    /// reported.
    pub fn prefetch(&self, oids: &[Oid], tid: Tid) -> Result<(), ClientError> {
        let (waiter, resolver) = completion();
        self.send(Command::Prefetch {
            oids: oids.to_vec(),
            tid,
            completion: resolver,
        })?;
        self.wait(waiter, None)
    }

    /// Finishes a two-phase commit: applies `updates` to the cache under the
    /// server-assigned tid, runs `on_commit` with it, and returns it.
    ///
    /// On failure the cache state is indeterminate, so the connection is
    /// dropped and coherence is restored by reconnect-and-verify.
    pub fn tpc_finish<F>(
        &self,
        tid: Tid,
        updates: Vec<CommitUpdate>,
        on_commit: F,
    ) -> Result<Tid, ClientError>
    where
        F: FnOnce(Tid) + Send + 'static,
    {
        let (waiter, resolver) = completion();
        self.send(Command::TpcFinish {
            tid,
            updates,
            on_commit: Box::new(on_commit),
            completion: resolver,
        })?;
        self.wait(waiter, None)
    }

    /// Blocks until a session is ready.
    pub fn wait_connected(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        let (waiter, resolver) = completion();
        self.send(Command::AwaitConnected {
            completion: resolver,
        })?;
        self.wait(waiter, timeout)
    }

    /// Snapshot of the session state.
    pub fn status(&self) -> Result<ClientStatus, ClientError> {
        let (waiter, resolver) = completion();
        self.send(Command::Status {
            completion: resolver,
        })?;
        self.wait(waiter, None)
    }

    /// Replaces the candidate address list. Takes effect at the next
    /// disconnect, or immediately when the client is still hunting for a
    /// connection it actually wants.
    pub fn new_addrs(&self, addrs: Vec<ServerAddr>) -> Result<(), ClientError> {
        let (waiter, resolver) = completion();
        self.send(Command::NewAddrs {
            addrs,
            completion: resolver,
        })?;
        self.wait(waiter, None)
    }

    /// Whether a verified session is currently up.
    pub fn is_connected(&self) -> bool {
        self.flags.ready.load(Ordering::SeqCst)
    }

    /// Effective read-only mode; falls back to the configured preference
    /// while no session is registered.
    pub fn is_read_only(&self) -> bool {
        self.flags.read_only.load(Ordering::SeqCst)
    }

    /// Shuts the client down and joins the I/O thread. Idempotent; runs
    /// automatically on drop.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (waiter, resolver) = completion();
        if self
            .commands
            .send(Command::Close {
                completion: resolver,
            })
            .is_ok()
        {
            let _ = waiter.wait(self.timeout);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::disconnected("closed"));
        }
        self.commands
            .send(command)
            .map_err(|_| ClientError::disconnected("client thread is gone"))
    }

    fn wait<T>(&self, waiter: Completion<T>, timeout: Option<Duration>) -> Result<T, ClientError> {
        let timeout = timeout.unwrap_or(self.timeout);
        match waiter.wait(timeout) {
            Err(ClientError::Timeout) if !self.is_connected() => Err(ClientError::disconnected(
                "timed out waiting for connection",
            )),
            other => other,
        }
    }
}

impl Drop for ClientThread {
    fn drop(&mut self) {
        self.close();
    }
}
