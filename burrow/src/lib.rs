//! # burrow
//!
//! Asynchronous, cache-coherent client engine for Burrow transactional
//! object stores.
//!
//! A [`ClientThread`] owns a dedicated I/O thread running a current-thread
//! executor. On that thread a client session races connection attempts
//! against every configured server address, negotiates a protocol version,
//! registers (optionally falling back to read-only), verifies the persistent
//! local cache against the server's transaction history, and then serves as
//! a pipelined request/response multiplexer until the connection is lost.
//! After a loss it reconnects and re-verifies on its own.
//!
//! Outside threads interact only through the synchronous [`ClientThread`]
//! surface. The embedding application observes invalidations and connection
//! events through its [`StoreListener`], and supplies the persistent cache
//! behind the [`ClientCache`] trait.

#![warn(missing_docs)]

use std::time::Duration;

mod cache;
mod client;
mod completion;
mod error;
mod notify;
mod protocol;
mod runner;
mod transport;

pub use burrow_protocol as wire;
pub use burrow_protocol::{InfoMap, Oid, RemoteError, RemoteErrorKind, Revision, Tid};

pub use cache::{ClientCache, MemCache};
pub use client::{ClientStatus, CommitUpdate, VerifyOutcome};
pub use error::ClientError;
pub use notify::StoreListener;
pub use runner::ClientThread;
pub use transport::ServerAddr;
#[cfg(feature = "tls")]
pub use transport::TlsOptions;

/// Client-wide read-only preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOnly {
    /// Require a writable session.
    No,
    /// Require a read-only session.
    Yes,
    /// Prefer writable; accept read-only if the server refuses writes right
    /// now, and keep hunting for a writable connection in the background.
    Fallback,
}

/// Configuration of a client.
#[derive(Debug, Clone)]
pub struct Options {
    /// Candidate server addresses; attempts race in parallel.
    pub addrs: Vec<ServerAddr>,
    /// Which storage on the server to register against.
    pub storage_key: String,
    /// Read-only preference.
    pub read_only: ReadOnly,
    /// Base delay between attempts to reach one address.
    pub connect_poll: Duration,
    /// Base delay before reconnecting after every candidate failed to
    /// register.
    pub register_failed_poll: Duration,
    /// Keepalive period on an established connection.
    pub heartbeat_interval: Duration,
    /// Default deadline for synchronous calls.
    pub timeout: Duration,
    /// Seed for the retry-jitter generator; fixed in tests, entropy in
    /// production.
    pub jitter_seed: Option<u64>,
    /// TLS settings for TCP addresses.
    #[cfg(feature = "tls")]
    pub tls: Option<TlsOptions>,
}

impl Options {
    /// Options for the given addresses with the defaults filled in.
    pub fn new(addrs: Vec<ServerAddr>) -> Options {
        Options {
            addrs,
            storage_key: "1".to_owned(),
            read_only: ReadOnly::No,
            connect_poll: Duration::from_secs(1),
            register_failed_poll: Duration::from_secs(9),
            heartbeat_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            jitter_seed: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl Default for Options {
    fn default() -> Options {
        Options::new(Vec::new())
    }
}
