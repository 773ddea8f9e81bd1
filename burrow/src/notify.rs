//! The embedder-facing event interface.

use burrow_protocol::{InfoMap, Oid, RemoteError, Tid};

/// Hooks the engine invokes on the embedding application as the session and
/// cache change state.
///
/// Every hook runs on the I/O thread. Implementations must not call back
/// into the client synchronously (that would deadlock the executor) and
/// should hand anything expensive off to another thread.
pub trait StoreListener: Send + Sync {
    /// A session became ready. `info` is the server's info mapping.
    fn notify_connected(&self, info: &InfoMap);

    /// The ready session was lost; the client is reconnecting on its own.
    fn notify_disconnected(&self);

    /// Objects were invalidated by a committed transaction.
    fn invalidate_transaction(&self, tid: Tid, oids: &[Oid]);

    /// The whole local cache was discarded; every piece of cached state the
    /// embedder derived from it is stale.
    fn invalidate_cache(&self);

    /// The persistent cache was too far behind the server and is about to be
    /// dropped.
    fn stale_cache(&self) {}

    /// Per-object outcomes of a transaction vote, unmodified from the wire.
    fn serials(&self, items: &[(Oid, Result<Tid, RemoteError>)]) {
        let _ = items;
    }

    /// The server pushed an updated info mapping.
    fn info(&self, info: &InfoMap) {
        let _ = info;
    }

    /// Start of a blob stream.
    fn blob_start(&self, oid: Oid, serial: Tid) {
        let _ = (oid, serial);
    }

    /// One chunk of a blob stream.
    fn blob_chunk(&self, oid: Oid, serial: Tid, chunk: &[u8]) {
        let _ = (oid, serial, chunk);
    }

    /// End of a blob stream.
    fn blob_stop(&self, oid: Oid, serial: Tid) {
        let _ = (oid, serial);
    }
}
