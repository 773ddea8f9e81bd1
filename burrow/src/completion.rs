//! Cross-thread single-shot results.
//!
//! This is the completion kind that crosses the Runner boundary: the
//! resolving half lives on the I/O thread and is consumed by value, so a
//! completion is resolved at most once by construction; the waiting half
//! blocks an outside thread with a deadline. Work that stays on the I/O
//! thread never uses these; it is driven inline by ordered protocol events
//! (see `client`).

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use crate::error::ClientError;

/// Creates a connected completion/resolver pair.
pub(crate) fn completion<T>() -> (Completion<T>, Resolver<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Completion { rx }, Resolver { tx })
}

/// The waiting half of a single-shot result.
pub(crate) struct Completion<T> {
    rx: Receiver<Result<T, ClientError>>,
}

impl<T> Completion<T> {
    /// Blocks until the result arrives or the deadline passes.
    pub fn wait(self, timeout: Duration) -> Result<T, ClientError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout),
            // the resolver was dropped without resolving: the owning task
            // cancelled the call, typically during a deliberate close
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::disconnected("cancelled")),
        }
    }
}

/// The resolving half of a single-shot result.
pub(crate) struct Resolver<T> {
    tx: SyncSender<Result<T, ClientError>>,
}

impl<T> Resolver<T> {
    /// Resolves the completion, consuming the resolver.
    pub fn resolve(self, result: Result<T, ClientError>) {
        // the waiter may have timed out and gone away
        let _ = self.tx.try_send(result);
    }

    /// Resolves with a success value.
    pub fn ok(self, value: T) {
        self.resolve(Ok(value));
    }

    /// Resolves with a failure.
    pub fn err(self, error: ClientError) {
        self.resolve(Err(error));
    }
}
