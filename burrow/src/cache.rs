//! Client-side object cache: the interface the engine drives, and an
//! in-memory implementation.

use std::collections::HashMap;

use burrow_protocol::{Oid, Revision, Tid};

/// Persistent mapping from object id to historical revisions, with the last
/// transaction the cache is known to reflect.
///
/// The engine owns the cache and mutates it only from the I/O thread, so
/// implementations need `Send` but no interior synchronization. The cache
/// survives reconnects; it is closed once, when the client closes.
pub trait ClientCache: Send {
    /// Returns the revision of `oid` visible before `tid`, if cached.
    fn load_before(&self, oid: Oid, tid: Tid) -> Option<Revision>;

    /// Stores a revision written at `start` and superseded at `end`
    /// (open-ended when `None`).
    fn store(&mut self, oid: Oid, start: Tid, end: Option<Tid>, data: &[u8]);

    /// Closes the open revision of `oid` at `tid`, or forgets the object
    /// entirely when `tid` is `None`.
    fn invalidate(&mut self, oid: Oid, tid: Option<Tid>);

    /// The last transaction this cache reflects, if recorded.
    fn last_tid(&self) -> Option<Tid>;

    /// Records the last reflected transaction.
    fn set_last_tid(&mut self, tid: Tid);

    /// Whether no objects are cached.
    fn is_empty(&self) -> bool;

    /// Drops every cached object and the recorded tid.
    fn clear(&mut self);

    /// Releases underlying resources. Called once, at client close.
    fn close(&mut self) {}
}

/// In-memory [`ClientCache`].
///
/// Revisions are kept per object as `[start, end)` validity windows; an open
/// window (`end == None`) is the current revision.
#[derive(Debug, Default)]
pub struct MemCache {
    objects: HashMap<Oid, Vec<Span>>,
    last_tid: Option<Tid>,
}

#[derive(Debug, Clone)]
struct Span {
    start: Tid,
    end: Option<Tid>,
    data: Vec<u8>,
}

impl MemCache {
    /// An empty cache.
    pub fn new() -> MemCache {
        MemCache::default()
    }
}

impl ClientCache for MemCache {
    fn load_before(&self, oid: Oid, tid: Tid) -> Option<Revision> {
        let spans = self.objects.get(&oid)?;
        spans
            .iter()
            .find(|span| span.start < tid && span.end.map_or(true, |end| tid <= end))
            .map(|span| Revision {
                data: span.data.clone(),
                start: span.start,
                end: span.end,
            })
    }

    fn store(&mut self, oid: Oid, start: Tid, end: Option<Tid>, data: &[u8]) {
        let spans = self.objects.entry(oid).or_default();
        // a re-store of the same revision replaces it
        spans.retain(|span| span.start != start);
        spans.push(Span {
            start,
            end,
            data: data.to_vec(),
        });
    }

    fn invalidate(&mut self, oid: Oid, tid: Option<Tid>) {
        match tid {
            None => {
                self.objects.remove(&oid);
            }
            Some(tid) => {
                if let Some(spans) = self.objects.get_mut(&oid) {
                    for span in spans.iter_mut() {
                        if span.end.is_none() {
                            span.end = Some(tid);
                        }
                    }
                }
            }
        }
    }

    fn last_tid(&self) -> Option<Tid> {
        self.last_tid
    }

    fn set_last_tid(&mut self, tid: Tid) {
        self.last_tid = Some(tid);
    }

    fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn clear(&mut self) {
        self.objects.clear();
        self.last_tid = None;
    }
}
