//! Cache-coherence verification after registration.

mod support;

use std::thread;
use std::time::Duration;

use burrow::wire::message::{self, method};
use burrow::wire::{InfoMap, Oid, Tid};
use burrow::{ClientThread, VerifyOutcome};

use support::{FakeServer, RecordingListener, Seen, SharedCache};

#[test]
fn quick_verification_applies_listed_invalidations() {
    let cache = SharedCache::new();
    cache.preload(Oid(1), Tid(4), b"a");
    cache.preload(Oid(2), Tid(4), b"b");
    cache.preload_tid(Tid(5));

    let server = FakeServer::start(|_, conn| {
        conn.handshake();
        let register = conn.expect_call(method::REGISTER);
        conn.reply_ok(register.id, &Some(Tid(10)));

        let invalidations = conn.expect_call(method::GET_INVALIDATIONS);
        let args: message::GetInvalidations = message::decode_args(&invalidations.body).unwrap();
        assert_eq!(args.tid, Tid(5));
        conn.reply_ok(
            invalidations.id,
            &Some(message::Invalidations {
                tid: Tid(10),
                oids: vec![Oid(1), Oid(2)],
            }),
        );

        let info = conn.expect_call(method::GET_INFO);
        conn.reply_ok(info.id, &InfoMap::new());
        conn.hold_open();
    });

    let listener = RecordingListener::new();
    let mut client = ClientThread::new(
        support::options(vec![server.addr()]),
        listener.clone(),
        Box::new(cache.handle()),
    )
    .unwrap();

    client.wait_connected(None).unwrap();
    assert_eq!(client.status().unwrap().verify, Some(VerifyOutcome::Quick));
    assert_eq!(cache.peek_last_tid(), Some(Tid(10)));
    // the listed objects were dropped from the cache
    assert!(cache.peek(Oid(1), Tid(5)).is_none());
    assert!(cache.peek(Oid(2), Tid(5)).is_none());

    assert!(listener.wait_for(Duration::from_secs(2), |seen| {
        seen.contains(&Seen::InvalidateTransaction(
            Tid(10),
            vec![Oid(1), Oid(2)],
        ))
    }));

    client.close();
    server.assert_clean();
}

#[test]
fn stale_cache_is_cleared() {
    let cache = SharedCache::new();
    cache.preload(Oid(1), Tid(4), b"a");
    cache.preload_tid(Tid(5));

    let server = FakeServer::start(|_, conn| {
        conn.handshake();
        let register = conn.expect_call(method::REGISTER);
        conn.reply_ok(register.id, &Some(Tid(10)));

        // the gap since tid 5 is too large to enumerate
        let invalidations = conn.expect_call(method::GET_INVALIDATIONS);
        conn.reply_ok(invalidations.id, &None::<message::Invalidations>);

        let info = conn.expect_call(method::GET_INFO);
        conn.reply_ok(info.id, &InfoMap::new());
        conn.hold_open();
    });

    let listener = RecordingListener::new();
    let mut client = ClientThread::new(
        support::options(vec![server.addr()]),
        listener.clone(),
        Box::new(cache.handle()),
    )
    .unwrap();

    client.wait_connected(None).unwrap();
    assert_eq!(client.status().unwrap().verify, Some(VerifyOutcome::Stale));
    assert!(cache.peek_empty());
    assert_eq!(cache.peek_last_tid(), Some(Tid(10)));

    assert!(listener.wait_for(Duration::from_secs(2), |seen| {
        let stale = seen.iter().position(|e| *e == Seen::StaleCache);
        let cleared = seen.iter().position(|e| *e == Seen::InvalidateCache);
        matches!((stale, cleared), (Some(s), Some(c)) if s < c)
    }));

    client.close();
    server.assert_clean();
}

#[test]
fn up_to_date_cache_needs_no_work() {
    let cache = SharedCache::new();
    cache.preload(Oid(1), Tid(4), b"a");
    cache.preload_tid(Tid(10));

    let server = FakeServer::start(|_, conn| {
        conn.serve_session(10);
        conn.hold_open();
    });

    let listener = RecordingListener::new();
    let mut client = ClientThread::new(
        support::options(vec![server.addr()]),
        listener,
        Box::new(cache.handle()),
    )
    .unwrap();

    client.wait_connected(None).unwrap();
    assert_eq!(client.status().unwrap().verify, Some(VerifyOutcome::UpToDate));
    // no invalidation round-trip happened
    assert_eq!(server.count_calls(method::GET_INVALIDATIONS), 0);
    assert!(cache.peek(Oid(1), Tid(5)).is_some());

    client.close();
    server.assert_clean();
}

#[test]
fn cache_without_recorded_tid_is_dropped() {
    let cache = SharedCache::new();
    cache.preload(Oid(1), Tid(4), b"a");

    let server = FakeServer::start(|_, conn| {
        conn.serve_session(10);
        conn.hold_open();
    });

    let listener = RecordingListener::new();
    let mut client = ClientThread::new(
        support::options(vec![server.addr()]),
        listener.clone(),
        Box::new(cache.handle()),
    )
    .unwrap();

    client.wait_connected(None).unwrap();
    assert_eq!(
        client.status().unwrap().verify,
        Some(VerifyOutcome::MissingTid)
    );
    assert!(cache.peek_empty());
    assert_eq!(cache.peek_last_tid(), Some(Tid(10)));
    assert!(listener.wait_for(Duration::from_secs(2), |seen| {
        seen.contains(&Seen::InvalidateCache)
    }));

    client.close();
    server.assert_clean();
}

#[test]
fn cache_ahead_of_server_aborts_registration() {
    let cache = SharedCache::new();
    cache.preload(Oid(1), Tid(19), b"a");
    cache.preload_tid(Tid(20));

    let server = FakeServer::start(|_, conn| {
        conn.handshake();
        let register = conn.expect_call(method::REGISTER);
        conn.reply_ok(register.id, &Some(Tid(10)));
        // the client abandons the connection instead of verifying
        assert!(conn.next_call().is_none());
    });

    let listener = RecordingListener::new();
    let mut client = ClientThread::new(
        support::options(vec![server.addr()]),
        listener.clone(),
        Box::new(cache.handle()),
    )
    .unwrap();

    thread::sleep(Duration::from_millis(300));
    assert!(!client.is_connected());
    assert_eq!(
        client.status().unwrap().verify,
        Some(VerifyOutcome::CacheAhead)
    );
    // the cache was left alone
    assert_eq!(cache.peek_last_tid(), Some(Tid(20)));
    assert!(!listener
        .seen()
        .iter()
        .any(|event| matches!(event, Seen::Connected(_))));

    client.close();
    server.assert_clean();
}

#[test]
fn register_without_tid_asks_for_last_transaction() {
    let server = FakeServer::start(|_, conn| {
        conn.handshake();
        let register = conn.expect_call(method::REGISTER);
        conn.reply_ok(register.id, &None::<Tid>);

        let last = conn.expect_call(method::LAST_TRANSACTION);
        conn.reply_ok(last.id, &Tid(10));

        let info = conn.expect_call(method::GET_INFO);
        conn.reply_ok(info.id, &InfoMap::new());
        conn.hold_open();
    });

    let listener = RecordingListener::new();
    let mut client = ClientThread::new(
        support::options(vec![server.addr()]),
        listener,
        Box::new(SharedCache::new().handle()),
    )
    .unwrap();

    client.wait_connected(None).unwrap();
    assert_eq!(
        client.status().unwrap().verify,
        Some(VerifyOutcome::EmptyCache)
    );

    client.close();
    server.assert_clean();
}
