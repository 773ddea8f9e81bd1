//! Session establishment: handshake, version negotiation, registration, and
//! the read-only fallback upgrade.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use burrow::wire::message::{self, method};
use burrow::wire::{InfoMap, RemoteError, RemoteErrorKind, Tid};
use burrow::{ClientThread, MemCache, ReadOnly, VerifyOutcome};

use support::{dead_addr, eventually, FakeServer, RecordingListener, Seen};

#[test]
fn register_with_empty_cache_becomes_ready() {
    let server = FakeServer::start(|_, conn| {
        conn.send_version(b"BRW4");
        conn.expect_version_echo(b"BRW4");

        let register = conn.expect_call(method::REGISTER);
        let args: message::Register = message::decode_args(&register.body).unwrap();
        assert_eq!(args.storage_key, "1");
        assert!(!args.read_only);
        conn.reply_ok(register.id, &Some(Tid(10)));

        let info = conn.expect_call(method::GET_INFO);
        let mut map = InfoMap::new();
        map.insert("name".to_owned(), "test storage".to_owned());
        conn.reply_ok(info.id, &map);

        conn.hold_open();
    });

    let listener = RecordingListener::new();
    let mut client = ClientThread::new(
        support::options(vec![server.addr()]),
        listener.clone(),
        Box::new(MemCache::new()),
    )
    .unwrap();

    client.wait_connected(None).unwrap();
    assert!(client.is_connected());
    assert!(!client.is_read_only());

    let status = client.status().unwrap();
    assert!(status.ready);
    assert_eq!(status.read_only, Some(false));
    assert_eq!(status.verify, Some(VerifyOutcome::EmptyCache));
    assert_eq!(status.protocol_version.as_deref(), Some("BRW4"));

    assert!(listener.wait_for(Duration::from_secs(2), |seen| {
        seen.iter().any(|event| {
            matches!(event, Seen::Connected(info)
                if info.get("name").map(String::as_str) == Some("test storage"))
        })
    }));

    client.close();
    server.assert_clean();
}

#[test]
fn newer_server_version_is_clamped() {
    let server = FakeServer::start(|_, conn| {
        // a server from the future still speaks our dialect
        conn.send_version(b"BRW9");
        conn.expect_version_echo(b"BRW4");
        let register = conn.expect_call(method::REGISTER);
        conn.reply_ok(register.id, &Some(Tid(1)));
        let info = conn.expect_call(method::GET_INFO);
        conn.reply_ok(info.id, &InfoMap::new());
        conn.hold_open();
    });

    let listener = RecordingListener::new();
    let mut client = ClientThread::new(
        support::options(vec![server.addr()]),
        listener,
        Box::new(MemCache::new()),
    )
    .unwrap();

    client.wait_connected(None).unwrap();
    let status = client.status().unwrap();
    assert_eq!(status.protocol_version.as_deref(), Some("BRW4"));

    client.close();
    server.assert_clean();
}

#[test]
fn unknown_server_version_fails_registration() {
    let server = FakeServer::start(|_, conn| {
        conn.send_version(b"AXE1");
        // the client reports a protocol error and hangs up without echoing
        assert!(conn.next_call().is_none());
    });

    let listener = RecordingListener::new();
    let mut client = ClientThread::new(
        support::options(vec![server.addr()]),
        listener.clone(),
        Box::new(MemCache::new()),
    )
    .unwrap();

    thread::sleep(Duration::from_millis(300));
    assert!(!client.is_connected());
    assert!(listener.seen().is_empty());

    client.close();
    server.assert_clean();
}

#[test]
fn new_addrs_takes_effect_while_hunting() {
    let server = FakeServer::start(|_, conn| {
        conn.serve_session(10);
        conn.hold_open();
    });

    let listener = RecordingListener::new();
    // start against an address nothing answers on
    let mut client = ClientThread::new(
        support::options(vec![dead_addr()]),
        listener,
        Box::new(MemCache::new()),
    )
    .unwrap();

    thread::sleep(Duration::from_millis(100));
    assert!(!client.is_connected());

    client.new_addrs(vec![server.addr()]).unwrap();
    client.wait_connected(None).unwrap();
    assert!(client.is_connected());

    client.close();
    server.assert_clean();
}

#[test]
fn read_only_fallback_upgrades_to_writable() {
    let release_writable = Arc::new(AtomicBool::new(false));

    let read_only_server = FakeServer::start(|_, conn| {
        conn.handshake();

        let register = conn.expect_call(method::REGISTER);
        let args: message::Register = message::decode_args(&register.body).unwrap();
        assert!(!args.read_only);
        conn.reply_err(
            register.id,
            RemoteError::new(RemoteErrorKind::ReadOnly, "writes disabled"),
        );

        // fallback: the client retries the registration read-only
        let register = conn.expect_call(method::REGISTER);
        let args: message::Register = message::decode_args(&register.body).unwrap();
        assert!(args.read_only);
        conn.reply_ok(register.id, &Some(Tid(10)));

        let info = conn.expect_call(method::GET_INFO);
        conn.reply_ok(info.id, &InfoMap::new());

        // closed by the client once the writable connection wins
        conn.hold_open();
    });

    let gate = release_writable.clone();
    let writable_server = FakeServer::start(move |_, conn| {
        while !gate.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(10));
        }
        conn.serve_session(12);
        conn.hold_open();
    });

    let listener = RecordingListener::new();
    let mut options = support::options(vec![read_only_server.addr(), writable_server.addr()]);
    options.read_only = ReadOnly::Fallback;
    let mut client =
        ClientThread::new(options, listener.clone(), Box::new(MemCache::new())).unwrap();

    client.wait_connected(None).unwrap();
    assert!(client.is_connected());
    assert!(client.is_read_only());
    assert_eq!(client.status().unwrap().read_only, Some(true));

    release_writable.store(true, Ordering::SeqCst);

    assert!(eventually(Duration::from_secs(5), || {
        client.is_connected() && !client.is_read_only()
    }));
    let status = client.status().unwrap();
    assert_eq!(status.read_only, Some(false));
    assert_eq!(status.verify, Some(VerifyOutcome::EmptyCache));

    // a fresh verification round ran against the writable server
    assert_eq!(writable_server.count_calls(method::GET_INFO), 1);
    assert_eq!(
        listener
            .seen()
            .iter()
            .filter(|event| matches!(event, Seen::Connected(_)))
            .count(),
        2
    );

    client.close();
    read_only_server.assert_clean();
    writable_server.assert_clean();
}
