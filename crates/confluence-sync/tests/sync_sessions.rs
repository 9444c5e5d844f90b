//! End-to-end session tests against the mock service layer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use confluence_core::mock::{MockNodeDirectory, MockStreamCache, MockStreamService};
use confluence_core::{
    NODE_ADDRESS_LEN, NodeAddress, STREAM_ID_LEN, StreamId, SyncCookie, SyncError, SyncFrame,
    SyncOp, SyncResult,
};
use confluence_sync::SyncHandler;

fn addr(b: u8) -> NodeAddress {
    NodeAddress::new([b; NODE_ADDRESS_LEN])
}

fn sid(b: u8) -> StreamId {
    StreamId::new([b; STREAM_ID_LEN])
}

struct Session {
    handler: Arc<SyncHandler>,
    sync_id: String,
    rx: mpsc::UnboundedReceiver<SyncFrame>,
    runner: JoinHandle<SyncResult<()>>,
}

impl Session {
    /// Open a session and consume the leading `New` frame.
    async fn open(handler: Arc<SyncHandler>, cookies: Vec<SyncCookie>) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn({
            let handler = handler.clone();
            async move { handler.sync_streams(cookies, &tx).await }
        });
        let first = rx.recv().await.expect("session must send New first");
        assert_eq!(first.op, SyncOp::New);
        Session {
            handler,
            sync_id: first.sync_id,
            rx,
            runner,
        }
    }

    async fn next(&mut self) -> SyncFrame {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("session closed unexpectedly")
    }

    /// Cancel the session and consume the trailing `Close` frame.
    async fn close(mut self) {
        self.handler.cancel_sync(&self.sync_id).await.unwrap();
        loop {
            let frame = self.next().await;
            if frame.op == SyncOp::Close {
                break;
            }
        }
        self.runner.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_adding_tracked_stream_is_noop() {
    let cache = MockStreamCache::new(addr(1));
    let stream = cache.register_stream(sid(2));
    let handler = SyncHandler::new(addr(1), cache.clone(), MockNodeDirectory::new());

    let cookie = SyncCookie::start_of(addr(1), sid(2));
    let mut session = Session::open(handler.clone(), vec![cookie.clone()]).await;

    // A second add of the same stream succeeds without subscribing twice.
    handler
        .add_stream_to_sync(&session.sync_id, cookie)
        .await
        .unwrap();
    assert_eq!(stream.listener_count(), 1);

    // One append produces exactly one update.
    stream.append(1, 1, Bytes::from_static(b"once"));
    let frame = session.next().await;
    assert_eq!(frame.op, SyncOp::Update);

    handler.ping_sync(&session.sync_id, "fence").await.unwrap();
    let frame = session.next().await;
    assert_eq!(frame.op, SyncOp::Pong);

    session.close().await;
}

#[tokio::test]
async fn test_per_stream_ordering_survives_interleaving() {
    let cache = MockStreamCache::new(addr(1));
    let stream_a = cache.register_stream(sid(2));
    let stream_b = cache.register_stream(sid(3));
    let handler = SyncHandler::new(addr(1), cache.clone(), MockNodeDirectory::new());

    let mut session = Session::open(
        handler.clone(),
        vec![
            SyncCookie::start_of(addr(1), sid(2)),
            SyncCookie::start_of(addr(1), sid(3)),
        ],
    )
    .await;

    // Randomly merge two per-stream append schedules.
    const PER_STREAM: u64 = 20;
    let mut rng = rand::rng();
    let (mut next_a, mut next_b) = (1u64, 1u64);
    while next_a <= PER_STREAM || next_b <= PER_STREAM {
        let pick_a = next_b > PER_STREAM || (next_a <= PER_STREAM && rng.random_bool(0.5));
        if pick_a {
            stream_a.append(1, next_a, Bytes::from_static(b"a"));
            next_a += 1;
        } else {
            stream_b.append(1, next_b, Bytes::from_static(b"b"));
            next_b += 1;
        }
    }

    let (mut got_a, mut got_b) = (Vec::new(), Vec::new());
    for _ in 0..(2 * PER_STREAM) {
        let frame = session.next().await;
        assert_eq!(frame.op, SyncOp::Update);
        let cookie = frame.next_cookie.clone().unwrap();
        match frame.stream_id().unwrap() {
            id if id == sid(2) => got_a.push(cookie.slot),
            id if id == sid(3) => got_b.push(cookie.slot),
            other => panic!("unexpected stream {other}"),
        }
    }
    let want: Vec<u64> = (1..=PER_STREAM).collect();
    assert_eq!(got_a, want);
    assert_eq!(got_b, want);

    session.close().await;
}

#[tokio::test]
async fn test_removing_last_remote_stream_drops_connection() {
    let cache = MockStreamCache::new(addr(1));
    let directory = MockNodeDirectory::new();
    let remote = MockStreamService::new(addr(2));
    directory.register(remote.clone());
    let handler = SyncHandler::new(addr(1), cache, directory);

    let cookie = remote.cookie_for(sid(5));
    let mut session = Session::open(handler.clone(), vec![cookie.clone()]).await;
    assert_eq!(remote.connections_opened(), 1);

    handler
        .remove_stream_from_sync(&session.sync_id, sid(5))
        .await
        .unwrap();
    assert_eq!(remote.removed_calls(), vec![(session.sync_id.clone(), sid(5))]);

    // Removing again: the registry no longer knows the stream.
    let err = handler
        .remove_stream_from_sync(&session.sync_id, sid(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));

    // Re-adding builds a fresh connection rather than reusing a dead one.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handler
        .add_stream_to_sync(&session.sync_id, cookie)
        .await
        .unwrap();
    assert_eq!(remote.connections_opened(), 2);

    remote.push_update(remote.cookie_for(sid(5)).advanced(1, 1, [1u8; 32]), Bytes::from_static(b"x")).await;
    let frame = session.next().await;
    assert_eq!(frame.op, SyncOp::Update);

    session.close().await;
}

#[tokio::test]
async fn test_severed_connection_downs_every_stream_once() {
    let cache = MockStreamCache::new(addr(1));
    let local = cache.register_stream(sid(9));
    let directory = MockNodeDirectory::new();
    let remote = MockStreamService::new(addr(2));
    directory.register(remote.clone());
    let handler = SyncHandler::new(addr(1), cache.clone(), directory);

    let mut session = Session::open(
        handler.clone(),
        vec![
            SyncCookie::start_of(addr(1), sid(9)),
            remote.cookie_for(sid(5)),
            remote.cookie_for(sid(6)),
        ],
    )
    .await;

    remote.sever();

    let mut downed = Vec::new();
    for _ in 0..2 {
        let frame = session.next().await;
        assert_eq!(frame.op, SyncOp::Down);
        downed.push(frame.stream_id().unwrap());
    }
    downed.sort();
    assert_eq!(downed, vec![sid(5), sid(6)]);

    // The session itself is unaffected: local traffic still flows and no
    // further Down frames appear.
    local.append(1, 1, Bytes::from_static(b"still here"));
    let frame = session.next().await;
    assert_eq!(frame.op, SyncOp::Update);
    assert_eq!(frame.stream_id(), Some(sid(9)));

    session.close().await;
}

#[tokio::test]
async fn test_unreachable_backend_reports_down_not_failure() {
    let cache = MockStreamCache::new(addr(1));
    cache.register_stream(sid(9));
    let handler = SyncHandler::new(addr(1), cache.clone(), MockNodeDirectory::new());

    // addr(3) resolves to nothing.
    let mut session = Session::open(
        handler.clone(),
        vec![
            SyncCookie::start_of(addr(1), sid(9)),
            SyncCookie::start_of(addr(3), sid(5)),
        ],
    )
    .await;

    let frame = session.next().await;
    assert_eq!(frame.op, SyncOp::Down);
    assert_eq!(frame.stream_id(), Some(sid(5)));

    session.close().await;
}

#[tokio::test]
async fn test_two_nodes_one_down_one_up() {
    let cache = MockStreamCache::new(addr(1));
    let stream_x = cache.register_stream(sid(2));
    let directory = MockNodeDirectory::new();
    let node_y = MockStreamService::new(addr(2));
    directory.register(node_y.clone());
    let handler = SyncHandler::new(addr(1), cache.clone(), directory);

    let y_cookie = node_y.cookie_for(sid(5));
    let mut session = Session::open(
        handler.clone(),
        vec![SyncCookie::start_of(addr(1), sid(2)), y_cookie.clone()],
    )
    .await;

    // Both backends deliver.
    stream_x.append(1, 1, Bytes::from_static(b"x1"));
    let frame = session.next().await;
    assert_eq!(frame.stream_id(), Some(sid(2)));

    node_y
        .push_update(y_cookie.advanced(1, 1, [1u8; 32]), Bytes::from_static(b"y1"))
        .await;
    let frame = session.next().await;
    assert_eq!(frame.stream_id(), Some(sid(5)));

    // Y dies; its stream goes down, X is untouched.
    node_y.sever();
    let frame = session.next().await;
    assert_eq!(frame.op, SyncOp::Down);
    assert_eq!(frame.stream_id(), Some(sid(5)));

    stream_x.append(1, 2, Bytes::from_static(b"x2"));
    let frame = session.next().await;
    assert_eq!(frame.op, SyncOp::Update);
    assert_eq!(frame.stream_id(), Some(sid(2)));

    // Y comes back: re-adding its stream opens a new connection and
    // updates flow again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handler
        .add_stream_to_sync(&session.sync_id, y_cookie.clone())
        .await
        .unwrap();
    assert_eq!(node_y.connections_opened(), 2);

    node_y
        .push_update(y_cookie.advanced(1, 2, [2u8; 32]), Bytes::from_static(b"y2"))
        .await;
    let frame = session.next().await;
    assert_eq!(frame.op, SyncOp::Update);
    assert_eq!(frame.stream_id(), Some(sid(5)));

    session.close().await;
}

#[tokio::test]
async fn test_ping_pong_round_trip() {
    let cache = MockStreamCache::new(addr(1));
    cache.register_stream(sid(2));
    let handler = SyncHandler::new(addr(1), cache.clone(), MockNodeDirectory::new());

    let mut session =
        Session::open(handler.clone(), vec![SyncCookie::start_of(addr(1), sid(2))]).await;

    handler.ping_sync(&session.sync_id, "alive?").await.unwrap();
    let frame = session.next().await;
    assert_eq!(frame.op, SyncOp::Pong);
    assert_eq!(frame.pong_nonce, "alive?");

    session.close().await;
}

#[tokio::test]
async fn test_debug_drop_stream_downs_remote_stream() {
    let cache = MockStreamCache::new(addr(1));
    let directory = MockNodeDirectory::new();
    let remote = MockStreamService::new(addr(2));
    directory.register(remote.clone());
    let handler = SyncHandler::new(addr(1), cache, directory);

    let mut session = Session::open(handler.clone(), vec![remote.cookie_for(sid(5))]).await;

    handler
        .debug_drop_stream(&session.sync_id, sid(5))
        .await
        .unwrap();
    assert_eq!(remote.dropped_calls(), vec![(session.sync_id.clone(), sid(5))]);

    let frame = session.next().await;
    assert_eq!(frame.op, SyncOp::Down);
    assert_eq!(frame.stream_id(), Some(sid(5)));

    session.close().await;
}

#[tokio::test]
async fn test_bad_cookie_rejected_before_session_state_changes() {
    let cache = MockStreamCache::new(addr(1));
    cache.register_stream(sid(2));
    let handler = SyncHandler::new(addr(1), cache.clone(), MockNodeDirectory::new());

    let session = Session::open(handler.clone(), vec![SyncCookie::start_of(addr(1), sid(2))]).await;

    let bad = SyncCookie::start_of(addr(1), StreamId::new([0u8; STREAM_ID_LEN]));
    let err = handler
        .add_stream_to_sync(&session.sync_id, bad)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::BadSyncCookie(_) | SyncError::InvalidArgument(_)));

    session.close().await;
}
