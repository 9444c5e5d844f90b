//! In-memory mock collaborators for testing
//!
//! Provides scriptable implementations of the collaborator traits so sync
//! logic can be exercised without real networking or storage.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use confluence_core::mock::{MockStreamCache, MockStreamService};
//!
//! let backend = MockStreamService::new();
//! let handle = backend.sync_streams(vec![cookie]).await.unwrap();
//! backend.push_update(next_cookie, payload).await;
//! backend.sever(); // simulate the connection dying
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::cookie::SyncCookie;
use crate::error::{SyncError, SyncResult};
use crate::frame::SyncFrame;
use crate::service::{
    ListenerId, NodeDirectory, StreamCache, StreamHandle, StreamServiceClient, SyncStreamHandle,
    UpdateListener,
};
use crate::stream_id::{NodeAddress, StreamId};

/// Buffer size for mock sync connections.
const MOCK_CONNECTION_BUFFER: usize = 256;

/// Receiving half of a mock sync connection.
pub struct MockSyncStreamHandle {
    rx: mpsc::Receiver<SyncFrame>,
}

#[async_trait]
impl SyncStreamHandle for MockSyncStreamHandle {
    async fn recv(&mut self) -> Option<SyncFrame> {
        self.rx.recv().await
    }
}

/// A scriptable mock backend node.
///
/// Tests push frames onto the live connection, sever it to simulate a
/// transport failure, and inspect the control calls the engine issued.
pub struct MockStreamService {
    /// This mock node's address, used to build cookies in tests.
    address: NodeAddress,
    /// Senders for connections opened via `sync_streams`, newest last.
    connections: Mutex<Vec<mpsc::Sender<SyncFrame>>>,
    /// Monotonic counter for minted sync ids.
    next_sync_id: AtomicU64,
    /// Refuse new connections with `Unavailable` while non-zero.
    fail_connects_remaining: AtomicU32,
    /// Fail `add_stream_to_sync` with `Unavailable` while non-zero.
    fail_adds_remaining: AtomicU32,
    /// Send a garbage first frame instead of `New` on the next connection.
    bad_first_frame: AtomicU32,
    /// Do not answer pings on the connection while non-zero.
    pongs_muted: AtomicU32,
    /// Recorded control calls.
    added: Mutex<Vec<(String, SyncCookie)>>,
    removed: Mutex<Vec<(String, StreamId)>>,
    pings: Mutex<Vec<(String, String)>>,
    cancels: Mutex<Vec<String>>,
    dropped: Mutex<Vec<(String, StreamId)>>,
}

impl MockStreamService {
    /// Create a mock backend with the given node address.
    pub fn new(address: NodeAddress) -> Arc<Self> {
        Arc::new(Self {
            address,
            connections: Mutex::new(Vec::new()),
            next_sync_id: AtomicU64::new(1),
            fail_connects_remaining: AtomicU32::new(0),
            fail_adds_remaining: AtomicU32::new(0),
            bad_first_frame: AtomicU32::new(0),
            pongs_muted: AtomicU32::new(0),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            pings: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
        })
    }

    /// This mock node's address.
    pub fn address(&self) -> NodeAddress {
        self.address
    }

    /// Build a start-of-stream cookie owned by this node.
    pub fn cookie_for(&self, stream_id: StreamId) -> SyncCookie {
        SyncCookie::start_of(self.address, stream_id)
    }

    /// Refuse the next `n` connection attempts with `Unavailable`.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `add_stream_to_sync` calls with `Unavailable`.
    pub fn fail_next_adds(&self, n: u32) {
        self.fail_adds_remaining.store(n, Ordering::SeqCst);
    }

    /// Open the next connection with a non-`New` first frame.
    pub fn bad_first_frame_next_connect(&self) {
        self.bad_first_frame.store(1, Ordering::SeqCst);
    }

    /// Stop answering pings, simulating a backend that accepts the unary
    /// call but whose stream has gone silent.
    pub fn mute_pongs(&self) {
        self.pongs_muted.store(1, Ordering::SeqCst);
    }

    /// Push a frame onto the most recent live connection.
    pub async fn push_frame(&self, frame: SyncFrame) {
        let sender = {
            let conns = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            conns.last().cloned()
        };
        if let Some(tx) = sender {
            let _ = tx.send(frame).await;
        }
    }

    /// Push an `Update` frame for one stream.
    pub async fn push_update(&self, next_cookie: SyncCookie, payload: Bytes) {
        self.push_frame(SyncFrame::update_frame(next_cookie, payload))
            .await;
    }

    /// Push a `Down` frame for one stream.
    pub async fn push_down(&self, stream_id: StreamId) {
        self.push_frame(SyncFrame::down_frame(stream_id)).await;
    }

    /// Push a `Close` frame, then end the connection.
    pub async fn push_close(&self) {
        let sync_id = format!("mock-{}", self.next_sync_id.load(Ordering::SeqCst) - 1);
        self.push_frame(SyncFrame::close_frame(sync_id)).await;
        self.sever();
    }

    /// Drop all connection senders, simulating a dead transport.
    pub fn sever(&self) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of connections opened so far.
    pub fn connections_opened(&self) -> u64 {
        self.next_sync_id.load(Ordering::SeqCst) - 1
    }

    /// Recorded `add_stream_to_sync` calls.
    pub fn added_calls(&self) -> Vec<(String, SyncCookie)> {
        self.added.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recorded `remove_stream_from_sync` calls.
    pub fn removed_calls(&self) -> Vec<(String, StreamId)> {
        self.removed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Recorded `ping_sync` calls.
    pub fn ping_calls(&self) -> Vec<(String, String)> {
        self.pings.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recorded `debug_drop_stream` calls.
    pub fn dropped_calls(&self) -> Vec<(String, StreamId)> {
        self.dropped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_flag(flag: &AtomicU32) -> bool {
        flag.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StreamServiceClient for MockStreamService {
    async fn sync_streams(
        &self,
        _cookies: Vec<SyncCookie>,
    ) -> SyncResult<Box<dyn SyncStreamHandle>> {
        if Self::take_flag(&self.fail_connects_remaining) {
            return Err(SyncError::Unavailable(format!(
                "mock node {} refusing connections",
                self.address.short_id()
            )));
        }

        let (tx, rx) = mpsc::channel(MOCK_CONNECTION_BUFFER);
        let n = self.next_sync_id.fetch_add(1, Ordering::SeqCst);
        let sync_id = format!("mock-{n}");

        let first = if Self::take_flag(&self.bad_first_frame) {
            SyncFrame::pong_frame(sync_id, "unexpected")
        } else {
            SyncFrame::new_frame(sync_id)
        };
        tx.send(first)
            .await
            .map_err(|_| SyncError::Unavailable("mock connection closed".into()))?;

        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);

        Ok(Box::new(MockSyncStreamHandle { rx }))
    }

    async fn add_stream_to_sync(&self, sync_id: &str, cookie: SyncCookie) -> SyncResult<()> {
        if Self::take_flag(&self.fail_adds_remaining) {
            return Err(SyncError::Unavailable(format!(
                "mock node {} refusing add",
                self.address.short_id()
            )));
        }
        self.added
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((sync_id.to_string(), cookie));
        Ok(())
    }

    async fn remove_stream_from_sync(&self, sync_id: &str, stream_id: StreamId) -> SyncResult<()> {
        self.removed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((sync_id.to_string(), stream_id));
        Ok(())
    }

    async fn ping_sync(&self, sync_id: &str, nonce: &str) -> SyncResult<()> {
        self.pings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((sync_id.to_string(), nonce.to_string()));
        // A live backend answers on the stream.
        if self.pongs_muted.load(Ordering::SeqCst) == 0 {
            self.push_frame(SyncFrame::pong_frame(sync_id, nonce)).await;
        }
        Ok(())
    }

    async fn cancel_sync(&self, sync_id: &str) -> SyncResult<()> {
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sync_id.to_string());
        Ok(())
    }

    async fn debug_drop_stream(&self, sync_id: &str, stream_id: StreamId) -> SyncResult<()> {
        self.dropped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((sync_id.to_string(), stream_id));
        // The backend reports the dropped stream down on the connection.
        self.push_down(stream_id).await;
        Ok(())
    }
}

/// Node directory backed by a static address -> mock service map.
#[derive(Default)]
pub struct MockNodeDirectory {
    nodes: Mutex<HashMap<NodeAddress, Arc<MockStreamService>>>,
}

impl MockNodeDirectory {
    /// Create an empty directory.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a mock node under its address.
    pub fn register(&self, service: Arc<MockStreamService>) {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service.address(), service);
    }

    /// Remove a node, making its address unresolvable.
    pub fn deregister(&self, address: NodeAddress) {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&address);
    }
}

impl NodeDirectory for MockNodeDirectory {
    fn client_for_address(&self, address: NodeAddress) -> SyncResult<Arc<dyn StreamServiceClient>> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address)
            .cloned()
            .map(|s| s as Arc<dyn StreamServiceClient>)
            .ok_or_else(|| {
                SyncError::Unavailable(format!("no node at address {}", address.short_id()))
            })
    }
}

/// One in-memory local stream.
pub struct MockLocalStream {
    node_address: NodeAddress,
    stream_id: StreamId,
    next_listener: AtomicU64,
    listeners: Mutex<HashMap<ListenerId, Arc<dyn UpdateListener>>>,
}

impl MockLocalStream {
    /// Append an update, notifying every listener in order.
    pub fn append(&self, generation: u64, slot: u64, payload: Bytes) {
        let cookie = SyncCookie {
            node_address: self.node_address,
            stream_id: self.stream_id,
            generation,
            slot,
            prev_hash: [0u8; 32],
        };
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener.on_update(cookie.clone(), payload.clone());
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl StreamHandle for MockLocalStream {
    fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    async fn subscribe(
        &self,
        _cookie: SyncCookie,
        listener: Arc<dyn UpdateListener>,
    ) -> SyncResult<ListenerId> {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);
        Ok(id)
    }

    async fn unsubscribe(&self, listener: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&listener);
    }
}

/// In-memory local stream storage.
pub struct MockStreamCache {
    node_address: NodeAddress,
    streams: Mutex<HashMap<StreamId, Arc<MockLocalStream>>>,
}

impl MockStreamCache {
    /// Create storage for the node at `node_address`.
    pub fn new(node_address: NodeAddress) -> Arc<Self> {
        Arc::new(Self {
            node_address,
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// This node's address.
    pub fn node_address(&self) -> NodeAddress {
        self.node_address
    }

    /// Create a local stream that tests can append to.
    pub fn register_stream(&self, stream_id: StreamId) -> Arc<MockLocalStream> {
        let stream = Arc::new(MockLocalStream {
            node_address: self.node_address,
            stream_id,
            next_listener: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        });
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stream_id, stream.clone());
        stream
    }
}

#[async_trait]
impl StreamCache for MockStreamCache {
    async fn get_stream_wait_for_local(
        &self,
        stream_id: StreamId,
    ) -> SyncResult<Arc<dyn StreamHandle>> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&stream_id)
            .cloned()
            .map(|s| s as Arc<dyn StreamHandle>)
            .ok_or_else(|| {
                SyncError::NotFound(format!("no local stream {}", stream_id.short_id()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_id::{NODE_ADDRESS_LEN, STREAM_ID_LEN};

    fn addr(b: u8) -> NodeAddress {
        NodeAddress::new([b; NODE_ADDRESS_LEN])
    }

    fn sid(b: u8) -> StreamId {
        StreamId::new([b; STREAM_ID_LEN])
    }

    #[tokio::test]
    async fn test_mock_connection_starts_with_new() {
        let svc = MockStreamService::new(addr(1));
        let mut handle = svc.sync_streams(vec![]).await.unwrap();
        let first = handle.recv().await.unwrap();
        assert_eq!(first.op, crate::frame::SyncOp::New);
        assert!(!first.sync_id.is_empty());
    }

    #[tokio::test]
    async fn test_sever_ends_connection() {
        let svc = MockStreamService::new(addr(1));
        let mut handle = svc.sync_streams(vec![]).await.unwrap();
        let _ = handle.recv().await.unwrap();
        svc.sever();
        assert!(handle.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fail_next_adds_counts_down() {
        let svc = MockStreamService::new(addr(1));
        svc.fail_next_adds(2);
        let cookie = svc.cookie_for(sid(5));
        assert!(svc.add_stream_to_sync("s", cookie.clone()).await.is_err());
        assert!(svc.add_stream_to_sync("s", cookie.clone()).await.is_err());
        assert!(svc.add_stream_to_sync("s", cookie).await.is_ok());
        assert_eq!(svc.added_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_local_stream_fan_out() {
        let cache = MockStreamCache::new(addr(2));
        let stream = cache.register_stream(sid(3));

        struct Collect(Mutex<Vec<u64>>);
        impl UpdateListener for Collect {
            fn on_update(&self, cookie: SyncCookie, _payload: Bytes) {
                self.0
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(cookie.slot);
            }
        }

        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let handle = cache.get_stream_wait_for_local(sid(3)).await.unwrap();
        let id = handle
            .subscribe(svc_cookie(&cache, sid(3)), sink.clone())
            .await
            .unwrap();

        stream.append(1, 1, Bytes::from_static(b"a"));
        stream.append(1, 2, Bytes::from_static(b"b"));
        handle.unsubscribe(id).await;
        stream.append(1, 3, Bytes::from_static(b"c"));

        assert_eq!(*sink.0.lock().unwrap(), vec![1, 2]);
        assert_eq!(stream.listener_count(), 0);
    }

    fn svc_cookie(cache: &MockStreamCache, stream_id: StreamId) -> SyncCookie {
        SyncCookie::start_of(cache.node_address(), stream_id)
    }
}
