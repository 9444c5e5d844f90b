//! Local syncer
//!
//! Subscribes directly to in-process stream storage, no network involved.
//! Updates are pushed onto the session's merged channel with a non-blocking
//! send: a full channel is fatal to the whole session, because a stuck
//! consumer must never apply backpressure to the storage layer's fan-out to
//! other sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

use confluence_core::{
    CancelScope, ListenerId, NodeAddress, StreamCache, StreamHandle, StreamId, SyncCookie,
    SyncError, SyncFrame, SyncResult, UpdateListener,
};

/// Syncer for streams hosted by this process.
pub struct LocalSyncer {
    sync_id: String,
    local_addr: NodeAddress,
    cache: Arc<dyn StreamCache>,
    session_scope: CancelScope,
    /// Active subscriptions, keyed by stream.
    subscriptions: Mutex<HashMap<StreamId, (Arc<dyn StreamHandle>, ListenerId)>>,
    /// The listener registered with storage for every subscribed stream.
    listener: Arc<LocalUpdateListener>,
}

/// Storage-side callback forwarding updates onto the merged channel.
struct LocalUpdateListener {
    sync_id: String,
    session_scope: CancelScope,
    messages: mpsc::Sender<SyncFrame>,
}

impl UpdateListener for LocalUpdateListener {
    fn on_update(&self, next_cookie: SyncCookie, payload: Bytes) {
        let frame = SyncFrame::update_frame(next_cookie, payload);
        if let Err(err) = try_forward(&self.messages, &self.session_scope, frame) {
            if !err.is_cancellation() {
                error!(sync_id = %self.sync_id, error = %err, "local update fan-in overrun, cancelling session");
                self.session_scope.cancel(err);
            }
        }
    }
}

/// Non-blocking send onto the merged channel.
///
/// `Full` maps to `BufferFull` (fatal to the session); a closed channel
/// means the session is already shutting down.
pub(crate) fn try_forward(
    messages: &mpsc::Sender<SyncFrame>,
    session_scope: &CancelScope,
    frame: SyncFrame,
) -> SyncResult<()> {
    if session_scope.is_cancelled() {
        return Err(SyncError::Canceled("sync operation stopped".into()));
    }
    match messages.try_send(frame) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(SyncError::BufferFull(
            "client sync subscription message channel is full".into(),
        )),
        Err(TrySendError::Closed(_)) => Err(SyncError::Canceled("sync operation stopped".into())),
    }
}

impl LocalSyncer {
    /// Create a local syncer subscribed to every initial cookie's stream.
    ///
    /// Subscriptions are live before this returns; streams that cannot be
    /// subscribed are reported `Down` instead of failing construction.
    pub async fn new(
        sync_id: String,
        session_scope: CancelScope,
        local_addr: NodeAddress,
        cache: Arc<dyn StreamCache>,
        cookies: Vec<SyncCookie>,
        messages: mpsc::Sender<SyncFrame>,
    ) -> Self {
        let listener = Arc::new(LocalUpdateListener {
            sync_id: sync_id.clone(),
            session_scope: session_scope.clone(),
            messages,
        });
        let syncer = Self {
            sync_id,
            local_addr,
            cache,
            session_scope,
            subscriptions: Mutex::new(HashMap::new()),
            listener,
        };
        for cookie in cookies {
            let stream_id = cookie.stream_id;
            if let Err(err) = syncer.subscribe_stream(cookie).await {
                warn!(
                    sync_id = %syncer.sync_id,
                    stream = %stream_id.short_id(),
                    error = %err,
                    "unable to subscribe local stream, reporting it down"
                );
                let _ = try_forward(
                    &syncer.listener.messages,
                    &syncer.session_scope,
                    SyncFrame::down_frame(stream_id),
                );
            }
        }
        syncer
    }

    /// This process's node address.
    pub fn address(&self) -> NodeAddress {
        self.local_addr
    }

    /// Park until the session is cancelled, then unsubscribe everything.
    pub async fn run(&self) {
        self.session_scope.cancelled().await;

        let subs: Vec<_> = {
            let mut map = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().collect()
        };
        for (_, (handle, listener_id)) in subs {
            handle.unsubscribe(listener_id).await;
        }
        debug!(sync_id = %self.sync_id, "local syncer stopped");
    }

    /// Subscribe one more local stream.
    pub async fn add_stream(&self, cookie: SyncCookie) -> SyncResult<()> {
        self.subscribe_stream(cookie).await
    }

    /// Unsubscribe one stream. Returns true when no streams remain.
    pub async fn remove_stream(&self, stream_id: StreamId) -> SyncResult<bool> {
        let (handle, listener_id) = self
            .take_subscription(stream_id)
            .ok_or_else(|| SyncError::stream_not_found(&self.sync_id, stream_id))?;
        handle.unsubscribe(listener_id).await;
        Ok(self.is_empty())
    }

    /// Unsubscribe one stream and report it `Down` to the caller.
    pub async fn debug_drop_stream(&self, stream_id: StreamId) -> SyncResult<bool> {
        let (handle, listener_id) = self
            .take_subscription(stream_id)
            .ok_or_else(|| SyncError::stream_not_found(&self.sync_id, stream_id))?;
        handle.unsubscribe(listener_id).await;
        try_forward(
            &self.listener.messages,
            &self.session_scope,
            SyncFrame::down_frame(stream_id),
        )?;
        Ok(self.is_empty())
    }

    async fn subscribe_stream(&self, cookie: SyncCookie) -> SyncResult<()> {
        let stream_id = cookie.stream_id;
        let handle = self.cache.get_stream_wait_for_local(stream_id).await?;
        let listener_id = handle
            .subscribe(cookie, self.listener.clone() as Arc<dyn UpdateListener>)
            .await?;
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stream_id, (handle, listener_id));
        Ok(())
    }

    fn take_subscription(&self, stream_id: StreamId) -> Option<(Arc<dyn StreamHandle>, ListenerId)> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream_id)
    }

    fn is_empty(&self) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confluence_core::mock::MockStreamCache;
    use confluence_core::{NODE_ADDRESS_LEN, STREAM_ID_LEN, SyncOp};

    fn addr(b: u8) -> NodeAddress {
        NodeAddress::new([b; NODE_ADDRESS_LEN])
    }

    fn sid(b: u8) -> StreamId {
        StreamId::new([b; STREAM_ID_LEN])
    }

    #[tokio::test]
    async fn test_full_channel_cancels_session() {
        let cache = MockStreamCache::new(addr(1));
        let stream = cache.register_stream(sid(2));
        let scope = CancelScope::new();
        let (tx, _rx) = mpsc::channel(1);

        let syncer = LocalSyncer::new(
            "s1".into(),
            scope.clone(),
            addr(1),
            cache.clone(),
            vec![],
            tx,
        )
        .await;
        syncer
            .add_stream(SyncCookie::start_of(addr(1), sid(2)))
            .await
            .unwrap();

        // First update fills the channel, second overruns it.
        stream.append(1, 1, Bytes::from_static(b"a"));
        assert!(!scope.is_cancelled());
        stream.append(1, 2, Bytes::from_static(b"b"));
        assert!(scope.is_cancelled());
        assert!(matches!(scope.cause(), Some(SyncError::BufferFull(_))));
    }

    #[tokio::test]
    async fn test_debug_drop_emits_down_and_unsubscribes() {
        let cache = MockStreamCache::new(addr(1));
        let stream = cache.register_stream(sid(2));
        let scope = CancelScope::new();
        let (tx, mut rx) = mpsc::channel(16);

        let syncer = LocalSyncer::new(
            "s1".into(),
            scope.clone(),
            addr(1),
            cache.clone(),
            vec![],
            tx,
        )
        .await;
        syncer
            .add_stream(SyncCookie::start_of(addr(1), sid(2)))
            .await
            .unwrap();
        assert_eq!(stream.listener_count(), 1);

        let empty = syncer.debug_drop_stream(sid(2)).await.unwrap();
        assert!(empty);
        assert_eq!(stream.listener_count(), 0);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.op, SyncOp::Down);
        assert_eq!(frame.stream_id, Some(sid(2)));
    }

    #[tokio::test]
    async fn test_run_unsubscribes_on_cancel() {
        let cache = MockStreamCache::new(addr(1));
        let stream = cache.register_stream(sid(2));
        let scope = CancelScope::new();
        let (tx, _rx) = mpsc::channel(16);

        let syncer = Arc::new(
            LocalSyncer::new(
                "s1".into(),
                scope.clone(),
                addr(1),
                cache.clone(),
                vec![SyncCookie::start_of(addr(1), sid(2))],
                tx,
            )
            .await,
        );
        assert_eq!(stream.listener_count(), 1);
        let task = tokio::spawn({
            let syncer = syncer.clone();
            async move { syncer.run().await }
        });

        scope.cancel(SyncError::Canceled("test over".into()));
        task.await.unwrap();
        assert_eq!(stream.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_initial_streams_are_subscribed_before_new_returns() {
        let cache = MockStreamCache::new(addr(1));
        let stream = cache.register_stream(sid(2));
        let scope = CancelScope::new();
        let (tx, _rx) = mpsc::channel(16);

        let syncer = LocalSyncer::new(
            "s1".into(),
            scope.clone(),
            addr(1),
            cache.clone(),
            vec![SyncCookie::start_of(addr(1), sid(2))],
            tx,
        )
        .await;

        // The subscription exists without run() ever being polled, so a
        // removal right after construction finds the stream.
        assert_eq!(stream.listener_count(), 1);
        let empty = syncer.remove_stream(sid(2)).await.unwrap();
        assert!(empty);
        assert_eq!(stream.listener_count(), 0);
    }
}
