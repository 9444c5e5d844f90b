//! Remote syncer
//!
//! Owns one multiplexed sync connection to a remote node: performs the
//! handshake (first frame must be `New`), forwards `Update`/`Down` frames to
//! the session's merged channel, and runs an independent liveness watchdog.
//! If the connection dies while streams are still tracked, one `Down` is
//! synthesized per stream so callers never silently lose a stream.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
// tokio's Instant so the paused test clock drives the watchdog.
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use confluence_core::{
    CancelScope, NodeAddress, StreamId, StreamServiceClient, SyncCookie, SyncError, SyncFrame,
    SyncOp, SyncResult, SyncStreamHandle,
};

use crate::local::try_forward;

/// How often the watchdog checks connection activity.
const PING_TICK: Duration = Duration::from_secs(3);

/// No ping is sent while a frame arrived within this interval.
const RECENT_ACTIVITY_INTERVAL: Duration = Duration::from_secs(15);

/// The connection is declared dead after this long without any frame.
const RECENT_ACTIVITY_DEADLINE: Duration = Duration::from_secs(30);

/// Syncer forwarding one remote node's multiplexed sync connection.
pub struct RemoteSyncer {
    /// Session id used between the caller and this process, for logging.
    session_sync_id: String,
    /// Sync id assigned by the remote backend during the handshake.
    sync_id: String,
    remote_addr: NodeAddress,
    client: Arc<dyn StreamServiceClient>,
    session_scope: CancelScope,
    /// Scope of this one connection; cancelling it stops only this syncer.
    conn_scope: CancelScope,
    messages: mpsc::Sender<SyncFrame>,
    streams: Mutex<HashSet<StreamId>>,
    /// Receiving half of the connection, taken by `run`.
    handle: tokio::sync::Mutex<Option<Box<dyn SyncStreamHandle>>>,
    /// When the last frame was received; shared with the watchdog.
    last_recv: Arc<Mutex<Instant>>,
}

impl RemoteSyncer {
    /// Open the multiplexed connection and perform the handshake.
    ///
    /// The caller is responsible for reporting the cookies' streams `Down`
    /// if this fails.
    pub async fn new(
        session_sync_id: String,
        session_scope: CancelScope,
        remote_addr: NodeAddress,
        client: Arc<dyn StreamServiceClient>,
        cookies: Vec<SyncCookie>,
        messages: mpsc::Sender<SyncFrame>,
    ) -> SyncResult<Self> {
        let mut handle = client.sync_streams(cookies.clone()).await?;

        let first = handle.recv().await.ok_or_else(|| {
            SyncError::Unavailable(format!(
                "connection to {} closed before handshake",
                remote_addr.short_id()
            ))
        })?;
        if first.op != SyncOp::New || first.sync_id.is_empty() {
            error!(
                remote = %remote_addr.short_id(),
                op = ?first.op,
                "unexpected first frame on sync connection"
            );
            return Err(SyncError::BadSyncCookie(format!(
                "expected NEW as first frame from {}",
                remote_addr.short_id()
            )));
        }

        let streams = cookies.iter().map(|c| c.stream_id).collect();

        Ok(Self {
            session_sync_id,
            sync_id: first.sync_id,
            remote_addr,
            client,
            session_scope,
            conn_scope: CancelScope::new(),
            messages,
            streams: Mutex::new(streams),
            handle: tokio::sync::Mutex::new(Some(handle)),
            last_recv: Arc::new(Mutex::new(Instant::now())),
        })
    }

    /// The remote node's address.
    pub fn address(&self) -> NodeAddress {
        self.remote_addr
    }

    /// Receive loop plus liveness watchdog; runs until the session stops,
    /// the connection is cancelled, or the transport dies.
    pub async fn run(&self) {
        let Some(mut handle) = self.handle.lock().await.take() else {
            return;
        };
        *self.last_recv.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();

        let watchdog = tokio::spawn(connection_alive(
            self.client.clone(),
            self.sync_id.clone(),
            self.remote_addr,
            self.conn_scope.clone(),
            self.last_recv.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.conn_scope.cancelled() => break,
                _ = self.session_scope.cancelled() => break,
                frame = handle.recv() => {
                    let Some(frame) = frame else {
                        info!(remote = %self.remote_addr.short_id(), "remote node disconnected");
                        break;
                    };
                    *self.last_recv.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                    match frame.op {
                        SyncOp::Update => {
                            if self.forward(frame).is_err() {
                                break;
                            }
                        }
                        SyncOp::Down => {
                            let stream_id = frame.stream_id();
                            if self.forward(frame).is_err() {
                                break;
                            }
                            if let Some(id) = stream_id {
                                self.streams
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .remove(&id);
                            }
                        }
                        op => {
                            debug!(
                                remote = %self.remote_addr.short_id(),
                                op = ?op,
                                "ignoring sync frame"
                            );
                        }
                    }
                }
            }
        }

        // Connection is gone one way or another: every stream still tracked
        // would otherwise silently stop producing updates.
        if !self.session_scope.is_cancelled() {
            self.report_remaining_down();
        }

        self.conn_scope
            .cancel(SyncError::Canceled("sync connection closed".into()));
        let _ = watchdog.await;
        debug!(
            sync_id = %self.session_sync_id,
            remote = %self.remote_addr.short_id(),
            "remote syncer stopped"
        );
    }

    /// Add one stream to the existing connection.
    pub async fn add_stream(&self, cookie: SyncCookie) -> SyncResult<()> {
        let stream_id = cookie.stream_id;
        self.client.add_stream_to_sync(&self.sync_id, cookie).await?;
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stream_id);
        Ok(())
    }

    /// Remove one stream from the connection. Removing the last stream
    /// cancels the connection; no idle connections are kept open.
    pub async fn remove_stream(&self, stream_id: StreamId) -> SyncResult<bool> {
        self.client
            .remove_stream_from_sync(&self.sync_id, stream_id)
            .await?;

        let empty = {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.remove(&stream_id);
            streams.is_empty()
        };
        if empty {
            self.conn_scope
                .cancel(SyncError::Canceled("no streams left on connection".into()));
        }
        Ok(empty)
    }

    /// Ask the backend to force-drop one stream. The backend answers with a
    /// `Down` frame on the connection, which untracks the stream here.
    pub async fn debug_drop_stream(&self, stream_id: StreamId) -> SyncResult<bool> {
        self.client
            .debug_drop_stream(&self.sync_id, stream_id)
            .await?;

        let empty = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty();
        if empty {
            self.conn_scope
                .cancel(SyncError::Canceled("no streams left on connection".into()));
        }
        Ok(empty)
    }

    /// Forward a frame to the merged channel; forwarding failures that are
    /// not cancellations take the whole session down.
    fn forward(&self, frame: SyncFrame) -> SyncResult<()> {
        try_forward(&self.messages, &self.session_scope, frame).inspect_err(|err| {
            if !err.is_cancellation() {
                error!(
                    remote = %self.remote_addr.short_id(),
                    error = %err,
                    "cancelling sync operation, unable to forward remote update"
                );
                self.session_scope.cancel(err.clone());
            }
        })
    }

    /// Synthesize one `Down` per stream still tracked.
    fn report_remaining_down(&self) {
        let streams: Vec<StreamId> = {
            let mut set = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            set.drain().collect()
        };
        for stream_id in streams {
            debug!(
                sync_id = %self.session_sync_id,
                remote = %self.remote_addr.short_id(),
                stream = %stream_id.short_id(),
                "stream down"
            );
            if self.forward(SyncFrame::down_frame(stream_id)).is_err() {
                return;
            }
        }
    }
}

/// Liveness watchdog for one sync connection.
///
/// Every few seconds: if nothing was received for the deadline, cancel the
/// connection; if nothing was received for the shorter quiet interval, ping
/// the remote to provoke activity (the `Pong` arrives on the connection and
/// refreshes `last_recv`).
async fn connection_alive(
    client: Arc<dyn StreamServiceClient>,
    sync_id: String,
    remote_addr: NodeAddress,
    conn_scope: CancelScope,
    last_recv: Arc<Mutex<Instant>>,
) {
    let mut ticker = tokio::time::interval(PING_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = conn_scope.cancelled() => return,
            _ = ticker.tick() => {
                let quiet = last_recv
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .elapsed();

                if quiet >= RECENT_ACTIVITY_DEADLINE {
                    warn!(remote = %remote_addr.short_id(), "remote sync node timed out");
                    conn_scope.cancel(SyncError::Unavailable(format!(
                        "remote node {} timed out",
                        remote_addr.short_id()
                    )));
                    return;
                }
                if quiet < RECENT_ACTIVITY_INTERVAL {
                    continue;
                }

                let nonce = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
                    .to_string();
                if let Err(err) = client.ping_sync(&sync_id, &nonce).await {
                    if !err.is_cancellation() {
                        error!(remote = %remote_addr.short_id(), error = %err, "ping sync failed");
                    }
                    conn_scope.cancel(err);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use confluence_core::mock::MockStreamService;
    use confluence_core::{NODE_ADDRESS_LEN, STREAM_ID_LEN};

    fn addr(b: u8) -> NodeAddress {
        NodeAddress::new([b; NODE_ADDRESS_LEN])
    }

    fn sid(b: u8) -> StreamId {
        StreamId::new([b; STREAM_ID_LEN])
    }

    async fn syncer_with(
        svc: &Arc<MockStreamService>,
        cookies: Vec<SyncCookie>,
        capacity: usize,
    ) -> (Arc<RemoteSyncer>, mpsc::Receiver<SyncFrame>, CancelScope) {
        let scope = CancelScope::new();
        let (tx, rx) = mpsc::channel(capacity);
        let syncer = RemoteSyncer::new(
            "session-1".into(),
            scope.clone(),
            svc.address(),
            svc.clone(),
            cookies,
            tx,
        )
        .await
        .unwrap();
        (Arc::new(syncer), rx, scope)
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_new_first_frame() {
        let svc = MockStreamService::new(addr(1));
        svc.bad_first_frame_next_connect();
        let scope = CancelScope::new();
        let (tx, _rx) = mpsc::channel(16);

        let result = RemoteSyncer::new(
            "session-1".into(),
            scope,
            svc.address(),
            svc.clone(),
            vec![svc.cookie_for(sid(2))],
            tx,
        )
        .await;
        assert!(matches!(result, Err(SyncError::BadSyncCookie(_))));
    }

    #[tokio::test]
    async fn test_updates_are_forwarded() {
        let svc = MockStreamService::new(addr(1));
        let cookie = svc.cookie_for(sid(2));
        let (syncer, mut rx, _scope) = syncer_with(&svc, vec![cookie.clone()], 16).await;

        let task = tokio::spawn({
            let syncer = syncer.clone();
            async move { syncer.run().await }
        });

        svc.push_update(cookie.advanced(1, 1, [0u8; 32]), Bytes::from_static(b"x"))
            .await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.op, SyncOp::Update);
        assert_eq!(frame.stream_id(), Some(sid(2)));

        svc.sever();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_synthesizes_down_for_tracked_streams() {
        let svc = MockStreamService::new(addr(1));
        let cookies = vec![svc.cookie_for(sid(2)), svc.cookie_for(sid(3))];
        let (syncer, mut rx, _scope) = syncer_with(&svc, cookies, 16).await;

        let task = tokio::spawn({
            let syncer = syncer.clone();
            async move { syncer.run().await }
        });

        svc.sever();
        task.await.unwrap();

        let mut down = std::collections::HashSet::new();
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(frame.op, SyncOp::Down);
            assert!(down.insert(frame.stream_id().unwrap()));
        }
        assert_eq!(down, [sid(2), sid(3)].into_iter().collect());
    }

    #[tokio::test]
    async fn test_removing_last_stream_cancels_connection() {
        let svc = MockStreamService::new(addr(1));
        let (syncer, _rx, _scope) = syncer_with(&svc, vec![svc.cookie_for(sid(2))], 16).await;

        let task = tokio::spawn({
            let syncer = syncer.clone();
            async move { syncer.run().await }
        });

        let empty = syncer.remove_stream(sid(2)).await.unwrap();
        assert!(empty);
        assert_eq!(svc.removed_calls().len(), 1);

        // The connection scope is cancelled, so run() must return.
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_cancels_silent_connection() {
        let svc = MockStreamService::new(addr(1));
        svc.mute_pongs();
        let (syncer, mut rx, _scope) = syncer_with(&svc, vec![svc.cookie_for(sid(2))], 16).await;

        let task = tokio::spawn({
            let syncer = syncer.clone();
            async move { syncer.run().await }
        });

        // No frames ever arrive; virtual time passes the deadline and the
        // watchdog kills the connection, which reports the stream down.
        tokio::time::timeout(Duration::from_secs(120), task)
            .await
            .expect("watchdog should have cancelled the connection")
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.op, SyncOp::Down);
        assert_eq!(frame.stream_id(), Some(sid(2)));
        // Pings were attempted once the quiet interval elapsed.
        assert!(!svc.ping_calls().is_empty());
    }
}
