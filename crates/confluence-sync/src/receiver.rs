//! Single-upstream sync client
//!
//! Used where this process consumes streams from exactly one remote node,
//! without the per-session fan-out machinery. Tracks per-stream status and
//! the latest cookie, forwards decoded updates to per-stream consumer
//! channels, and re-adds streams that went down with a doubling retry
//! interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use confluence_core::{
    CancelScope, StreamId, StreamServiceClient, StreamStatus, SyncCookie,
    SyncError, SyncFrame, SyncOp, SyncResult, SyncStreamHandle, validate_cookie,
};

/// First re-add attempt after a stream goes down.
const RETRY_INITIAL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on the re-add interval.
const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Doubling backoff, capped.
fn next_retry_interval(current: Duration) -> Duration {
    (current * 2).min(RETRY_MAX_INTERVAL)
}

/// What happened to a tracked stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncUpdateKind {
    /// Regular update on a healthy stream.
    Update,
    /// First update after subscribing.
    Added,
    /// First update after the stream recovered from `Down`.
    Up,
    /// The upstream reported the stream down.
    Down,
}

/// One decoded event delivered to a stream's consumer channel.
#[derive(Debug, Clone)]
pub struct SyncUpdate {
    pub kind: SyncUpdateKind,
    pub stream_id: StreamId,
    /// Position after this update; `None` for `Down`.
    pub cookie: Option<SyncCookie>,
    pub payload: Bytes,
}

struct StreamState {
    /// Latest known position, used when re-adding after `Down`.
    cookie: SyncCookie,
    status: StreamStatus,
    /// A retry task for this stream is currently alive. Cleared by the
    /// task itself on exit, so a later `Down` can spawn a fresh one.
    retrying: bool,
    updates: mpsc::UnboundedSender<SyncUpdate>,
}

/// Client-side receiver for one upstream node's sync stream.
pub struct SyncReceiver {
    sync_id: String,
    client: Arc<dyn StreamServiceClient>,
    scope: CancelScope,
    streams: Mutex<HashMap<StreamId, StreamState>>,
}

/// Open a sync stream against `client` and spawn the receive task.
///
/// The upstream must answer with a `New` frame carrying the sync id before
/// anything else. `exit_tx` fires exactly once when the receiver stops,
/// with `Ok` on clean shutdown and the transport error otherwise.
pub async fn start_sync_receiver(
    client: Arc<dyn StreamServiceClient>,
    exit_tx: oneshot::Sender<SyncResult<()>>,
) -> SyncResult<Arc<SyncReceiver>> {
    let mut handle = client.sync_streams(Vec::new()).await?;

    let first = handle.recv().await.ok_or_else(|| {
        SyncError::Unavailable("sync stream closed before handshake".into())
    })?;
    if first.op != SyncOp::New || first.sync_id.is_empty() {
        return Err(SyncError::BadSyncCookie(format!(
            "expected New frame opening sync, got {:?}",
            first.op
        )));
    }
    info!(sync_id = %first.sync_id, "sync receiver started");

    let receiver = Arc::new(SyncReceiver {
        sync_id: first.sync_id,
        client,
        scope: CancelScope::new(),
        streams: Mutex::new(HashMap::new()),
    });
    tokio::spawn(receiver.clone().receive_loop(handle, exit_tx));
    Ok(receiver)
}

impl SyncReceiver {
    /// The sync id minted by the upstream for this connection.
    pub fn sync_id(&self) -> &str {
        &self.sync_id
    }

    /// Subscribe one stream, delivering its events on `updates`.
    ///
    /// The stream is registered locally before the upstream call, and an
    /// upstream error leaves the registration in place: the stored cookie
    /// is what a later re-add resumes from.
    pub async fn add_stream(
        &self,
        cookie: SyncCookie,
        updates: mpsc::UnboundedSender<SyncUpdate>,
    ) -> SyncResult<()> {
        validate_cookie(&cookie)?;
        let stream_id = cookie.stream_id;
        {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            if streams.contains_key(&stream_id) {
                // A retry after a transport error may legitimately re-add;
                // the original registration stays as-is.
                warn!(
                    sync_id = %self.sync_id,
                    stream = %stream_id.short_id(),
                    "stream already registered with sync receiver"
                );
            } else {
                streams.insert(
                    stream_id,
                    StreamState {
                        cookie: cookie.clone(),
                        status: StreamStatus::Added,
                        retrying: false,
                        updates,
                    },
                );
            }
        }
        self.client.add_stream_to_sync(&self.sync_id, cookie).await
    }

    /// Unsubscribe one stream.
    pub async fn remove_stream(&self, stream_id: StreamId) -> SyncResult<()> {
        let removed = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream_id);
        if removed.is_none() {
            return Err(SyncError::stream_not_found(&self.sync_id, stream_id));
        }
        self.client
            .remove_stream_from_sync(&self.sync_id, stream_id)
            .await
    }

    /// Stop the receiver; `exit_tx` fires with `Ok`.
    pub fn stop(&self) {
        self.scope
            .cancel(SyncError::Canceled("sync receiver stopped".into()));
    }

    /// Number of tracked streams.
    pub fn tracked_streams(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut handle: Box<dyn SyncStreamHandle>,
        exit_tx: oneshot::Sender<SyncResult<()>>,
    ) {
        let result = loop {
            tokio::select! {
                _ = self.scope.cancelled() => break Ok(()),

                maybe_frame = handle.recv() => {
                    let Some(frame) = maybe_frame else {
                        break Err(SyncError::Unavailable(
                            "sync stream closed by upstream".into(),
                        ));
                    };
                    match frame.op {
                        SyncOp::Update => self.handle_update(frame),
                        SyncOp::Down => {
                            if let Some(stream_id) = frame.stream_id() {
                                self.handle_down(stream_id);
                            }
                        }
                        SyncOp::Close => break Ok(()),
                        SyncOp::New => {
                            break Err(SyncError::BadSyncCookie(
                                "unexpected New frame on established sync".into(),
                            ));
                        }
                        SyncOp::Pong => {
                            debug!(sync_id = %self.sync_id, nonce = %frame.pong_nonce, "pong");
                        }
                        SyncOp::Unspecified => {
                            error!(sync_id = %self.sync_id, "frame with unspecified op");
                        }
                    }
                }
            }
        };

        match &result {
            Ok(()) => debug!(sync_id = %self.sync_id, "sync receiver finished"),
            Err(err) => info!(sync_id = %self.sync_id, error = %err, "sync receiver lost upstream"),
        }
        // Stop any in-flight retry tasks before reporting the exit.
        self.scope
            .cancel(SyncError::Canceled("sync receiver stopped".into()));
        let _ = exit_tx.send(result);
    }

    fn handle_update(&self, frame: SyncFrame) {
        let Some(stream_id) = frame.stream_id() else {
            error!(sync_id = %self.sync_id, "update frame without stream id");
            return;
        };
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = streams.get_mut(&stream_id) else {
            error!(
                sync_id = %self.sync_id,
                stream = %stream_id.short_id(),
                "update for stream not found in sync"
            );
            return;
        };

        if let Some(cookie) = &frame.next_cookie {
            state.cookie = cookie.clone();
        }
        let kind = match state.status.on_update() {
            StreamStatus::Down => SyncUpdateKind::Up,
            StreamStatus::Added => SyncUpdateKind::Added,
            StreamStatus::Ok => SyncUpdateKind::Update,
        };
        let update = SyncUpdate {
            kind,
            stream_id,
            cookie: frame.next_cookie,
            payload: frame.payload,
        };
        if state.updates.send(update).is_err() {
            warn!(
                sync_id = %self.sync_id,
                stream = %stream_id.short_id(),
                "update consumer gone, dropping stream"
            );
            streams.remove(&stream_id);
        }
    }

    fn handle_down(self: &Arc<Self>, stream_id: StreamId) {
        let spawn_retry = {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            let Some(state) = streams.get_mut(&stream_id) else {
                error!(
                    sync_id = %self.sync_id,
                    stream = %stream_id.short_id(),
                    "down for stream not found in sync"
                );
                return;
            };
            state.status.on_down();
            let _ = state.updates.send(SyncUpdate {
                kind: SyncUpdateKind::Down,
                stream_id,
                cookie: None,
                payload: Bytes::new(),
            });
            // At most one live retry task per stream. Status alone cannot
            // tell: a re-add leaves the stream `Down` until its first
            // update, with no task running.
            !std::mem::replace(&mut state.retrying, true)
        };
        if spawn_retry {
            let receiver = Arc::clone(self);
            tokio::spawn(async move { receiver.retry_stream(stream_id).await });
        }
    }

    /// Re-add a down stream from its last known cookie until it succeeds,
    /// the stream recovers or is removed, or the receiver stops.
    async fn retry_stream(self: Arc<Self>, stream_id: StreamId) {
        let mut interval = RETRY_INITIAL_INTERVAL;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.scope.cancelled() => break,
            }

            let Some(cookie) = self.down_cookie(stream_id) else { break };
            match self.client.add_stream_to_sync(&self.sync_id, cookie).await {
                Ok(()) => {
                    debug!(
                        sync_id = %self.sync_id,
                        stream = %stream_id.short_id(),
                        "stream re-added to sync"
                    );
                    break;
                }
                Err(err) => {
                    debug!(
                        sync_id = %self.sync_id,
                        stream = %stream_id.short_id(),
                        error = %err,
                        retry_in = ?next_retry_interval(interval),
                        "re-adding stream to sync failed"
                    );
                    interval = next_retry_interval(interval);
                }
            }
        }

        if let Some(state) = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&stream_id)
        {
            state.retrying = false;
        }
    }

    fn down_cookie(&self, stream_id: StreamId) -> Option<SyncCookie> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let state = streams.get(&stream_id)?;
        if state.status != StreamStatus::Down {
            return None;
        }
        Some(state.cookie.clone())
    }
}
