//! Sync session state machine
//!
//! One [`SyncSession`] per caller. External control calls are translated
//! into commands on a bounded queue and applied by a single-threaded
//! `select!` loop, which also relays merged syncer output to the caller.
//! The single loop removes any need for locking caller-visible state and
//! guarantees commands are applied strictly in arrival order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use confluence_core::{
    CancelScope, NodeAddress, NodeDirectory, StreamCache, StreamId, SyncCookie, SyncError,
    SyncFrame, SyncOp, SyncResult, validate_cookie,
};

use crate::syncer_set::{SyncerSet, group_cookies};

/// Capacity of the command queue between control calls and the loop.
const COMMAND_BUFFER: usize = 64;

/// How long a control call waits for queue space before giving up.
const COMMAND_DEADLINE: Duration = Duration::from_secs(10);

/// Cancellation gets a little longer, matching its caller expectations.
const CANCEL_DEADLINE: Duration = Duration::from_secs(15);

/// Where session output goes. The RPC layer implements this over its
/// server-streaming response; tests use a channel-backed sink.
pub trait ResponseSink: Send + Sync {
    /// Deliver one frame to the caller.
    fn send(&self, frame: SyncFrame) -> SyncResult<()>;
}

impl ResponseSink for mpsc::UnboundedSender<SyncFrame> {
    fn send(&self, frame: SyncFrame) -> SyncResult<()> {
        mpsc::UnboundedSender::send(self, frame)
            .map_err(|_| SyncError::Unavailable("response stream closed".into()))
    }
}

/// A control request queued for the session loop.
enum SessionCommand {
    AddStream {
        cookie: SyncCookie,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    RemoveStream {
        stream_id: StreamId,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Ping {
        nonce: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    DebugDropStream {
        stream_id: StreamId,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Cancel {
        reply: oneshot::Sender<SyncResult<()>>,
    },
}

/// One caller's sync session across possibly many streams and backends.
pub struct SyncSession {
    sync_id: String,
    scope: CancelScope,
    local_addr: NodeAddress,
    cache: Arc<dyn StreamCache>,
    directory: Arc<dyn NodeDirectory>,
    commands: mpsc::Sender<SessionCommand>,
    /// Receiving half of the command queue, taken by `run`.
    commands_rx: std::sync::Mutex<Option<mpsc::Receiver<SessionCommand>>>,
}

impl SyncSession {
    /// Create a session with a freshly minted sync id.
    pub fn new(
        local_addr: NodeAddress,
        cache: Arc<dyn StreamCache>,
        directory: Arc<dyn NodeDirectory>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        Self {
            sync_id: format!("{:032x}", rand::random::<u128>()),
            scope: CancelScope::new(),
            local_addr,
            cache,
            directory,
            commands,
            commands_rx: std::sync::Mutex::new(Some(commands_rx)),
        }
    }

    /// The session id used between the caller and this process.
    pub fn sync_id(&self) -> &str {
        &self.sync_id
    }

    /// Cancellation scope of this session.
    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }

    /// Run the session until the caller cancels, disconnects, or an
    /// unrecoverable internal error occurs.
    ///
    /// Sends `New` first, then relays merged syncer output and applies
    /// queued commands until done; the caller always sees `Close` (or an
    /// error) last.
    pub async fn run(&self, initial_cookies: Vec<SyncCookie>, sink: &dyn ResponseSink) -> SyncResult<()> {
        let result = self.run_inner(initial_cookies, sink).await;
        // Whatever the exit path, stop every syncer of this session.
        self.scope
            .cancel(SyncError::Canceled("sync operation complete".into()));
        result
    }

    async fn run_inner(
        &self,
        initial_cookies: Vec<SyncCookie>,
        sink: &dyn ResponseSink,
    ) -> SyncResult<()> {
        let grouped = group_cookies(&initial_cookies)?;

        let mut commands_rx = self
            .commands_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| SyncError::InvalidArgument("session already running".into()))?;

        let (set, mut merged) = SyncerSet::new(
            self.scope.clone(),
            self.sync_id.clone(),
            self.local_addr,
            self.cache.clone(),
            self.directory.clone(),
            grouped,
        )
        .await;

        // The caller learns the session id before any stream events.
        sink.send(SyncFrame::new_frame(self.sync_id.clone()))?;

        set.start_all().await;
        let supervisor = set.clone();
        tokio::spawn(async move { supervisor.run().await });

        loop {
            tokio::select! {
                maybe_frame = merged.recv() => {
                    let Some(mut frame) = maybe_frame else {
                        // All syncers stopped and the channel closed.
                        let _ = sink.send(SyncFrame::close_frame(self.sync_id.clone()));
                        return Ok(());
                    };
                    if frame.op == SyncOp::Down {
                        if let Some(stream_id) = frame.stream_id() {
                            set.unmap_stream(stream_id).await;
                        }
                    }
                    frame.sync_id = self.sync_id.clone();
                    if let Err(err) = sink.send(frame) {
                        error!(
                            sync_id = %self.sync_id,
                            error = %err,
                            "unable to send sync stream update to caller"
                        );
                        self.scope.cancel(err.clone());
                        return Err(err);
                    }
                }

                _ = self.scope.cancelled() => {
                    return Err(self.cancelled_err());
                }

                maybe_cmd = commands_rx.recv() => {
                    // The session holds a sender, so the queue cannot close.
                    let Some(cmd) = maybe_cmd else { return Ok(()) };
                    match cmd {
                        SessionCommand::AddStream { cookie, reply } => {
                            let res = set
                                .add_stream(cookie.node_address, cookie.stream_id, cookie)
                                .await;
                            let _ = reply.send(res);
                        }
                        SessionCommand::RemoveStream { stream_id, reply } => {
                            let _ = reply.send(set.remove_stream(stream_id).await);
                        }
                        SessionCommand::Ping { nonce, reply } => {
                            let res = sink.send(SyncFrame::pong_frame(self.sync_id.clone(), nonce));
                            let _ = reply.send(res);
                        }
                        SessionCommand::DebugDropStream { stream_id, reply } => {
                            let _ = reply.send(set.debug_drop_stream(stream_id).await);
                        }
                        SessionCommand::Cancel { reply } => {
                            let _ = sink.send(SyncFrame::close_frame(self.sync_id.clone()));
                            let _ = reply.send(Ok(()));
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Add one stream to the running session.
    pub async fn add_stream_to_sync(&self, sync_id: &str, cookie: SyncCookie) -> SyncResult<()> {
        self.check_sync_id(sync_id)?;
        validate_cookie(&cookie)?;
        let (reply, reply_rx) = oneshot::channel();
        self.process(SessionCommand::AddStream { cookie, reply }, reply_rx, COMMAND_DEADLINE)
            .await
    }

    /// Remove one stream from the running session.
    pub async fn remove_stream_from_sync(
        &self,
        sync_id: &str,
        stream_id: StreamId,
    ) -> SyncResult<()> {
        self.check_sync_id(sync_id)?;
        let (reply, reply_rx) = oneshot::channel();
        self.process(
            SessionCommand::RemoveStream { stream_id, reply },
            reply_rx,
            COMMAND_DEADLINE,
        )
        .await
    }

    /// Liveness check. The nonce is echoed back as a `Pong` frame on the
    /// session's event stream, not in this call's reply.
    pub async fn ping_sync(&self, sync_id: &str, nonce: &str) -> SyncResult<()> {
        self.check_sync_id(sync_id)?;
        let (reply, reply_rx) = oneshot::channel();
        self.process(
            SessionCommand::Ping {
                nonce: nonce.to_string(),
                reply,
            },
            reply_rx,
            COMMAND_DEADLINE,
        )
        .await
    }

    /// Cancel the session; the caller sees a final `Close` frame.
    pub async fn cancel_sync(&self, sync_id: &str) -> SyncResult<()> {
        self.check_sync_id(sync_id)?;
        let (reply, reply_rx) = oneshot::channel();
        self.process(SessionCommand::Cancel { reply }, reply_rx, CANCEL_DEADLINE)
            .await
    }

    /// Force one stream to report `Down`. Test/operational tooling.
    pub async fn debug_drop_stream(&self, sync_id: &str, stream_id: StreamId) -> SyncResult<()> {
        self.check_sync_id(sync_id)?;
        let (reply, reply_rx) = oneshot::channel();
        self.process(
            SessionCommand::DebugDropStream { stream_id, reply },
            reply_rx,
            COMMAND_DEADLINE,
        )
        .await
    }

    fn check_sync_id(&self, sync_id: &str) -> SyncResult<()> {
        if sync_id != self.sync_id {
            return Err(SyncError::InvalidArgument(format!(
                "invalid sync id {sync_id}"
            )));
        }
        Ok(())
    }

    fn cancelled_err(&self) -> SyncError {
        self.scope.cause().unwrap_or_else(|| {
            SyncError::Canceled(format!("sync operation {} cancelled", self.sync_id))
        })
    }

    /// Enqueue a command and wait for its reply, racing session
    /// cancellation and the queue-space deadline.
    async fn process(
        &self,
        cmd: SessionCommand,
        reply_rx: oneshot::Receiver<SyncResult<()>>,
        deadline: Duration,
    ) -> SyncResult<()> {
        tokio::select! {
            sent = tokio::time::timeout(deadline, self.commands.send(cmd)) => {
                match sent {
                    Err(_elapsed) => {
                        warn!(sync_id = %self.sync_id, "sync operation command queue full");
                        return Err(SyncError::DeadlineExceeded(
                            "sync operation command queue full".into(),
                        ));
                    }
                    Ok(Err(_closed)) => return Err(self.cancelled_err()),
                    Ok(Ok(())) => {}
                }
            }
            _ = self.scope.cancelled() => return Err(self.cancelled_err()),
        }

        tokio::select! {
            // Prefer a reply that is already there over a cancellation that
            // raced it; cancel replies arrive just before the scope closes.
            biased;
            reply = reply_rx => reply.unwrap_or_else(|_| Err(self.cancelled_err())),
            _ = self.scope.cancelled() => Err(self.cancelled_err()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use confluence_core::mock::{MockNodeDirectory, MockStreamCache};
    use confluence_core::{NODE_ADDRESS_LEN, STREAM_ID_LEN};

    fn addr(b: u8) -> NodeAddress {
        NodeAddress::new([b; NODE_ADDRESS_LEN])
    }

    fn sid(b: u8) -> StreamId {
        StreamId::new([b; STREAM_ID_LEN])
    }

    fn session() -> Arc<SyncSession> {
        let cache = MockStreamCache::new(addr(1));
        let directory = MockNodeDirectory::new();
        Arc::new(SyncSession::new(addr(1), cache, directory))
    }

    #[tokio::test]
    async fn test_new_then_close_on_cancel() {
        let cache = MockStreamCache::new(addr(1));
        cache.register_stream(sid(2));
        let directory = MockNodeDirectory::new();
        let session = Arc::new(SyncSession::new(addr(1), cache.clone(), directory));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn({
            let session = session.clone();
            let cookie = SyncCookie::start_of(addr(1), sid(2));
            async move { session.run(vec![cookie], &tx).await }
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.op, SyncOp::New);
        let sync_id = first.sync_id.clone();

        session.cancel_sync(&sync_id).await.unwrap();
        let last = rx.recv().await.unwrap();
        assert_eq!(last.op, SyncOp::Close);
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ping_answers_with_pong_on_stream() {
        let cache = MockStreamCache::new(addr(1));
        cache.register_stream(sid(2));
        let directory = MockNodeDirectory::new();
        let session = Arc::new(SyncSession::new(addr(1), cache.clone(), directory));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn({
            let session = session.clone();
            let cookie = SyncCookie::start_of(addr(1), sid(2));
            async move { session.run(vec![cookie], &tx).await }
        });

        let first = rx.recv().await.unwrap();
        let sync_id = first.sync_id.clone();

        session.ping_sync(&sync_id, "nonce-7").await.unwrap();
        let pong = rx.recv().await.unwrap();
        assert_eq!(pong.op, SyncOp::Pong);
        assert_eq!(pong.pong_nonce, "nonce-7");

        session.cancel_sync(&sync_id).await.unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_sync_id_is_rejected() {
        let session = session();
        let err = session.ping_sync("not-the-id", "n").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_local_updates_are_relabelled_with_sync_id() {
        let cache = MockStreamCache::new(addr(1));
        let stream = cache.register_stream(sid(2));
        let directory = MockNodeDirectory::new();
        let session = Arc::new(SyncSession::new(addr(1), cache.clone(), directory));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn({
            let session = session.clone();
            let cookie = SyncCookie::start_of(addr(1), sid(2));
            async move { session.run(vec![cookie], &tx).await }
        });

        let first = rx.recv().await.unwrap();
        let sync_id = first.sync_id.clone();

        stream.append(1, 1, Bytes::from_static(b"payload"));

        let update = rx.recv().await.unwrap();
        assert_eq!(update.op, SyncOp::Update);
        assert_eq!(update.sync_id, sync_id);
        assert_eq!(update.stream_id(), Some(sid(2)));

        session.cancel_sync(&sync_id).await.unwrap();
        runner.await.unwrap().unwrap();
    }
}
