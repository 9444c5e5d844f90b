//! Sync session directory
//!
//! Owns every live [`SyncSession`] in the process and routes control calls
//! to them by sync id. A session is registered before its first frame goes
//! out and deregistered on every exit path, so a control call for a
//! finished session always gets a not-found error rather than hanging.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::timeout;
use tracing::{debug, info};

use confluence_core::{
    NodeAddress, NodeDirectory, StreamCache, StreamId, SyncCookie, SyncError, SyncResult,
};

use crate::operation::{ResponseSink, SyncSession};

/// Upper bound on a single add/remove control call, queueing included.
const CONTROL_DEADLINE: Duration = Duration::from_secs(10);

/// Entry point for all sync traffic of one node.
pub struct SyncHandler {
    local_addr: NodeAddress,
    cache: Arc<dyn StreamCache>,
    directory: Arc<dyn NodeDirectory>,
    /// Live sessions keyed by sync id.
    active: DashMap<String, Arc<SyncSession>>,
}

impl SyncHandler {
    pub fn new(
        local_addr: NodeAddress,
        cache: Arc<dyn StreamCache>,
        directory: Arc<dyn NodeDirectory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_addr,
            cache,
            directory,
            active: DashMap::new(),
        })
    }

    /// Open a sync session and drive it to completion.
    ///
    /// Blocks for the whole lifetime of the session; the caller typically
    /// runs this inside its server-streaming request task.
    pub async fn sync_streams(
        &self,
        cookies: Vec<SyncCookie>,
        sink: &dyn ResponseSink,
    ) -> SyncResult<()> {
        let session = Arc::new(SyncSession::new(
            self.local_addr,
            self.cache.clone(),
            self.directory.clone(),
        ));
        let sync_id = session.sync_id().to_string();

        self.active.insert(sync_id.clone(), session.clone());
        let result = session.run(cookies, sink).await;
        self.active.remove(&sync_id);

        match &result {
            Ok(()) => debug!(sync_id = %sync_id, "sync operation finished"),
            Err(err) if err.is_cancellation() => {
                debug!(sync_id = %sync_id, error = %err, "sync operation cancelled")
            }
            Err(err) => info!(sync_id = %sync_id, error = %err, "sync operation failed"),
        }
        result
    }

    /// Add a stream to an existing session.
    pub async fn add_stream_to_sync(&self, sync_id: &str, cookie: SyncCookie) -> SyncResult<()> {
        let session = self.lookup(sync_id)?;
        bounded(session.add_stream_to_sync(sync_id, cookie)).await
    }

    /// Remove a stream from an existing session.
    pub async fn remove_stream_from_sync(
        &self,
        sync_id: &str,
        stream_id: StreamId,
    ) -> SyncResult<()> {
        let session = self.lookup(sync_id)?;
        bounded(session.remove_stream_from_sync(sync_id, stream_id)).await
    }

    /// Probe a session for liveness; the pong arrives on its event stream.
    pub async fn ping_sync(&self, sync_id: &str, nonce: &str) -> SyncResult<()> {
        let session = self.lookup(sync_id)?;
        session.ping_sync(sync_id, nonce).await
    }

    /// Cancel a session; its caller sees a final `Close` frame.
    pub async fn cancel_sync(&self, sync_id: &str) -> SyncResult<()> {
        let session = self.lookup(sync_id)?;
        session.cancel_sync(sync_id).await
    }

    /// Force a stream of a session to report `Down`. Test tooling.
    pub async fn debug_drop_stream(&self, sync_id: &str, stream_id: StreamId) -> SyncResult<()> {
        let session = self.lookup(sync_id)?;
        session.debug_drop_stream(sync_id, stream_id).await
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.active.len()
    }

    fn lookup(&self, sync_id: &str) -> SyncResult<Arc<SyncSession>> {
        self.active
            .get(sync_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SyncError::sync_not_found(sync_id))
    }
}

async fn bounded<F>(call: F) -> SyncResult<()>
where
    F: std::future::Future<Output = SyncResult<()>>,
{
    match timeout(CONTROL_DEADLINE, call).await {
        Ok(result) => result,
        Err(_elapsed) => Err(SyncError::DeadlineExceeded(
            "sync control call timed out".into(),
        )),
    }
}
