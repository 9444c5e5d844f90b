//! Collaborator trait seams
//!
//! The sync engine consumes three external collaborators: the wire client
//! for remote backends, the directory resolving node addresses to clients,
//! and the local stream storage pub/sub surface. All three are traits so
//! the same engine runs against real networking and against the in-memory
//! mocks in [`crate::mock`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cookie::SyncCookie;
use crate::error::SyncResult;
use crate::frame::SyncFrame;
use crate::stream_id::{NodeAddress, StreamId};

/// Receiving half of one multiplexed sync connection.
///
/// Dropping the handle closes the underlying connection.
#[async_trait]
pub trait SyncStreamHandle: Send {
    /// Receive the next frame. `None` means the connection ended, whether
    /// gracefully or not.
    async fn recv(&mut self) -> Option<SyncFrame>;
}

/// Wire client for one backend node's stream service.
#[async_trait]
pub trait StreamServiceClient: Send + Sync {
    /// Open a multiplexed sync connection resuming from the given cookies.
    ///
    /// The first frame on the returned handle is expected to be `New` and
    /// carry the backend-assigned sync id.
    async fn sync_streams(&self, cookies: Vec<SyncCookie>)
    -> SyncResult<Box<dyn SyncStreamHandle>>;

    /// Add one stream to an existing sync connection.
    async fn add_stream_to_sync(&self, sync_id: &str, cookie: SyncCookie) -> SyncResult<()>;

    /// Remove one stream from an existing sync connection.
    async fn remove_stream_from_sync(&self, sync_id: &str, stream_id: StreamId) -> SyncResult<()>;

    /// Liveness probe; the reply arrives as a `Pong` frame on the
    /// connection, not in the unary response.
    async fn ping_sync(&self, sync_id: &str, nonce: &str) -> SyncResult<()>;

    /// Cancel the sync session on the backend.
    async fn cancel_sync(&self, sync_id: &str) -> SyncResult<()>;

    /// Force one stream to report `Down`. Test/operational tooling.
    async fn debug_drop_stream(&self, sync_id: &str, stream_id: StreamId) -> SyncResult<()>;
}

/// Resolves backend node addresses to wire clients.
pub trait NodeDirectory: Send + Sync {
    /// Get a client for the node at `address`, or `Unavailable` if the
    /// node is unknown or unreachable.
    fn client_for_address(&self, address: NodeAddress) -> SyncResult<Arc<dyn StreamServiceClient>>;
}

/// Identity of one registered update listener.
///
/// Issued by [`StreamHandle::subscribe`] and required for unsubscribing;
/// trait objects have no stable identity of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Callback surface the storage layer invokes per stream update.
pub trait UpdateListener: Send + Sync {
    /// Called once per appended update, in append order.
    fn on_update(&self, next_cookie: SyncCookie, payload: Bytes);
}

/// One local stream's pub/sub surface.
#[async_trait]
pub trait StreamHandle: Send + Sync {
    /// The stream this handle refers to.
    fn stream_id(&self) -> StreamId;

    /// Register a listener for updates past the cookie's position.
    async fn subscribe(
        &self,
        cookie: SyncCookie,
        listener: Arc<dyn UpdateListener>,
    ) -> SyncResult<ListenerId>;

    /// Remove a previously registered listener.
    async fn unsubscribe(&self, listener: ListenerId);
}

/// Local stream storage seam.
#[async_trait]
pub trait StreamCache: Send + Sync {
    /// Get a handle for a stream hosted by this node, waiting for it to be
    /// loaded if necessary.
    async fn get_stream_wait_for_local(
        &self,
        stream_id: StreamId,
    ) -> SyncResult<Arc<dyn StreamHandle>>;
}
