//! The two-variant syncer union
//!
//! A syncer owns one backend node's contribution to a sync session. The
//! variant is chosen exactly once, at construction, by comparing the cookie
//! group's node address against this process's own address; it is never
//! re-derived afterwards.

use confluence_core::{NodeAddress, StreamId, SyncCookie, SyncResult};

use crate::local::LocalSyncer;
use crate::remote::RemoteSyncer;

/// One backend node's syncer within a session.
pub enum Syncer {
    /// Subscribes directly to in-process stream storage.
    Local(LocalSyncer),
    /// Forwards over one multiplexed connection to a remote node.
    Remote(RemoteSyncer),
}

impl Syncer {
    /// The backend node address this syncer is responsible for.
    pub fn address(&self) -> NodeAddress {
        match self {
            Syncer::Local(s) => s.address(),
            Syncer::Remote(s) => s.address(),
        }
    }

    /// Run until the session or this syncer's connection is cancelled.
    pub async fn run(&self) {
        match self {
            Syncer::Local(s) => s.run().await,
            Syncer::Remote(s) => s.run().await,
        }
    }

    /// Subscribe one more stream on this backend.
    pub async fn add_stream(&self, cookie: SyncCookie) -> SyncResult<()> {
        match self {
            Syncer::Local(s) => s.add_stream(cookie).await,
            Syncer::Remote(s) => s.add_stream(cookie).await,
        }
    }

    /// Remove one stream. Returns true when the syncer now tracks no
    /// streams and has stopped.
    pub async fn remove_stream(&self, stream_id: StreamId) -> SyncResult<bool> {
        match self {
            Syncer::Local(s) => s.remove_stream(stream_id).await,
            Syncer::Remote(s) => s.remove_stream(stream_id).await,
        }
    }

    /// Force one stream to report `Down`. Returns true when the syncer now
    /// tracks no streams and has stopped.
    pub async fn debug_drop_stream(&self, stream_id: StreamId) -> SyncResult<bool> {
        match self {
            Syncer::Local(s) => s.debug_drop_stream(stream_id).await,
            Syncer::Remote(s) => s.debug_drop_stream(stream_id).await,
        }
    }
}
