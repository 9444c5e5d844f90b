//! Sync cookies
//!
//! A [`SyncCookie`] is a resumable position marker for one stream: the node
//! hosting the stream, the stream id, the monotonic generation/slot pair,
//! and the hash of the previous position-defining block. Callers supply
//! cookies to resume from a known position; syncers replace them with newer
//! cookies as updates arrive. The stream id of a cookie never changes after
//! creation.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::stream_id::{NodeAddress, StreamId};

/// Resumable position marker for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCookie {
    /// Address of the node hosting the stream.
    pub node_address: NodeAddress,
    /// The stream this cookie points into.
    pub stream_id: StreamId,
    /// Miniblock generation of the position.
    pub generation: u64,
    /// Slot within the generation.
    pub slot: u64,
    /// Hash of the previous position-defining block.
    pub prev_hash: [u8; 32],
}

impl SyncCookie {
    /// Cookie pointing at the start of a stream.
    pub fn start_of(node_address: NodeAddress, stream_id: StreamId) -> Self {
        Self {
            node_address,
            stream_id,
            generation: 0,
            slot: 0,
            prev_hash: [0u8; 32],
        }
    }

    /// Cookie advanced to a newer position within the same stream.
    pub fn advanced(&self, generation: u64, slot: u64, prev_hash: [u8; 32]) -> Self {
        Self {
            node_address: self.node_address,
            stream_id: self.stream_id,
            generation,
            slot,
            prev_hash,
        }
    }
}

/// Validate a caller-supplied cookie's structural well-formedness.
///
/// This is the only gate through which external cookies enter a sync
/// session. It checks shape, not position: whether the position is still
/// servable is for the owning backend to decide.
pub fn validate_cookie(cookie: &SyncCookie) -> SyncResult<()> {
    if cookie.stream_id.is_zero() {
        return Err(SyncError::InvalidArgument(
            "sync cookie has a zero stream id".into(),
        ));
    }
    if cookie.node_address.is_zero() {
        return Err(SyncError::InvalidArgument(
            "sync cookie has a zero node address".into(),
        ));
    }
    // A slot without a generation is a position that cannot exist.
    if cookie.generation == 0 && cookie.slot != 0 {
        return Err(SyncError::InvalidArgument(format!(
            "sync cookie for stream {} has slot {} in generation 0",
            cookie.stream_id.short_id(),
            cookie.slot
        )));
    }
    Ok(())
}
