//! Sync connection frames
//!
//! [`SyncFrame`] is the message exchanged on a sync connection, in both
//! directions of the fan-out: backends produce frames that syncers forward,
//! and sessions produce frames for their caller. The [`SyncOp`] kind
//! determines which optional fields are populated.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cookie::SyncCookie;
use crate::stream_id::StreamId;

/// Kind of message on a sync connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    /// Protocol error marker, never sent intentionally.
    Unspecified,
    /// Session established; carries the backend-assigned sync id.
    New,
    /// New data for one stream; carries the updated cookie and payload.
    Update,
    /// A stream is no longer servable by its current backend.
    Down,
    /// Graceful end of the session.
    Close,
    /// Liveness reply echoing a ping nonce.
    Pong,
}

/// One message on a sync connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFrame {
    /// Frame kind.
    pub op: SyncOp,
    /// Session id. Stamped by the session before frames reach the caller;
    /// may be empty on frames produced by individual syncers.
    pub sync_id: String,
    /// The stream this frame concerns (`Update` and `Down`).
    pub stream_id: Option<StreamId>,
    /// Updated position after this frame's data (`Update`).
    pub next_cookie: Option<SyncCookie>,
    /// Stream data (`Update`).
    pub payload: Bytes,
    /// Echoed ping nonce (`Pong`).
    pub pong_nonce: String,
}

impl SyncFrame {
    /// `New` frame announcing an established session.
    pub fn new_frame(sync_id: impl Into<String>) -> Self {
        Self {
            op: SyncOp::New,
            sync_id: sync_id.into(),
            stream_id: None,
            next_cookie: None,
            payload: Bytes::new(),
            pong_nonce: String::new(),
        }
    }

    /// `Update` frame carrying data and the advanced cookie for one stream.
    pub fn update_frame(next_cookie: SyncCookie, payload: Bytes) -> Self {
        Self {
            op: SyncOp::Update,
            sync_id: String::new(),
            stream_id: Some(next_cookie.stream_id),
            next_cookie: Some(next_cookie),
            payload,
            pong_nonce: String::new(),
        }
    }

    /// `Down` frame for one stream.
    pub fn down_frame(stream_id: StreamId) -> Self {
        Self {
            op: SyncOp::Down,
            sync_id: String::new(),
            stream_id: Some(stream_id),
            next_cookie: None,
            payload: Bytes::new(),
            pong_nonce: String::new(),
        }
    }

    /// `Close` frame ending a session.
    pub fn close_frame(sync_id: impl Into<String>) -> Self {
        Self {
            op: SyncOp::Close,
            sync_id: sync_id.into(),
            stream_id: None,
            next_cookie: None,
            payload: Bytes::new(),
            pong_nonce: String::new(),
        }
    }

    /// `Pong` frame echoing a ping nonce.
    pub fn pong_frame(sync_id: impl Into<String>, nonce: impl Into<String>) -> Self {
        Self {
            op: SyncOp::Pong,
            sync_id: sync_id.into(),
            stream_id: None,
            next_cookie: None,
            payload: Bytes::new(),
            pong_nonce: nonce.into(),
        }
    }

    /// The stream this frame concerns, from the explicit field or the
    /// cookie.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
            .or_else(|| self.next_cookie.as_ref().map(|c| c.stream_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_id::{NODE_ADDRESS_LEN, NodeAddress, STREAM_ID_LEN};

    #[test]
    fn test_update_frame_carries_stream_id_both_ways() {
        let cookie = SyncCookie::start_of(
            NodeAddress::new([1u8; NODE_ADDRESS_LEN]),
            StreamId::new([4u8; STREAM_ID_LEN]),
        );
        let frame = SyncFrame::update_frame(cookie.clone(), Bytes::from_static(b"data"));
        assert_eq!(frame.op, SyncOp::Update);
        assert_eq!(frame.stream_id(), Some(cookie.stream_id));
        assert_eq!(frame.stream_id, Some(cookie.stream_id));
    }

    #[test]
    fn test_down_frame_has_no_cookie() {
        let id = StreamId::new([4u8; STREAM_ID_LEN]);
        let frame = SyncFrame::down_frame(id);
        assert_eq!(frame.op, SyncOp::Down);
        assert_eq!(frame.stream_id(), Some(id));
        assert!(frame.next_cookie.is_none());
    }

    #[test]
    fn test_pong_echoes_nonce() {
        let frame = SyncFrame::pong_frame("sync-1", "nonce-42");
        assert_eq!(frame.op, SyncOp::Pong);
        assert_eq!(frame.pong_nonce, "nonce-42");
        assert_eq!(frame.sync_id, "sync-1");
    }
}
