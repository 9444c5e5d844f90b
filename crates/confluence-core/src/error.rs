//! Error types for the Confluence sync layer

use thiserror::Error;

use crate::stream_id::StreamId;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Top-level error type for the sync layer
///
/// The variants mirror the status codes surfaced to callers of the sync
/// RPCs. Failures scoped to one backend are reported to callers as
/// stream-level `Down` events and never carry this type across the session
/// boundary; failures scoped to the session do.
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    /// Unknown sync session or a stream that is not part of a session.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed cookie or a sync-id mismatch on a control call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session or a backend connection was intentionally stopped.
    /// Terminal state, not an error condition worth logging as one.
    #[error("canceled: {0}")]
    Canceled(String),

    /// The session's merged output channel overran. Fatal to the session.
    #[error("buffer full: {0}")]
    BufferFull(String),

    /// A backend could not be reached or a capability is unsupported.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Protocol violation on a sync connection, e.g. a second NEW frame.
    #[error("bad sync cookie: {0}")]
    BadSyncCookie(String),

    /// A control command could not be enqueued before its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

impl SyncError {
    /// True for errors that represent intentional shutdown rather than a
    /// fault. Callers use this to skip error-level logging.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SyncError::Canceled(_))
    }

    /// Unknown stream within a session.
    pub fn stream_not_found(sync_id: &str, stream_id: StreamId) -> Self {
        SyncError::NotFound(format!(
            "stream {} not part of sync {sync_id}",
            stream_id.short_id()
        ))
    }

    /// Unknown sync session.
    pub fn sync_not_found(sync_id: &str) -> Self {
        SyncError::NotFound(format!("unknown sync operation {sync_id}"))
    }
}
