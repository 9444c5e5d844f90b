//! # Confluence Core
//!
//! Core types, errors, and collaborator traits for the Confluence stream
//! synchronization layer.
//!
//! This crate provides the vocabulary shared by the sync engine and its
//! collaborators: stream/node identifiers, sync cookies, the wire frame
//! enumeration, the error taxonomy, and the trait seams behind which the
//! stream storage engine, the node directory, and the wire transport live.
//!
//! ## Key Types
//!
//! - [`StreamId`] / [`NodeAddress`]: fixed-size opaque identifiers
//! - [`SyncCookie`]: resumable position marker for one stream
//! - [`SyncFrame`] / [`SyncOp`]: messages exchanged on a sync connection
//! - [`SyncError`]: error taxonomy for the whole sync layer
//! - [`CancelScope`]: cancellation primitive with a recorded cause
//!
//! ## Key Traits
//!
//! - [`StreamServiceClient`]: wire client for one backend node
//! - [`NodeDirectory`]: address -> backend client resolution
//! - [`StreamCache`] / [`StreamHandle`]: local stream storage pub/sub seam

pub mod cancel;
pub mod cookie;
pub mod error;
pub mod frame;
pub mod mock;
pub mod service;
pub mod status;
pub mod stream_id;

// Re-export main types
pub use cancel::*;
pub use cookie::*;
pub use error::*;
pub use frame::*;
pub use service::*;
pub use status::*;
pub use stream_id::*;
