//! # Confluence Sync
//!
//! The fan-out engine of the Confluence stream platform: one caller session
//! is multiplexed across per-backend sync connections and merged back into a
//! single ordered outbound channel.
//!
//! ## Components
//!
//! - [`Syncer`]: one backend node's contribution to a session, either
//!   [`LocalSyncer`] (in-process storage) or [`RemoteSyncer`] (wire)
//! - [`SyncerSet`]: the per-session registry mapping streams and node
//!   addresses to syncers and merging their output
//! - [`SyncSession`]: the per-caller state machine serializing control
//!   commands and relaying merged events
//! - [`SyncHandler`]: the process-wide session directory routing control
//!   calls to the right session
//! - [`SyncReceiver`]: the simpler single-upstream client that demultiplexes
//!   one node's stream and retries failed streams with backoff
//!
//! Ordering: events for a single stream arrive in the order the owning
//! backend produced them. Nothing is guaranteed across streams.

pub mod handler;
pub mod local;
pub mod operation;
pub mod receiver;
pub mod remote;
pub mod syncer;
pub mod syncer_set;

pub use handler::SyncHandler;
pub use local::LocalSyncer;
pub use operation::{ResponseSink, SyncSession};
pub use receiver::{SyncReceiver, SyncUpdate, SyncUpdateKind, start_sync_receiver};
pub use remote::RemoteSyncer;
pub use syncer::Syncer;
pub use syncer_set::{SyncerSet, group_cookies};
