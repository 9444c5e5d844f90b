//! Syncer registry
//!
//! The per-session set of syncers, keyed by backend node address, plus the
//! stream -> syncer routing map. Both maps live under one mutex and are
//! always mutated together: every tracked stream maps to an address present
//! in the syncer map, and a syncer that reports itself empty leaves the
//! registry in the same critical section.
//!
//! Syncers execute on independent tasks that communicate only through the
//! merged output channel. Shutdown waits for every task before the channel
//! is closed; the closed channel is what tells the session to emit `Close`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use confluence_core::{
    CancelScope, NodeAddress, NodeDirectory, StreamCache, StreamId, SyncCookie, SyncError,
    SyncFrame, SyncResult, validate_cookie,
};

use crate::local::LocalSyncer;
use crate::remote::RemoteSyncer;
use crate::syncer::Syncer;

/// Capacity of the merged output channel shared by all syncers.
pub const MESSAGES_BUFFER: usize = 256;

/// Validate caller-supplied cookies and group them by owning node address.
///
/// Later cookies win when the same stream appears twice.
pub fn group_cookies(
    cookies: &[SyncCookie],
) -> SyncResult<HashMap<NodeAddress, Vec<SyncCookie>>> {
    let mut by_stream: HashMap<NodeAddress, HashMap<StreamId, SyncCookie>> = HashMap::new();
    for cookie in cookies {
        validate_cookie(cookie)?;
        by_stream
            .entry(cookie.node_address)
            .or_default()
            .insert(cookie.stream_id, cookie.clone());
    }
    Ok(by_stream
        .into_iter()
        .map(|(addr, set)| (addr, set.into_values().collect()))
        .collect())
}

struct SetState {
    /// Set once the session is shutting down; rejects further mutation.
    stopped: bool,
    /// Active syncers, keyed by backend node address.
    syncers: HashMap<NodeAddress, Arc<Syncer>>,
    /// Which syncer currently owns each tracked stream.
    stream_to_syncer: HashMap<StreamId, NodeAddress>,
    /// Running syncer tasks, drained at shutdown.
    tasks: Vec<JoinHandle<()>>,
}

/// The set of syncers serving one sync session.
pub struct SyncerSet {
    /// Session scope; cancelling it stops the whole set.
    scope: CancelScope,
    sync_id: String,
    local_addr: NodeAddress,
    cache: Arc<dyn StreamCache>,
    directory: Arc<dyn NodeDirectory>,
    /// Sending half of the merged channel; taken at shutdown so the channel
    /// closes once every syncer has dropped its clone.
    messages: std::sync::Mutex<Option<mpsc::Sender<SyncFrame>>>,
    state: tokio::sync::Mutex<SetState>,
}

impl SyncerSet {
    /// Build the set for the given cookies, one syncer per backend node.
    ///
    /// Streams on unreachable remotes are reported `Down` instead of
    /// failing the session. Returns the receiving half of the merged
    /// channel; call [`start_all`](Self::start_all) to begin syncing and
    /// spawn [`run`](Self::run) to supervise shutdown.
    pub async fn new(
        scope: CancelScope,
        sync_id: String,
        local_addr: NodeAddress,
        cache: Arc<dyn StreamCache>,
        directory: Arc<dyn NodeDirectory>,
        grouped: HashMap<NodeAddress, Vec<SyncCookie>>,
    ) -> (Arc<Self>, mpsc::Receiver<SyncFrame>) {
        let (tx, rx) = mpsc::channel(MESSAGES_BUFFER);

        let mut syncers: HashMap<NodeAddress, Arc<Syncer>> = HashMap::new();
        let mut stream_to_syncer = HashMap::new();
        let mut tasks = Vec::new();

        for (address, cookies) in grouped {
            let stream_ids: Vec<StreamId> = cookies.iter().map(|c| c.stream_id).collect();

            let syncer = if address == local_addr {
                Syncer::Local(
                    LocalSyncer::new(
                        sync_id.clone(),
                        scope.clone(),
                        local_addr,
                        cache.clone(),
                        cookies,
                        tx.clone(),
                    )
                    .await,
                )
            } else {
                let client = match directory.client_for_address(address) {
                    Ok(client) => client,
                    Err(err) => {
                        warn!(
                            sync_id = %sync_id,
                            remote = %address.short_id(),
                            error = %err,
                            "unable to find client for remote stream sync"
                        );
                        tasks.push(spawn_unavailable(tx.clone(), scope.clone(), stream_ids));
                        continue;
                    }
                };
                match RemoteSyncer::new(
                    sync_id.clone(),
                    scope.clone(),
                    address,
                    client,
                    cookies,
                    tx.clone(),
                )
                .await
                {
                    Ok(syncer) => Syncer::Remote(syncer),
                    Err(err) => {
                        warn!(
                            sync_id = %sync_id,
                            remote = %address.short_id(),
                            error = %err,
                            "unable to connect to remote node when starting stream sync"
                        );
                        tasks.push(spawn_unavailable(tx.clone(), scope.clone(), stream_ids));
                        continue;
                    }
                }
            };

            let syncer = Arc::new(syncer);
            for stream_id in stream_ids {
                stream_to_syncer.insert(stream_id, address);
            }
            syncers.insert(address, syncer);
        }

        let set = Arc::new(Self {
            scope,
            sync_id,
            local_addr,
            cache,
            directory,
            messages: std::sync::Mutex::new(Some(tx)),
            state: tokio::sync::Mutex::new(SetState {
                stopped: false,
                syncers,
                stream_to_syncer,
                tasks,
            }),
        });

        (set, rx)
    }

    /// Start a task for every syncer built from the initial cookies.
    pub async fn start_all(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        let syncers: Vec<Arc<Syncer>> = state.syncers.values().cloned().collect();
        for syncer in syncers {
            self.start_syncer_locked(&mut state, syncer);
        }
    }

    /// Supervise shutdown: wait for session cancellation, then for every
    /// syncer task, then close the merged channel.
    pub async fn run(&self) {
        self.scope.cancelled().await;

        let tasks = {
            let mut state = self.state.lock().await;
            state.stopped = true;
            std::mem::take(&mut state.tasks)
        };
        for task in tasks {
            let _ = task.await;
        }

        {
            let mut state = self.state.lock().await;
            state.syncers.clear();
            state.stream_to_syncer.clear();
        }
        // Last sender clone gone: the session loop sees the channel close
        // and emits the final Close frame.
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        debug!(sync_id = %self.sync_id, "syncer set stopped");
    }

    /// Route one more stream into the set, creating a syncer for its
    /// backend if none exists yet. Adding an already-tracked stream is a
    /// no-op.
    pub async fn add_stream(
        self: &Arc<Self>,
        address: NodeAddress,
        stream_id: StreamId,
        cookie: SyncCookie,
    ) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(SyncError::Canceled(format!(
                "sync operation {} stopped",
                self.sync_id
            )));
        }
        if state.stream_to_syncer.contains_key(&stream_id) {
            // Stream is already part of the sync operation.
            return Ok(());
        }

        if let Some(syncer) = state.syncers.get(&address).cloned() {
            syncer.add_stream(cookie).await?;
            state.stream_to_syncer.insert(stream_id, address);
            return Ok(());
        }

        // First stream for this backend: create a new syncer.
        let sender = self.sender()?;
        let syncer = if address == self.local_addr {
            Syncer::Local(
                LocalSyncer::new(
                    self.sync_id.clone(),
                    self.scope.clone(),
                    self.local_addr,
                    self.cache.clone(),
                    vec![cookie],
                    sender,
                )
                .await,
            )
        } else {
            let client = self.directory.client_for_address(address)?;
            Syncer::Remote(
                RemoteSyncer::new(
                    self.sync_id.clone(),
                    self.scope.clone(),
                    address,
                    client,
                    vec![cookie],
                    sender,
                )
                .await?,
            )
        };

        let syncer = Arc::new(syncer);
        state.syncers.insert(address, syncer.clone());
        state.stream_to_syncer.insert(stream_id, address);
        self.start_syncer_locked(&mut state, syncer);
        Ok(())
    }

    /// Remove one stream, dropping its syncer if it now tracks nothing.
    pub async fn remove_stream(&self, stream_id: StreamId) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        let (address, syncer) = self.owning_syncer(&state, stream_id)?;

        let syncer_stopped = syncer.remove_stream(stream_id).await?;

        state.stream_to_syncer.remove(&stream_id);
        if syncer_stopped {
            state.syncers.remove(&address);
        }
        Ok(())
    }

    /// Force one stream to report `Down`. Operational/test tooling.
    pub async fn debug_drop_stream(&self, stream_id: StreamId) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        let (address, syncer) = self.owning_syncer(&state, stream_id)?;

        let syncer_stopped = syncer.debug_drop_stream(stream_id).await?;

        state.stream_to_syncer.remove(&stream_id);
        if syncer_stopped {
            state.syncers.remove(&address);
        }
        Ok(())
    }

    /// Forget the routing entry for a stream that went `Down`, so a later
    /// `AddStream` for it is not treated as a duplicate. Called by the
    /// session as `Down` frames pass through it.
    pub(crate) async fn unmap_stream(&self, stream_id: StreamId) {
        let mut state = self.state.lock().await;
        state.stream_to_syncer.remove(&stream_id);
    }

    /// Number of registered syncers and tracked streams, for tests and
    /// introspection.
    pub async fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.syncers.len(), state.stream_to_syncer.len())
    }

    fn owning_syncer(
        &self,
        state: &SetState,
        stream_id: StreamId,
    ) -> SyncResult<(NodeAddress, Arc<Syncer>)> {
        let address = state
            .stream_to_syncer
            .get(&stream_id)
            .copied()
            .ok_or_else(|| SyncError::stream_not_found(&self.sync_id, stream_id))?;
        // A missing syncer here would mean the two maps disagree.
        let syncer = state
            .syncers
            .get(&address)
            .cloned()
            .ok_or_else(|| SyncError::stream_not_found(&self.sync_id, stream_id))?;
        Ok((address, syncer))
    }

    fn sender(&self) -> SyncResult<mpsc::Sender<SyncFrame>> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                SyncError::Canceled(format!("sync operation {} stopped", self.sync_id))
            })
    }

    /// Spawn a syncer's task and register it for shutdown supervision.
    /// The caller must hold the state lock.
    fn start_syncer_locked(self: &Arc<Self>, state: &mut SetState, syncer: Arc<Syncer>) {
        let set = Arc::clone(self);
        let handle = tokio::spawn(async move {
            syncer.run().await;
            // The syncer finished (connection gone or session over): drop
            // it from the registry unless a replacement already took the
            // address.
            let mut state = set.state.lock().await;
            let address = syncer.address();
            if let Some(current) = state.syncers.get(&address) {
                if Arc::ptr_eq(current, &syncer) {
                    state.syncers.remove(&address);
                    state.stream_to_syncer.retain(|_, a| *a != address);
                }
            }
        });
        state.tasks.push(handle);
    }
}

/// Report every stream of an unreachable backend as `Down`.
fn spawn_unavailable(
    messages: mpsc::Sender<SyncFrame>,
    scope: CancelScope,
    stream_ids: Vec<StreamId>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for stream_id in stream_ids {
            tokio::select! {
                res = messages.send(SyncFrame::down_frame(stream_id)) => {
                    if res.is_err() {
                        return;
                    }
                }
                _ = scope.cancelled() => return,
            }
        }
    })
}
