//! One connection to one node endpoint.
//!
//! Each client runs a supervision loop for the process lifetime: bootstrap
//! the endpoint, validate its chain data against the pool, follow its event
//! stream, and on any failure go offline and retry with tiered backoff.
//! Observations are submitted into the pool's shared block cache; the loop
//! itself never returns an error to callers.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use argus_common::{Checkpoint, ClientKind, Dispatcher, NodeVersion, Root, Slot, SyncState};

use crate::block_cache::BlockCache;
use crate::configuration::EndpointConfig;
use crate::forks::ForkCache;
use crate::rpc::{ExecutionApi, NodeEvent, RpcClient};

const HEAD_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Connection/health state of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Disconnected,
    Initializing,
    Healthy,
    Syncing,
    Optimistic,
    Offline,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClientStatus::Disconnected => "disconnected",
            ClientStatus::Initializing => "initializing",
            ClientStatus::Healthy => "healthy",
            ClientStatus::Syncing => "syncing",
            ClientStatus::Optimistic => "optimistic",
            ClientStatus::Offline => "offline",
        };
        f.write_str(label)
    }
}

/// Fired by the pool whenever any client's head changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadEvent {
    pub client_index: u16,
    pub slot: Slot,
    pub root: Root,
}

pub struct Client {
    index: u16,
    config: EndpointConfig,
    rpc: Arc<dyn RpcClient>,
    status: RwLock<ClientStatus>,
    head: RwLock<Option<(Slot, Root)>>,
    finalized: RwLock<Option<Checkpoint>>,
    version: RwLock<Option<NodeVersion>>,
    last_error: Mutex<Option<String>>,
    failures: AtomicU32,
}

impl Client {
    pub(crate) fn new(index: u16, config: EndpointConfig, rpc: Arc<dyn RpcClient>) -> Arc<Self> {
        Arc::new(Self {
            index,
            config,
            rpc,
            status: RwLock::new(ClientStatus::Disconnected),
            head: RwLock::new(None),
            finalized: RwLock::new(None),
            version: RwLock::new(None),
            last_error: Mutex::new(None),
            failures: AtomicU32::new(0),
        })
    }

    /// Stable index assigned at registration; used for scheduling fairness
    /// and tie-breaking.
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> &ClientKind {
        &self.config.kind
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.read().expect("status lock poisoned")
    }

    /// Last observed head, fully replaced on every update.
    pub fn head(&self) -> Option<(Slot, Root)> {
        *self.head.read().expect("head lock poisoned")
    }

    pub fn finalized(&self) -> Option<Checkpoint> {
        *self.finalized.read().expect("finalized lock poisoned")
    }

    pub fn version(&self) -> Option<NodeVersion> {
        self.version.read().expect("version lock poisoned").clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last_error lock poisoned").clone()
    }

    pub fn rpc(&self) -> &Arc<dyn RpcClient> {
        &self.rpc
    }

    /// Account/transaction capability, if this endpoint has one.
    pub fn execution(&self) -> Option<&dyn ExecutionApi> {
        self.rpc.execution()
    }

    /// Apply a status transition; invalidates the fork cache when the
    /// status actually changed, since readiness depends on it.
    fn transition(&self, status: ClientStatus, fork_cache: &ForkCache) {
        let changed = {
            let mut current = self.status.write().expect("status lock poisoned");
            if *current == status {
                false
            } else {
                debug!(client = self.name(), from = %current, to = %status, "status change");
                *current = status;
                true
            }
        };
        if changed {
            fork_cache.invalidate();
        }
    }

    fn record_error(&self, err: &anyhow::Error) {
        *self.last_error.lock().expect("last_error lock poisoned") = Some(format!("{err:#}"));
    }

    /// Supervision loop; only exits on shutdown.
    pub(crate) async fn run(
        self: Arc<Self>,
        cache: Arc<BlockCache>,
        fork_cache: Arc<ForkCache>,
        head_events: Dispatcher<HeadEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            self.transition(ClientStatus::Initializing, &fork_cache);

            let outcome = match self.bootstrap(&cache).await {
                Ok(status) => {
                    self.failures.store(0, Ordering::SeqCst);
                    self.transition(status, &fork_cache);
                    self.follow_chain(&cache, &fork_cache, &head_events, &mut shutdown).await
                }
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(()) => return, // shutdown
                Err(err) => err,
            };
            if *shutdown.borrow() {
                return;
            }

            self.record_error(&err);
            self.transition(ClientStatus::Offline, &fork_cache);
            let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
            let backoff = retry_backoff(failures);
            warn!(
                client = self.name(),
                failures,
                "endpoint offline, retrying in {}s: {err:#}",
                backoff.as_secs()
            );
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Connect and take a one-shot health snapshot. Chain data is validated
    /// against the pool's cache; a mismatch keeps this client's data out.
    async fn bootstrap(&self, cache: &BlockCache) -> Result<ClientStatus> {
        self.rpc.initialize().await?;
        let (version, genesis, specs, sync) = futures::try_join!(
            self.rpc.node_version(),
            self.rpc.genesis(),
            self.rpc.chain_specs(),
            self.rpc.sync_status(),
        )?;
        cache.set_genesis(&genesis)?;
        cache.set_specs(&specs)?;
        info!(client = self.name(), version = %version.0, "endpoint initialized");
        *self.version.write().expect("version lock poisoned") = Some(version);
        Ok(status_for_sync_state(&sync))
    }

    /// Consume the event stream, with a periodic head poll as a liveness
    /// fallback in case the stream silently stalls.
    async fn follow_chain(
        self: &Arc<Self>,
        cache: &Arc<BlockCache>,
        fork_cache: &Arc<ForkCache>,
        head_events: &Dispatcher<HeadEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut events = self.rpc.subscribe_events().await?;

        let (slot, root) = self.rpc.latest_head().await?;
        self.process_head(slot, root, cache, fork_cache, head_events).await;
        let checkpoint = self.rpc.finality_checkpoint().await?;
        self.process_finality(checkpoint, cache, fork_cache);

        let mut poll = tokio::time::interval(HEAD_POLL_INTERVAL);
        poll.reset();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(anyhow!("event stream closed"));
                    };
                    match event {
                        NodeEvent::Head { slot, root } => {
                            self.process_head(slot, root, cache, fork_cache, head_events).await;
                        }
                        NodeEvent::FinalizedCheckpoint(checkpoint) => {
                            self.process_finality(checkpoint, cache, fork_cache);
                        }
                    }
                    // The stream is alive; push the liveness poll back out
                    poll.reset();
                }
                _ = poll.tick() => {
                    let sync = self.rpc.sync_status().await?;
                    self.transition(status_for_sync_state(&sync), fork_cache);
                    let (slot, root) = self.rpc.latest_head().await?;
                    self.process_head(slot, root, cache, fork_cache, head_events).await;
                }
            }
        }
    }

    /// Submit an observed head into the cache and update our head pointer.
    async fn process_head(
        self: &Arc<Self>,
        slot: Slot,
        root: Root,
        cache: &Arc<BlockCache>,
        fork_cache: &Arc<ForkCache>,
        head_events: &Dispatcher<HeadEvent>,
    ) {
        match cache.add_block(root, slot) {
            Some((block, is_new)) => {
                block.mark_seen_by(self.clone());
                if is_new || block.header().is_none() {
                    let rpc = self.rpc.clone();
                    let loaded = cache
                        .ensure_header(&block, || async move {
                            rpc.block_header_by_root(root)
                                .await?
                                .ok_or_else(|| anyhow!("header {root} not known by endpoint"))
                        })
                        .await;
                    if let Err(err) = loaded {
                        warn!(client = self.name(), %root, "header load failed: {err:#}");
                    }
                }
                if is_new || block.body().is_none() {
                    let rpc = self.rpc.clone();
                    let loaded = cache
                        .ensure_body(&block, || async move {
                            rpc.block_body_by_root(root)
                                .await?
                                .ok_or_else(|| anyhow!("body {root} not known by endpoint"))
                        })
                        .await;
                    if let Err(err) = loaded {
                        warn!(client = self.name(), %root, "body load failed: {err:#}");
                    }
                }
            }
            // Stale observation from a lagging endpoint; expected race
            None => debug!(client = self.name(), slot, "head below retention floor"),
        }

        let changed = {
            let mut head = self.head.write().expect("head lock poisoned");
            if *head == Some((slot, root)) {
                false
            } else {
                *head = Some((slot, root));
                true
            }
        };
        if changed {
            debug!(client = self.name(), slot, %root, "head updated");
            fork_cache.invalidate();
            head_events.fire(&HeadEvent {
                client_index: self.index,
                slot,
                root,
            });
        }
    }

    /// Record an observed finality checkpoint; lower-or-equal epochs are
    /// ignored.
    fn process_finality(&self, checkpoint: Checkpoint, cache: &BlockCache, fork_cache: &ForkCache) {
        let changed = {
            let mut finalized = self.finalized.write().expect("finalized lock poisoned");
            match finalized.as_ref() {
                Some(current) if checkpoint.epoch <= current.epoch => false,
                _ => {
                    *finalized = Some(checkpoint);
                    true
                }
            }
        };
        if changed {
            cache.set_finalized_checkpoint(checkpoint);
            fork_cache.invalidate();
        }
    }

    #[cfg(test)]
    pub(crate) fn force_status(&self, status: ClientStatus) {
        *self.status.write().expect("status lock poisoned") = status;
    }

    #[cfg(test)]
    pub(crate) fn force_head(&self, slot: Slot, root: Root) {
        *self.head.write().expect("head lock poisoned") = Some((slot, root));
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("index", &self.index)
            .field("name", &self.config.name)
            .field("status", &self.status())
            .finish()
    }
}

fn status_for_sync_state(sync: &SyncState) -> ClientStatus {
    if sync.is_syncing {
        ClientStatus::Syncing
    } else if sync.is_optimistic {
        ClientStatus::Optimistic
    } else {
        ClientStatus::Healthy
    }
}

fn retry_backoff(failures: u32) -> Duration {
    let secs = match failures {
        f if f >= 10 => 300,
        f if f >= 5 => 60,
        _ => 10,
    };
    Duration::from_secs(secs)
}
