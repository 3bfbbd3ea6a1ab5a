//! Endpoint pool with fork-aware scheduling.
//!
//! A pool owns one set of clients, the block cache they report into, and a
//! memoized fork-resolution view. Callers pull a "ready" client - one that
//! is healthy and agrees with the canonical fork - through a round-robin
//! scheduler, and may subscribe to block and head events to react to chain
//! progress.

pub mod block_cache;
pub mod client;
pub mod configuration;
pub mod forks;
pub mod rpc;

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::info;

use argus_common::{ClientKind, Dispatcher, Root, Slot, Subscription};

pub use crate::block_cache::{Block, BlockCache};
pub use crate::client::{Client, ClientStatus, HeadEvent};
pub use crate::configuration::{EndpointConfig, PoolConfig, SchedulerMode};
pub use crate::forks::HeadFork;
pub use crate::rpc::{
    BlockHeader, ExecutionApi, NodeEvent, RpcClient, TransactionReceipt,
};

use crate::forks::{resolve_head_forks, ForkCache};

/// Read-only per-endpoint row for status surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub kind: ClientKind,
    pub status: ClientStatus,
    pub head_slot: Option<Slot>,
    pub head_root: Option<Root>,
    pub last_error: Option<String>,
}

pub struct ClientPool {
    config: PoolConfig,
    cache: Arc<BlockCache>,
    clients: RwLock<Vec<Arc<Client>>>,
    fork_cache: Arc<ForkCache>,
    head_events: Dispatcher<HeadEvent>,
    cursors: DashMap<Option<ClientKind>, u16>,
    shutdown_tx: watch::Sender<bool>,
}

impl ClientPool {
    /// Create a pool and start its cache maintenance tasks. Endpoints are
    /// added separately, with the transport for each.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cache = Arc::new(BlockCache::new(config.follow_distance, shutdown_rx));
        cache.spawn_maintenance();
        Arc::new(Self {
            config,
            cache,
            clients: RwLock::new(Vec::new()),
            fork_cache: Arc::new(ForkCache::new()),
            head_events: Dispatcher::new(),
            cursors: DashMap::new(),
            shutdown_tx,
        })
    }

    /// Register an endpoint and start its supervision loop. The returned
    /// client lives for the pool's lifetime.
    pub fn add_endpoint(&self, endpoint: EndpointConfig, rpc: Arc<dyn RpcClient>) -> Arc<Client> {
        let mut clients = self.clients.write().expect("clients lock poisoned");
        let index = clients.len() as u16;
        let client = Client::new(index, endpoint, rpc);
        clients.push(client.clone());
        info!(pool = %self.config.name, client = client.name(), index, "endpoint added");
        tokio::spawn(client.clone().run(
            self.cache.clone(),
            self.fork_cache.clone(),
            self.head_events.clone(),
            self.shutdown_tx.subscribe(),
        ));
        client
    }

    pub fn get_all_endpoints(&self) -> Vec<Arc<Client>> {
        self.clients.read().expect("clients lock poisoned").clone()
    }

    /// Current fork view for the given fork distance, memoized until the
    /// next head/status/finality change.
    pub fn get_head_forks(&self, fork_distance: u64) -> Arc<Vec<HeadFork>> {
        let clients = self.get_all_endpoints();
        self.fork_cache
            .get_or_compute(fork_distance, || resolve_head_forks(&clients, &self.cache, fork_distance))
    }

    /// The fork with the most ready clients.
    pub fn get_canonical_fork(&self, fork_distance: u64) -> Option<HeadFork> {
        self.get_head_forks(fork_distance).first().cloned()
    }

    /// Hand out the next ready client of the requested kind, round robin.
    ///
    /// The per-kind cursor remembers the index of the last client returned;
    /// the first ready client with a strictly greater index is chosen,
    /// wrapping to the smallest-indexed ready client. Never blocks; `None`
    /// when no client currently qualifies.
    pub fn get_ready_endpoint(&self, kind: Option<&ClientKind>) -> Option<Arc<Client>> {
        let forks = self.get_head_forks(self.config.fork_distance);
        let canonical = forks.first()?;
        let mut ready: Vec<Arc<Client>> = canonical
            .ready_clients
            .iter()
            .filter(|client| kind.is_none_or(|k| client.kind() == k))
            .cloned()
            .collect();
        if ready.is_empty() {
            return None;
        }
        ready.sort_by_key(|client| client.index());

        let key = kind.cloned();
        let last = self.cursors.get(&key).map(|entry| *entry);
        let chosen = match last {
            Some(last) => {
                ready.iter().find(|client| client.index() > last).unwrap_or(&ready[0]).clone()
            }
            None => ready[0].clone(),
        };
        self.cursors.insert(key, chosen.index());
        Some(chosen)
    }

    /// Whether a client the caller already holds is still on the canonical
    /// fork and safe to use.
    pub fn is_client_ready(&self, client: &Client) -> bool {
        self.get_head_forks(self.config.fork_distance)
            .first()
            .is_some_and(|fork| fork.is_ready_client(client))
    }

    pub fn block_cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn subscribe_head_event(&self, capacity: usize) -> Subscription<HeadEvent> {
        self.head_events.subscribe(capacity)
    }

    /// Receiver that flips to `true` when the pool shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop every client loop and maintenance task.
    pub fn shutdown(&self) {
        info!(pool = %self.config.name, "pool shutting down");
        self.shutdown_tx.send_replace(true);
    }

    /// Per-endpoint snapshot rows for status surfaces.
    pub fn status(&self) -> Vec<EndpointStatus> {
        self.get_all_endpoints()
            .iter()
            .map(|client| {
                let head = client.head();
                EndpointStatus {
                    name: client.name().to_string(),
                    kind: client.kind().clone(),
                    status: client.status(),
                    head_slot: head.map(|(slot, _)| slot),
                    head_root: head.map(|(_, root)| root),
                    last_error: client.last_error(),
                }
            })
            .collect()
    }
}
