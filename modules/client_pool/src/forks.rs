//! Head fork resolution.
//!
//! Recomputed on demand from every client's reported head plus ancestry
//! lookups in the block cache, then memoized per fork-distance until any
//! head, status or finality change invalidates the whole cache. Recompute
//! cost is bounded by client count, which keeps wholesale invalidation
//! cheaper than incremental bucket maintenance at this scale.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use argus_common::{Root, Slot};

use crate::block_cache::BlockCache;
use crate::client::{Client, ClientStatus};

/// A transient view of one group of clients agreeing on a chain.
#[derive(Debug, Clone)]
pub struct HeadFork {
    /// Representative head of this fork: the furthest-ahead head that all
    /// members resolve to by ancestry.
    pub slot: Slot,
    pub root: Root,

    /// Every client whose head resolves to this fork.
    pub clients: Vec<Arc<Client>>,

    /// Members that are healthy and within fork distance of the head.
    pub ready_clients: Vec<Arc<Client>>,
}

impl HeadFork {
    pub fn is_ready_client(&self, client: &Client) -> bool {
        self.ready_clients.iter().any(|c| c.index() == client.index())
    }
}

/// Group clients into divergent forks and rank them.
///
/// Bucketing rules, per client in index order: join the first fork whose
/// head equals the client's head, or is linked to it by ancestry in either
/// direction; when the client's head is ahead of the fork's representative,
/// the representative advances to it. A head that links to nothing opens a
/// fork of its own. Buckets are ranked by ready-client count, ties keeping
/// discovery order.
pub(crate) fn resolve_head_forks(
    clients: &[Arc<Client>],
    cache: &BlockCache,
    fork_distance: u64,
) -> Vec<HeadFork> {
    let mut forks: Vec<HeadFork> = Vec::new();

    for client in clients {
        let Some((slot, root)) = client.head() else {
            continue;
        };
        let mut placed = false;
        for fork in forks.iter_mut() {
            if fork.root == root {
                fork.clients.push(client.clone());
                placed = true;
                break;
            }
            if cache.block_distance(&root, &fork.root).is_some() {
                // Client's head is an ancestor of this fork's head
                fork.clients.push(client.clone());
                placed = true;
                break;
            }
            if cache.block_distance(&fork.root, &root).is_some() {
                // Fork's representative is behind this client; advance it
                fork.slot = slot;
                fork.root = root;
                fork.clients.push(client.clone());
                placed = true;
                break;
            }
        }
        if !placed {
            forks.push(HeadFork {
                slot,
                root,
                clients: vec![client.clone()],
                ready_clients: Vec::new(),
            });
        }
    }

    for fork in forks.iter_mut() {
        fork.ready_clients = fork
            .clients
            .iter()
            .filter(|client| {
                if client.status() != ClientStatus::Healthy {
                    return false;
                }
                let Some((_, head_root)) = client.head() else {
                    return false;
                };
                if head_root == fork.root {
                    return true;
                }
                matches!(
                    cache.block_distance(&head_root, &fork.root),
                    Some(distance) if distance <= fork_distance
                )
            })
            .cloned()
            .collect();
    }

    // Stable sort keeps discovery order on ties
    forks.sort_by(|a, b| b.ready_clients.len().cmp(&a.ready_clients.len()));
    forks
}

/// Memoized fork views, keyed by the fork distance used to compute them.
pub(crate) struct ForkCache {
    cached: Mutex<HashMap<u64, Arc<Vec<HeadFork>>>>,
}

impl ForkCache {
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every memoized view. Called on any head, status or finality
    /// change.
    pub fn invalidate(&self) {
        self.cached.lock().expect("fork cache lock poisoned").clear();
    }

    pub fn get_or_compute<F>(&self, fork_distance: u64, compute: F) -> Arc<Vec<HeadFork>>
    where
        F: FnOnce() -> Vec<HeadFork>,
    {
        let mut cached = self.cached.lock().expect("fork cache lock poisoned");
        cached.entry(fork_distance).or_insert_with(|| Arc::new(compute())).clone()
    }
}
