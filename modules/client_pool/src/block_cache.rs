//! Bounded, dual-indexed cache of recently seen blocks.
//!
//! One instance per pool. Every client of the pool writes its observations
//! here; external callers only read. Blocks are retained for at least
//! `follow_distance` slots below the highest slot seen, then evicted by a
//! periodic cleanup pass.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::debug;

use argus_common::wallclock::SlotClock;
use argus_common::{
    ChainDataError, ChainSpecs, Checkpoint, Dispatcher, Epoch, Genesis, Root, Signal, Slot,
    Subscription,
};

use crate::client::Client;
use crate::rpc::BlockHeader;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Empty,
    Loading,
    Filled,
}

/// Resets a claimed load back to `Empty` if the loading future is dropped
/// before completing, so cancellation cannot wedge other waiters.
struct LoadGuard<'a> {
    state: &'a watch::Sender<LoadState>,
    armed: bool,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_if_modified(|s| {
                if *s == LoadState::Loading {
                    *s = LoadState::Empty;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Lazily populated field with exactly-once loading under concurrency.
///
/// The state machine is `Empty -> Loading -> Filled`; the first caller to
/// observe `Empty` claims the load, everyone else waits for the outcome. A
/// failed load resets to `Empty` so a later caller can retry. `ready` fires
/// once, on the first successful fill.
struct Lazy<T> {
    state: watch::Sender<LoadState>,
    value: RwLock<Option<T>>,
    ready: Signal,
}

impl<T: Clone> Lazy<T> {
    fn new() -> Self {
        let (state, _) = watch::channel(LoadState::Empty);
        Self {
            state,
            value: RwLock::new(None),
            ready: Signal::new(),
        }
    }

    fn get(&self) -> Option<T> {
        self.value.read().expect("lazy value lock poisoned").clone()
    }

    /// Returns the value plus whether this call performed the fill.
    async fn ensure<F, Fut>(&self, loader: F) -> Result<(T, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let mut rx = self.state.subscribe();
            let mut claimed = false;
            self.state.send_if_modified(|s| {
                if *s == LoadState::Empty {
                    *s = LoadState::Loading;
                    claimed = true;
                    true
                } else {
                    false
                }
            });
            if claimed {
                break;
            }
            let outcome =
                *rx.wait_for(|s| *s != LoadState::Loading).await.expect("lazy state sender dropped");
            if outcome == LoadState::Filled {
                return Ok((self.get().expect("filled lazy field has no value"), false));
            }
            // The load failed and the field is empty again; contend for it
        }

        let mut guard = LoadGuard {
            state: &self.state,
            armed: true,
        };
        match loader().await {
            Ok(value) => {
                *self.value.write().expect("lazy value lock poisoned") = Some(value.clone());
                guard.armed = false;
                self.state.send_replace(LoadState::Filled);
                self.ready.fire();
                Ok((value, true))
            }
            Err(e) => {
                guard.armed = false;
                self.state.send_replace(LoadState::Empty);
                Err(e)
            }
        }
    }
}

/// A block identity with lazily loaded content.
///
/// Created the first time any client reports its `(root, slot)` pair and
/// owned by the cache; clients and callers only hold references.
pub struct Block {
    root: Root,
    slot: Slot,
    header: Lazy<BlockHeader>,
    body: Lazy<Bytes>,
    seen_by: Mutex<BTreeMap<u16, Arc<Client>>>,
}

impl Block {
    fn new(root: Root, slot: Slot) -> Self {
        Self {
            root,
            slot,
            header: Lazy::new(),
            body: Lazy::new(),
            seen_by: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> Root {
        self.root
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Cached header, without triggering a load.
    pub fn header(&self) -> Option<BlockHeader> {
        self.header.get()
    }

    /// Cached body, without triggering a load.
    pub fn body(&self) -> Option<Bytes> {
        self.body.get()
    }

    pub fn parent_root(&self) -> Option<Root> {
        self.header().map(|h| h.parent_root)
    }

    /// Clients that reported this block, ordered by client index.
    pub fn seen_by(&self) -> Vec<Arc<Client>> {
        self.seen_by.lock().expect("seen_by lock poisoned").values().cloned().collect()
    }

    pub(crate) fn mark_seen_by(&self, client: Arc<Client>) {
        self.seen_by.lock().expect("seen_by lock poisoned").insert(client.index(), client);
    }

    /// Wait until a header has been attached.
    pub async fn await_header(&self) {
        self.header.ready.wait().await
    }

    /// Wait until a body has been attached.
    pub async fn await_body(&self) {
        self.body.ready.wait().await
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block").field("root", &self.root).field("slot", &self.slot).finish()
    }
}

#[derive(Default)]
struct Indices {
    by_root: HashMap<Root, Arc<Block>>,
    by_slot: BTreeMap<Slot, Vec<Arc<Block>>>,
    max_slot_seen: Slot,
}

impl Indices {
    fn retention_floor(&self, follow_distance: u64) -> Slot {
        self.max_slot_seen.saturating_sub(follow_distance)
    }
}

/// Shared block cache of one pool.
pub struct BlockCache {
    follow_distance: u64,
    indices: RwLock<Indices>,
    genesis: RwLock<Option<Genesis>>,
    specs: RwLock<Option<ChainSpecs>>,
    finalized: RwLock<Option<Checkpoint>>,
    block_dispatcher: Dispatcher<Arc<Block>>,
    finalized_dispatcher: Dispatcher<Checkpoint>,
    wallclock_slot_dispatcher: Dispatcher<Slot>,
    wallclock_epoch_dispatcher: Dispatcher<Epoch>,
    shutdown: watch::Receiver<bool>,
}

impl BlockCache {
    pub fn new(follow_distance: u64, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            follow_distance,
            indices: RwLock::new(Indices::default()),
            genesis: RwLock::new(None),
            specs: RwLock::new(None),
            finalized: RwLock::new(None),
            block_dispatcher: Dispatcher::new(),
            finalized_dispatcher: Dispatcher::new(),
            wallclock_slot_dispatcher: Dispatcher::new(),
            wallclock_epoch_dispatcher: Dispatcher::new(),
            shutdown,
        }
    }

    pub fn follow_distance(&self) -> u64 {
        self.follow_distance
    }

    /// Start the periodic cleanup timer and the wallclock tick loop.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let cache = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(CLEANUP_INTERVAL);
            timer.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = timer.tick() => cache.run_cleanup(),
                }
            }
        });

        let cache = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            cache.run_wallclock(&mut shutdown).await;
        });
    }

    /// Register a block observation.
    ///
    /// Returns the cached block and whether it is new to the cache; `None`
    /// when the slot is already below the retention floor (an expected race
    /// between fast and slow clients, not an error).
    pub fn add_block(&self, root: Root, slot: Slot) -> Option<(Arc<Block>, bool)> {
        let mut indices = self.indices.write().expect("index lock poisoned");
        if let Some(existing) = indices.by_root.get(&root) {
            return Some((existing.clone(), false));
        }
        if slot < indices.retention_floor(self.follow_distance) {
            return None;
        }
        let block = Arc::new(Block::new(root, slot));
        indices.by_root.insert(root, block.clone());
        indices.by_slot.entry(slot).or_default().push(block.clone());
        indices.max_slot_seen = indices.max_slot_seen.max(slot);
        Some((block, true))
    }

    /// Load the block's header if not yet present. The first caller runs
    /// `loader`; concurrent callers block until it completes.
    pub async fn ensure_header<F, Fut>(&self, block: &Arc<Block>, loader: F) -> Result<BlockHeader>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BlockHeader>>,
    {
        let (header, _) = block.header.ensure(loader).await?;
        Ok(header)
    }

    /// Load the block's body if not yet present. Fires the pool-wide block
    /// event exactly once, when the body is first attached.
    pub async fn ensure_body<F, Fut>(&self, block: &Arc<Block>, loader: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let (body, filled_now) = block.body.ensure(loader).await?;
        if filled_now {
            self.block_dispatcher.fire(block);
        }
        Ok(body)
    }

    pub fn cached_block_by_root(&self, root: &Root) -> Option<Arc<Block>> {
        self.indices.read().expect("index lock poisoned").by_root.get(root).cloned()
    }

    pub fn cached_blocks_by_slot(&self, slot: Slot) -> Vec<Arc<Block>> {
        self.indices
            .read()
            .expect("index lock poisoned")
            .by_slot
            .get(&slot)
            .cloned()
            .unwrap_or_default()
    }

    /// All cached blocks, ordered by descending slot; blocks within one slot
    /// keep insertion order.
    pub fn cached_blocks(&self) -> Vec<Arc<Block>> {
        let indices = self.indices.read().expect("index lock poisoned");
        indices.by_slot.values().rev().flat_map(|blocks| blocks.iter().cloned()).collect()
    }

    pub fn max_slot_seen(&self) -> Slot {
        self.indices.read().expect("index lock poisoned").max_slot_seen
    }

    /// Ancestry distance from `ancestor_root` up to `descendant_root`.
    ///
    /// Walks parent pointers from the descendant towards genesis. `None`
    /// when the two are not linked, or when linkage is undecidable with
    /// current cache contents (an ancestor header missing or evicted).
    pub fn block_distance(&self, ancestor_root: &Root, descendant_root: &Root) -> Option<u64> {
        if ancestor_root == descendant_root {
            return Some(0);
        }
        let indices = self.indices.read().expect("index lock poisoned");
        let ancestor_slot = indices.by_root.get(ancestor_root)?.slot();
        let mut current = indices.by_root.get(descendant_root)?.clone();
        let mut distance = 0u64;
        loop {
            if current.root() == *ancestor_root {
                return Some(distance);
            }
            if current.slot() <= ancestor_slot {
                // Walked down to the ancestor's slot without meeting it
                return None;
            }
            let parent = current.parent_root()?;
            current = indices.by_root.get(&parent)?.clone();
            distance += 1;
        }
    }

    /// True if `ancestor_root` is on the chain ending at `descendant_root`.
    pub fn is_canonical(&self, ancestor_root: &Root, descendant_root: &Root) -> bool {
        self.block_distance(ancestor_root, descendant_root).is_some()
    }

    /// Store the genesis record, or validate it against the one already
    /// stored. A mismatch identifies a client on the wrong network.
    pub fn set_genesis(&self, reported: &Genesis) -> Result<(), ChainDataError> {
        let mut genesis = self.genesis.write().expect("genesis lock poisoned");
        match genesis.as_ref() {
            Some(existing) if existing == reported => Ok(()),
            Some(_) => Err(ChainDataError::GenesisMismatch),
            None => {
                *genesis = Some(reported.clone());
                Ok(())
            }
        }
    }

    pub fn set_specs(&self, reported: &ChainSpecs) -> Result<(), ChainDataError> {
        reported.validate()?;
        let mut specs = self.specs.write().expect("specs lock poisoned");
        match specs.as_ref() {
            Some(existing) if existing == reported => Ok(()),
            Some(_) => Err(ChainDataError::SpecsMismatch),
            None => {
                *specs = Some(reported.clone());
                Ok(())
            }
        }
    }

    pub fn genesis(&self) -> Option<Genesis> {
        self.genesis.read().expect("genesis lock poisoned").clone()
    }

    pub fn specs(&self) -> Option<ChainSpecs> {
        self.specs.read().expect("specs lock poisoned").clone()
    }

    /// Record a finality checkpoint. Lower-or-equal epochs are ignored.
    /// Returns whether the checkpoint advanced.
    pub fn set_finalized_checkpoint(&self, checkpoint: Checkpoint) -> bool {
        {
            let mut finalized = self.finalized.write().expect("finalized lock poisoned");
            match finalized.as_ref() {
                Some(current) if checkpoint.epoch <= current.epoch => return false,
                _ => *finalized = Some(checkpoint),
            }
        }
        self.finalized_dispatcher.fire(&checkpoint);
        true
    }

    pub fn finalized_checkpoint(&self) -> Option<Checkpoint> {
        *self.finalized.read().expect("finalized lock poisoned")
    }

    /// Wallclock derived from genesis time and slot duration, once both
    /// genesis and specs are known.
    pub fn slot_clock(&self) -> Option<SlotClock> {
        let genesis = self.genesis.read().expect("genesis lock poisoned");
        let specs = self.specs.read().expect("specs lock poisoned");
        Some(SlotClock::from_chain_data(genesis.as_ref()?, specs.as_ref()?))
    }

    pub fn subscribe_block_event(&self, capacity: usize) -> Subscription<Arc<Block>> {
        self.block_dispatcher.subscribe(capacity)
    }

    pub fn subscribe_finalized_event(&self, capacity: usize) -> Subscription<Checkpoint> {
        self.finalized_dispatcher.subscribe(capacity)
    }

    pub fn subscribe_wallclock_slot_event(&self, capacity: usize) -> Subscription<Slot> {
        self.wallclock_slot_dispatcher.subscribe(capacity)
    }

    pub fn subscribe_wallclock_epoch_event(&self, capacity: usize) -> Subscription<Epoch> {
        self.wallclock_epoch_dispatcher.subscribe(capacity)
    }

    /// Evict every block whose slot is below the retention floor, from both
    /// indices atomically with respect to readers. Callers already holding
    /// a block reference can finish their lookups on it.
    pub fn run_cleanup(&self) {
        let mut indices = self.indices.write().expect("index lock poisoned");
        let floor = indices.retention_floor(self.follow_distance);
        if floor == 0 {
            return;
        }
        let keep = indices.by_slot.split_off(&floor);
        let stale = std::mem::replace(&mut indices.by_slot, keep);
        let mut removed = 0usize;
        for blocks in stale.into_values() {
            for block in blocks {
                indices.by_root.remove(&block.root());
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, floor, "evicted blocks below retention floor");
        }
    }

    async fn run_wallclock(&self, shutdown: &mut watch::Receiver<bool>) {
        // Chain data arrives with the first successful client bootstrap
        let clock = loop {
            if *shutdown.borrow() {
                return;
            }
            if let Some(clock) = self.slot_clock() {
                break clock;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        };

        loop {
            let next = match clock.current_slot() {
                Some(current) => current + 1,
                None => 0,
            };
            let wait = clock.duration_until_slot(next);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    self.wallclock_slot_dispatcher.fire(&next);
                    let epoch = clock.epoch_of(next);
                    if clock.epoch_start_slot(epoch) == next {
                        self.wallclock_epoch_dispatcher.fire(&epoch);
                    }
                }
            }
        }
    }
}
