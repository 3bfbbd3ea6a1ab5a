//! Test helpers for Argus modules: a scripted RPC endpoint and small
//! constructors shared by the module crates' tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use argus_common::{
    Address, ChainSpecs, Checkpoint, Genesis, NodeVersion, Root, Slot, SyncState, TxHash,
};
use argus_module_client_pool::{
    BlockHeader, ExecutionApi, NodeEvent, RpcClient, TransactionReceipt,
};

/// Root with a recognizable first byte.
pub fn root(n: u8) -> Root {
    let mut bytes = [0u8; 32];
    bytes[0] = n;
    Root::new(bytes)
}

/// Address with a recognizable first byte.
pub fn address(n: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[0] = n;
    Address::new(bytes)
}

pub fn devnet_genesis() -> Genesis {
    Genesis {
        genesis_time: 1_600_000_000,
        genesis_root: root(0xaa),
        network_name: "mocknet".to_string(),
    }
}

pub fn devnet_specs() -> ChainSpecs {
    ChainSpecs {
        network_id: 1337,
        seconds_per_slot: 12,
        slots_per_epoch: 32,
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Scripted in-memory endpoint implementing both the chain-following and
/// the account/transaction capabilities.
pub struct MockRpc {
    version: NodeVersion,
    genesis: Mutex<Genesis>,
    specs: Mutex<ChainSpecs>,
    sync: Mutex<SyncState>,
    head: Mutex<(Slot, Root)>,
    finality: Mutex<Checkpoint>,
    headers: Mutex<HashMap<Root, BlockHeader>>,
    bodies: Mutex<HashMap<Root, Bytes>>,
    event_streams: Mutex<Vec<mpsc::Sender<NodeEvent>>>,
    fail_connect: AtomicBool,
    header_loads: AtomicUsize,
    body_loads: AtomicUsize,

    nonces: Mutex<HashMap<Address, u64>>,
    balances: Mutex<HashMap<Address, u128>>,
    receipts: Mutex<HashMap<TxHash, TransactionReceipt>>,
    sent: Mutex<Vec<Bytes>>,
}

impl Default for MockRpc {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRpc {
    pub fn new() -> Self {
        Self {
            version: NodeVersion("mock/v1.0.0".to_string()),
            genesis: Mutex::new(devnet_genesis()),
            specs: Mutex::new(devnet_specs()),
            sync: Mutex::new(SyncState::default()),
            head: Mutex::new((1, root(1))),
            finality: Mutex::new(Checkpoint::default()),
            headers: Mutex::new(HashMap::new()),
            bodies: Mutex::new(HashMap::new()),
            event_streams: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            header_loads: AtomicUsize::new(0),
            body_loads: AtomicUsize::new(0),
            nonces: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_genesis(&self, genesis: Genesis) {
        *self.genesis.lock().unwrap() = genesis;
    }

    pub fn set_specs(&self, specs: ChainSpecs) {
        *self.specs.lock().unwrap() = specs;
    }

    pub fn set_sync(&self, sync: SyncState) {
        *self.sync.lock().unwrap() = sync;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make a block known to this endpoint.
    pub fn put_block(&self, root: Root, header: BlockHeader, body: Bytes) {
        self.headers.lock().unwrap().insert(root, header);
        self.bodies.lock().unwrap().insert(root, body);
    }

    /// Update the reported head without emitting a stream event; the next
    /// `latest_head` poll sees it.
    pub fn set_head(&self, slot: Slot, root: Root) {
        *self.head.lock().unwrap() = (slot, root);
    }

    /// Update the reported head and push it to every open event stream.
    pub async fn push_head(&self, slot: Slot, root: Root) {
        self.set_head(slot, root);
        let streams = self.event_streams.lock().unwrap().clone();
        for stream in streams {
            let _ = stream.send(NodeEvent::Head { slot, root }).await;
        }
    }

    pub async fn push_finality(&self, checkpoint: Checkpoint) {
        *self.finality.lock().unwrap() = checkpoint;
        let streams = self.event_streams.lock().unwrap().clone();
        for stream in streams {
            let _ = stream.send(NodeEvent::FinalizedCheckpoint(checkpoint)).await;
        }
    }

    /// Close all open event streams, simulating a stream stall/disconnect.
    pub fn drop_event_streams(&self) {
        self.event_streams.lock().unwrap().clear();
    }

    pub fn header_loads(&self) -> usize {
        self.header_loads.load(Ordering::SeqCst)
    }

    pub fn body_loads(&self) -> usize {
        self.body_loads.load(Ordering::SeqCst)
    }

    pub fn set_account_nonce(&self, address: Address, nonce: u64) {
        self.nonces.lock().unwrap().insert(address, nonce);
    }

    pub fn set_balance(&self, address: Address, balance: u128) {
        self.balances.lock().unwrap().insert(address, balance);
    }

    pub fn put_receipt(&self, receipt: TransactionReceipt) {
        self.receipts.lock().unwrap().insert(receipt.tx_hash, receipt);
    }

    pub fn sent_transactions(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl RpcClient for MockRpc {
    async fn initialize(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(())
    }

    async fn node_version(&self) -> Result<NodeVersion> {
        Ok(self.version.clone())
    }

    async fn genesis(&self) -> Result<Genesis> {
        Ok(self.genesis.lock().unwrap().clone())
    }

    async fn chain_specs(&self) -> Result<ChainSpecs> {
        Ok(self.specs.lock().unwrap().clone())
    }

    async fn sync_status(&self) -> Result<SyncState> {
        Ok(*self.sync.lock().unwrap())
    }

    async fn latest_head(&self) -> Result<(Slot, Root)> {
        Ok(*self.head.lock().unwrap())
    }

    async fn finality_checkpoint(&self) -> Result<Checkpoint> {
        Ok(*self.finality.lock().unwrap())
    }

    async fn block_header_by_root(&self, root: Root) -> Result<Option<BlockHeader>> {
        self.header_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.headers.lock().unwrap().get(&root).cloned())
    }

    async fn block_body_by_root(&self, root: Root) -> Result<Option<Bytes>> {
        self.body_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.bodies.lock().unwrap().get(&root).cloned())
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<NodeEvent>> {
        let (tx, rx) = mpsc::channel(64);
        self.event_streams.lock().unwrap().push(tx);
        Ok(rx)
    }

    fn execution(&self) -> Option<&dyn ExecutionApi> {
        Some(self)
    }
}

#[async_trait]
impl ExecutionApi for MockRpc {
    async fn account_nonce(&self, address: Address) -> Result<u64> {
        Ok(self.nonces.lock().unwrap().get(&address).copied().unwrap_or(0))
    }

    async fn account_balance(&self, address: Address) -> Result<u128> {
        Ok(self.balances.lock().unwrap().get(&address).copied().unwrap_or(0))
    }

    async fn send_transaction(&self, raw: Bytes) -> Result<TxHash> {
        let mut digest = [0u8; 32];
        for (i, byte) in raw.iter().enumerate() {
            digest[i % 32] ^= byte;
        }
        self.sent.lock().unwrap().push(raw);
        Ok(TxHash::new(digest))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>> {
        Ok(self.receipts.lock().unwrap().get(&hash).copied())
    }
}
