//! The opaque RPC capability a pool drives each endpoint through.
//!
//! The wire transport (REST+SSE, JSON-RPC, gRPC) is the integration's
//! concern; the pool only sees this trait. Execution-style transports map
//! block hashes onto roots and block numbers onto slots before reporting,
//! and additionally expose the account/transaction surface via
//! [`RpcClient::execution`].

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use argus_common::{Address, ChainSpecs, Checkpoint, Genesis, NodeVersion, Root, Slot, SyncState, TxHash};

/// Header fields the block cache needs for ancestry walks.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub slot: Slot,
    pub parent_root: Root,
    pub state_root: Root,
}

/// Push notification from an endpoint's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Head { slot: Slot, root: Root },
    FinalizedCheckpoint(Checkpoint),
}

/// Receipt of an included transaction, as reported by an execution endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransactionReceipt {
    pub tx_hash: TxHash,
    pub block_root: Root,
    pub block_slot: Slot,
    pub success: bool,
}

/// One connection to one node endpoint.
///
/// All methods may fail transiently; the owning client's supervision loop
/// treats any error as a connection failure and retries with backoff.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// One-time connection setup (dial, auth handshake).
    async fn initialize(&self) -> Result<()>;

    async fn node_version(&self) -> Result<NodeVersion>;

    async fn genesis(&self) -> Result<Genesis>;

    async fn chain_specs(&self) -> Result<ChainSpecs>;

    async fn sync_status(&self) -> Result<SyncState>;

    async fn latest_head(&self) -> Result<(Slot, Root)>;

    async fn finality_checkpoint(&self) -> Result<Checkpoint>;

    /// `None` when the endpoint does not know the block.
    async fn block_header_by_root(&self, root: Root) -> Result<Option<BlockHeader>>;

    /// `None` when the endpoint does not know the block.
    async fn block_body_by_root(&self, root: Root) -> Result<Option<Bytes>>;

    /// Open the streaming head/finality subscription. The stream ending is
    /// treated as a disconnect.
    async fn subscribe_events(&self) -> Result<mpsc::Receiver<NodeEvent>>;

    /// Account/transaction capability, present on execution transports.
    fn execution(&self) -> Option<&dyn ExecutionApi> {
        None
    }
}

/// Account and transaction operations offered by execution endpoints.
#[async_trait]
pub trait ExecutionApi: Send + Sync {
    /// Number of confirmed transactions from this account (the next unused
    /// nonce).
    async fn account_nonce(&self, address: Address) -> Result<u64>;

    async fn account_balance(&self, address: Address) -> Result<u128>;

    async fn send_transaction(&self, raw: Bytes) -> Result<TxHash>;

    /// `None` while the transaction is not yet included.
    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>>;
}
