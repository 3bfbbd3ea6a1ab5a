//! Per-account transaction coordinator for execution pools.
//!
//! A wallet serializes nonce allocation across concurrent transaction
//! builders, tracks the confirmed on-chain nonce through the pool's block
//! events, and lets callers await confirmation of a specific transaction
//! without polling. One wallet per (pool, address).

pub mod signer;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use argus_common::{Address, Signal};
use argus_module_client_pool::{Client, ClientPool, TransactionReceipt};

pub use crate::signer::{SignedTransaction, TransactionRequest, TransactionSigner, WalletSigner};

const INITIAL_LOAD_RETRY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("no ready client available")]
    NoClient,

    #[error("ready client offers no account api")]
    NoExecutionApi,

    #[error("cannot sign for {requested}, wallet owns {owned}")]
    ForeignAddress { requested: Address, owned: Address },

    #[error("transaction build failed: {0:#}")]
    Build(anyhow::Error),

    #[error("rpc failure: {0:#}")]
    Rpc(anyhow::Error),
}

#[derive(Debug, Default, Clone, Copy)]
struct WalletState {
    /// Next nonce to hand to a builder
    next_nonce: u64,

    /// On-chain transaction count (the next unused nonce on chain)
    confirmed_nonce: u64,

    balance: u128,
}

#[derive(Default)]
struct PendingWaits {
    /// Target nonce -> one-shot signal fired once that nonce is confirmed
    waits: BTreeMap<u64, Signal>,
    watcher_running: bool,
}

struct WalletInner {
    pool: Arc<ClientPool>,
    signer: Arc<dyn TransactionSigner>,
    address: Address,
    state: RwLock<WalletState>,
    ready: Signal,
    build_lock: tokio::sync::Mutex<()>,
    pending: Mutex<PendingWaits>,
}

/// Handle to one account's coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Wallet {
    inner: Arc<WalletInner>,
}

impl Wallet {
    /// Create a wallet and start loading its on-chain state from a ready
    /// client, retrying until one is available.
    pub fn new(pool: Arc<ClientPool>, signer: Arc<dyn TransactionSigner>) -> Self {
        let inner = Arc::new(WalletInner {
            address: signer.address(),
            pool,
            signer,
            state: RwLock::new(WalletState::default()),
            ready: Signal::new(),
            build_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(PendingWaits::default()),
        });

        let loader = inner.clone();
        tokio::spawn(async move {
            let mut shutdown = loader.pool.shutdown_signal();
            loop {
                match loader.load_state().await {
                    Ok(()) => {
                        loader.ready.fire();
                        return;
                    }
                    Err(err) => {
                        debug!(address = %loader.address, "initial wallet load failed: {err}")
                    }
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(INITIAL_LOAD_RETRY) => {}
                }
            }
        });

        Self { inner }
    }

    pub fn address(&self) -> Address {
        self.inner.address
    }

    /// Next nonce that will be handed to a builder.
    pub fn nonce(&self) -> u64 {
        self.inner.state.read().expect("wallet state lock poisoned").next_nonce
    }

    pub fn balance(&self) -> u128 {
        self.inner.state.read().expect("wallet state lock poisoned").balance
    }

    /// Wait until the initial state load has completed. Callers wanting a
    /// deadline wrap this in a timeout.
    pub async fn await_ready(&self) {
        self.inner.ready.wait().await
    }

    /// Re-read nonce and balance from a ready client.
    pub async fn refresh_state(&self) -> Result<(), WalletError> {
        self.inner.load_state().await
    }

    /// Build one transaction with the next nonce.
    ///
    /// Builders run one at a time; the nonce is allocated under the build
    /// lock and advanced only when the builder succeeds, so concurrent
    /// callers receive distinct, gap-free nonces in call order. The signer
    /// handle only signs for this wallet's address.
    pub async fn build_transaction<F>(&self, build: F) -> Result<SignedTransaction, WalletError>
    where
        F: FnOnce(u64, &WalletSigner<'_>) -> Result<SignedTransaction, WalletError>,
    {
        self.inner.ready.wait().await;
        let _guard = self.inner.build_lock.lock().await;

        let nonce = self.inner.state.read().expect("wallet state lock poisoned").next_nonce;
        let signer = WalletSigner::new(self.inner.address, self.inner.signer.as_ref());
        let tx = build(nonce, &signer)?;
        if tx.nonce != nonce {
            return Err(WalletError::Build(anyhow::anyhow!(
                "built transaction carries nonce {}, allocated {nonce}",
                tx.nonce
            )));
        }

        self.inner.state.write().expect("wallet state lock poisoned").next_nonce = nonce + 1;
        Ok(tx)
    }

    /// Wait until the chain has confirmed `tx`'s nonce, then fetch its
    /// receipt from a ready client. `None` when the nonce was consumed by a
    /// different transaction (replaced or dropped).
    pub async fn await_transaction(
        &self,
        tx: &SignedTransaction,
    ) -> Result<Option<TransactionReceipt>, WalletError> {
        let confirmed = self.confirmed_nonce();
        if confirmed <= tx.nonce {
            let signal = {
                let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
                let signal = pending.waits.entry(tx.nonce).or_insert_with(Signal::new).clone();
                if !pending.watcher_running {
                    pending.watcher_running = true;
                    tokio::spawn(run_watcher(self.inner.clone()));
                }
                signal
            };
            // A confirmation may have landed while the wait was registered
            if self.confirmed_nonce() > tx.nonce {
                self.inner.pending.lock().expect("pending lock poisoned").waits.remove(&tx.nonce);
                signal.fire();
            }
            signal.wait().await;
        }

        let client = self.ready_execution_client()?;
        let execution = client.execution().ok_or(WalletError::NoExecutionApi)?;
        execution.transaction_receipt(tx.hash).await.map_err(WalletError::Rpc)
    }

    fn ready_execution_client(&self) -> Result<Arc<Client>, WalletError> {
        self.inner.pool.get_ready_endpoint(None).ok_or(WalletError::NoClient)
    }

    fn confirmed_nonce(&self) -> u64 {
        self.inner.state.read().expect("wallet state lock poisoned").confirmed_nonce
    }
}

impl WalletInner {
    async fn load_state(&self) -> Result<(), WalletError> {
        let client = self.pool.get_ready_endpoint(None).ok_or(WalletError::NoClient)?;
        let execution = client.execution().ok_or(WalletError::NoExecutionApi)?;
        let (nonce, balance) = futures::try_join!(
            execution.account_nonce(self.address),
            execution.account_balance(self.address),
        )
        .map_err(WalletError::Rpc)?;

        let mut state = self.state.write().expect("wallet state lock poisoned");
        state.confirmed_nonce = nonce;
        state.next_nonce = state.next_nonce.max(nonce);
        state.balance = balance;
        debug!(address = %self.address, nonce, "wallet state loaded");
        Ok(())
    }

    /// Re-read the on-chain nonce and fire every wait it satisfies.
    async fn advance_confirmed(&self) -> Result<(), WalletError> {
        let client = self.pool.get_ready_endpoint(None).ok_or(WalletError::NoClient)?;
        let execution = client.execution().ok_or(WalletError::NoExecutionApi)?;
        let nonce = execution.account_nonce(self.address).await.map_err(WalletError::Rpc)?;

        let advanced = {
            let mut state = self.state.write().expect("wallet state lock poisoned");
            if nonce > state.confirmed_nonce {
                state.confirmed_nonce = nonce;
                state.next_nonce = state.next_nonce.max(nonce);
                true
            } else {
                false
            }
        };
        if advanced {
            let matured: Vec<Signal> = {
                let mut pending = self.pending.lock().expect("pending lock poisoned");
                let still_waiting = pending.waits.split_off(&nonce);
                let matured = std::mem::replace(&mut pending.waits, still_waiting);
                matured.into_values().collect()
            };
            for signal in matured {
                signal.fire();
            }
        }
        Ok(())
    }
}

/// Confirmation loop: started lazily with the first wait, exits once no
/// waits remain.
async fn run_watcher(inner: Arc<WalletInner>) {
    debug!(address = %inner.address, "nonce watcher started");
    let mut blocks = inner.pool.block_cache().subscribe_block_event(32);
    let mut shutdown = inner.pool.shutdown_signal();
    loop {
        {
            let mut pending = inner.pending.lock().expect("pending lock poisoned");
            if pending.waits.is_empty() {
                pending.watcher_running = false;
                break;
            }
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    inner.pending.lock().expect("pending lock poisoned").watcher_running = false;
                    return;
                }
            }
            block = blocks.recv() => {
                if block.is_none() {
                    inner.pending.lock().expect("pending lock poisoned").watcher_running = false;
                    return;
                }
                if let Err(err) = inner.advance_confirmed().await {
                    // Transient: no ready client right now, try on the next block
                    debug!(address = %inner.address, "nonce refresh failed: {err}");
                }
            }
        }
    }
    debug!(address = %inner.address, "nonce watcher idle, stopping");
}
