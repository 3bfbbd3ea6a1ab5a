//! Wallet nonce coordination against a scripted execution endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;

use argus_common::{Address, ClientKind, TxHash};
use argus_module_client_pool::{ClientPool, EndpointConfig, PoolConfig, TransactionReceipt};
use argus_module_wallet::{
    SignedTransaction, TransactionRequest, TransactionSigner, Wallet, WalletError,
};
use argus_test_utils::{address, root, wait_until, MockRpc};

struct TestSigner {
    address: Address,
}

impl TransactionSigner for TestSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign(&self, request: &TransactionRequest) -> Result<SignedTransaction> {
        let mut digest = [0u8; 32];
        digest[..8].copy_from_slice(&request.nonce.to_le_bytes());
        digest[8..28].copy_from_slice(request.from.as_ref());
        Ok(SignedTransaction {
            hash: TxHash::new(digest),
            from: request.from,
            nonce: request.nonce,
            raw: request.payload.clone(),
        })
    }
}

async fn ready_pool() -> (Arc<ClientPool>, Arc<MockRpc>) {
    let pool = ClientPool::new(PoolConfig::named("execution"));
    let rpc = Arc::new(MockRpc::new());
    pool.add_endpoint(
        EndpointConfig {
            name: "exec-0".to_string(),
            url: "http://exec-0.local".to_string(),
            kind: ClientKind::new("mock"),
            auth_header: None,
        },
        rpc.clone(),
    );
    let ready = wait_until(
        || pool.get_ready_endpoint(None).is_some(),
        Duration::from_secs(5),
    )
    .await;
    assert!(ready, "execution endpoint never became ready");
    (pool, rpc)
}

async fn ready_wallet(pool: &Arc<ClientPool>, owner: Address) -> Wallet {
    let wallet = Wallet::new(pool.clone(), Arc::new(TestSigner { address: owner }));
    tokio::time::timeout(Duration::from_secs(5), wallet.await_ready())
        .await
        .expect("wallet never loaded its state");
    wallet
}

fn build_payload(nonce: u64) -> Bytes {
    Bytes::from(format!("payload-{nonce}"))
}

/// Fire one block event through the pool's cache so the nonce watcher
/// re-reads the on-chain nonce.
async fn fire_block_event(pool: &Arc<ClientPool>, marker: u8) {
    let cache = pool.block_cache();
    if let Some((block, _)) = cache.add_block(root(marker), marker as u64 + 100) {
        let _ = cache.ensure_body(&block, || async { Ok(Bytes::from_static(b"tick")) }).await;
    }
}

#[tokio::test]
async fn initial_state_loads_from_chain() {
    let (pool, rpc) = ready_pool().await;
    let owner = address(0x11);
    rpc.set_account_nonce(owner, 7);
    rpc.set_balance(owner, 1_000_000);

    let wallet = ready_wallet(&pool, owner).await;
    assert_eq!(wallet.address(), owner);
    assert_eq!(wallet.nonce(), 7);
    assert_eq!(wallet.balance(), 1_000_000);

    let tx = wallet
        .build_transaction(|nonce, signer| {
            signer.sign(&TransactionRequest {
                from: owner,
                nonce,
                payload: build_payload(nonce),
            })
        })
        .await
        .unwrap();
    assert_eq!(tx.nonce, 7);
}

#[tokio::test]
async fn concurrent_builders_get_contiguous_nonces() {
    let (pool, _rpc) = ready_pool().await;
    let owner = address(0x22);
    let wallet = ready_wallet(&pool, owner).await;

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let wallet = wallet.clone();
        tasks.push(tokio::spawn(async move {
            wallet
                .build_transaction(|nonce, signer| {
                    signer.sign(&TransactionRequest {
                        from: owner,
                        nonce,
                        payload: build_payload(nonce),
                    })
                })
                .await
                .unwrap()
                .nonce
        }));
    }

    let mut nonces = Vec::new();
    for task in tasks {
        nonces.push(task.await.unwrap());
    }
    nonces.sort_unstable();
    let expected: Vec<u64> = (0..50).collect();
    assert_eq!(nonces, expected);
    assert_eq!(wallet.nonce(), 50);
}

#[tokio::test]
async fn failed_build_does_not_consume_the_nonce() {
    let (pool, _rpc) = ready_pool().await;
    let owner = address(0x33);
    let wallet = ready_wallet(&pool, owner).await;

    let failed: Result<SignedTransaction, WalletError> = wallet
        .build_transaction(|_nonce, _signer| {
            Err(WalletError::Build(anyhow::anyhow!("gas estimation failed")))
        })
        .await;
    assert!(failed.is_err());

    let tx = wallet
        .build_transaction(|nonce, signer| {
            signer.sign(&TransactionRequest {
                from: owner,
                nonce,
                payload: build_payload(nonce),
            })
        })
        .await
        .unwrap();
    assert_eq!(tx.nonce, 0);
}

#[tokio::test]
async fn signing_for_a_foreign_address_is_rejected() {
    let (pool, _rpc) = ready_pool().await;
    let owner = address(0x44);
    let wallet = ready_wallet(&pool, owner).await;

    let result = wallet
        .build_transaction(|nonce, signer| {
            signer.sign(&TransactionRequest {
                from: address(0x99),
                nonce,
                payload: build_payload(nonce),
            })
        })
        .await;
    assert!(matches!(result, Err(WalletError::ForeignAddress { .. })));
    // The nonce was not consumed
    assert_eq!(wallet.nonce(), 0);
}

#[tokio::test]
async fn await_transaction_completes_on_confirmation() {
    let (pool, rpc) = ready_pool().await;
    let owner = address(0x55);
    let wallet = ready_wallet(&pool, owner).await;

    let tx = wallet
        .build_transaction(|nonce, signer| {
            signer.sign(&TransactionRequest {
                from: owner,
                nonce,
                payload: build_payload(nonce),
            })
        })
        .await
        .unwrap();
    let receipt = TransactionReceipt {
        tx_hash: tx.hash,
        block_root: root(0x60),
        block_slot: 105,
        success: true,
    };
    rpc.put_receipt(receipt);

    let waiter = {
        let wallet = wallet.clone();
        let tx = tx.clone();
        tokio::spawn(async move { wallet.await_transaction(&tx).await })
    };

    // Confirm the nonce on chain, then keep producing blocks until the
    // watcher notices
    rpc.set_account_nonce(owner, 1);
    let mut marker = 0u8;
    while !waiter.is_finished() {
        fire_block_event(&pool, marker).await;
        marker = marker.checked_add(1).expect("confirmation never observed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let fetched = waiter.await.unwrap().unwrap().expect("receipt should be known");
    assert_eq!(fetched, receipt);
}

#[tokio::test]
async fn already_confirmed_transaction_returns_immediately() {
    let (pool, rpc) = ready_pool().await;
    let owner = address(0x66);
    rpc.set_account_nonce(owner, 5);
    let wallet = ready_wallet(&pool, owner).await;

    // A transaction from an earlier session, already confirmed on chain
    let tx = SignedTransaction {
        hash: TxHash::new([3u8; 32]),
        from: owner,
        nonce: 3,
        raw: Bytes::from_static(b"old"),
    };
    let receipt = TransactionReceipt {
        tx_hash: tx.hash,
        block_root: root(0x61),
        block_slot: 80,
        success: true,
    };
    rpc.put_receipt(receipt);

    let fetched = tokio::time::timeout(Duration::from_secs(1), wallet.await_transaction(&tx))
        .await
        .expect("await_transaction should not block")
        .unwrap();
    assert_eq!(fetched, Some(receipt));
}

#[tokio::test]
async fn refresh_state_picks_up_chain_changes() {
    let (pool, rpc) = ready_pool().await;
    let owner = address(0x77);
    let wallet = ready_wallet(&pool, owner).await;
    assert_eq!(wallet.balance(), 0);

    rpc.set_balance(owner, 42);
    rpc.set_account_nonce(owner, 2);
    wallet.refresh_state().await.unwrap();
    assert_eq!(wallet.balance(), 42);
    assert_eq!(wallet.nonce(), 2);
}
