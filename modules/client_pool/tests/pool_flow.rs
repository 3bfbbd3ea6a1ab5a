//! End-to-end pool behavior against scripted endpoints.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use argus_common::{Checkpoint, ClientKind, Root};
use argus_module_client_pool::{
    BlockHeader, ClientPool, ClientStatus, EndpointConfig, PoolConfig,
};
use argus_test_utils::{root, wait_until, MockRpc};

fn endpoint(name: &str) -> EndpointConfig {
    EndpointConfig {
        name: name.to_string(),
        url: format!("http://{name}.local"),
        kind: ClientKind::new("mock"),
        auth_header: None,
    }
}

fn header(slot: u64, parent: Root) -> BlockHeader {
    BlockHeader {
        slot,
        parent_root: parent,
        state_root: Root::default(),
    }
}

async fn pool_with_endpoints(count: usize) -> (Arc<ClientPool>, Vec<Arc<MockRpc>>) {
    let pool = ClientPool::new(PoolConfig::named("consensus"));
    let mut rpcs = Vec::new();
    for i in 0..count {
        let rpc = Arc::new(MockRpc::new());
        pool.add_endpoint(endpoint(&format!("node-{i}")), rpc.clone());
        rpcs.push(rpc);
    }
    let ready = wait_until(
        || {
            pool.get_all_endpoints()
                .iter()
                .all(|client| client.status() == ClientStatus::Healthy)
                && pool.get_ready_endpoint(None).is_some()
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(ready, "endpoints never became ready");
    (pool, rpcs)
}

#[tokio::test]
async fn pool_follows_streamed_heads() {
    let (pool, rpcs) = pool_with_endpoints(2).await;
    let cache = pool.block_cache().clone();
    let mut block_events = cache.subscribe_block_event(8);

    for rpc in &rpcs {
        rpc.put_block(root(2), header(2, root(1)), Bytes::from_static(b"block-2"));
    }
    for rpc in &rpcs {
        rpc.push_head(2, root(2)).await;
    }

    let seen = wait_until(
        || {
            cache
                .cached_block_by_root(&root(2))
                .is_some_and(|block| block.body().is_some() && block.seen_by().len() == 2)
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(seen, "streamed block never landed in the cache");

    let block = cache.cached_block_by_root(&root(2)).unwrap();
    let seen_by: Vec<u16> = block.seen_by().iter().map(|client| client.index()).collect();
    assert_eq!(seen_by, vec![0, 1]);
    assert_eq!(block.body().unwrap(), Bytes::from_static(b"block-2"));

    // The pool-wide block event fired exactly once for the body attach
    let event = tokio::time::timeout(Duration::from_secs(1), block_events.recv())
        .await
        .expect("no block event")
        .unwrap();
    assert_eq!(event.root(), root(2));

    let fork = pool.get_canonical_fork(2).expect("a canonical fork");
    assert_eq!(fork.root, root(2));
    assert_eq!(fork.ready_clients.len(), 2);

    // Round robin alternates between the two ready endpoints
    let first = pool.get_ready_endpoint(None).unwrap().index();
    let second = pool.get_ready_endpoint(None).unwrap().index();
    let third = pool.get_ready_endpoint(None).unwrap().index();
    assert_ne!(first, second);
    assert_eq!(first, third);
}

#[tokio::test]
async fn unreachable_endpoint_goes_offline() {
    let pool = ClientPool::new(PoolConfig::named("consensus"));
    let rpc = Arc::new(MockRpc::new());
    rpc.set_fail_connect(true);
    let client = pool.add_endpoint(endpoint("down-1"), rpc);

    let offline = wait_until(
        || client.status() == ClientStatus::Offline,
        Duration::from_secs(5),
    )
    .await;
    assert!(offline, "client never went offline");
    assert!(client.last_error().unwrap().contains("connection refused"));
    assert!(pool.get_ready_endpoint(None).is_none());
}

#[tokio::test]
async fn wrong_network_endpoint_is_kept_out() {
    let (pool, _rpcs) = pool_with_endpoints(1).await;

    let rogue = Arc::new(MockRpc::new());
    let mut genesis = argus_test_utils::devnet_genesis();
    genesis.network_name = "other-net".to_string();
    rogue.set_genesis(genesis);
    let client = pool.add_endpoint(endpoint("rogue-1"), rogue);

    let offline = wait_until(
        || client.status() == ClientStatus::Offline,
        Duration::from_secs(5),
    )
    .await;
    assert!(offline, "mismatched client never went offline");
    assert!(client.last_error().unwrap().contains("genesis"));

    // The established chain data is untouched
    assert_eq!(
        pool.block_cache().genesis().unwrap().network_name,
        argus_test_utils::devnet_genesis().network_name
    );
    // And the healthy endpoint still schedules
    assert_eq!(pool.get_ready_endpoint(None).unwrap().index(), 0);
}

#[tokio::test]
async fn finality_checkpoints_propagate_monotonically() {
    let (pool, rpcs) = pool_with_endpoints(1).await;
    let cache = pool.block_cache().clone();
    let mut finalized_events = cache.subscribe_finalized_event(8);

    rpcs[0].push_finality(Checkpoint { epoch: 3, root: root(7) }).await;
    let landed = wait_until(
        || cache.finalized_checkpoint().is_some_and(|cp| cp.epoch == 3),
        Duration::from_secs(5),
    )
    .await;
    assert!(landed, "finality checkpoint never propagated");

    let event = tokio::time::timeout(Duration::from_secs(1), finalized_events.recv())
        .await
        .expect("no finalized event")
        .unwrap();
    assert_eq!(event.epoch, 3);

    // An older checkpoint from the stream is ignored
    rpcs[0].push_finality(Checkpoint { epoch: 2, root: root(8) }).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cache.finalized_checkpoint().unwrap().epoch, 3);
}

#[tokio::test]
async fn closed_event_stream_marks_endpoint_offline() {
    let (pool, rpcs) = pool_with_endpoints(1).await;
    let client = pool.get_all_endpoints()[0].clone();
    assert_eq!(client.status(), ClientStatus::Healthy);

    rpcs[0].drop_event_streams();
    let offline = wait_until(
        || client.status() == ClientStatus::Offline,
        Duration::from_secs(5),
    )
    .await;
    assert!(offline, "client never noticed the dropped stream");
    assert!(!pool.is_client_ready(&client));
}

#[tokio::test]
async fn diverging_endpoints_form_ranked_forks() {
    let (pool, rpcs) = pool_with_endpoints(3).await;

    // Two endpoints advance along one chain, the third reports an
    // unrelated head
    for rpc in &rpcs[..2] {
        rpc.put_block(root(2), header(2, root(1)), Bytes::from_static(b"a"));
    }
    rpcs[2].put_block(root(9), header(2, root(8)), Bytes::from_static(b"b"));

    rpcs[0].push_head(2, root(2)).await;
    rpcs[1].push_head(2, root(2)).await;
    rpcs[2].push_head(2, root(9)).await;

    let settled = wait_until(
        || {
            let forks = pool.get_head_forks(2);
            forks.len() == 2 && forks[0].ready_clients.len() == 2
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(settled, "fork view never settled");

    let forks = pool.get_head_forks(2);
    assert_eq!(forks[0].root, root(2));
    assert_eq!(forks[1].root, root(9));
    // Scheduling only draws from the canonical fork
    for _ in 0..4 {
        let chosen = pool.get_ready_endpoint(None).unwrap();
        assert!(chosen.index() < 2);
    }
}

#[tokio::test]
async fn wallclock_ticks_fire_after_chain_data_arrives() {
    let pool = ClientPool::new(PoolConfig::named("consensus"));
    let mut slot_events = pool.block_cache().subscribe_wallclock_slot_event(8);

    let rpc = Arc::new(MockRpc::new());
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let mut genesis = argus_test_utils::devnet_genesis();
    genesis.genesis_time = now.saturating_sub(100);
    rpc.set_genesis(genesis);
    let mut specs = argus_test_utils::devnet_specs();
    specs.seconds_per_slot = 1;
    rpc.set_specs(specs);
    pool.add_endpoint(endpoint("node-0"), rpc);

    let tick = tokio::time::timeout(Duration::from_secs(5), slot_events.recv()).await;
    let slot = tick.expect("no wallclock tick").unwrap();
    assert!(slot >= 100);
}
