// Background runners: block catch-up and pool top-up on a timer, clean shutdown

mod common;

use colorledger::{fee::Fixed, scheduler, utxo::UtxoStatus};
use common::{TestEnv, SPONSOR};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

async fn wait_for(mut done: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !done() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_sync_runner_follows_the_tip() {
    let env = TestEnv::new();
    env.create_wallet("alice");
    env.node.mine(Vec::new());
    env.node.mine(Vec::new());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = scheduler::spawn_block_sync(
        Arc::new(env.block_syncer()),
        env.node.clone(),
        Duration::from_millis(20),
        shutdown_rx,
    );

    wait_for(|| env.store.sync_height().unwrap() == Some(2)).await;
    env.node.mine(Vec::new());
    wait_for(|| env.store.sync_height().unwrap() == Some(3)).await;

    shutdown_tx.send(()).unwrap();
    timeout(Duration::from_secs(5), handle).await.expect("Runner did not stop").unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_runner_tops_up_once_then_shuts_down() {
    let env = TestEnv::new();
    let sponsor = env.create_wallet(SPONSOR);
    env.fund(&sponsor, &[20_000]);
    let pool = env.pool(Arc::new(Fixed::new(100)), 1_000, 4);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = scheduler::spawn_pool_maintenance(pool, Duration::from_millis(20), shutdown_rx);

    wait_for(|| env.node.broadcast_count() == 1).await;
    // later ticks see the pending pool outputs and stay quiet
    sleep(Duration::from_millis(100)).await;
    assert_eq!(env.node.broadcast_count(), 1);

    shutdown_tx.send(()).unwrap();
    timeout(Duration::from_secs(5), handle).await.expect("Runner did not stop").unwrap();

    let pooled = env
        .utxos()
        .find_spendable(&sponsor, None, UtxoStatus::Unconfirmed)
        .unwrap()
        .filter(|u| u.as_ref().unwrap().value == 1_000)
        .count();
    assert_eq!(pooled, 4);
}
