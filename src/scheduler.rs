//! Periodic runners for pool maintenance and block catch-up.
//!
//! Store and node calls block, so each tick hands its work to the blocking pool.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::task::{self, JoinHandle};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::error::Error;
use crate::node::NodeClient;
use crate::pool::UtxoPoolManager;
use crate::sync::BlockSyncer;

pub fn spawn_pool_maintenance(
    manager: Arc<UtxoPoolManager>,
    period: Duration,
    mut shutdown_rx: Receiver<()>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut timer = interval(period);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("pool maintenance received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    let manager = manager.clone();
                    let run = task::spawn_blocking(move || {
                        let txid = manager.manage_utxo_pool()?;
                        let report = manager.status()?;
                        Ok::<_, Error>((txid, report))
                    });
                    match run.await {
                        Ok(Ok((txid, report))) => info!(
                            txid = ?txid,
                            status = %report.status,
                            size = report.current_size,
                            target = report.target_size,
                            "utxo pool checked"
                        ),
                        Ok(Err(e)) => warn!(error = %e, "pool maintenance failed"),
                        Err(e) => error!(error = %e, "pool maintenance task aborted"),
                    }
                }
            }
        }
    })
}

pub fn spawn_block_sync(
    syncer: Arc<BlockSyncer>,
    node: Arc<dyn NodeClient>,
    period: Duration,
    mut shutdown_rx: Receiver<()>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut timer = interval(period);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("block sync received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    let syncer = syncer.clone();
                    let node = node.clone();
                    match task::spawn_blocking(move || syncer.catch_up(node.as_ref())).await {
                        Ok(Ok(applied)) if applied.is_empty() => debug!("no new blocks"),
                        Ok(Ok(applied)) => info!(blocks = applied.len(), "blocks synced"),
                        Ok(Err(e)) => warn!(error = %e, "block sync failed"),
                        Err(e) => error!(error = %e, "block sync task aborted"),
                    }
                }
            }
        }
    })
}

/// Starts both runners with the configured periods.
pub fn spawn_all(
    cfg: &config::Scheduler,
    manager: Arc<UtxoPoolManager>,
    syncer: Arc<BlockSyncer>,
    node: Arc<dyn NodeClient>,
    shutdown_rx: &Receiver<()>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_pool_maintenance(manager, Duration::from_secs(cfg.pool_interval_secs), shutdown_rx.resubscribe()),
        spawn_block_sync(syncer, node, Duration::from_secs(cfg.block_interval_secs), shutdown_rx.resubscribe()),
    ]
}
