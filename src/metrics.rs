use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::warn;

// Metric names are compile-time constants, so construction cannot fail at runtime.
fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("static counter definition")
}

pub static BUILT_TRANSACTIONS: Lazy<IntCounter> =
    Lazy::new(|| counter("colorledger_built_transactions_total", "Transactions assembled by the builder"));
pub static BROADCASTS: Lazy<IntCounter> =
    Lazy::new(|| counter("colorledger_broadcasts_total", "Transactions accepted by the node"));
pub static BROADCAST_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| counter("colorledger_broadcast_failures_total", "Broadcasts rejected or failed"));
pub static SYNCED_BLOCKS: Lazy<IntCounter> =
    Lazy::new(|| counter("colorledger_synced_blocks_total", "Blocks applied by the block syncer"));
pub static CONFIRMED_TXS: Lazy<IntCounter> =
    Lazy::new(|| counter("colorledger_confirmed_transactions_total", "Pending transactions confirmed by a block"));
pub static POOL_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("colorledger_utxo_pool_size", "Finalized outputs in the sponsor pool").expect("static gauge definition")
});

fn register(registry: &Registry, collector: Box<dyn Collector>) {
    if let Err(e) = registry.register(collector) {
        warn!(error = %e, "metric registration failed");
    }
}

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    for counter in [&BUILT_TRANSACTIONS, &BROADCASTS, &BROADCAST_FAILURES, &SYNCED_BLOCKS, &CONFIRMED_TXS] {
        register(&registry, Box::new(IntCounter::clone(counter)));
    }
    register(&registry, Box::new(IntGauge::clone(&POOL_SIZE)));
    registry
});

/// Renders every metric in the text exposition format.
pub fn encode() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
