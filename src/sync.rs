//! Reconciles the local store with what the chain has seen.
//!
//! [`TxSyncer`] runs when a transaction becomes visible (our own broadcast or a
//! transaction found in a block): spent inputs disappear and outputs paying our
//! keys appear as unconfirmed, in one batch. [`BlockSyncer`] runs per confirmed
//! block and promotes every pending record whose txid the block contains.
//! Both are replay-safe.

use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::node::NodeClient;
use crate::storage::{now_secs, Store, CF_PENDING_TX, CF_TIMESTAMP, CF_TIMESTAMP_BY_TXID, CF_TX};
use crate::timestamp::TimestampStatus;
use crate::tx::{Block, OutPoint, Transaction, Txid};
use crate::utxo::{Utxo, UtxoStatus};
use crate::utxo_store::UtxoStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Unconfirmed,
    Confirmed { height: u64, time: u64 },
}

/// A transaction that touched the wallet. Confirmed is terminal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub txid: Txid,
    pub status: TxStatus,
    pub first_seen: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxSyncOutcome {
    pub already_applied: bool,
    pub spent: Vec<OutPoint>,
    pub created: Vec<OutPoint>,
}

impl TxSyncOutcome {
    /// True when the transaction neither spent nor paid anything we track.
    pub fn is_foreign(&self) -> bool {
        !self.already_applied && self.spent.is_empty() && self.created.is_empty()
    }
}

#[derive(Clone)]
pub struct TxSyncer {
    store: Arc<Store>,
    utxos: UtxoStore,
}

impl TxSyncer {
    pub fn new(store: Arc<Store>) -> Self {
        Self { utxos: UtxoStore::new(store.clone()), store }
    }

    /// Removes spent outputs and inserts outputs paying tracked keys, atomically.
    pub fn apply_transaction(&self, tx: &Transaction) -> Result<TxSyncOutcome> {
        let txid = tx.txid();
        let _guard = self.store.commit_guard();

        if self.store.get_tx(&txid)?.is_some() {
            debug!(%txid, "transaction already synced");
            return Ok(TxSyncOutcome { already_applied: true, ..Default::default() });
        }

        let mut batch = WriteBatch::default();
        let mut outcome = TxSyncOutcome::default();

        for input in &tx.inputs {
            if self.utxos.stage_remove(&mut batch, &input.prev_out)?.is_some() {
                outcome.spent.push(input.prev_out);
            }
        }

        for (index, output) in tx.outputs.iter().enumerate() {
            let Some(address) = output.script.address() else { continue };
            if self.store.get_key(&address)?.is_none() {
                continue;
            }
            let outpoint = OutPoint::new(txid, index as u32);
            let utxo = Utxo::new(outpoint, output.script.clone(), output.value, address, UtxoStatus::Unconfirmed);
            match self.utxos.stage_put(&mut batch, utxo) {
                Ok(()) => outcome.created.push(outpoint),
                Err(Error::DuplicateUtxo(existing)) => {
                    warn!(outpoint = %existing, "output already tracked, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        if outcome.spent.is_empty() && outcome.created.is_empty() {
            return Ok(outcome);
        }

        let record = TxRecord { txid, status: TxStatus::Unconfirmed, first_seen: now_secs() };
        self.store.stage_put(&mut batch, CF_TX, txid.as_bytes(), &record)?;
        self.store.stage_put(&mut batch, CF_PENDING_TX, txid.as_bytes(), &())?;
        self.store.write_batch(batch)?;

        info!(%txid, spent = outcome.spent.len(), created = outcome.created.len(), "transaction synced");
        Ok(outcome)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockSyncOutcome {
    pub height: u64,
    pub confirmed_txs: Vec<Txid>,
    pub finalized_utxos: usize,
    pub confirmed_timestamps: Vec<u64>,
}

#[derive(Clone)]
pub struct BlockSyncer {
    store: Arc<Store>,
    utxos: UtxoStore,
    tx_syncer: TxSyncer,
}

impl BlockSyncer {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            utxos: UtxoStore::new(store.clone()),
            tx_syncer: TxSyncer::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Confirms every pending record whose txid appears in `block`.
    ///
    /// Transactions of the block are transaction-synced first, so a block never
    /// confirms something the store has not seen.
    pub fn apply_block(&self, block: &Block) -> Result<BlockSyncOutcome> {
        for tx in &block.transactions {
            self.tx_syncer.apply_transaction(tx)?;
        }
        let in_block = block.txids();

        let _guard = self.store.commit_guard();
        let mut batch = WriteBatch::default();
        let mut outcome = BlockSyncOutcome { height: block.height, ..Default::default() };

        for txid in self.store.pending_txids()? {
            if !in_block.contains(&txid) {
                continue;
            }

            if let Some(mut record) = self.store.get_tx(&txid)? {
                if record.status == TxStatus::Unconfirmed {
                    record.status = TxStatus::Confirmed { height: block.height, time: block.time };
                    self.store.stage_put(&mut batch, CF_TX, txid.as_bytes(), &record)?;
                }
            }

            for stored in self.utxos.outputs_of(&txid)? {
                if stored.utxo.status == UtxoStatus::Unconfirmed {
                    self.utxos.stage_status(&mut batch, stored, UtxoStatus::Finalized)?;
                    outcome.finalized_utxos += 1;
                }
            }

            for (_key, value) in self.store.scan_prefix(CF_TIMESTAMP_BY_TXID, txid.as_bytes())? {
                let id: u64 = bincode::deserialize(&value)?;
                let Some(mut stamp) = self.store.get_timestamp(id)? else { continue };
                if stamp.status != TimestampStatus::Unconfirmed {
                    continue;
                }
                stamp.confirm(block.height, block.time)?;
                self.store.stage_put(&mut batch, CF_TIMESTAMP, &id.to_be_bytes(), &stamp)?;
                outcome.confirmed_timestamps.push(id);
            }

            self.store.stage_delete(&mut batch, CF_PENDING_TX, txid.as_bytes())?;
            outcome.confirmed_txs.push(txid);
        }

        self.store.stage_sync_height(&mut batch, block.height)?;
        self.store.write_batch(batch)?;

        metrics::SYNCED_BLOCKS.inc();
        metrics::CONFIRMED_TXS.inc_by(outcome.confirmed_txs.len() as u64);
        info!(
            height = block.height,
            confirmed = outcome.confirmed_txs.len(),
            finalized = outcome.finalized_utxos,
            "block synced"
        );
        Ok(outcome)
    }

    /// Applies every block after the last synced height up to the node's tip, in order.
    pub fn catch_up(&self, node: &dyn NodeClient) -> Result<Vec<BlockSyncOutcome>> {
        let tip = node.block_count()?;
        let mut next = self.store.sync_height()?.map_or(0, |h| h + 1);
        let mut applied = Vec::new();
        while next <= tip {
            let block = node.block_at(next)?;
            if block.height != next {
                return Err(Error::InvalidState(format!(
                    "node returned block {} when asked for {next}",
                    block.height
                )));
            }
            applied.push(self.apply_block(&block)?);
            next += 1;
        }
        if !applied.is_empty() {
            debug!(tip, blocks = applied.len(), "caught up with node");
        }
        Ok(applied)
    }
}
