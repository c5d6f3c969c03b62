//! Sponsor-side pool of fixed-denomination fee outputs.
//!
//! The pool is not a table: it is the set of the sponsor wallet's native,
//! finalized outputs worth exactly `default_value`.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::claims::{Claim, ClaimRegistry};
use crate::config;
use crate::crypto::Address;
use crate::error::{Error, Result};
use crate::fee::FeeEstimator;
use crate::metrics;
use crate::tx::{Script, Transaction, TxIn, TxOut, Txid};
use crate::utxo::{KeyPurpose, Utxo, UtxoStatus, WalletId};
use crate::wallet::{ColorFilter, UnspentFilter, WalletAdapter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolStatus {
    NotReady,
    InsufficientAmount,
    Ready,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PoolStatus::NotReady => "not_ready",
            PoolStatus::InsufficientAmount => "insufficient_amount",
            PoolStatus::Ready => "ready",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolReport {
    pub status: PoolStatus,
    pub current_size: usize,
    pub target_size: usize,
    pub default_value: u64,
    /// Native value outside the pool that a top-up could consume. Narrower than
    /// the sponsor's total native value: pool-denomination outputs are left out
    /// because consolidation never spends them.
    pub available_value: u64,
    pub value_to_fill_pool: u64,
}

pub struct UtxoPoolManager {
    adapter: Arc<dyn WalletAdapter>,
    estimator: Arc<dyn FeeEstimator>,
    claims: Arc<ClaimRegistry>,
    sponsor: WalletId,
    default_value: u64,
    pool_size: usize,
    use_unfinalized_utxo: bool,
}

impl UtxoPoolManager {
    pub fn new(
        adapter: Arc<dyn WalletAdapter>,
        estimator: Arc<dyn FeeEstimator>,
        claims: Arc<ClaimRegistry>,
        provider: &config::UtxoProvider,
        use_unfinalized_utxo: bool,
    ) -> Result<Self> {
        provider.validate()?;
        Ok(Self {
            adapter,
            estimator,
            claims,
            sponsor: WalletId::new(provider.wallet.clone()),
            default_value: provider.default_value,
            pool_size: provider.utxo_pool_size,
            use_unfinalized_utxo,
        })
    }

    pub fn sponsor(&self) -> &WalletId {
        &self.sponsor
    }

    pub fn default_value(&self) -> u64 {
        self.default_value
    }

    pub fn target_size(&self) -> usize {
        self.pool_size
    }

    /// The sponsor's native outputs. A sponsor wallet that was never created
    /// holds nothing yet, so it reads as empty.
    fn native_outputs(&self, min_status: UtxoStatus) -> Result<Vec<Utxo>> {
        let filter = UnspentFilter { color: ColorFilter::Native, min_status };
        match self.adapter.list_unspent(&self.sponsor, filter) {
            Ok(iter) => iter.collect(),
            Err(Error::UnknownWallet(id)) if id == self.sponsor => {
                debug!(sponsor = %self.sponsor, "sponsor wallet not created yet");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn is_pool_output(&self, utxo: &Utxo) -> bool {
        utxo.is_native() && utxo.value == self.default_value
    }

    /// Consolidates the sponsor's non-pool native outputs into new pool outputs.
    ///
    /// Returns the broadcast txid, or `None` when there was nothing to do or not
    /// enough value for even one pool output. Pool outputs still awaiting
    /// confirmation count toward the current size, so repeated runs do not
    /// overshoot the target.
    pub fn manage_utxo_pool(&self) -> Result<Option<Txid>> {
        let outputs = self.native_outputs(UtxoStatus::Unconfirmed)?;
        let min_status = UnspentFilter::new(ColorFilter::Native, self.use_unfinalized_utxo).min_status;

        let pooled = outputs.iter().filter(|u| self.is_pool_output(u)).count();
        let shortage = self.pool_size.saturating_sub(pooled);
        if shortage == 0 {
            debug!(pooled, target = self.pool_size, "utxo pool is full");
            return Ok(None);
        }

        let mut claim = Claim::new(self.claims.clone());
        let mut tx = Transaction::default();
        let mut inputs = Vec::new();
        for utxo in outputs {
            if self.is_pool_output(&utxo) || !utxo.status.satisfies(min_status) {
                continue;
            }
            if claim.try_take(utxo.outpoint, self.adapter.as_ref())? {
                tx.inputs.push(TxIn::unsigned(utxo.outpoint));
                inputs.push(utxo);
            }
        }
        if inputs.is_empty() {
            debug!(sponsor = %self.sponsor, "no outputs to consolidate");
            return Ok(None);
        }
        let total_in: u64 = inputs.iter().map(|u| u.value).sum();

        let placeholder: Address = [0u8; 32];
        let change_placeholder = TxOut::new(0, Script::pay_to(&placeholder));
        let mut added = 0usize;
        let mut fee = 0u64;
        while added < shortage {
            tx.outputs.push(TxOut::new(self.default_value, Script::pay_to(&placeholder)));
            let mut draft = tx.clone();
            draft.outputs.push(change_placeholder.clone());
            let next_fee = self.estimator.estimate(&draft);
            let needed = (added as u64 + 1)
                .saturating_mul(self.default_value)
                .saturating_add(next_fee);
            if total_in < needed {
                tx.outputs.pop();
                break;
            }
            fee = next_fee;
            added += 1;
        }
        if added == 0 {
            info!(sponsor = %self.sponsor, total_in, "not enough value to add a pool output");
            return Ok(None);
        }

        let pool_address = self.adapter.new_address(&self.sponsor, KeyPurpose::SponsorPool)?;
        let pool_script = Script::pay_to(&pool_address);
        for output in &mut tx.outputs {
            output.script = pool_script.clone();
        }
        let change = total_in - added as u64 * self.default_value - fee;
        if change > 0 {
            let change_address = self.adapter.new_address(&self.sponsor, KeyPurpose::Change)?;
            tx.outputs.push(TxOut::new(change, Script::pay_to(&change_address)));
        }

        let signed = self.adapter.sign(tx, &inputs)?;
        let broadcast = self.adapter.broadcast(&signed);
        claim.settle(&broadcast);
        let txid = broadcast?;
        info!(%txid, added, shortage, fee, change, "utxo pool topped up");
        Ok(Some(txid))
    }

    /// Claims the oldest finalized pool outputs until `amount` is covered.
    pub fn take(&self, amount: u64, claim: &mut Claim) -> Result<Vec<Utxo>> {
        let filter = UnspentFilter { color: ColorFilter::Native, min_status: UtxoStatus::Finalized };
        let mut taken = Vec::new();
        let mut sum = 0u64;
        for utxo in self.adapter.list_unspent(&self.sponsor, filter)? {
            if sum >= amount {
                break;
            }
            let utxo = utxo?;
            if !self.is_pool_output(&utxo) {
                continue;
            }
            if claim.try_take(utxo.outpoint, self.adapter.as_ref())? {
                sum += utxo.value;
                taken.push(utxo);
            }
        }
        if sum < amount {
            return Err(Error::InsufficientFunds { color: None, required: amount, available: sum });
        }
        debug!(amount, taken = taken.len(), "pool outputs taken for fee");
        Ok(taken)
    }

    /// Read-only capacity report; an empty pool is `NotReady`, never an error.
    pub fn status(&self) -> Result<PoolReport> {
        let min_status = UnspentFilter::new(ColorFilter::Native, self.use_unfinalized_utxo).min_status;
        let mut current_size = 0usize;
        let mut available_value = 0u64;
        for utxo in self.native_outputs(UtxoStatus::Unconfirmed)? {
            if self.is_pool_output(&utxo) {
                if utxo.status == UtxoStatus::Finalized {
                    current_size += 1;
                }
            } else if utxo.status.satisfies(min_status) {
                available_value = available_value.saturating_add(utxo.value);
            }
        }

        let missing = self.pool_size.saturating_sub(current_size) as u64;
        let value_to_fill_pool = missing.saturating_mul(self.default_value);
        let status = if current_size == 0 {
            PoolStatus::NotReady
        } else if missing > 0 && available_value < value_to_fill_pool {
            PoolStatus::InsufficientAmount
        } else {
            PoolStatus::Ready
        };
        metrics::POOL_SIZE.set(current_size as i64);

        Ok(PoolReport {
            status,
            current_size,
            target_size: self.pool_size,
            default_value: self.default_value,
            available_value,
            value_to_fill_pool,
        })
    }
}
