//! Coin selection and transaction assembly.
//!
//! Outputs are laid out as: payments in request order, colored change (one per
//! color, ordered by color id), the payer's native change, then the sponsor's
//! change. Candidates are drawn oldest first and claimed as they are picked; the
//! only store write before submission is the creation of change keys, which
//! happens after selection has succeeded.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::claims::{Claim, ClaimRegistry};
use crate::crypto::Address;
use crate::error::{Error, Result};
use crate::fee::FeePolicy;
use crate::metrics;
use crate::pool::UtxoPoolManager;
use crate::tx::{ColorId, OutPoint, Script, Transaction, TxIn, TxOut, Txid};
use crate::utxo::{KeyPurpose, Utxo, UtxoStatus, WalletId};
use crate::wallet::{ColorFilter, UnspentFilter, UtxoIter, WalletAdapter};

/// Stand-in address for change outputs while fees are estimated. Same length
/// as a real address, so the draft size matches the final size.
const PLACEHOLDER_ADDRESS: Address = [0u8; 32];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentRequest {
    pub script: Script,
    pub value: u64,
}

impl PaymentRequest {
    pub fn to_address(address: &Address, value: u64, color: Option<ColorId>) -> Self {
        Self { script: Script::pay_to_with_color(color.as_ref(), address), value }
    }

    /// Zero-value data carrier output.
    pub fn data(bytes: &[u8]) -> Self {
        Self { script: Script::op_return(bytes), value: 0 }
    }

    pub fn color_id(&self) -> Option<ColorId> {
        self.script.color_id()
    }
}

#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub payer: WalletId,
    pub payments: Vec<PaymentRequest>,
    /// Outpoints that must be spent regardless of selection.
    pub explicit_inputs: Vec<OutPoint>,
    pub auto_fulfill: bool,
}

impl BuildRequest {
    pub fn new(payer: WalletId) -> Self {
        Self { payer, payments: Vec::new(), explicit_inputs: Vec::new(), auto_fulfill: true }
    }

    pub fn pay(mut self, payment: PaymentRequest) -> Self {
        self.payments.push(payment);
        self
    }

    pub fn spend(mut self, outpoint: OutPoint) -> Self {
        self.explicit_inputs.push(outpoint);
        self
    }

    pub fn without_auto_fulfill(mut self) -> Self {
        self.auto_fulfill = false;
        self
    }
}

/// A balanced, unsigned transaction together with the claim on its inputs.
/// Dropping it releases the inputs without touching the store.
#[derive(Debug)]
pub struct BuiltTransaction {
    pub transaction: Transaction,
    /// Spent outputs, parallel to `transaction.inputs`.
    pub prevouts: Vec<Utxo>,
    /// Network fee carried by the transaction.
    pub fee: u64,
    /// Part of the fee paid from the payer's own inputs.
    pub payer_fee: u64,
    pub sponsored: bool,
    claim: Claim,
}

impl BuiltTransaction {
    pub fn txid(&self) -> Txid {
        self.transaction.txid()
    }

    pub fn input_value(&self) -> u64 {
        self.prevouts.iter().map(|u| u.value).sum()
    }

    pub fn output_value(&self) -> u64 {
        self.transaction.outputs.iter().map(|o| o.value).sum()
    }

    pub fn claimed(&self) -> &[OutPoint] {
        self.claim.outpoints()
    }
}

struct ChangeSlot {
    owner: WalletId,
    color: Option<ColorId>,
    value: u64,
}

impl ChangeSlot {
    fn placeholder(&self) -> TxOut {
        TxOut::new(self.value, Script::pay_to_with_color(self.color.as_ref(), &PLACEHOLDER_ADDRESS))
    }
}

struct Selection {
    tx: Transaction,
    prevouts: Vec<Utxo>,
    claim: Claim,
}

impl Selection {
    fn add(&mut self, utxo: Utxo) {
        self.tx.inputs.push(TxIn::unsigned(utxo.outpoint));
        self.prevouts.push(utxo);
    }

    fn input_value(&self, color: Option<&ColorId>) -> u64 {
        self.prevouts
            .iter()
            .filter(|u| u.color_id.as_ref() == color)
            .map(|u| u.value)
            .sum()
    }

    fn draft(&self, change: &[ChangeSlot]) -> Transaction {
        let mut draft = self.tx.clone();
        draft.outputs.extend(change.iter().map(ChangeSlot::placeholder));
        draft
    }
}

pub struct TransactionBuilder {
    adapter: Arc<dyn WalletAdapter>,
    policy: FeePolicy,
    claims: Arc<ClaimRegistry>,
    pool: Option<Arc<UtxoPoolManager>>,
    use_unfinalized_utxo: bool,
}

impl TransactionBuilder {
    pub fn new(
        adapter: Arc<dyn WalletAdapter>,
        policy: FeePolicy,
        claims: Arc<ClaimRegistry>,
        use_unfinalized_utxo: bool,
    ) -> Self {
        Self { adapter, policy, claims, pool: None, use_unfinalized_utxo }
    }

    /// Sponsor pool used when the fee policy says the sponsor bears fees.
    pub fn with_pool(mut self, pool: Arc<UtxoPoolManager>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn adapter(&self) -> &Arc<dyn WalletAdapter> {
        &self.adapter
    }

    pub fn policy(&self) -> &FeePolicy {
        &self.policy
    }

    pub fn build(&self, request: BuildRequest) -> Result<BuiltTransaction> {
        let BuildRequest { payer, payments, explicit_inputs, auto_fulfill } = request;
        if payments.is_empty() && explicit_inputs.is_empty() {
            return Err(Error::InvalidParameter("transaction has no payments and no inputs".into()));
        }

        let mut sel = Selection {
            tx: Transaction::default(),
            prevouts: Vec::new(),
            claim: Claim::new(self.claims.clone()),
        };

        let mut colored_out: BTreeMap<ColorId, u64> = BTreeMap::new();
        let mut native_out = 0u64;
        for payment in &payments {
            if payment.value == 0 && !payment.script.is_op_return() {
                return Err(Error::InvalidParameter("zero-value payment".into()));
            }
            let total = match payment.color_id() {
                Some(color) => colored_out.entry(color).or_default(),
                None => &mut native_out,
            };
            *total = total
                .checked_add(payment.value)
                .ok_or_else(|| Error::InvalidParameter("payment total overflows".into()))?;
            sel.tx.outputs.push(TxOut::new(payment.value, payment.script.clone()));
        }

        self.add_explicit_inputs(&payer, &explicit_inputs, &mut sel)?;

        let mut change = Vec::new();

        // Colors brought in only by explicit inputs are returned whole as change.
        let mut colors = colored_out;
        for utxo in &sel.prevouts {
            if let Some(color) = utxo.color_id {
                colors.entry(color).or_insert(0);
            }
        }
        for (color, need) in colors {
            self.fill(&payer, ColorFilter::Color(color), auto_fulfill, &mut sel, |_| need)?;
            let have = sel.input_value(Some(&color));
            if have > need {
                change.push(ChangeSlot { owner: payer.clone(), color: Some(color), value: have - need });
            }
        }

        let sponsored = self.policy.sponsor_bears_fee();
        let fee = if sponsored {
            self.sponsor_fee(&payer, native_out, auto_fulfill, &mut sel, &mut change)?
        } else {
            self.payer_fee(&payer, native_out, auto_fulfill, &mut sel, &mut change)?
        };

        for slot in change.into_iter().filter(|slot| slot.value > 0) {
            let address = self.adapter.new_address(&slot.owner, KeyPurpose::Change)?;
            sel.tx
                .outputs
                .push(TxOut::new(slot.value, Script::pay_to_with_color(slot.color.as_ref(), &address)));
        }

        let native_in = sel.input_value(None);
        let native_total = sel.tx.native_output_value();
        if native_in != native_total + fee {
            return Err(Error::InvalidState(format!(
                "unbalanced transaction: inputs {native_in}, outputs {native_total}, fee {fee}"
            )));
        }

        let Selection { tx, prevouts, claim } = sel;
        let built = BuiltTransaction {
            transaction: tx,
            prevouts,
            fee,
            payer_fee: if sponsored { 0 } else { fee },
            sponsored,
            claim,
        };
        metrics::BUILT_TRANSACTIONS.inc();
        info!(
            txid = %built.txid(),
            payer = %payer,
            inputs = built.prevouts.len(),
            outputs = built.transaction.outputs.len(),
            fee,
            sponsored,
            "transaction built"
        );
        Ok(built)
    }

    /// Signs and broadcasts. The claim is released once the broadcast returns;
    /// by then a local adapter has already removed the spent outputs. If the
    /// node accepted the transaction but the local update failed, the inputs
    /// stay claimed.
    pub fn submit(&self, built: BuiltTransaction) -> Result<Txid> {
        let BuiltTransaction { transaction, prevouts, claim, .. } = built;
        let signed = self.adapter.sign(transaction, &prevouts)?;
        let broadcast = self.adapter.broadcast(&signed);
        claim.settle(&broadcast);
        broadcast
    }

    pub fn send(&self, request: BuildRequest) -> Result<Txid> {
        let built = self.build(request)?;
        self.submit(built)
    }

    fn add_explicit_inputs(&self, payer: &WalletId, outpoints: &[OutPoint], sel: &mut Selection) -> Result<()> {
        if outpoints.is_empty() {
            return Ok(());
        }
        let filter = UnspentFilter { color: ColorFilter::Any, min_status: UtxoStatus::Unconfirmed };
        let listed: Vec<Utxo> = self
            .adapter
            .list_unspent(payer, filter)?
            .filter(|item| item.as_ref().map_or(true, |u| outpoints.contains(&u.outpoint)))
            .collect::<Result<_>>()?;

        for outpoint in outpoints {
            if sel.claim.contains(outpoint) {
                return Err(Error::InvalidParameter(format!("input {outpoint} requested twice")));
            }
            let utxo = listed
                .iter()
                .find(|u| u.outpoint == *outpoint)
                .cloned()
                .ok_or_else(|| Error::InvalidParameter(format!("{outpoint} is not an unspent output of {payer}")))?;
            if !sel.claim.try_add(*outpoint) {
                return Err(Error::Conflict(*outpoint));
            }
            sel.add(utxo);
        }
        Ok(())
    }

    /// Draws `owner`'s candidates of one color until the input value reaches
    /// `target`, which is re-evaluated after every addition.
    fn fill<F>(&self, owner: &WalletId, color: ColorFilter, auto_fulfill: bool, sel: &mut Selection, mut target: F) -> Result<()>
    where
        F: FnMut(&Selection) -> u64,
    {
        let color_id = match color {
            ColorFilter::Color(color) => Some(color),
            _ => None,
        };
        let mut candidates: UtxoIter<'_> = if auto_fulfill {
            self.adapter
                .list_unspent(owner, UnspentFilter::new(color, self.use_unfinalized_utxo))?
        } else {
            Box::new(std::iter::empty())
        };
        loop {
            let required = target(sel);
            let available = sel.input_value(color_id.as_ref());
            if available >= required {
                return Ok(());
            }
            let utxo = match candidates.next() {
                Some(utxo) => utxo?,
                None => return Err(Error::InsufficientFunds { color: color_id, required, available }),
            };
            if sel.claim.try_take(utxo.outpoint, self.adapter.as_ref())? {
                debug!(outpoint = %utxo.outpoint, value = utxo.value, "input selected");
                sel.add(utxo);
            }
        }
    }

    /// Payer covers native payments and the fee; returns the fee.
    fn payer_fee(
        &self,
        payer: &WalletId,
        native_out: u64,
        auto_fulfill: bool,
        sel: &mut Selection,
        change: &mut Vec<ChangeSlot>,
    ) -> Result<u64> {
        change.push(ChangeSlot { owner: payer.clone(), color: None, value: 0 });
        let policy = &self.policy;
        {
            let change: &[ChangeSlot] = change;
            self.fill(payer, ColorFilter::Native, auto_fulfill, sel, |sel| {
                native_out.saturating_add(policy.payer_fee(&sel.draft(change)))
            })?;
        }
        let fee = policy.payer_fee(&sel.draft(change));
        let surplus = sel.input_value(None) - native_out - fee;
        if let Some(slot) = change.last_mut() {
            slot.value = surplus;
        }
        Ok(fee)
    }

    /// Payer covers native payments only; the sponsor pool covers the network fee.
    fn sponsor_fee(
        &self,
        payer: &WalletId,
        native_out: u64,
        auto_fulfill: bool,
        sel: &mut Selection,
        change: &mut Vec<ChangeSlot>,
    ) -> Result<u64> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("sponsor bears fees but no utxo pool is attached".into()))?;

        self.fill(payer, ColorFilter::Native, auto_fulfill, sel, |_| native_out)?;
        let payer_surplus = sel.input_value(None) - native_out;
        if payer_surplus > 0 {
            change.push(ChangeSlot { owner: payer.clone(), color: None, value: payer_surplus });
        }

        change.push(ChangeSlot { owner: pool.sponsor().clone(), color: None, value: 0 });
        let mut sponsor_in = 0u64;
        let fee = loop {
            let fee = self.policy.network_fee(&sel.draft(change));
            if sponsor_in >= fee {
                break fee;
            }
            for utxo in pool.take(fee - sponsor_in, &mut sel.claim)? {
                sponsor_in += utxo.value;
                sel.add(utxo);
            }
        };
        if let Some(slot) = change.last_mut() {
            slot.value = sponsor_in - fee;
        }
        debug!(fee, sponsor_in, "fee delegated to sponsor pool");
        Ok(fee)
    }
}
