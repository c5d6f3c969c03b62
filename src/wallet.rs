//! Where keys, addresses and unspent outputs live.
//!
//! The builder and pool manager talk to [`WalletAdapter`] only. The store-backed
//! variant keeps keys and outputs in the local [`Store`]; the node-backed variant
//! lives in [`crate::node`].

use ed25519_dalek::SigningKey;
use std::sync::Arc;
use tracing::{info, warn};

use crate::crypto::{self, Address};
use crate::error::{Error, Result};
use crate::metrics;
use crate::node::{NodeClient, NodeError};
use crate::storage::{now_secs, Store};
use crate::sync::TxSyncer;
use crate::tx::{ColorId, OutPoint, Transaction, Txid};
use crate::utxo::{KeyPurpose, KeyRecord, Utxo, UtxoStatus, WalletId, WalletRecord};
use crate::utxo_store::UtxoStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorFilter {
    Any,
    Native,
    Color(ColorId),
}

impl ColorFilter {
    pub fn of(color: Option<ColorId>) -> Self {
        match color {
            Some(color) => ColorFilter::Color(color),
            None => ColorFilter::Native,
        }
    }

    pub fn matches(&self, color: Option<&ColorId>) -> bool {
        match (self, color) {
            (ColorFilter::Any, _) => true,
            (ColorFilter::Native, None) => true,
            (ColorFilter::Color(want), Some(have)) => want == have,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnspentFilter {
    pub color: ColorFilter,
    pub min_status: UtxoStatus,
}

impl UnspentFilter {
    pub fn new(color: ColorFilter, use_unfinalized_utxo: bool) -> Self {
        let min_status = if use_unfinalized_utxo {
            UtxoStatus::Unconfirmed
        } else {
            UtxoStatus::Finalized
        };
        Self { color, min_status }
    }

    pub fn admits(&self, utxo: &Utxo) -> bool {
        self.color.matches(utxo.color_id.as_ref()) && utxo.status.satisfies(self.min_status)
    }
}

pub type UtxoIter<'a> = Box<dyn Iterator<Item = Result<Utxo>> + 'a>;

pub trait WalletAdapter: Send + Sync {
    /// Candidate outputs of `owner`, oldest first where the backend knows the order.
    fn list_unspent<'a>(&'a self, owner: &WalletId, filter: UnspentFilter) -> Result<UtxoIter<'a>>;

    fn new_address(&self, owner: &WalletId, purpose: KeyPurpose) -> Result<Address>;

    /// Signs every input whose key the backend holds. `prevouts` are the outputs
    /// being spent, in any order.
    fn sign(&self, tx: Transaction, prevouts: &[Utxo]) -> Result<Transaction>;

    /// Hands the signed transaction to the network. Not safe to retry blindly.
    fn broadcast(&self, tx: &Transaction) -> Result<Txid>;

    /// Re-checks a candidate right after it was claimed. Backends without a
    /// cheap existence check rely on the node rejecting double spends.
    fn still_unspent(&self, _outpoint: &OutPoint) -> Result<bool> {
        Ok(true)
    }
}

/// Keystore and UTXO set kept in the local ledger store; broadcasting goes
/// through a node and the accepted transaction is synced into the store.
pub struct LocalStoreWallet {
    store: Arc<Store>,
    utxos: UtxoStore,
    syncer: TxSyncer,
    node: Option<Arc<dyn NodeClient>>,
}

impl LocalStoreWallet {
    pub fn new(store: Arc<Store>, node: Arc<dyn NodeClient>) -> Self {
        Self::build(store, Some(node))
    }

    /// A wallet that can list, derive and sign but not broadcast.
    pub fn offline(store: Arc<Store>) -> Self {
        Self::build(store, None)
    }

    fn build(store: Arc<Store>, node: Option<Arc<dyn NodeClient>>) -> Self {
        Self {
            utxos: UtxoStore::new(store.clone()),
            syncer: TxSyncer::new(store.clone()),
            store,
            node,
        }
    }

    pub fn create_wallet(&self, id: &WalletId) -> Result<WalletRecord> {
        self.store.create_wallet(id)
    }

    pub fn utxo_store(&self) -> &UtxoStore {
        &self.utxos
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn require_wallet(&self, owner: &WalletId) -> Result<()> {
        match self.store.get_wallet(owner)? {
            Some(_) => Ok(()),
            None => Err(Error::UnknownWallet(owner.clone())),
        }
    }
}

impl WalletAdapter for LocalStoreWallet {
    fn list_unspent<'a>(&'a self, owner: &WalletId, filter: UnspentFilter) -> Result<UtxoIter<'a>> {
        self.require_wallet(owner)?;
        let iter: UtxoIter<'a> = match filter.color {
            ColorFilter::Any => Box::new(self.utxos.list(owner, filter.min_status)?),
            ColorFilter::Native => Box::new(self.utxos.find_spendable(owner, None, filter.min_status)?),
            ColorFilter::Color(color) => {
                Box::new(self.utxos.find_spendable(owner, Some(&color), filter.min_status)?)
            }
        };
        Ok(iter)
    }

    fn new_address(&self, owner: &WalletId, purpose: KeyPurpose) -> Result<Address> {
        self.require_wallet(owner)?;
        let key = crypto::generate_signing_key();
        let public_key = key.verifying_key().to_bytes();
        let record = KeyRecord {
            address: crypto::address_from_pk_bytes(&public_key),
            wallet_id: owner.clone(),
            purpose,
            public_key,
            secret_key: Some(key.to_bytes()),
            created_at: now_secs(),
        };
        self.store.put_key(&record)?;
        info!(wallet = %owner, %purpose, address = %hex::encode(record.address), "new key derived");
        Ok(record.address)
    }

    fn sign(&self, mut tx: Transaction, prevouts: &[Utxo]) -> Result<Transaction> {
        let sighash = tx.sighash();
        for (index, input) in tx.inputs.iter_mut().enumerate() {
            let owner = match prevouts.iter().find(|u| u.outpoint == input.prev_out) {
                Some(utxo) => utxo.owning_key,
                None => self
                    .utxos
                    .get(&input.prev_out)?
                    .map(|u| u.owning_key)
                    .ok_or(Error::MissingKey { index })?,
            };
            let secret = self
                .store
                .get_key(&owner)?
                .and_then(|record| record.secret_key)
                .ok_or(Error::MissingKey { index })?;
            input.script_sig = crypto::sign_input(&SigningKey::from_bytes(&secret), &sighash);
        }
        Ok(tx)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let node = self.node.as_ref().ok_or(NodeError::Unavailable)?;
        let txid = match node.broadcast(tx) {
            Ok(txid) => txid,
            Err(e) => {
                metrics::BROADCAST_FAILURES.inc();
                warn!(txid = %tx.txid(), error = %e, "broadcast failed");
                return Err(e.into());
            }
        };
        metrics::BROADCASTS.inc();
        info!(%txid, "transaction broadcast");
        if let Err(first) = self.syncer.apply_transaction(tx) {
            warn!(%txid, error = %first, "local update after broadcast failed, retrying");
            self.syncer
                .apply_transaction(tx)
                .map_err(|e| Error::LocalUpdateFailed { txid, source: Box::new(e) })?;
        }
        Ok(txid)
    }

    fn still_unspent(&self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self.utxos.get(outpoint)?.is_some())
    }
}
