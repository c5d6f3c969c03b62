//! Authoritative record of spendable outputs.
//!
//! Layout:
//! * `utxo`: `txid || index` -> [`StoredUtxo`]
//! * `utxo_owner`: `wallet || color-tag || seq` -> `txid || index`
//!
//! The owner index is keyed by insertion sequence, so a prefix scan yields the
//! oldest outputs first. Outputs paying a non-selectable key (trackable
//! timestamps) are listed but never offered as spendable candidates.

use rocksdb::{Direction, IteratorMode, WriteBatch};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::{Store, CF_UTXO, CF_UTXO_OWNER};
use crate::tx::{ColorId, OutPoint, Txid, COLOR_ID_LEN};
use crate::utxo::{KeyPurpose, Utxo, UtxoStatus, WalletId};

const COLOR_TAG_LEN: usize = 1 + COLOR_ID_LEN;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredUtxo {
    pub utxo: Utxo,
    pub wallet_id: WalletId,
    /// Purpose of the owning key, copied at insertion.
    pub purpose: KeyPurpose,
    pub seq: u64,
}

fn color_tag(color: Option<&ColorId>) -> [u8; COLOR_TAG_LEN] {
    let mut tag = [0u8; COLOR_TAG_LEN];
    if let Some(color) = color {
        tag[0] = 1;
        tag[1..].copy_from_slice(color.as_bytes());
    }
    tag
}

fn owner_prefix(owner: &WalletId, color: Option<&ColorId>) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(32 + COLOR_TAG_LEN);
    prefix.extend_from_slice(&owner.key_prefix());
    prefix.extend_from_slice(&color_tag(color));
    prefix
}

fn owner_key(stored: &StoredUtxo) -> Vec<u8> {
    let mut key = owner_prefix(&stored.wallet_id, stored.utxo.color_id.as_ref());
    key.extend_from_slice(&stored.seq.to_be_bytes());
    key
}

#[derive(Clone)]
pub struct UtxoStore {
    store: Arc<Store>,
}

impl UtxoStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Inserts a new output.
    ///
    /// # Errors
    /// * [`Error::DuplicateUtxo`] if `(txid, index)` is already tracked.
    /// * [`Error::UnknownKey`] if the owning key is not registered.
    pub fn put(&self, utxo: Utxo) -> Result<()> {
        let _guard = self.store.commit_guard();
        let mut batch = WriteBatch::default();
        let outpoint = utxo.outpoint;
        self.stage_put(&mut batch, utxo)?;
        self.store.write_batch(batch)?;
        debug!(%outpoint, "utxo stored");
        Ok(())
    }

    /// Deletes an output. Absent outputs are not an error so sync replays stay harmless.
    pub fn remove(&self, txid: &Txid, index: u32) -> Result<bool> {
        let _guard = self.store.commit_guard();
        let mut batch = WriteBatch::default();
        let removed = self.stage_remove(&mut batch, &OutPoint::new(*txid, index))?;
        if removed.is_some() {
            self.store.write_batch(batch)?;
        }
        Ok(removed.is_some())
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        Ok(self.get_stored(outpoint)?.map(|s| s.utxo))
    }

    pub fn get_stored(&self, outpoint: &OutPoint) -> Result<Option<StoredUtxo>> {
        self.store.get(CF_UTXO, &outpoint.to_key())
    }

    /// Lazily yields `owner`'s selectable outputs of one color (`None` = native
    /// asset) whose status is at least `min_status`, oldest first.
    pub fn find_spendable(
        &self,
        owner: &WalletId,
        color: Option<&ColorId>,
        min_status: UtxoStatus,
    ) -> Result<impl Iterator<Item = Result<Utxo>> + '_> {
        self.scan(owner_prefix(owner, color), min_status, true)
    }

    /// Every output of `owner` regardless of color or key purpose, grouped by
    /// color then age.
    pub fn list(&self, owner: &WalletId, min_status: UtxoStatus) -> Result<impl Iterator<Item = Result<Utxo>> + '_> {
        self.scan(owner.key_prefix().to_vec(), min_status, false)
    }

    pub fn sum_available(&self, owner: &WalletId, color: Option<&ColorId>, min_status: UtxoStatus) -> Result<u64> {
        self.find_spendable(owner, color, min_status)?
            .try_fold(0u64, |acc, utxo| Ok(acc.saturating_add(utxo?.value)))
    }

    /// Tracked outputs created by `txid`.
    pub fn outputs_of(&self, txid: &Txid) -> Result<Vec<StoredUtxo>> {
        self.store
            .scan_prefix(CF_UTXO, txid.as_bytes())?
            .into_iter()
            .map(|(_k, v)| Ok(bincode::deserialize(&v)?))
            .collect()
    }

    fn scan(
        &self,
        prefix: Vec<u8>,
        min_status: UtxoStatus,
        selectable_only: bool,
    ) -> Result<impl Iterator<Item = Result<Utxo>> + '_> {
        let handle = self.store.cf(CF_UTXO_OWNER)?;
        let iter = self
            .store
            .db
            .iterator_cf(handle, IteratorMode::From(&prefix, Direction::Forward));
        Ok(iter
            .take_while(move |item| match item {
                Ok((k, _)) => k.starts_with(&prefix),
                Err(_) => true,
            })
            .filter_map(move |item| {
                let (_k, v) = match item {
                    Ok(pair) => pair,
                    Err(e) => return Some(Err(Error::from(e))),
                };
                let outpoint = OutPoint::from_key(&v)?;
                match self.get_stored(&outpoint) {
                    // removed between the index read and the record read
                    Ok(None) => None,
                    Ok(Some(stored))
                        if stored.utxo.status.satisfies(min_status)
                            && (!selectable_only || stored.purpose.is_selectable()) =>
                    {
                        Some(Ok(stored.utxo))
                    }
                    Ok(Some(_)) => None,
                    Err(e) => Some(Err(e)),
                }
            }))
    }

    /// Stages an insert. Caller must hold the commit guard.
    pub(crate) fn stage_put(&self, batch: &mut WriteBatch, utxo: Utxo) -> Result<()> {
        if self.store.contains(CF_UTXO, &utxo.outpoint.to_key())? {
            return Err(Error::DuplicateUtxo(utxo.outpoint));
        }
        let key = self
            .store
            .get_key(&utxo.owning_key)?
            .ok_or_else(|| Error::UnknownKey(hex::encode(utxo.owning_key)))?;
        let seq = self.store.reserve_utxo_seq(batch)?;
        let stored = StoredUtxo { utxo, wallet_id: key.wallet_id, purpose: key.purpose, seq };
        batch.put_cf(self.store.cf(CF_UTXO_OWNER)?, owner_key(&stored), stored.utxo.outpoint.to_key());
        self.store.stage_put(batch, CF_UTXO, &stored.utxo.outpoint.to_key(), &stored)?;
        Ok(())
    }

    /// Stages a delete, returning what was removed. Caller must hold the commit guard.
    pub(crate) fn stage_remove(&self, batch: &mut WriteBatch, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        let Some(stored) = self.get_stored(outpoint)? else {
            return Ok(None);
        };
        self.store.stage_delete(batch, CF_UTXO_OWNER, &owner_key(&stored))?;
        self.store.stage_delete(batch, CF_UTXO, &outpoint.to_key())?;
        Ok(Some(stored.utxo))
    }

    /// Stages a status change keeping the insertion sequence.
    pub(crate) fn stage_status(&self, batch: &mut WriteBatch, mut stored: StoredUtxo, status: UtxoStatus) -> Result<()> {
        stored.utxo.status = status;
        self.store.stage_put(batch, CF_UTXO, &stored.utxo.outpoint.to_key(), &stored)
    }
}
