//! Exclusive claims on candidate inputs.
//!
//! A builder claims every outpoint it is about to spend. Other builders skip
//! claimed outpoints while selecting, so two concurrent attempts can never
//! pick the same output. A [`Claim`] releases its outpoints when dropped,
//! unless [`Claim::settle`] sees a transaction the node accepted but the
//! store never applied.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::error::{Error, Result};
use crate::tx::OutPoint;
use crate::wallet::WalletAdapter;

#[derive(Debug, Default)]
pub struct ClaimRegistry {
    held: Mutex<HashSet<OutPoint>>,
}

impl ClaimRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_claimed(&self, outpoint: &OutPoint) -> bool {
        self.lock().contains(outpoint)
    }

    pub fn held_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<OutPoint>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Set of outpoints held by one build attempt.
#[derive(Debug)]
pub struct Claim {
    registry: Arc<ClaimRegistry>,
    outpoints: Vec<OutPoint>,
}

impl Claim {
    pub fn new(registry: Arc<ClaimRegistry>) -> Self {
        Self { registry, outpoints: Vec::new() }
    }

    /// Claims `outpoint`; returns false when another attempt already holds it.
    pub fn try_add(&mut self, outpoint: OutPoint) -> bool {
        if self.outpoints.contains(&outpoint) {
            return true;
        }
        if !self.registry.lock().insert(outpoint) {
            return false;
        }
        self.outpoints.push(outpoint);
        true
    }

    /// Claims a fresh candidate for spending: skips outpoints this attempt
    /// already holds, those held elsewhere, and those spent since they were listed.
    pub fn try_take(&mut self, outpoint: OutPoint, adapter: &dyn WalletAdapter) -> Result<bool> {
        if self.contains(&outpoint) || !self.try_add(outpoint) {
            return Ok(false);
        }
        if !adapter.still_unspent(&outpoint)? {
            self.release(&outpoint);
            return Ok(false);
        }
        Ok(true)
    }

    /// Gives back a single outpoint, e.g. one found to be spent after claiming.
    pub fn release(&mut self, outpoint: &OutPoint) {
        if let Some(pos) = self.outpoints.iter().position(|o| o == outpoint) {
            self.outpoints.swap_remove(pos);
            self.registry.lock().remove(outpoint);
        }
    }

    /// Keeps every outpoint claimed for the life of the registry and returns them.
    pub fn keep(mut self) -> Vec<OutPoint> {
        std::mem::take(&mut self.outpoints)
    }

    /// Ends the claim once a broadcast returned. When the node accepted the
    /// transaction but the store still lists its inputs, they stay claimed so
    /// no later build spends them again.
    pub fn settle<T>(self, broadcast: &Result<T>) {
        if let Err(Error::LocalUpdateFailed { txid, .. }) = broadcast {
            let kept = self.keep();
            warn!(%txid, inputs = kept.len(), "inputs of a broadcast transaction stay claimed");
        }
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.outpoints.contains(outpoint)
    }

    pub fn outpoints(&self) -> &[OutPoint] {
        &self.outpoints
    }

    pub fn len(&self) -> usize {
        self.outpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outpoints.is_empty()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut held = self.registry.lock();
        for outpoint in &self.outpoints {
            held.remove(outpoint);
        }
    }
}
