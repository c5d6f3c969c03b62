use std::sync::Arc;

use crate::config::{self, FeeStrategy};
use crate::tx::Transaction;

pub const DEFAULT_FIXED_FEE: u64 = 10_000;
/// Units per 1000 bytes.
pub const DEFAULT_FEE_RATE: u64 = 1_000;

/// Computes the fee a draft transaction must pay.
///
/// Estimation never fails: a malformed draft is a caller bug.
pub trait FeeEstimator: Send + Sync {
    fn estimate(&self, tx: &Transaction) -> u64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fixed {
    fee: u64,
}

impl Fixed {
    pub fn new(fee: u64) -> Self {
        Self { fee }
    }
}

impl Default for Fixed {
    fn default() -> Self {
        Self::new(DEFAULT_FIXED_FEE)
    }
}

impl FeeEstimator for Fixed {
    fn estimate(&self, _tx: &Transaction) -> u64 {
        self.fee
    }
}

/// Size-based fee: `ceil(size / 1000 * fee_rate)`, plus one unit when any
/// output is colored, since colored outputs must strictly exceed the minimum
/// relay fee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Auto {
    fee_rate: u64,
}

impl Auto {
    pub fn new(fee_rate: u64) -> Self {
        Self { fee_rate }
    }

    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }

    pub fn fee_for_size(&self, size: usize, has_colored_output: bool) -> u64 {
        let scaled = (size as u64).saturating_mul(self.fee_rate);
        let fee = scaled / 1000 + u64::from(scaled % 1000 != 0);
        fee + u64::from(has_colored_output)
    }
}

impl Default for Auto {
    fn default() -> Self {
        Self::new(DEFAULT_FEE_RATE)
    }
}

impl FeeEstimator for Auto {
    fn estimate(&self, tx: &Transaction) -> u64 {
        self.fee_for_size(tx.estimated_size(), tx.has_colored_output())
    }
}

pub fn estimator_from_config(cfg: &config::Fee) -> Arc<dyn FeeEstimator> {
    match cfg.strategy {
        FeeStrategy::Fixed => Arc::new(Fixed::new(cfg.fixed_fee)),
        FeeStrategy::Auto => Arc::new(Auto::new(cfg.fee_rate)),
    }
}

/// Pairs an estimator with the sponsor override. When the sponsor bears fees
/// the payer-visible fee is zero and the sponsor pays [`FeePolicy::network_fee`]
/// from its pool.
#[derive(Clone)]
pub struct FeePolicy {
    estimator: Arc<dyn FeeEstimator>,
    sponsor_bears_fee: bool,
}

impl FeePolicy {
    pub fn new(estimator: Arc<dyn FeeEstimator>, sponsor_bears_fee: bool) -> Self {
        Self { estimator, sponsor_bears_fee }
    }

    pub fn from_config(fee: &config::Fee, provider: &config::UtxoProvider) -> Self {
        Self::new(estimator_from_config(fee), provider.enabled)
    }

    pub fn sponsor_bears_fee(&self) -> bool {
        self.sponsor_bears_fee
    }

    pub fn payer_fee(&self, tx: &Transaction) -> u64 {
        if self.sponsor_bears_fee {
            0
        } else {
            self.estimator.estimate(tx)
        }
    }

    pub fn network_fee(&self, tx: &Transaction) -> u64 {
        self.estimator.estimate(tx)
    }

    pub fn estimator(&self) -> &Arc<dyn FeeEstimator> {
        &self.estimator
    }
}
