use serde::Deserialize;
use std::{fs, path::Path};
use anyhow::{Context, Result};

use crate::error::Error;

/// Upper bound on the number of fee-only outputs kept by the sponsor wallet.
pub const MAX_UTXO_POOL_SIZE: usize = 2_000;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: Storage,
    #[serde(default)]
    pub fee: Fee,
    #[serde(default)]
    pub wallet: Wallet,
    #[serde(default)]
    pub utxo_provider: UtxoProvider,
    #[serde(default)]
    pub scheduler: Scheduler,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeeStrategy {
    Fixed,
    Auto,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Fee {
    #[serde(default = "default_strategy")]
    pub strategy: FeeStrategy,
    /// Units per 1000 bytes of serialized transaction.
    #[serde(default = "default_fee_rate")]
    pub fee_rate: u64,
    #[serde(default = "default_fixed_fee")]
    pub fixed_fee: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Wallet {
    #[serde(default)]
    pub use_unfinalized_utxo: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UtxoProvider {
    /// When set the sponsor wallet pays network fees for every built transaction.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_provider_wallet")]
    pub wallet: String,
    #[serde(default = "default_value")]
    pub default_value: u64,
    #[serde(default = "default_pool_size")]
    pub utxo_pool_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Scheduler {
    #[serde(default = "default_pool_interval")]
    pub pool_interval_secs: u64,
    #[serde(default = "default_block_interval")]
    pub block_interval_secs: u64,
}

fn default_strategy() -> FeeStrategy { FeeStrategy::Auto }
fn default_fee_rate() -> u64 { 1_000 }
fn default_fixed_fee() -> u64 { 10_000 }
fn default_provider_wallet() -> String { "utxo_provider".into() }
fn default_value() -> u64 { 1_000 }
fn default_pool_size() -> usize { 20 }
fn default_pool_interval() -> u64 { 60 }
fn default_block_interval() -> u64 { 10 }

impl Default for Fee {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            fee_rate: default_fee_rate(),
            fixed_fee: default_fixed_fee(),
        }
    }
}

impl Default for UtxoProvider {
    fn default() -> Self {
        Self {
            enabled: false,
            wallet: default_provider_wallet(),
            default_value: default_value(),
            utxo_pool_size: default_pool_size(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            pool_interval_secs: default_pool_interval(),
            block_interval_secs: default_block_interval(),
        }
    }
}

impl Config {
    /// Rejects settings the components cannot operate with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.fee.strategy == FeeStrategy::Auto && self.fee.fee_rate == 0 {
            return Err(Error::InvalidConfig("fee_rate must be positive for the auto strategy".into()));
        }
        self.utxo_provider.validate()
    }
}

impl UtxoProvider {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.default_value == 0 {
            return Err(Error::InvalidConfig("utxo_provider.default_value must be positive".into()));
        }
        if self.utxo_pool_size == 0 || self.utxo_pool_size > MAX_UTXO_POOL_SIZE {
            return Err(Error::InvalidConfig(format!(
                "utxo_provider.utxo_pool_size must be between 1 and {MAX_UTXO_POOL_SIZE}, got {}",
                self.utxo_pool_size
            )));
        }
        if self.wallet.is_empty() {
            return Err(Error::InvalidConfig("utxo_provider.wallet must not be empty".into()));
        }
        Ok(())
    }
}

/// Read the TOML file at `p`, deserialize into `Config` and validate it.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read, parsed or fails validation.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text).context("invalid TOML in config file")?;
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}
