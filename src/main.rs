use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use colorledger::claims::ClaimRegistry;
use colorledger::config;
use colorledger::fee;
use colorledger::metrics;
use colorledger::pool::UtxoPoolManager;
use colorledger::storage;
use colorledger::tx::ColorId;
use colorledger::utxo::{KeyPurpose, UtxoStatus, WalletId};
use colorledger::wallet::{ColorFilter, LocalStoreWallet, UnspentFilter, WalletAdapter};

#[derive(Parser)]
#[command(author, version, about = "colorledger: local UTXO ledger inspector")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Register a wallet in the local store
    WalletCreate {
        #[arg(long)]
        wallet: String,
    },
    /// Derive a new key and print its address
    Address {
        #[arg(long)]
        wallet: String,
        /// receive, change, sponsor_pool or trackable
        #[arg(long, default_value = "receive")]
        purpose: String,
    },
    /// List unspent outputs, oldest first
    Utxos {
        #[arg(long)]
        wallet: String,
        /// Include outputs whose transaction is not yet in a block
        #[arg(long)]
        unconfirmed: bool,
    },
    Balance {
        #[arg(long)]
        wallet: String,
        /// Hex color id; native asset when omitted
        #[arg(long)]
        color: Option<String>,
        #[arg(long)]
        unconfirmed: bool,
    },
    /// Report the sponsor pool state
    PoolStatus,
    Timestamps,
    /// Print prometheus metrics
    Metrics,
}

fn parse_purpose(text: &str) -> anyhow::Result<KeyPurpose> {
    match text {
        "receive" => Ok(KeyPurpose::Receive),
        "change" => Ok(KeyPurpose::Change),
        "sponsor_pool" => Ok(KeyPurpose::SponsorPool),
        "trackable" => Ok(KeyPurpose::Trackable),
        other => anyhow::bail!("unknown key purpose '{other}'"),
    }
}

fn min_status(unconfirmed: bool) -> UtxoStatus {
    if unconfirmed {
        UtxoStatus::Unconfirmed
    } else {
        UtxoStatus::Finalized
    }
}

fn load_config(path: &str) -> anyhow::Result<config::Config> {
    const EMBEDDED_CONFIG: &str = include_str!("../config.toml");
    let cfg = match config::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(path, error = %e, "falling back to embedded configuration");
            config::load_from_str(EMBEDDED_CONFIG)?
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    let store = storage::open(&cfg.storage).context("opening ledger store")?;
    let wallet = Arc::new(LocalStoreWallet::offline(store.clone()));

    match cli.cmd {
        Cmd::WalletCreate { wallet: id } => {
            let record = wallet.create_wallet(&WalletId::new(id))?;
            println!("wallet {} (created at {})", record.id, record.created_at);
        }
        Cmd::Address { wallet: id, purpose } => {
            let address = wallet.new_address(&WalletId::new(id), parse_purpose(&purpose)?)?;
            println!("{}", hex::encode(address));
        }
        Cmd::Utxos { wallet: id, unconfirmed } => {
            let filter = UnspentFilter { color: ColorFilter::Any, min_status: min_status(unconfirmed) };
            for utxo in wallet.list_unspent(&WalletId::new(id), filter)? {
                let utxo = utxo?;
                let color = utxo.color_id.map_or_else(|| "native".to_string(), |c| c.to_string());
                println!("{} {:>12} {:?} {}", utxo.outpoint, utxo.value, utxo.status, color);
            }
        }
        Cmd::Balance { wallet: id, color, unconfirmed } => {
            let color = color.as_deref().map(ColorId::from_hex).transpose()?;
            let total = wallet
                .utxo_store()
                .sum_available(&WalletId::new(id), color.as_ref(), min_status(unconfirmed))?;
            println!("{total}");
        }
        Cmd::PoolStatus => {
            let manager = UtxoPoolManager::new(
                wallet.clone(),
                fee::estimator_from_config(&cfg.fee),
                ClaimRegistry::new(),
                &cfg.utxo_provider,
                cfg.wallet.use_unfinalized_utxo,
            )?;
            let report = manager.status()?;
            println!("status:             {}", report.status);
            println!("current size:       {}", report.current_size);
            println!("target size:        {}", report.target_size);
            println!("default value:      {}", report.default_value);
            println!("available value:    {}", report.available_value);
            println!("value to fill pool: {}", report.value_to_fill_pool);
        }
        Cmd::Timestamps => {
            for stamp in store.timestamps()? {
                let txid = stamp.txid.map_or_else(|| "-".to_string(), |t| t.to_string());
                println!(
                    "{:>6} {:<12} {:?} {} {}",
                    stamp.id,
                    stamp.status,
                    stamp.kind,
                    hex::encode(&stamp.content_hash),
                    txid
                );
            }
        }
        Cmd::Metrics => print!("{}", metrics::encode()?),
    }

    store.flush()?;
    Ok(())
}
