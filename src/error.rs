//! Error taxonomy shared by the store, builders, pool manager and syncers.

use thiserror::Error;

use crate::node::NodeError;
use crate::tx::{ColorId, OutPoint, Txid};
use crate::utxo::WalletId;

#[derive(Error, Debug)]
pub enum Error {
    /// An output with the same (txid, index) is already tracked.
    #[error("utxo {0} already exists")]
    DuplicateUtxo(OutPoint),

    #[error(
        "insufficient funds for {}: required {required}, available {available}",
        asset_name(.color)
    )]
    InsufficientFunds {
        color: Option<ColorId>,
        required: u64,
        available: u64,
    },

    #[error("unsupported digest type: {0}")]
    UnsupportedDigestType(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("node communication error: {0}")]
    NodeCommunication(#[from] NodeError),

    /// The outpoint is held by another in-flight build.
    #[error("utxo {0} is claimed by another transaction")]
    Conflict(OutPoint),

    #[error("unknown wallet: {0}")]
    UnknownWallet(WalletId),

    #[error("unknown key {0}")]
    UnknownKey(String),

    #[error("no signing key for input {index}")]
    MissingKey { index: usize },

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    /// The node accepted the transaction but the local store could not record it.
    #[error("transaction {txid} was broadcast but the local update failed: {source}")]
    LocalUpdateFailed {
        txid: Txid,
        #[source]
        source: Box<Error>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("column family '{0}' missing")]
    MissingColumnFamily(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

fn asset_name(color: &Option<ColorId>) -> String {
    match color {
        Some(color) => format!("color {color}"),
        None => "native asset".to_string(),
    }
}
