//! Node interface and the node-backed wallet adapter.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto::Address;
use crate::error::Result;
use crate::tx::{Block, ColorId, OutPoint, Script, Transaction, Txid};
use crate::utxo::{KeyPurpose, Utxo, UtxoStatus, WalletId};
use crate::wallet::{UnspentFilter, UtxoIter, WalletAdapter};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("node rejected request ({code}): {message}")]
    Rejected { code: i32, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no node configured")]
    Unavailable,
}

/// Unspent output as reported by the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeUnspent {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script: Script,
    pub color_id: Option<ColorId>,
    pub finalized: bool,
}

/// Blockchain query/broadcast interface. Every call may fail with a
/// [`NodeError`]; callers must not assume `broadcast` is idempotent.
pub trait NodeClient: Send + Sync {
    fn list_unspent(&self, wallet: &str) -> std::result::Result<Vec<NodeUnspent>, NodeError>;
    fn get_new_address(&self, wallet: &str, label: &str) -> std::result::Result<Address, NodeError>;
    fn sign(&self, tx: &Transaction) -> std::result::Result<Transaction, NodeError>;
    fn broadcast(&self, tx: &Transaction) -> std::result::Result<Txid, NodeError>;
    fn block_count(&self) -> std::result::Result<u64, NodeError>;
    fn block_at(&self, height: u64) -> std::result::Result<Block, NodeError>;
}

/// Adapter for wallets whose keys live in the node's own keystore.
pub struct RemoteNodeWallet {
    node: Arc<dyn NodeClient>,
}

impl RemoteNodeWallet {
    pub fn new(node: Arc<dyn NodeClient>) -> Self {
        Self { node }
    }
}

impl WalletAdapter for RemoteNodeWallet {
    fn list_unspent<'a>(&'a self, owner: &WalletId, filter: UnspentFilter) -> Result<UtxoIter<'a>> {
        let unspent = self.node.list_unspent(owner.as_str())?;
        debug!(wallet = %owner, count = unspent.len(), "node listed unspent outputs");
        let utxos: Vec<Utxo> = unspent
            .into_iter()
            .map(|u| Utxo {
                outpoint: u.outpoint,
                owning_key: u.script.address().unwrap_or_default(),
                script: u.script,
                value: u.value,
                color_id: u.color_id,
                status: if u.finalized { UtxoStatus::Finalized } else { UtxoStatus::Unconfirmed },
            })
            .filter(|u| filter.admits(u))
            .collect();
        Ok(Box::new(utxos.into_iter().map(Ok)))
    }

    fn new_address(&self, owner: &WalletId, purpose: KeyPurpose) -> Result<Address> {
        Ok(self.node.get_new_address(owner.as_str(), &purpose.to_string())?)
    }

    fn sign(&self, tx: Transaction, _prevouts: &[Utxo]) -> Result<Transaction> {
        Ok(self.node.sign(&tx)?)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let txid = self.node.broadcast(tx)?;
        info!(%txid, "transaction broadcast through node wallet");
        Ok(txid)
    }
}
