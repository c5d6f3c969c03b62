use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::Address;
use crate::tx::{ColorId, OutPoint, Script, Txid};

/// Confirmation state of a tracked output. Ordered so that
/// `status >= min_status` reads as "at least as safe as".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UtxoStatus {
    Unconfirmed,
    Finalized,
}

impl UtxoStatus {
    pub fn satisfies(self, min_status: UtxoStatus) -> bool {
        self >= min_status
    }
}

/// An unspent output owned by one of the wallet's keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub script: Script,
    pub value: u64,
    pub color_id: Option<ColorId>,
    pub owning_key: Address,
    pub status: UtxoStatus,
}

impl Utxo {
    /// Builds the record for output `index` of `txid`, taking the color from the script.
    pub fn new(outpoint: OutPoint, script: Script, value: u64, owning_key: Address, status: UtxoStatus) -> Self {
        let color_id = script.color_id();
        Self { outpoint, script, value, color_id, owning_key, status }
    }

    pub fn txid(&self) -> Txid {
        self.outpoint.txid
    }

    pub fn index(&self) -> u32 {
        self.outpoint.index
    }

    pub fn is_native(&self) -> bool {
        self.color_id.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyPurpose {
    Receive,
    Change,
    SponsorPool,
    /// Carries a trackable timestamp forward. Only spent when named explicitly.
    Trackable,
}

impl KeyPurpose {
    /// Whether outputs paying this key may be drawn by automatic coin selection.
    pub fn is_selectable(self) -> bool {
        self != KeyPurpose::Trackable
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KeyPurpose::Receive => "receive",
            KeyPurpose::Change => "change",
            KeyPurpose::SponsorPool => "sponsor_pool",
            KeyPurpose::Trackable => "trackable",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalletId(pub String);

impl WalletId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed-width form used as a storage key prefix.
    pub fn key_prefix(&self) -> [u8; 32] {
        crate::crypto::blake3_hash(self.0.as_bytes())
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WalletId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A signing key tracked by the ledger. Never mutated after creation.
/// `secret_key` is present only when the local store is the keystore.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub address: Address,
    pub wallet_id: WalletId,
    pub purpose: KeyPurpose,
    pub public_key: [u8; 32],
    pub secret_key: Option<[u8; 32]>,
    pub created_at: u64,
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("address", &hex::encode(self.address))
            .field("wallet_id", &self.wallet_id)
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub id: WalletId,
    pub created_at: u64,
}
