// Library interface for the colorledger wallet engine
// Tests and embedding services use the components directly; the binary is a thin inspector.

pub mod config;
pub mod error;
pub mod crypto;
pub mod tx;
pub mod utxo;
pub mod storage;
pub mod utxo_store;
pub mod claims;
pub mod fee;
pub mod wallet;
pub mod node;
pub mod builder;
pub mod pool;
pub mod sync;
pub mod timestamp;
pub mod scheduler;
pub mod metrics;

pub use builder::{BuildRequest, BuiltTransaction, PaymentRequest, TransactionBuilder};
pub use claims::{Claim, ClaimRegistry};
pub use crypto::{address_from_pk, Address};
pub use error::{Error, Result};
pub use fee::{Auto, FeeEstimator, FeePolicy, Fixed};
pub use node::{NodeClient, NodeError, NodeUnspent, RemoteNodeWallet};
pub use pool::{PoolReport, PoolStatus, UtxoPoolManager};
pub use storage::Store;
pub use sync::{BlockSyncer, TxSyncer};
pub use timestamp::{DigestType, TimestampRecord, TimestampService, TimestampStatus};
pub use tx::{Block, ColorId, OutPoint, Script, Transaction, Txid};
pub use utxo::{KeyPurpose, Utxo, UtxoStatus, WalletId};
pub use utxo_store::UtxoStore;
pub use wallet::{ColorFilter, LocalStoreWallet, UnspentFilter, WalletAdapter};
