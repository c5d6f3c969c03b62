// Shared harness: a TempDir-backed store, a scripted node and funding helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use colorledger::{
    claims::ClaimRegistry,
    config::UtxoProvider,
    crypto::Address,
    fee::{FeeEstimator, FeePolicy, Fixed},
    node::{NodeClient, NodeError, NodeUnspent},
    pool::UtxoPoolManager,
    storage::{Store, CF_TX},
    sync::BlockSyncer,
    tx::{Block, ColorId, ColorKind, OutPoint, Script, Transaction, Txid},
    utxo::{KeyPurpose, Utxo, UtxoStatus, WalletId},
    utxo_store::UtxoStore,
    wallet::{LocalStoreWallet, WalletAdapter},
    TransactionBuilder,
};

pub const SPONSOR: &str = "utxo_provider";

/// Node stand-in: records broadcasts, serves scripted blocks and unspent lists.
pub struct MockNode {
    pub broadcasts: Mutex<Vec<Transaction>>,
    pub blocks: Mutex<Vec<Block>>,
    pub unspent: Mutex<HashMap<String, Vec<NodeUnspent>>>,
    pub fail_broadcast: AtomicBool,
    pub fail_queries: AtomicBool,
    /// Runs after a broadcast is accepted, before the wallet applies it locally.
    pub on_broadcast: Mutex<Option<Box<dyn Fn(&Transaction) + Send + Sync>>>,
    next_address: AtomicU64,
}

impl MockNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            broadcasts: Mutex::new(Vec::new()),
            blocks: Mutex::new(vec![Block { height: 0, time: 1_600_000_000, transactions: Vec::new() }]),
            unspent: Mutex::new(HashMap::new()),
            fail_broadcast: AtomicBool::new(false),
            fail_queries: AtomicBool::new(false),
            on_broadcast: Mutex::new(None),
            next_address: AtomicU64::new(1),
        })
    }

    /// Appends a block holding `transactions` and returns it.
    pub fn mine(&self, transactions: Vec<Transaction>) -> Block {
        let mut blocks = self.blocks.lock().unwrap();
        let height = blocks.len() as u64;
        let block = Block { height, time: 1_600_000_000 + height * 600, transactions };
        blocks.push(block.clone());
        block
    }

    /// Mines every broadcast transaction not yet in a block.
    pub fn mine_pending(&self) -> Block {
        let pending: Vec<Transaction> = self.broadcasts.lock().unwrap().drain(..).collect();
        self.mine(pending)
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    pub fn last_broadcast(&self) -> Option<Transaction> {
        self.broadcasts.lock().unwrap().last().cloned()
    }

    fn check_queries(&self) -> Result<(), NodeError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(NodeError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

impl NodeClient for MockNode {
    fn list_unspent(&self, wallet: &str) -> Result<Vec<NodeUnspent>, NodeError> {
        self.check_queries()?;
        Ok(self.unspent.lock().unwrap().get(wallet).cloned().unwrap_or_default())
    }

    fn get_new_address(&self, _wallet: &str, _label: &str) -> Result<Address, NodeError> {
        self.check_queries()?;
        let n = self.next_address.fetch_add(1, Ordering::SeqCst);
        Ok(*blake3::hash(&n.to_le_bytes()).as_bytes())
    }

    fn sign(&self, tx: &Transaction) -> Result<Transaction, NodeError> {
        self.check_queries()?;
        let mut signed = tx.clone();
        for input in &mut signed.inputs {
            input.script_sig = vec![0xaa; colorledger::crypto::SCRIPT_SIG_LEN];
        }
        Ok(signed)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, NodeError> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(NodeError::Rejected { code: -26, message: "txn-mempool-conflict".into() });
        }
        self.broadcasts.lock().unwrap().push(tx.clone());
        if let Some(hook) = self.on_broadcast.lock().unwrap().as_ref() {
            hook(tx);
        }
        Ok(tx.txid())
    }

    fn block_count(&self) -> Result<u64, NodeError> {
        self.check_queries()?;
        Ok(self.blocks.lock().unwrap().len() as u64 - 1)
    }

    fn block_at(&self, height: u64) -> Result<Block, NodeError> {
        self.check_queries()?;
        self.blocks
            .lock()
            .unwrap()
            .get(height as usize)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(format!("block {height}")))
    }
}

pub struct TestEnv {
    _dir: TempDir,
    pub store: Arc<Store>,
    pub node: Arc<MockNode>,
    pub wallet: Arc<LocalStoreWallet>,
    pub claims: Arc<ClaimRegistry>,
    next_txid: AtomicU64,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = dir.path().join("ledger_db");
        let store = Arc::new(Store::open(db_path.to_str().unwrap()).expect("Failed to open store"));
        let node = MockNode::new();
        let wallet = Arc::new(LocalStoreWallet::new(store.clone(), node.clone()));
        Self {
            _dir: dir,
            store,
            node,
            wallet,
            claims: ClaimRegistry::new(),
            next_txid: AtomicU64::new(1),
        }
    }

    pub fn utxos(&self) -> UtxoStore {
        UtxoStore::new(self.store.clone())
    }

    pub fn create_wallet(&self, name: &str) -> WalletId {
        let id = WalletId::from(name);
        self.wallet.create_wallet(&id).expect("Failed to create wallet");
        id
    }

    pub fn fresh_txid(&self) -> Txid {
        let n = self.next_txid.fetch_add(1, Ordering::SeqCst);
        Txid(*blake3::hash(&n.to_be_bytes()).as_bytes())
    }

    /// Inserts one output per value, each from its own funding transaction, oldest first.
    pub fn fund_with(
        &self,
        owner: &WalletId,
        values: &[u64],
        color: Option<ColorId>,
        purpose: KeyPurpose,
        status: UtxoStatus,
    ) -> Vec<Utxo> {
        let store = self.utxos();
        values
            .iter()
            .map(|&value| {
                let address = self.wallet.new_address(owner, purpose).expect("Failed to derive address");
                let utxo = Utxo::new(
                    OutPoint::new(self.fresh_txid(), 0),
                    Script::pay_to_with_color(color.as_ref(), &address),
                    value,
                    address,
                    status,
                );
                store.put(utxo.clone()).expect("Failed to store funding utxo");
                utxo
            })
            .collect()
    }

    pub fn fund(&self, owner: &WalletId, values: &[u64]) -> Vec<Utxo> {
        self.fund_with(owner, values, None, KeyPurpose::Receive, UtxoStatus::Finalized)
    }

    /// Makes every later local update after a broadcast fail: the node accepts
    /// the transaction, then an unreadable row lands where its record goes.
    pub fn break_local_sync(&self) {
        let store = self.store.clone();
        let hook: Box<dyn Fn(&Transaction) + Send + Sync> = Box::new(move |tx: &Transaction| {
            let cf = store.db.cf_handle(CF_TX).expect("tx column family");
            store.db.put_cf(cf, tx.txid().as_bytes(), [0xffu8]).expect("Failed to corrupt tx row");
        });
        *self.node.on_broadcast.lock().unwrap() = Some(hook);
    }

    pub fn builder(&self, policy: FeePolicy) -> TransactionBuilder {
        TransactionBuilder::new(self.wallet.clone(), policy, self.claims.clone(), false)
    }

    pub fn fixed_builder(&self, fee: u64) -> TransactionBuilder {
        self.builder(FeePolicy::new(Arc::new(Fixed::new(fee)), false))
    }

    pub fn pool(&self, estimator: Arc<dyn FeeEstimator>, default_value: u64, pool_size: usize) -> Arc<UtxoPoolManager> {
        let provider = UtxoProvider {
            enabled: true,
            wallet: SPONSOR.to_string(),
            default_value,
            utxo_pool_size: pool_size,
        };
        Arc::new(
            UtxoPoolManager::new(self.wallet.clone(), estimator, self.claims.clone(), &provider, false)
                .expect("Failed to create pool manager"),
        )
    }

    pub fn block_syncer(&self) -> BlockSyncer {
        BlockSyncer::new(self.store.clone())
    }

    pub fn balance(&self, owner: &WalletId, color: Option<&ColorId>) -> u64 {
        self.utxos()
            .sum_available(owner, color, UtxoStatus::Unconfirmed)
            .expect("Failed to sum balance")
    }

    pub fn outpoints(&self, owner: &WalletId) -> Vec<OutPoint> {
        let filter = colorledger::wallet::UnspentFilter {
            color: colorledger::wallet::ColorFilter::Any,
            min_status: UtxoStatus::Unconfirmed,
        };
        self.wallet
            .list_unspent(owner, filter)
            .expect("Failed to list")
            .map(|u| u.expect("Failed to read utxo").outpoint)
            .collect()
    }
}

pub fn color(tag: u8) -> ColorId {
    ColorId::new(ColorKind::Reissuable, [tag; 32])
}

pub fn external_address(tag: u8) -> Address {
    [tag; 32]
}
