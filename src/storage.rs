use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::crypto::Address;
use crate::error::{Error, Result};
use crate::sync::TxRecord;
use crate::timestamp::TimestampRecord;
use crate::tx::Txid;
use crate::utxo::{KeyRecord, WalletId, WalletRecord};

pub const CF_META: &str = "meta";
pub const CF_WALLET: &str = "wallet";
pub const CF_KEY: &str = "key";
pub const CF_UTXO: &str = "utxo";
pub const CF_UTXO_OWNER: &str = "utxo_owner";
pub const CF_TX: &str = "tx";
pub const CF_PENDING_TX: &str = "pending_tx";
pub const CF_TIMESTAMP: &str = "timestamp";
pub const CF_TIMESTAMP_BY_TXID: &str = "timestamp_by_txid";

const META_UTXO_SEQ: &[u8] = b"utxo_seq";
const META_TIMESTAMP_SEQ: &[u8] = b"timestamp_seq";
const META_SYNC_HEIGHT: &[u8] = b"sync_height";

/// Transactional key-value store backing every ledger entity.
///
/// Single-row reads are lock-free. Any read-validate-write sequence must run
/// while holding [`Store::commit_guard`] and finish with one [`WriteBatch`],
/// which is what makes "remove spent + insert created" atomic for observers.
pub struct Store {
    pub db: DB,
    path: String,
    utxo_seq: AtomicU64,
    commit_lock: Mutex<()>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let cf_names = [
            "default",
            CF_META,
            CF_WALLET,
            CF_KEY,
            CF_UTXO,
            CF_UTXO_OWNER,
            CF_TX,
            CF_PENDING_TX,
            CF_TIMESTAMP,
            CF_TIMESTAMP_BY_TXID,
        ];

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(16 * 1024 * 1024);
        cf_opts.set_max_write_buffer_number(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(256);
        db_opts.set_keep_log_file_num(10);

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let store = Store {
            db,
            path: path.to_string(),
            utxo_seq: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
        };
        let next_seq = store.get::<u64>(CF_META, META_UTXO_SEQ)?.unwrap_or(0);
        store.utxo_seq.store(next_seq, Ordering::SeqCst);

        info!(path, next_seq, "ledger store opened");
        Ok(store)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or(Error::MissingColumnFamily(name))
    }

    pub fn put<T: Serialize>(&self, cf: &'static str, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)?;
        let handle = self.cf(cf)?;
        self.db.put_cf_opt(handle, key, data, &WriteOptions::default())?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, cf: &'static str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.cf(cf)?;
        match self.db.get_cf(handle, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, cf: &'static str, key: &[u8]) -> Result<bool> {
        let handle = self.cf(cf)?;
        Ok(self.db.get_pinned_cf(handle, key)?.is_some())
    }

    /// Serializes `value` into `batch` under `cf`/`key`.
    pub fn stage_put<T: Serialize>(&self, batch: &mut WriteBatch, cf: &'static str, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)?;
        batch.put_cf(self.cf(cf)?, key, data);
        Ok(())
    }

    pub fn stage_delete(&self, batch: &mut WriteBatch, cf: &'static str, key: &[u8]) -> Result<()> {
        batch.delete_cf(self.cf(cf)?, key);
        Ok(())
    }

    /// Atomically applies a set of writes.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Serializes read-validate-write sequences across threads.
    pub fn commit_guard(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Collects `(key, value)` pairs whose key starts with `prefix`.
    pub fn scan_prefix(&self, cf: &'static str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let handle = self.cf(cf)?;
        let iter = self.db.iterator_cf(handle, IteratorMode::From(prefix, Direction::Forward));
        let mut out = Vec::new();
        for item in iter {
            let (k, v) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k, v));
        }
        Ok(out)
    }

    /// Reserves the next insertion sequence and stages its persistence.
    pub(crate) fn reserve_utxo_seq(&self, batch: &mut WriteBatch) -> Result<u64> {
        let seq = self.utxo_seq.fetch_add(1, Ordering::SeqCst);
        self.stage_put(batch, CF_META, META_UTXO_SEQ, &(seq + 1))?;
        Ok(seq)
    }

    // ---------------------------------------------------------------------
    // Wallets and keys
    // ---------------------------------------------------------------------

    /// Registers `id`, returning the existing record if it is already known.
    pub fn create_wallet(&self, id: &WalletId) -> Result<WalletRecord> {
        let _guard = self.commit_guard();
        if let Some(existing) = self.get::<WalletRecord>(CF_WALLET, id.as_str().as_bytes())? {
            return Ok(existing);
        }
        let record = WalletRecord { id: id.clone(), created_at: now_secs() };
        self.put(CF_WALLET, id.as_str().as_bytes(), &record)?;
        debug!(wallet = %id, "wallet created");
        Ok(record)
    }

    pub fn get_wallet(&self, id: &WalletId) -> Result<Option<WalletRecord>> {
        self.get(CF_WALLET, id.as_str().as_bytes())
    }

    pub fn wallets(&self) -> Result<Vec<WalletRecord>> {
        let handle = self.cf(CF_WALLET)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (_k, v) = item?;
            out.push(bincode::deserialize(&v)?);
        }
        Ok(out)
    }

    pub fn put_key(&self, record: &KeyRecord) -> Result<()> {
        if self.get_wallet(&record.wallet_id)?.is_none() {
            return Err(Error::UnknownWallet(record.wallet_id.clone()));
        }
        self.put(CF_KEY, &record.address, record)
    }

    pub fn get_key(&self, address: &Address) -> Result<Option<KeyRecord>> {
        self.get(CF_KEY, address)
    }

    pub fn keys_for_wallet(&self, id: &WalletId) -> Result<Vec<KeyRecord>> {
        let handle = self.cf(CF_KEY)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (_k, v) = item?;
            let record: KeyRecord = bincode::deserialize(&v)?;
            if &record.wallet_id == id {
                out.push(record);
            }
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Transaction tracking
    // ---------------------------------------------------------------------

    pub fn get_tx(&self, txid: &Txid) -> Result<Option<TxRecord>> {
        self.get(CF_TX, txid.as_bytes())
    }

    /// Transactions still awaiting a block.
    pub fn pending_txids(&self) -> Result<Vec<Txid>> {
        let handle = self.cf(CF_PENDING_TX)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (k, _v) = item?;
            if k.len() == 32 {
                let mut txid = [0u8; 32];
                txid.copy_from_slice(&k);
                out.push(Txid(txid));
            }
        }
        Ok(out)
    }

    pub fn sync_height(&self) -> Result<Option<u64>> {
        self.get(CF_META, META_SYNC_HEIGHT)
    }

    pub(crate) fn stage_sync_height(&self, batch: &mut WriteBatch, height: u64) -> Result<()> {
        let current = self.sync_height()?.unwrap_or(0);
        self.stage_put(batch, CF_META, META_SYNC_HEIGHT, &current.max(height))
    }

    // ---------------------------------------------------------------------
    // Timestamps
    // ---------------------------------------------------------------------

    pub fn next_timestamp_id(&self) -> Result<u64> {
        let _guard = self.commit_guard();
        let id = self.get::<u64>(CF_META, META_TIMESTAMP_SEQ)?.unwrap_or(1);
        self.put(CF_META, META_TIMESTAMP_SEQ, &(id + 1))?;
        Ok(id)
    }

    pub fn put_timestamp(&self, record: &TimestampRecord) -> Result<()> {
        self.put(CF_TIMESTAMP, &record.id.to_be_bytes(), record)
    }

    pub fn get_timestamp(&self, id: u64) -> Result<Option<TimestampRecord>> {
        self.get(CF_TIMESTAMP, &id.to_be_bytes())
    }

    pub fn timestamps(&self) -> Result<Vec<TimestampRecord>> {
        let handle = self.cf(CF_TIMESTAMP)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (_k, v) = item?;
            out.push(bincode::deserialize(&v)?);
        }
        Ok(out)
    }

    /// Force flush all memtables to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub fn open(cfg: &crate::config::Storage) -> Result<Arc<Store>> {
    std::fs::create_dir_all(&cfg.path)
        .map_err(|e| Error::InvalidConfig(format!("cannot create storage dir '{}': {e}", cfg.path)))?;
    Ok(Arc::new(Store::open(&cfg.path)?))
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
