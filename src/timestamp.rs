//! Content-hash anchoring.
//!
//! A record starts as `Init`, becomes `Unconfirmed` once its transaction is
//! broadcast and `Confirmed` when the block syncer sees that transaction in a
//! block. Records never move backwards.

use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::builder::{BuildRequest, PaymentRequest, TransactionBuilder};
use crate::crypto;
use crate::error::{Error, Result};
use crate::storage::{now_secs, Store, CF_PENDING_TX, CF_TIMESTAMP, CF_TIMESTAMP_BY_TXID};
use crate::sync::TxStatus;
use crate::tx::{OutPoint, Txid};
use crate::utxo::{KeyPurpose, WalletId};
use crate::wallet::WalletAdapter;

/// Largest OP_RETURN payload relayed by standard nodes.
pub const MAX_PAYLOAD_LEN: usize = 80;
/// Value of the output that tracks a trackable timestamp.
pub const DEFAULT_TRACKABLE_VALUE: u64 = 600;

/// Index of the trackable output: payments come first, data carrier at 0.
const TRACKABLE_OUTPUT_INDEX: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestType {
    /// Content is already a digest and is anchored as given.
    None,
    Sha256,
    DoubleSha256,
}

impl DigestType {
    pub fn apply(self, content: &[u8]) -> Vec<u8> {
        match self {
            DigestType::None => content.to_vec(),
            DigestType::Sha256 => crypto::sha256(content).to_vec(),
            DigestType::DoubleSha256 => crypto::double_sha256(content).to_vec(),
        }
    }
}

impl FromStr for DigestType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(DigestType::None),
            "sha256" => Ok(DigestType::Sha256),
            "double_sha256" => Ok(DigestType::DoubleSha256),
            other => Err(Error::UnsupportedDigestType(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampStatus {
    Init,
    Unconfirmed,
    Confirmed,
}

impl fmt::Display for TimestampStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimestampStatus::Init => "init",
            TimestampStatus::Unconfirmed => "unconfirmed",
            TimestampStatus::Confirmed => "confirmed",
        };
        f.pad(label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampKind {
    Simple,
    Trackable,
    UpdatingTrackable,
}

impl FromStr for TimestampKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(TimestampKind::Simple),
            "trackable" => Ok(TimestampKind::Trackable),
            "updating_trackable" => Ok(TimestampKind::UpdatingTrackable),
            other => Err(Error::InvalidParameter(format!("unknown timestamp kind '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRecord {
    pub id: u64,
    pub wallet_id: WalletId,
    pub content_hash: Vec<u8>,
    pub digest: DigestType,
    pub prefix: Vec<u8>,
    pub kind: TimestampKind,
    pub status: TimestampStatus,
    pub txid: Option<Txid>,
    pub block_height: Option<u64>,
    pub block_time: Option<u64>,
    /// Output that carries the timestamp forward (trackable kinds).
    pub trackable_outpoint: Option<OutPoint>,
    /// Trackable output of the record this one updates.
    pub prev_outpoint: Option<OutPoint>,
    pub created_at: u64,
}

impl TimestampRecord {
    /// Bytes carried by the OP_RETURN output.
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = self.prefix.clone();
        payload.extend_from_slice(&self.content_hash);
        payload
    }

    pub fn mark_broadcast(&mut self, txid: Txid) -> Result<()> {
        if self.status != TimestampStatus::Init {
            return Err(Error::InvalidState(format!("timestamp {} is {}, expected init", self.id, self.status)));
        }
        self.status = TimestampStatus::Unconfirmed;
        self.txid = Some(txid);
        if self.kind != TimestampKind::Simple {
            self.trackable_outpoint = Some(OutPoint::new(txid, TRACKABLE_OUTPUT_INDEX));
        }
        Ok(())
    }

    pub fn confirm(&mut self, height: u64, time: u64) -> Result<()> {
        if self.status != TimestampStatus::Unconfirmed {
            return Err(Error::InvalidState(format!(
                "timestamp {} is {}, expected unconfirmed",
                self.id, self.status
            )));
        }
        self.status = TimestampStatus::Confirmed;
        self.block_height = Some(height);
        self.block_time = Some(time);
        Ok(())
    }
}

/// Shapes the transaction that anchors a timestamp.
pub trait TimestampTxBuilder: Send + Sync {
    fn request(&self, record: &TimestampRecord, adapter: &dyn WalletAdapter) -> Result<BuildRequest>;
}

/// A single data-carrier output.
pub struct Simple;

impl TimestampTxBuilder for Simple {
    fn request(&self, record: &TimestampRecord, _adapter: &dyn WalletAdapter) -> Result<BuildRequest> {
        Ok(BuildRequest::new(record.wallet_id.clone()).pay(PaymentRequest::data(&record.payload())))
    }
}

/// Data carrier plus an output back to the wallet that later updates can spend.
pub struct Trackable {
    pub value: u64,
}

impl TimestampTxBuilder for Trackable {
    fn request(&self, record: &TimestampRecord, adapter: &dyn WalletAdapter) -> Result<BuildRequest> {
        let address = adapter.new_address(&record.wallet_id, KeyPurpose::Trackable)?;
        Ok(Simple
            .request(record, adapter)?
            .pay(PaymentRequest::to_address(&address, self.value, None)))
    }
}

/// A trackable timestamp that also spends the previous trackable output.
pub struct UpdatingTrackable {
    pub value: u64,
}

impl TimestampTxBuilder for UpdatingTrackable {
    fn request(&self, record: &TimestampRecord, adapter: &dyn WalletAdapter) -> Result<BuildRequest> {
        let prev = record
            .prev_outpoint
            .ok_or_else(|| Error::InvalidParameter(format!("timestamp {} has nothing to update", record.id)))?;
        Ok(Trackable { value: self.value }.request(record, adapter)?.spend(prev))
    }
}

pub fn tx_builder_for(kind: TimestampKind, trackable_value: u64) -> Box<dyn TimestampTxBuilder> {
    match kind {
        TimestampKind::Simple => Box::new(Simple),
        TimestampKind::Trackable => Box::new(Trackable { value: trackable_value }),
        TimestampKind::UpdatingTrackable => Box::new(UpdatingTrackable { value: trackable_value }),
    }
}

pub struct NewTimestamp<'a> {
    pub wallet: WalletId,
    pub content: &'a [u8],
    pub digest: DigestType,
    pub prefix: &'a [u8],
    pub kind: TimestampKind,
    /// Record whose trackable output an updating timestamp spends.
    pub previous: Option<u64>,
}

pub struct TimestampService {
    store: Arc<Store>,
    builder: Arc<TransactionBuilder>,
    trackable_value: u64,
}

impl TimestampService {
    pub fn new(store: Arc<Store>, builder: Arc<TransactionBuilder>) -> Self {
        Self { store, builder, trackable_value: DEFAULT_TRACKABLE_VALUE }
    }

    pub fn with_trackable_value(mut self, value: u64) -> Self {
        self.trackable_value = value;
        self
    }

    /// Validates the request and stores an `Init` record.
    pub fn create(&self, new: NewTimestamp<'_>) -> Result<TimestampRecord> {
        if new.content.is_empty() {
            return Err(Error::InvalidParameter("timestamp content is empty".into()));
        }
        if self.store.get_wallet(&new.wallet)?.is_none() {
            return Err(Error::UnknownWallet(new.wallet));
        }
        let content_hash = new.digest.apply(new.content);
        if new.prefix.len() + content_hash.len() > MAX_PAYLOAD_LEN {
            return Err(Error::InvalidParameter(format!(
                "prefix and digest exceed {MAX_PAYLOAD_LEN} bytes"
            )));
        }

        let prev_outpoint = match (new.kind, new.previous) {
            (TimestampKind::UpdatingTrackable, Some(prev_id)) => {
                let prev = self
                    .store
                    .get_timestamp(prev_id)?
                    .ok_or_else(|| Error::InvalidParameter(format!("unknown timestamp {prev_id}")))?;
                let outpoint = prev.trackable_outpoint.ok_or_else(|| {
                    Error::InvalidParameter(format!("timestamp {prev_id} has no trackable output"))
                })?;
                Some(outpoint)
            }
            (TimestampKind::UpdatingTrackable, None) => {
                return Err(Error::InvalidParameter("updating timestamp needs a previous record".into()));
            }
            (_, _) => None,
        };

        let record = TimestampRecord {
            id: self.store.next_timestamp_id()?,
            wallet_id: new.wallet,
            content_hash,
            digest: new.digest,
            prefix: new.prefix.to_vec(),
            kind: new.kind,
            status: TimestampStatus::Init,
            txid: None,
            block_height: None,
            block_time: None,
            trackable_outpoint: None,
            prev_outpoint,
            created_at: now_secs(),
        };
        self.store.put_timestamp(&record)?;
        info!(id = record.id, kind = ?record.kind, "timestamp created");
        Ok(record)
    }

    /// Builds, signs and broadcasts the anchoring transaction, then moves the
    /// record to `Unconfirmed`.
    pub fn broadcast(&self, id: u64) -> Result<Txid> {
        let record = self
            .store
            .get_timestamp(id)?
            .ok_or_else(|| Error::InvalidParameter(format!("unknown timestamp {id}")))?;
        if record.status != TimestampStatus::Init {
            return Err(Error::InvalidState(format!("timestamp {id} is already {}", record.status)));
        }

        let request = tx_builder_for(record.kind, self.trackable_value)
            .request(&record, self.builder.adapter().as_ref())?;
        let built = self.builder.build(request)?;
        match self.builder.submit(built) {
            Ok(txid) => {
                self.record_broadcast(record, txid, true)?;
                info!(id, %txid, "timestamp broadcast");
                Ok(txid)
            }
            // the node has the transaction; keep its txid so block sync can confirm it
            Err(Error::LocalUpdateFailed { txid, source }) => {
                self.record_broadcast(record, txid, false)?;
                warn!(id, %txid, error = %source, "timestamp broadcast but not applied locally");
                Err(Error::LocalUpdateFailed { txid, source })
            }
            Err(err) => Err(err),
        }
    }

    /// Moves `record` to `Unconfirmed` under `txid` and indexes it for block
    /// sync. With `check_confirmed`, a transaction that a block sync already
    /// confirmed confirms the record at once.
    fn record_broadcast(&self, mut record: TimestampRecord, txid: Txid, check_confirmed: bool) -> Result<()> {
        record.mark_broadcast(txid)?;
        let id = record.id;

        let _guard = self.store.commit_guard();
        let mut batch = WriteBatch::default();
        let confirmed = if check_confirmed {
            match self.store.get_tx(&txid)?.map(|tx| tx.status) {
                Some(TxStatus::Confirmed { height, time }) => Some((height, time)),
                _ => None,
            }
        } else {
            None
        };
        match confirmed {
            // a block sync already went past this transaction
            Some((height, time)) => record.confirm(height, time)?,
            None => {
                let mut index_key = txid.as_bytes().to_vec();
                index_key.extend_from_slice(&id.to_be_bytes());
                self.store.stage_put(&mut batch, CF_TIMESTAMP_BY_TXID, &index_key, &id)?;
                self.store.stage_put(&mut batch, CF_PENDING_TX, txid.as_bytes(), &())?;
            }
        }
        self.store.stage_put(&mut batch, CF_TIMESTAMP, &id.to_be_bytes(), &record)?;
        self.store.write_batch(batch)
    }
}
