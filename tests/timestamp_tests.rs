// Timestamp lifecycle tests: init -> unconfirmed -> confirmed through the real builder and syncer

mod common;

use colorledger::{
    builder::{BuildRequest, PaymentRequest},
    error::Error,
    timestamp::{DigestType, NewTimestamp, TimestampKind, TimestampService, TimestampStatus},
    tx::OutPoint,
    utxo::WalletId,
};
use common::{external_address, TestEnv};
use std::sync::Arc;

fn service(env: &TestEnv) -> TimestampService {
    TimestampService::new(env.store.clone(), Arc::new(env.fixed_builder(1_000)))
}

fn stamp<'a>(wallet: &WalletId, content: &'a [u8], kind: TimestampKind, previous: Option<u64>) -> NewTimestamp<'a> {
    NewTimestamp {
        wallet: wallet.clone(),
        content,
        digest: DigestType::Sha256,
        prefix: b"app",
        kind,
        previous,
    }
}

#[tokio::test]
async fn test_simple_timestamp_lifecycle() {
    let env = TestEnv::new();
    let alice = env.create_wallet("alice");
    env.fund(&alice, &[10_000]);
    let service = service(&env);

    let record = service.create(stamp(&alice, b"hello world", TimestampKind::Simple, None)).unwrap();
    assert_eq!(record.status, TimestampStatus::Init);
    assert_eq!(record.content_hash, colorledger::crypto::sha256(b"hello world").to_vec());

    let txid = service.broadcast(record.id).unwrap();
    let stored = env.store.get_timestamp(record.id).unwrap().unwrap();
    assert_eq!(stored.status, TimestampStatus::Unconfirmed);
    assert_eq!(stored.txid, Some(txid));

    let tx = env.node.last_broadcast().unwrap();
    assert!(tx.outputs[0].script.is_op_return());
    assert!(tx.outputs[0].script.0.ends_with(&stored.payload()));

    let block = env.node.mine_pending();
    let outcome = env.block_syncer().apply_block(&block).unwrap();
    assert_eq!(outcome.confirmed_timestamps, vec![record.id]);

    let confirmed = env.store.get_timestamp(record.id).unwrap().unwrap();
    assert_eq!(confirmed.status, TimestampStatus::Confirmed);
    assert_eq!(confirmed.block_height, Some(block.height));
    assert_eq!(confirmed.block_time, Some(block.time));

    let replay = env.block_syncer().apply_block(&block).unwrap();
    assert!(replay.confirmed_timestamps.is_empty());
}

#[tokio::test]
async fn test_broadcast_only_from_init() {
    let env = TestEnv::new();
    let alice = env.create_wallet("alice");
    env.fund(&alice, &[10_000]);
    let service = service(&env);

    let record = service.create(stamp(&alice, b"once", TimestampKind::Simple, None)).unwrap();
    service.broadcast(record.id).unwrap();
    assert!(matches!(service.broadcast(record.id), Err(Error::InvalidState(_))));
    assert_eq!(env.node.broadcast_count(), 1);
}

#[tokio::test]
async fn test_failed_build_keeps_record_in_init() {
    let env = TestEnv::new();
    let alice = env.create_wallet("alice");
    let service = service(&env);

    let record = service.create(stamp(&alice, b"no funds", TimestampKind::Simple, None)).unwrap();
    assert!(matches!(service.broadcast(record.id), Err(Error::InsufficientFunds { .. })));
    let stored = env.store.get_timestamp(record.id).unwrap().unwrap();
    assert_eq!(stored.status, TimestampStatus::Init);
    assert!(stored.txid.is_none());
}

#[tokio::test]
async fn test_trackable_chain_spends_previous_output() {
    let env = TestEnv::new();
    let alice = env.create_wallet("alice");
    env.fund(&alice, &[10_000]);
    let service = service(&env);

    let first = service.create(stamp(&alice, b"v1", TimestampKind::Trackable, None)).unwrap();
    let first_txid = service.broadcast(first.id).unwrap();
    let first = env.store.get_timestamp(first.id).unwrap().unwrap();
    let tracked = OutPoint::new(first_txid, 1);
    assert_eq!(first.trackable_outpoint, Some(tracked));
    let tracked_utxo = env.utxos().get(&tracked).unwrap().expect("Trackable output belongs to the wallet");
    assert_eq!(tracked_utxo.value, colorledger::timestamp::DEFAULT_TRACKABLE_VALUE);

    let block = env.node.mine_pending();
    env.block_syncer().apply_block(&block).unwrap();

    let second = service
        .create(stamp(&alice, b"v2", TimestampKind::UpdatingTrackable, Some(first.id)))
        .unwrap();
    assert_eq!(second.prev_outpoint, Some(tracked));
    let second_txid = service.broadcast(second.id).unwrap();

    let tx = env.node.last_broadcast().unwrap();
    assert_eq!(tx.txid(), second_txid);
    assert_eq!(tx.inputs[0].prev_out, tracked, "Previous trackable output is spent first");
    assert!(env.utxos().get(&tracked).unwrap().is_none());
    assert!(env.utxos().get(&OutPoint::new(second_txid, 1)).unwrap().is_some());
}

#[tokio::test]
async fn test_trackable_output_is_not_spent_by_payments() {
    let env = TestEnv::new();
    let alice = env.create_wallet("alice");
    env.fund(&alice, &[10_000]);
    let service = service(&env);

    let first = service.create(stamp(&alice, b"v1", TimestampKind::Trackable, None)).unwrap();
    let first_txid = service.broadcast(first.id).unwrap();
    let tracked = OutPoint::new(first_txid, 1);
    let block = env.node.mine_pending();
    env.block_syncer().apply_block(&block).unwrap();

    let payment = PaymentRequest::to_address(&external_address(0xee), 100, None);
    let built = env.fixed_builder(100).build(BuildRequest::new(alice.clone()).pay(payment)).unwrap();
    assert!(built.transaction.inputs.iter().all(|input| input.prev_out != tracked));
    env.fixed_builder(100).submit(built).unwrap();
    assert!(env.utxos().get(&tracked).unwrap().is_some());
    let block = env.node.mine_pending();
    env.block_syncer().apply_block(&block).unwrap();

    let second = service
        .create(stamp(&alice, b"v2", TimestampKind::UpdatingTrackable, Some(first.id)))
        .unwrap();
    service.broadcast(second.id).unwrap();
    assert_eq!(env.node.last_broadcast().unwrap().inputs[0].prev_out, tracked);
    assert!(env.utxos().get(&tracked).unwrap().is_none());
}

#[tokio::test]
async fn test_local_update_failure_still_records_broadcast() {
    let env = TestEnv::new();
    let alice = env.create_wallet("alice");
    env.fund(&alice, &[10_000]);
    let service = service(&env);

    let record = service.create(stamp(&alice, b"sent anyway", TimestampKind::Simple, None)).unwrap();
    env.break_local_sync();
    let err = service.broadcast(record.id).unwrap_err();
    let sent = env.node.last_broadcast().unwrap().txid();
    assert!(matches!(err, Error::LocalUpdateFailed { txid, .. } if txid == sent));

    let stored = env.store.get_timestamp(record.id).unwrap().unwrap();
    assert_eq!(stored.status, TimestampStatus::Unconfirmed);
    assert_eq!(stored.txid, Some(sent));
    assert!(env.store.pending_txids().unwrap().contains(&sent));
    assert!(matches!(service.broadcast(record.id), Err(Error::InvalidState(_))));
    assert_eq!(env.node.broadcast_count(), 1);
}

#[tokio::test]
async fn test_create_validates_input() {
    let env = TestEnv::new();
    let alice = env.create_wallet("alice");
    let service = service(&env);

    assert!(matches!(
        "md5".parse::<DigestType>(),
        Err(Error::UnsupportedDigestType(_))
    ));

    let err = service
        .create(stamp(&alice, b"x", TimestampKind::UpdatingTrackable, None))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));

    let mut long = stamp(&alice, b"x", TimestampKind::Simple, None);
    let prefix = [b'p'; 60];
    long.prefix = &prefix;
    assert!(matches!(service.create(long), Err(Error::InvalidParameter(_))));

    let err = service
        .create(stamp(&WalletId::from("nobody"), b"x", TimestampKind::Simple, None))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownWallet(_)));

    let simple = service.create(stamp(&alice, b"plain", TimestampKind::Simple, None)).unwrap();
    let err = service
        .create(stamp(&alice, b"x", TimestampKind::UpdatingTrackable, Some(simple.id)))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)), "Simple stamps cannot be updated");
}
