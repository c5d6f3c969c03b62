// Fee strategy tests against real transaction shapes

use colorledger::{
    config,
    fee::{self, Auto, FeeEstimator, FeePolicy, Fixed},
    tx::{ColorId, ColorKind, OutPoint, Script, Transaction, TxIn, TxOut, Txid},
};
use proptest::prelude::*;
use std::sync::Arc;

fn draft(inputs: usize, plain_outputs: usize, colored_outputs: usize) -> Transaction {
    let mut tx = Transaction::default();
    for i in 0..inputs {
        tx.inputs.push(TxIn::unsigned(OutPoint::new(Txid([i as u8; 32]), i as u32)));
    }
    for i in 0..plain_outputs {
        tx.outputs.push(TxOut::new(1_000 + i as u64, Script::pay_to(&[i as u8; 32])));
    }
    let color = ColorId::new(ColorKind::NonReissuable, [4; 32]);
    for i in 0..colored_outputs {
        tx.outputs.push(TxOut::new(10, Script::colored_pay_to(&color, &[i as u8; 32])));
    }
    tx
}

#[test]
fn test_fixed_ignores_shape() {
    let fixed = Fixed::default();
    assert_eq!(fixed.estimate(&draft(0, 0, 0)), 10_000);
    assert_eq!(fixed.estimate(&draft(30, 12, 3)), 10_000);
}

#[test]
fn test_auto_charges_signed_size() {
    let tx = draft(2, 2, 0);
    let auto = Auto::default();
    // default rate is one unit per byte
    assert_eq!(auto.estimate(&tx), tx.estimated_size() as u64);
    assert!(tx.estimated_size() > tx.serialized_size(), "Unsigned inputs are priced as signed");
}

#[test]
fn test_auto_fee_grows_with_inputs() {
    let auto = Auto::new(100);
    let small = auto.estimate(&draft(1, 2, 0));
    let large = auto.estimate(&draft(5, 2, 0));
    assert!(large > small);
}

#[test]
fn test_estimator_follows_config() {
    let fixed = config::Fee { strategy: config::FeeStrategy::Fixed, fee_rate: 1, fixed_fee: 777 };
    assert_eq!(fee::estimator_from_config(&fixed).estimate(&draft(3, 3, 0)), 777);

    let auto = config::Fee { strategy: config::FeeStrategy::Auto, fee_rate: 1_000, fixed_fee: 777 };
    let tx = draft(1, 1, 0);
    assert_eq!(fee::estimator_from_config(&auto).estimate(&tx), tx.estimated_size() as u64);
}

#[test]
fn test_sponsor_override_applies_to_both_strategies() {
    let tx = draft(2, 1, 1);
    for estimator in [Arc::new(Fixed::default()) as Arc<dyn FeeEstimator>, Arc::new(Auto::default()) as Arc<dyn FeeEstimator>] {
        let policy = FeePolicy::new(estimator.clone(), true);
        assert_eq!(policy.payer_fee(&tx), 0);
        assert_eq!(policy.network_fee(&tx), estimator.estimate(&tx));
    }
}

proptest! {
    #[test]
    fn colored_drafts_pay_strictly_above_size_fee(
        inputs in 0usize..8,
        plain in 0usize..6,
        colored in 1usize..4,
        rate in 1u64..5_000,
    ) {
        let tx = draft(inputs, plain, colored);
        let size = tx.estimated_size() as u64;
        let size_fee = (size * rate + 999) / 1000;
        prop_assert!(Auto::new(rate).estimate(&tx) >= size_fee + 1);
    }

    #[test]
    fn plain_drafts_pay_exactly_size_fee(
        inputs in 0usize..8,
        plain in 0usize..6,
        rate in 1u64..5_000,
    ) {
        let tx = draft(inputs, plain, 0);
        let size = tx.estimated_size() as u64;
        prop_assert_eq!(Auto::new(rate).estimate(&tx), (size * rate + 999) / 1000);
    }
}
