//! Transaction model shared by the builder, the syncers and the node interface.
//!
//! Colors live inside output scripts: a colored output is
//! `<color-id> OP_COLOR <pay-to-address>`, an uncolored one is just the
//! pay-to-address part. The transaction id is malleability-fixed: it hashes the
//! transaction with every scriptSig blanked, so signing never changes it.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::collections::HashSet;
use std::fmt;

use crate::crypto::{Address, SCRIPT_SIG_LEN};
use crate::error::{Error, Result};

pub const COLOR_ID_LEN: usize = 33;

const OP_DUP: u8 = 0x76;
const OP_RETURN: u8 = 0x6a;
const OP_COLOR: u8 = 0xbc;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const PUSH_32: u8 = 0x20;
const PUSH_33: u8 = 0x21;

const PAY_TO_LEN: usize = 2 + 32;
const COLOR_PREFIX_LEN: usize = 1 + COLOR_ID_LEN + 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Txid(pub [u8; 32]);

impl Txid {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txid({self})")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub index: u32,
}

impl OutPoint {
    pub const KEY_LEN: usize = 36;

    pub fn new(txid: Txid, index: u32) -> Self {
        Self { txid, index }
    }

    /// Storage key: txid followed by the big-endian index, so outputs of one
    /// transaction are adjacent.
    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        let mut key = [0u8; Self::KEY_LEN];
        key[..32].copy_from_slice(&self.txid.0);
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != Self::KEY_LEN {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&key[..32]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&key[32..]);
        Some(Self { txid: Txid(txid), index: u32::from_be_bytes(index) })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ColorKind {
    Reissuable = 0xc1,
    NonReissuable = 0xc2,
    Nft = 0xc3,
}

impl ColorKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0xc1 => Some(Self::Reissuable),
            0xc2 => Some(Self::NonReissuable),
            0xc3 => Some(Self::Nft),
            _ => None,
        }
    }
}

/// Token marker attached to colored outputs. Two outputs are fungible only
/// when their color ids are byte-identical.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColorId(#[serde(with = "BigArray")] [u8; COLOR_ID_LEN]);

impl ColorId {
    pub fn new(kind: ColorKind, payload: [u8; 32]) -> Self {
        let mut bytes = [0u8; COLOR_ID_LEN];
        bytes[0] = kind as u8;
        bytes[1..].copy_from_slice(&payload);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != COLOR_ID_LEN {
            return None;
        }
        ColorKind::from_byte(bytes[0])?;
        let mut out = [0u8; COLOR_ID_LEN];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text)
            .map_err(|e| Error::InvalidParameter(format!("color id is not hex: {e}")))?;
        Self::from_bytes(&bytes)
            .ok_or_else(|| Error::InvalidParameter(format!("malformed color id {text}")))
    }

    pub fn kind(&self) -> ColorKind {
        // constructors only admit known kind bytes
        ColorKind::from_byte(self.0[0]).unwrap_or(ColorKind::Reissuable)
    }

    pub fn as_bytes(&self) -> &[u8; COLOR_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for ColorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ColorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ColorId({self})")
    }
}

/// Locking script bytes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Script(pub Vec<u8>);

impl Script {
    pub fn pay_to(address: &Address) -> Self {
        let mut bytes = Vec::with_capacity(PAY_TO_LEN);
        bytes.push(OP_DUP);
        bytes.push(PUSH_32);
        bytes.extend_from_slice(address);
        Self(bytes)
    }

    pub fn colored_pay_to(color: &ColorId, address: &Address) -> Self {
        let mut bytes = Vec::with_capacity(COLOR_PREFIX_LEN + PAY_TO_LEN);
        bytes.push(PUSH_33);
        bytes.extend_from_slice(color.as_bytes());
        bytes.push(OP_COLOR);
        bytes.push(OP_DUP);
        bytes.push(PUSH_32);
        bytes.extend_from_slice(address);
        Self(bytes)
    }

    pub fn pay_to_with_color(color: Option<&ColorId>, address: &Address) -> Self {
        match color {
            Some(color) => Self::colored_pay_to(color, address),
            None => Self::pay_to(address),
        }
    }

    pub fn op_return(data: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(data.len() + 4);
        bytes.push(OP_RETURN);
        match data.len() {
            len if len < OP_PUSHDATA1 as usize => bytes.push(len as u8),
            len if len <= u8::MAX as usize => {
                bytes.push(OP_PUSHDATA1);
                bytes.push(len as u8);
            }
            len => {
                bytes.push(OP_PUSHDATA2);
                bytes.extend_from_slice(&(len.min(u16::MAX as usize) as u16).to_le_bytes());
            }
        }
        bytes.extend_from_slice(&data[..data.len().min(u16::MAX as usize)]);
        Self(bytes)
    }

    pub fn is_op_return(&self) -> bool {
        self.0.first() == Some(&OP_RETURN)
    }

    pub fn color_id(&self) -> Option<ColorId> {
        if self.0.len() != COLOR_PREFIX_LEN + PAY_TO_LEN
            || self.0[0] != PUSH_33
            || self.0[COLOR_PREFIX_LEN - 1] != OP_COLOR
        {
            return None;
        }
        ColorId::from_bytes(&self.0[1..1 + COLOR_ID_LEN])
    }

    /// Address paid by a pay-to-address script, colored or not.
    pub fn address(&self) -> Option<Address> {
        let tail = match self.0.len() {
            PAY_TO_LEN => &self.0[..],
            len if len == COLOR_PREFIX_LEN + PAY_TO_LEN => {
                self.color_id()?;
                &self.0[COLOR_PREFIX_LEN..]
            }
            _ => return None,
        };
        if tail[0] != OP_DUP || tail[1] != PUSH_32 {
            return None;
        }
        let mut address = [0u8; 32];
        address.copy_from_slice(&tail[2..]);
        Some(address)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prev_out: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn unsigned(prev_out: OutPoint) -> Self {
        Self { prev_out, script_sig: Vec::new(), sequence: u32::MAX }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script: Script,
}

impl TxOut {
    pub fn new(value: u64, script: Script) -> Self {
        Self { value, script }
    }

    pub fn color_id(&self) -> Option<ColorId> {
        self.script.color_id()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Self { version: 1, inputs: Vec::new(), outputs: Vec::new(), lock_time: 0 }
    }
}

impl Transaction {
    pub fn txid(&self) -> Txid {
        let bytes = self.encode_with(false);
        Txid(*blake3::Hasher::new_derive_key("colorledger-txid")
            .update(&bytes)
            .finalize()
            .as_bytes())
    }

    /// Message every input signature commits to.
    pub fn sighash(&self) -> [u8; 32] {
        self.txid().0
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(true)
    }

    pub fn serialized_size(&self) -> usize {
        self.encode().len()
    }

    /// Serialized size once every still-unsigned input carries a signature.
    pub fn estimated_size(&self) -> usize {
        let unsigned = self.inputs.iter().filter(|i| i.script_sig.is_empty()).count();
        let per_input = SCRIPT_SIG_LEN + varint_len(SCRIPT_SIG_LEN as u64) - varint_len(0);
        self.serialized_size() + unsigned * per_input
    }

    pub fn has_colored_output(&self) -> bool {
        self.outputs.iter().any(|o| o.color_id().is_some())
    }

    /// Sum of the values of uncolored outputs.
    pub fn native_output_value(&self) -> u64 {
        self.outputs
            .iter()
            .filter(|o| o.color_id().is_none())
            .map(|o| o.value)
            .sum()
    }

    fn encode_with(&self, with_script_sig: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.inputs.len() * 48 + self.outputs.len() * 48);
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(&input.prev_out.txid.0);
            buf.extend_from_slice(&input.prev_out.index.to_le_bytes());
            if with_script_sig {
                write_varint(&mut buf, input.script_sig.len() as u64);
                buf.extend_from_slice(&input.script_sig);
            } else {
                write_varint(&mut buf, 0);
            }
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_varint(&mut buf, output.script.len() as u64);
            buf.extend_from_slice(&output.script.0);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }
}

/// A confirmed block as delivered by the node interface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub time: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn txids(&self) -> HashSet<Txid> {
        self.transactions.iter().map(Transaction::txid).collect()
    }
}

fn varint_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color() -> ColorId {
        ColorId::new(ColorKind::Reissuable, [9u8; 32])
    }

    #[test]
    fn scripts_expose_address_and_color() {
        let address = [3u8; 32];
        let plain = Script::pay_to(&address);
        assert_eq!(plain.address(), Some(address));
        assert_eq!(plain.color_id(), None);

        let colored = Script::colored_pay_to(&color(), &address);
        assert_eq!(colored.address(), Some(address));
        assert_eq!(colored.color_id(), Some(color()));

        let data = Script::op_return(b"hello");
        assert!(data.is_op_return());
        assert_eq!(data.address(), None);
    }

    #[test]
    fn unknown_color_kind_is_rejected() {
        let mut bytes = [0u8; COLOR_ID_LEN];
        bytes[0] = 0x01;
        assert!(ColorId::from_bytes(&bytes).is_none());
        assert!(ColorId::from_hex("zz").is_err());
    }

    #[test]
    fn txid_ignores_signatures_but_size_does_not() {
        let mut tx = Transaction::default();
        tx.inputs.push(TxIn::unsigned(OutPoint::new(Txid([1; 32]), 0)));
        tx.outputs.push(TxOut::new(500, Script::pay_to(&[2; 32])));
        let unsigned_id = tx.txid();
        let estimate = tx.estimated_size();

        tx.inputs[0].script_sig = vec![0u8; SCRIPT_SIG_LEN];
        assert_eq!(tx.txid(), unsigned_id);
        assert_eq!(tx.serialized_size(), estimate);
        assert_eq!(tx.estimated_size(), estimate);
    }

    #[test]
    fn outpoint_key_orders_by_txid_then_index() {
        let a = OutPoint::new(Txid([1; 32]), 2);
        let b = OutPoint::new(Txid([1; 32]), 10);
        assert!(a.to_key() < b.to_key());
        assert_eq!(OutPoint::from_key(&b.to_key()), Some(b));
    }
}
