use blake3::Hasher;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// A 32-byte address, derived from a BLAKE3 hash of a public key.
pub type Address = [u8; 32];

pub const PUBLIC_KEY_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;

/// Length of a signed input script: `push(sig) push(pubkey)`.
pub const SCRIPT_SIG_LEN: usize = 1 + SIGNATURE_BYTES + 1 + PUBLIC_KEY_BYTES;

pub fn address_from_pk(pk: &VerifyingKey) -> Address {
    address_from_pk_bytes(pk.as_bytes())
}

pub fn address_from_pk_bytes(pk: &[u8; PUBLIC_KEY_BYTES]) -> Address {
    *Hasher::new_derive_key("colorledger-address")
        .update(pk)
        .finalize()
        .as_bytes()
}

/// Hashes arbitrary data with a domain-specific key for internal consistency.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *Hasher::new_derive_key("colorledger-v1").update(data).finalize().as_bytes()
}

pub fn generate_signing_key() -> SigningKey {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let key = SigningKey::from_bytes(&seed);
    // best-effort zeroize
    seed.iter_mut().for_each(|b| *b = 0);
    key
}

/// Produces the unlocking script for an input committing to `sighash`.
pub fn sign_input(key: &SigningKey, sighash: &[u8; 32]) -> Vec<u8> {
    let signature = key.sign(sighash);
    let mut script = Vec::with_capacity(SCRIPT_SIG_LEN);
    script.push(SIGNATURE_BYTES as u8);
    script.extend_from_slice(&signature.to_bytes());
    script.push(PUBLIC_KEY_BYTES as u8);
    script.extend_from_slice(key.verifying_key().as_bytes());
    script
}

/// Checks that `script_sig` carries a valid signature over `sighash` by the key
/// behind `expected`.
pub fn verify_input(script_sig: &[u8], sighash: &[u8; 32], expected: &Address) -> bool {
    if script_sig.len() != SCRIPT_SIG_LEN
        || script_sig[0] as usize != SIGNATURE_BYTES
        || script_sig[1 + SIGNATURE_BYTES] as usize != PUBLIC_KEY_BYTES
    {
        return false;
    }
    let mut sig = [0u8; SIGNATURE_BYTES];
    sig.copy_from_slice(&script_sig[1..1 + SIGNATURE_BYTES]);
    let mut pk = [0u8; PUBLIC_KEY_BYTES];
    pk.copy_from_slice(&script_sig[2 + SIGNATURE_BYTES..]);
    if &address_from_pk_bytes(&pk) != expected {
        return false;
    }
    match VerifyingKey::from_bytes(&pk) {
        Ok(key) => key.verify(sighash, &Signature::from_bytes(&sig)).is_ok(),
        Err(_) => false,
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}
