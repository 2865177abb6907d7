//! Ed25519 signing for transaction inputs.
//!
//! Inputs are signed over a sighash that commits to the transaction version
//! and lock time, every input outpoint and sequence, every output, the index
//! of the input being signed, and the value of the coin it spends. Witness
//! fields are excluded so inputs can be signed in any order.

use ed25519_dalek::{Signer, Verifier};
use std::fmt;

use crate::error::CryptoError;
use crate::types::{Coin, Hash256, Transaction};

/// Ed25519 keypair. Use [`KeyPair::generate`] for random keys or
/// [`KeyPair::from_secret_bytes`] for deterministic derivation from a seed.
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Sign a message, returning the raw 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Pay-to-pubkey-hash script locking to this key.
    pub fn p2pkh_script(&self) -> Vec<u8> {
        self.public_key().pubkey_hash().0.to_vec()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let vk = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key: vk })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn pubkey_hash(&self) -> Hash256 {
        pubkey_hash(&self.to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

/// BLAKE3 hash of a raw public key, as stored in pay-to-pubkey-hash scripts.
pub fn pubkey_hash(pubkey_bytes: &[u8; 32]) -> Hash256 {
    Hash256(blake3::hash(pubkey_bytes).into())
}

/// Sighash for input `input_index` spending `spent`.
pub fn signing_hash(
    tx: &Transaction,
    input_index: usize,
    spent: &Coin,
) -> Result<Hash256, CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }

    let mut hasher = blake3::Hasher::new();
    hasher.update(&tx.version.to_le_bytes());
    hasher.update(&(tx.inputs.len() as u64).to_le_bytes());
    for input in &tx.inputs {
        hasher.update(input.previous_output.txid.as_bytes());
        hasher.update(&input.previous_output.index.to_le_bytes());
        hasher.update(&input.sequence.to_le_bytes());
    }
    hasher.update(&(tx.outputs.len() as u64).to_le_bytes());
    for output in &tx.outputs {
        hasher.update(&output.value.to_le_bytes());
        hasher.update(&(output.script_pubkey.len() as u64).to_le_bytes());
        hasher.update(&output.script_pubkey);
    }
    hasher.update(&tx.lock_time.to_le_bytes());
    hasher.update(&(input_index as u64).to_le_bytes());
    hasher.update(&spent.output.value.to_le_bytes());
    Ok(Hash256(hasher.finalize().into()))
}

/// Sign input `input_index` in place, writing signature and public key.
pub fn sign_transaction_input(
    tx: &mut Transaction,
    input_index: usize,
    spent: &Coin,
    keypair: &KeyPair,
) -> Result<(), CryptoError> {
    let sighash = signing_hash(tx, input_index, spent)?;
    let signature = keypair.sign(sighash.as_bytes());
    tx.inputs[input_index].signature = signature.to_vec();
    tx.inputs[input_index].public_key = keypair.public_key().to_bytes().to_vec();
    Ok(())
}

/// Verify input `input_index` against the pay-to-pubkey-hash script of `spent`.
///
/// Only the first 64 signature bytes and 32 key bytes are read; callers that
/// want exact lengths check them first.
pub fn verify_transaction_input(
    tx: &Transaction,
    input_index: usize,
    spent: &Coin,
) -> Result<(), CryptoError> {
    let input = tx
        .inputs
        .get(input_index)
        .ok_or(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        })?;

    let pk_bytes: [u8; 32] = input
        .public_key
        .get(..32)
        .and_then(|s| s.try_into().ok())
        .ok_or(CryptoError::InvalidPublicKey)?;
    let pk = PublicKey::from_bytes(&pk_bytes)?;

    if spent.output.script_pubkey.as_slice() != pk.pubkey_hash().as_bytes() {
        return Err(CryptoError::PubkeyHashMismatch);
    }

    let sig_bytes: [u8; 64] = input
        .signature
        .get(..64)
        .and_then(|s| s.try_into().ok())
        .ok_or(CryptoError::InvalidSignature)?;

    let sighash = signing_hash(tx, input_index, spent)?;
    pk.verify(sighash.as_bytes(), &sig_bytes)
}
