//! Ed25519 pay-to-pubkey-hash input verification.
//!
//! An output script is the 32-byte BLAKE3 hash of the owner's public key.
//! The spending input carries the public key and a signature over the
//! sighash from [`cairn_core::crypto::signing_hash`].

use cairn_core::crypto;
use cairn_core::error::TransactionError;
use cairn_core::traits::{ScriptFlags, ScriptVerifier};
use cairn_core::types::{Coin, Transaction};

const SIGNATURE_LEN: usize = 64;
const PUBLIC_KEY_LEN: usize = 32;

#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl ScriptVerifier for Ed25519Verifier {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        spent: &Coin,
        flags: ScriptFlags,
    ) -> Result<(), TransactionError> {
        let fail = |reason: String| TransactionError::Script {
            index: input_index,
            reason,
        };
        let input = tx
            .inputs
            .get(input_index)
            .ok_or_else(|| fail("input index out of range".into()))?;

        if flags.contains(ScriptFlags::STRICTENC)
            && (input.signature.len() != SIGNATURE_LEN || input.public_key.len() != PUBLIC_KEY_LEN)
        {
            return Err(fail(format!(
                "non-canonical witness: signature {} bytes, key {} bytes",
                input.signature.len(),
                input.public_key.len()
            )));
        }

        crypto::verify_transaction_input(tx, input_index, spent).map_err(|e| fail(e.to_string()))
    }
}
