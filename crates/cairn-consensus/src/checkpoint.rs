//! Signed header checkpoints.
//!
//! A checkpoint pins the block hash at a height. Checkpoints arrive signed by
//! the network's checkpoint master key; only verified pins enter a
//! [`CheckpointSet`], and only verified pins are persisted, so a set rebuilt
//! from disk is trusted without re-verification.
//!
//! # Attack vectors
//!
//! - **Long-range rewrite:** Without checkpoints an attacker with enough hash
//!   power could rewrite arbitrarily deep history. A branch whose ancestor at
//!   a pinned height differs from the pin is never activated, however much
//!   work it has.
//!
//! - **Checkpoint spoofing:** A forged pin would let an attacker force a
//!   reorg. Every pin must carry a valid signature from the master key
//!   compiled into [`ChainParams`](cairn_core::constants::ChainParams).

use std::collections::BTreeMap;

use cairn_core::crypto::{KeyPair, PublicKey};
use cairn_core::error::{BlockError, CheckpointError};
use cairn_core::types::Hash256;
use serde::{Deserialize, Serialize};
use tracing::debug;

const SIGNING_DOMAIN: &[u8] = b"cairn-checkpoint";

/// A checkpoint as received and stored.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct SignedCheckpoint {
    pub height: u64,
    pub hash: Hash256,
    pub signature: Vec<u8>,
}

impl SignedCheckpoint {
    fn message(height: u64, hash: &Hash256) -> Vec<u8> {
        let mut msg = Vec::with_capacity(SIGNING_DOMAIN.len() + 8 + 32);
        msg.extend_from_slice(SIGNING_DOMAIN);
        msg.extend_from_slice(&height.to_le_bytes());
        msg.extend_from_slice(hash.as_bytes());
        msg
    }

    pub fn sign(height: u64, hash: Hash256, key: &KeyPair) -> Self {
        Self {
            height,
            hash,
            signature: key.sign(&Self::message(height, &hash)).to_vec(),
        }
    }

    /// Check the signature against the master public key.
    pub fn verify(&self, master_key: &[u8; 32]) -> Result<(), CheckpointError> {
        let bad = || CheckpointError::BadSignature(self.height);
        let key = PublicKey::from_bytes(master_key).map_err(|_| bad())?;
        let sig: [u8; 64] = self.signature.as_slice().try_into().map_err(|_| bad())?;
        key.verify(&Self::message(self.height, &self.hash), &sig)
            .map_err(|_| bad())
    }
}

/// Verified checkpoints, ordered by height.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointSet {
    pins: BTreeMap<u64, Hash256>,
}

impl CheckpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from pins that were verified before they were persisted.
    pub fn from_verified(pins: impl IntoIterator<Item = (u64, Hash256)>) -> Self {
        Self {
            pins: pins.into_iter().collect(),
        }
    }

    /// Verify and add a batch. Nothing is added unless every checkpoint in
    /// the batch verifies and none conflicts with a known pin.
    ///
    /// Returns the checkpoints that were not already known.
    pub fn add_verified(
        &mut self,
        checkpoints: &[SignedCheckpoint],
        master_key: Option<&[u8; 32]>,
    ) -> Result<Vec<SignedCheckpoint>, CheckpointError> {
        let key = master_key.ok_or(CheckpointError::NoMasterKey)?;
        let mut staged: BTreeMap<u64, Hash256> = BTreeMap::new();
        for cp in checkpoints {
            cp.verify(key)?;
            let known = self.pins.get(&cp.height).or_else(|| staged.get(&cp.height));
            if known.is_some_and(|h| *h != cp.hash) {
                return Err(CheckpointError::Conflict { height: cp.height });
            }
            staged.insert(cp.height, cp.hash);
        }

        let mut added = Vec::new();
        for cp in checkpoints {
            if self.pins.insert(cp.height, cp.hash).is_none() {
                debug!(height = cp.height, hash = %cp.hash, "checkpoint added");
                added.push(cp.clone());
            }
        }
        Ok(added)
    }

    pub fn get(&self, height: u64) -> Option<Hash256> {
        self.pins.get(&height).copied()
    }

    /// Newest checkpoint.
    pub fn last(&self) -> Option<(u64, Hash256)> {
        self.pins.iter().next_back().map(|(h, x)| (*h, *x))
    }

    /// Height of the newest checkpoint, or 0 if there are none.
    pub fn last_height(&self) -> u64 {
        self.last().map_or(0, |(h, _)| h)
    }

    /// A block at `height` must match the pin there, if one exists.
    pub fn check(&self, height: u64, hash: &Hash256) -> Result<(), BlockError> {
        match self.pins.get(&height) {
            Some(pinned) if pinned != hash => Err(BlockError::CheckpointMismatch { height }),
            _ => Ok(()),
        }
    }

    /// Whether `height` is at or below the newest checkpoint.
    pub fn is_below(&self, height: u64) -> bool {
        !self.pins.is_empty() && height <= self.last_height()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, Hash256)> + '_ {
        self.pins.iter().map(|(h, x)| (*h, *x))
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}
