//! Core protocol types: transactions, blocks, coins and undo records.
//!
//! All monetary values are in base units (1 coin = 10^8 units).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::WITNESS_SCALE_FACTOR;

/// A 32-byte hash value.
///
/// Used for transaction IDs (BLAKE3), block header hashes (double SHA-256),
/// and merkle roots (BLAKE3).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Marks "no block" and coinbase previous outpoints.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Double SHA-256 of `data`.
    pub fn sha256d(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        Hash256(Sha256::digest(first).into())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u64,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u64) -> Self {
        Self { txid, index }
    }

    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u64::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u64::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
///
/// `signature` and `public_key` form the input's witness. They are excluded
/// from the txid. For coinbase inputs `signature` carries free-form coinbase
/// data that starts with the serialized block height once BIP34 is active.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn has_witness(&self) -> bool {
        !self.public_key.is_empty()
    }
}

/// A transaction output, creating a new coin.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    pub value: u64,
    /// Locking script. Pay-to-pubkey-hash outputs carry the 32-byte BLAKE3
    /// hash of the owner's Ed25519 key.
    pub script_pubkey: Vec<u8>,
}

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub version: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u64,
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

impl Transaction {
    /// Fixed little-endian layout without witness data.
    fn stripped_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.inputs.len() * 44 + self.outputs.len() * 48);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            buf.extend_from_slice(input.previous_output.txid.as_bytes());
            buf.extend_from_slice(&input.previous_output.index.to_le_bytes());
            buf.extend_from_slice(&input.sequence.to_le_bytes());
            if self.is_coinbase() {
                put_bytes(&mut buf, &input.signature);
            }
        }
        buf.extend_from_slice(&(self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            put_bytes(&mut buf, &output.script_pubkey);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    /// Stripped layout followed by every input's witness.
    fn full_bytes(&self) -> Vec<u8> {
        let mut buf = self.stripped_bytes();
        if !self.is_coinbase() {
            for input in &self.inputs {
                put_bytes(&mut buf, &input.signature);
                put_bytes(&mut buf, &input.public_key);
            }
        }
        buf
    }

    /// Transaction id: BLAKE3 of the witness-stripped layout.
    pub fn txid(&self) -> Hash256 {
        Hash256(blake3::hash(&self.stripped_bytes()).into())
    }

    /// Witness transaction id: BLAKE3 of the full layout.
    pub fn wtxid(&self) -> Hash256 {
        Hash256(blake3::hash(&self.full_bytes()).into())
    }

    pub fn stripped_size(&self) -> usize {
        self.stripped_bytes().len()
    }

    pub fn total_size(&self) -> usize {
        self.full_bytes().len()
    }

    pub fn weight(&self) -> usize {
        self.stripped_size() * (WITNESS_SCALE_FACTOR - 1) + self.total_size()
    }

    /// Single input with the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    pub fn has_witness(&self) -> bool {
        !self.is_coinbase() && self.inputs.iter().any(TxInput::has_witness)
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }
}

/// Block header containing the proof-of-work puzzle.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u64,
    pub prev_hash: Hash256,
    /// BLAKE3 merkle root over the block's txids.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Higher is easier. See [`difficulty`](crate::difficulty).
    pub difficulty_target: u64,
    pub nonce: u64,
}

impl BlockHeader {
    /// Header size in bytes when serialized for hashing (4 u64 fields + 2 * 32-byte hashes).
    const HASH_SIZE: usize = 4 * 8 + 2 * 32;

    /// Double SHA-256 over version || prev_hash || merkle_root || timestamp ||
    /// difficulty_target || nonce, all little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.difficulty_target.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        Hash256::sha256d(&data)
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// First transaction must be coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Size of the block with all witness data removed.
    pub fn stripped_size(&self) -> usize {
        BlockHeader::HASH_SIZE
            + 8
            + self
                .transactions
                .iter()
                .map(Transaction::stripped_size)
                .sum::<usize>()
    }

    pub fn weight(&self) -> usize {
        let base = BlockHeader::HASH_SIZE + 8;
        base * WITNESS_SCALE_FACTOR
            + self
                .transactions
                .iter()
                .map(Transaction::weight)
                .sum::<usize>()
    }
}

/// An unspent transaction output together with where it was created.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Coin {
    pub output: TxOutput,
    /// Height of the block that created this coin.
    pub height: u64,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn new(output: TxOutput, height: u64, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }

    /// Coinbase outputs require [`COINBASE_MATURITY`](crate::constants::COINBASE_MATURITY)
    /// confirmations. Non-coinbase outputs are always mature.
    pub fn is_mature(&self, spend_height: u64) -> bool {
        if !self.is_coinbase {
            return true;
        }
        spend_height.saturating_sub(self.height) >= crate::constants::COINBASE_MATURITY
    }

    /// Approximate heap footprint, used by the coin cache size policy.
    pub fn dynamic_usage(&self) -> usize {
        self.output.script_pubkey.capacity()
    }
}

/// Prior coins consumed by one non-coinbase transaction, in input order.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct TxUndo {
    pub prev_coins: Vec<Coin>,
}

/// Everything needed to reverse one block's effect on the coin set.
///
/// Holds one [`TxUndo`] per non-coinbase transaction, in block order.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;

    fn p2pkh(seed: u8) -> Vec<u8> {
        vec![seed; 32]
    }

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(Hash256([0x11; 32]), 0),
                signature: vec![7u8; 64],
                public_key: vec![9u8; 32],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value: 50 * COIN,
                script_pubkey: p2pkh(0xAA),
            }],
            lock_time: 0,
        }
    }

    fn sample_coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                signature: 1u64.to_le_bytes().to_vec(),
                public_key: vec![],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value: 50 * COIN,
                script_pubkey: p2pkh(0xAA),
            }],
            lock_time: 0,
        }
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 1_700_000_000,
            difficulty_target: u64::MAX,
            nonce: 0,
        }
    }

    // --- Hash256 ---

    #[test]
    fn hash256_display_hex() {
        let h = Hash256([0xAB; 32]);
        let s = format!("{h}");
        assert_eq!(s.len(), 64);
        assert_eq!(&s[0..2], "ab");
    }

    #[test]
    fn sha256d_is_double() {
        let once = Sha256::digest(b"cairn");
        let twice: [u8; 32] = Sha256::digest(once).into();
        assert_eq!(Hash256::sha256d(b"cairn"), Hash256(twice));
    }

    // --- OutPoint ---

    #[test]
    fn outpoint_null_detection() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint::new(Hash256([1; 32]), 0).is_null());
    }

    // --- Transaction ---

    #[test]
    fn coinbase_detection() {
        assert!(sample_coinbase().is_coinbase());
        assert!(!sample_tx().is_coinbase());
    }

    #[test]
    fn txid_ignores_witness() {
        let tx1 = sample_tx();
        let mut tx2 = sample_tx();
        tx2.inputs[0].signature = vec![1u8; 64];
        assert_eq!(tx1.txid(), tx2.txid());
        assert_ne!(tx1.wtxid(), tx2.wtxid());
    }

    #[test]
    fn coinbase_data_changes_txid() {
        let a = sample_coinbase();
        let mut b = sample_coinbase();
        b.inputs[0].signature = 2u64.to_le_bytes().to_vec();
        assert_ne!(a.txid(), b.txid());
    }

    #[test]
    fn txid_changes_with_lock_time() {
        let tx1 = sample_tx();
        let mut tx2 = sample_tx();
        tx2.lock_time = 1;
        assert_ne!(tx1.txid(), tx2.txid());
    }

    #[test]
    fn witness_counts_once_in_weight() {
        let tx = sample_tx();
        assert!(tx.total_size() > tx.stripped_size());
        assert_eq!(tx.weight(), tx.stripped_size() * 3 + tx.total_size());
        assert!(tx.has_witness());
        assert!(!sample_coinbase().has_witness());
    }

    #[test]
    fn total_output_value_overflow_returns_none() {
        let mut tx = sample_tx();
        tx.outputs.push(TxOutput {
            value: u64::MAX,
            script_pubkey: vec![],
        });
        assert_eq!(tx.total_output_value(), None);
    }

    // --- BlockHeader ---

    #[test]
    fn block_header_hash_changes_with_nonce() {
        let h1 = sample_header();
        let mut h2 = h1.clone();
        h2.nonce = 1;
        assert_ne!(h1.hash(), h2.hash());
    }

    // --- Coin ---

    #[test]
    fn coinbase_coin_matures_after_100() {
        let coin = Coin::new(sample_coinbase().outputs[0].clone(), 100, true);
        assert!(!coin.is_mature(150));
        assert!(coin.is_mature(200));
        let plain = Coin::new(sample_tx().outputs[0].clone(), 100, false);
        assert!(plain.is_mature(100));
    }

    // --- Bincode ---

    #[test]
    fn bincode_round_trip_block() {
        let block = Block {
            header: sample_header(),
            transactions: vec![sample_coinbase(), sample_tx()],
        };
        let encoded = bincode::encode_to_vec(&block, bincode::config::standard()).unwrap();
        let (decoded, _): (Block, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(block, decoded);
    }
}
