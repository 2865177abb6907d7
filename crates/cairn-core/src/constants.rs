//! Protocol constants and per-network chain parameters.
//!
//! All monetary values are in base units (1 coin = 10^8 units).

use serde::{Deserialize, Serialize};

use crate::crypto::KeyPair;
use crate::types::Hash256;

pub const COIN: u64 = 100_000_000;
/// No single output or sum of outputs may exceed this.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

pub const INITIAL_SUBSIDY: u64 = 50 * COIN;
pub const WITNESS_SCALE_FACTOR: usize = 4;
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;
pub const MAX_TX_WEIGHT: usize = 400_000;
pub const COINBASE_MATURITY: u64 = 100;
pub const MIN_COINBASE_DATA: usize = 2;
pub const MAX_COINBASE_DATA: usize = 100;
pub const BLOCK_TIME_SECS: u64 = 600;
pub const DIFFICULTY_WINDOW: u64 = 144;
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;
pub const MEDIAN_TIME_SPAN: usize = 11;
pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;
pub const SEQUENCE_FINAL: u32 = u32::MAX;

/// Unrequested blocks further than this many heights ahead of the tip are
/// dropped without processing.
pub const MIN_BLOCKS_TO_KEEP: u64 = 288;
/// Maximum number of heights connected while holding the chain lock in one
/// activation step.
pub const MAX_CONNECT_BATCH: u64 = 32;
/// An alternate branch must lead the tip by this many blocks of work to
/// raise a fork warning.
pub const FORK_WARNING_WORK_BLOCKS: u128 = 7;
/// A fork warning is only raised while the branch tip is within this many
/// heights of the active tip.
pub const FORK_WARNING_MAX_DEPTH: u64 = 72;
/// A tip older than this keeps the node in initial block download.
pub const MAX_TIP_AGE: u64 = 24 * 60 * 60;

/// Prefix of the coinbase output that commits to the witness merkle root.
pub const WITNESS_COMMITMENT_HEADER: [u8; 4] = [0xaa, 0x21, 0xa9, 0xed];

/// Network type: Mainnet, Testnet, or Regtest.
///
/// Controls magic bytes, data directory suffix, and the chain parameters
/// returned by [`ChainParams::for_network`].
///
/// # Examples
///
/// ```
/// use cairn_core::constants::NetworkType;
/// let net = NetworkType::default();
/// assert_eq!(net, NetworkType::Mainnet);
/// assert_eq!(net.magic_bytes(), *b"CARN");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local regression-test network with trivial proof of work.
    Regtest,
}

impl NetworkType {
    /// Four-byte tag written in front of every flat-file record.
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            Self::Mainnet => *b"CARN",
            Self::Testnet => *b"CTST",
            Self::Regtest => *b"CREG",
        }
    }

    /// Subdirectory name appended to the base data directory path.
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

impl std::str::FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// Secret seed of the regtest checkpoint master key. Regtest only.
pub const REGTEST_CHECKPOINT_SECRET: [u8; 32] = [0x42; 32];

/// Checkpoint master public key for mainnet and testnet.
const MAINNET_CHECKPOINT_KEY: [u8; 32] = [
    0x58, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66,
    0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66,
    0x66, 0x66,
];

/// Blocks that historically contain a duplicate coinbase and may overwrite
/// an unspent output.
const MAINNET_BIP30_EXCEPTIONS: [(u64, [u8; 32]); 2] = [
    (
        91_842,
        hex_literal(b"00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec"),
    ),
    (
        91_880,
        hex_literal(b"00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721"),
    ),
];

const fn hex_nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        _ => 0,
    }
}

const fn hex_literal(s: &[u8; 64]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        out[i] = (hex_nibble(s[2 * i]) << 4) | hex_nibble(s[2 * i + 1]);
        i += 1;
    }
    out
}

/// Consensus parameters for one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    pub network: NetworkType,
    /// Easiest allowed target.
    pub pow_limit: u64,
    /// When set, any target at or below `pow_limit` is accepted.
    pub pow_no_retargeting: bool,
    pub subsidy_halving_interval: u64,
    pub bip34_height: u64,
    pub bip65_height: u64,
    pub bip66_height: u64,
    pub csv_height: u64,
    pub segwit_height: u64,
    /// Minimum cumulative work before unrequested blocks are processed.
    pub min_chain_work: u128,
    pub bip30_exceptions: Vec<(u64, Hash256)>,
    /// Ed25519 key that signs checkpoints.
    pub checkpoint_key: Option<[u8; 32]>,
}

impl ChainParams {
    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Mainnet => Self {
                network,
                pow_limit: u64::MAX >> 8,
                pow_no_retargeting: false,
                subsidy_halving_interval: 210_000,
                bip34_height: 227_931,
                bip65_height: 388_381,
                bip66_height: 363_725,
                csv_height: 419_328,
                segwit_height: 481_824,
                min_chain_work: 0,
                bip30_exceptions: MAINNET_BIP30_EXCEPTIONS
                    .iter()
                    .map(|(h, hash)| (*h, Hash256(*hash)))
                    .collect(),
                checkpoint_key: Some(MAINNET_CHECKPOINT_KEY),
            },
            NetworkType::Testnet => Self {
                network,
                pow_limit: u64::MAX >> 4,
                pow_no_retargeting: false,
                subsidy_halving_interval: 210_000,
                bip34_height: 21_111,
                bip65_height: 581_885,
                bip66_height: 330_776,
                csv_height: 770_112,
                segwit_height: 834_624,
                min_chain_work: 0,
                bip30_exceptions: Vec::new(),
                checkpoint_key: Some(MAINNET_CHECKPOINT_KEY),
            },
            NetworkType::Regtest => Self {
                network,
                pow_limit: u64::MAX,
                pow_no_retargeting: true,
                subsidy_halving_interval: 150,
                bip34_height: 1,
                bip65_height: 1,
                bip66_height: 1,
                csv_height: 1,
                segwit_height: 0,
                min_chain_work: 0,
                bip30_exceptions: Vec::new(),
                checkpoint_key: Some(
                    KeyPair::from_secret_bytes(REGTEST_CHECKPOINT_SECRET)
                        .public_key()
                        .to_bytes(),
                ),
            },
        }
    }

    /// Hash of this network's genesis block.
    pub fn genesis_hash(&self) -> Hash256 {
        crate::genesis::genesis_block(self.network).header.hash()
    }

    pub fn magic(&self) -> [u8; 4] {
        self.network.magic_bytes()
    }

    /// Whether `(height, hash)` may overwrite an unspent coinbase output.
    pub fn is_bip30_exception(&self, height: u64, hash: &Hash256) -> bool {
        self.bip30_exceptions
            .iter()
            .any(|(h, x)| *h == height && x == hash)
    }

    /// Lowest header version accepted at `height`.
    pub fn min_block_version(&self, height: u64) -> u64 {
        if height >= self.bip65_height {
            4
        } else if height >= self.bip66_height {
            3
        } else if height >= self.bip34_height {
            2
        } else {
            1
        }
    }
}
