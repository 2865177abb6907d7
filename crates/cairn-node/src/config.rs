//! Chain-state configuration.
//!
//! [`ChainstateConfig`] has defaults for every field. [`ChainstateConfig::load`]
//! layers an optional TOML file and `CAIRN_*` environment variables over them.

use std::path::{Path, PathBuf};

use cairn_core::constants::NetworkType;
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Configuration for a chain-state instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainstateConfig {
    /// Root directory for all persistent data. The network's subdirectory is
    /// appended by the path helpers.
    pub data_dir: PathBuf,
    pub network: NetworkType,
    /// Coin cache budget in bytes. Above 90% of it, a periodic flush writes
    /// the cache out; above 100%, any flush point does.
    pub coins_cache_bytes: usize,
    /// Seconds between periodic writes of the block index and file infos.
    pub write_interval_secs: u64,
    /// Seconds between periodic full flushes of the coin cache.
    pub flush_interval_secs: u64,
    /// Script-check workers. 0 picks one per core.
    pub script_threads: usize,
    /// Block files rotate once the next record would pass this size.
    pub max_block_file_size: u64,
    /// Block files grow in steps of this many bytes.
    pub block_chunk_size: u64,
    /// Undo files grow in steps of this many bytes.
    pub undo_chunk_size: u64,
    /// Keep a txid -> position index for confirmed transactions.
    pub txindex: bool,
    /// Enforce signed checkpoints during header acceptance and activation.
    pub checkpoints: bool,
    /// Run the full block-index consistency check after every mutation.
    pub consistency_checks: bool,
}

impl Default for ChainstateConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cairn");

        Self {
            data_dir,
            network: NetworkType::Mainnet,
            coins_cache_bytes: 450 * MIB as usize,
            write_interval_secs: 60 * 60,
            flush_interval_secs: 24 * 60 * 60,
            script_threads: 0,
            max_block_file_size: 128 * MIB,
            block_chunk_size: 16 * MIB,
            undo_chunk_size: MIB,
            txindex: false,
            checkpoints: true,
            consistency_checks: false,
        }
    }
}

impl ChainstateConfig {
    /// Load defaults, then `path` (TOML) if given, then `CAIRN_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder = builder.add_source(config::Environment::with_prefix("CAIRN").try_parsing(true));
        builder.build()?.try_deserialize()
    }

    /// Directory holding everything for the configured network.
    pub fn network_dir(&self) -> PathBuf {
        self.data_dir.join(self.network.data_dir_suffix())
    }

    /// Directory of the `blk*.dat` and `rev*.dat` flat files.
    pub fn blocks_dir(&self) -> PathBuf {
        self.network_dir().join("blocks")
    }

    /// RocksDB directory of the block index.
    pub fn index_path(&self) -> PathBuf {
        self.blocks_dir().join("index")
    }

    /// RocksDB directory of the coin database.
    pub fn coins_path(&self) -> PathBuf {
        self.network_dir().join("chainstate")
    }
}
