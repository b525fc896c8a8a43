use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config load: {0}")]
    Load(#[from] config::ConfigError),
    #[error("config write: {0}")]
    Write(#[from] std::io::Error),
    #[error("config encode: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub chain_name: String,
    pub blockchain_directory: PathBuf,
    pub plot_directory: PathBuf,
    pub wallet_directory: PathBuf,
    pub farmer_wallet: String,
    pub target_block_time_seconds: u64,
    pub max_clock_skew_seconds: u64,
    pub difficulty_bits_initial: u32,
    pub retarget_interval: u64,
    pub block_tx_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenomicsConfig {
    pub halving_interval: u64,
    pub initial_block_reward: u64,
    pub max_satoshis: u64,
    pub pool_creation_fee_satoshis: u64,
    pub trade_nft_creation_fee_satoshis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdfConfig {
    pub vdf_time_parameter: u64,
    pub vdf_modulus_bits: u32,
    /// optional decimal override of the RSA modulus, for test networks
    #[serde(default)]
    pub vdf_modulus_decimal: Option<String>,
    pub vdf_security_bits: u16,
    pub vdf_worker_pool_size: usize,
    pub vdf_auto_adjust: bool,
    pub vdf_target_solving_time_seconds: u64,
    pub max_pending_vdf_challenges: usize,
    pub vdf_challenge_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolConfigSection {
    pub mempool_size_cap_bytes: usize,
    pub mempool_min_fee_rate: u64,
    pub mempool_tx_expiry_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub peer_listen_address: String,
    pub peer_seed_nodes: Vec<String>,
    pub peer_max_outbound: usize,
    pub peer_ban_duration_seconds: u64,
    pub sync_batch_size: u64,
    pub sync_height_threshold: u64,
    pub orphan_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub tracker_url: Option<String>,
    pub announce_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowyConfig {
    pub node: NodeConfig,
    pub tokenomics: TokenomicsConfig,
    pub vdf: VdfConfig,
    pub mempool: MempoolConfigSection,
    pub peers: PeerConfig,
    pub tracker: TrackerConfig,
}

impl ShadowyConfig {
    /// TOML file first, then `SHADOWY__SECTION__KEY` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("SHADOWY").separator("__"));
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn write_example(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(&Self::example())?)?;
        Ok(())
    }

    pub fn example() -> Self {
        Self {
            node: NodeConfig {
                chain_name: "shadowy-mainnet".into(),
                blockchain_directory: PathBuf::from("data/chain"),
                plot_directory: PathBuf::from("data/plots"),
                wallet_directory: PathBuf::from("data/wallets"),
                farmer_wallet: "farmer".into(),
                target_block_time_seconds: 600,
                max_clock_skew_seconds: 120,
                difficulty_bits_initial: 12,
                retarget_interval: 144,
                block_tx_cap: 2_000,
            },
            tokenomics: TokenomicsConfig {
                halving_interval: 210_000,
                initial_block_reward: 50 * 100_000_000,
                max_satoshis: 21_000_000 * 100_000_000,
                pool_creation_fee_satoshis: 5 * 100_000_000,
                trade_nft_creation_fee_satoshis: 10_000_000,
            },
            vdf: VdfConfig {
                vdf_time_parameter: 1 << 20,
                vdf_modulus_bits: 2048,
                vdf_modulus_decimal: None,
                vdf_security_bits: 128,
                vdf_worker_pool_size: 2,
                vdf_auto_adjust: true,
                vdf_target_solving_time_seconds: 300,
                max_pending_vdf_challenges: 16,
                vdf_challenge_timeout_seconds: 1_200,
            },
            mempool: MempoolConfigSection {
                mempool_size_cap_bytes: 32 * 1024 * 1024,
                mempool_min_fee_rate: 0,
                mempool_tx_expiry_seconds: 86_400,
            },
            peers: PeerConfig {
                peer_listen_address: "/ip4/0.0.0.0/tcp/7744".into(),
                peer_seed_nodes: Vec::new(),
                peer_max_outbound: 32,
                peer_ban_duration_seconds: 900,
                sync_batch_size: 32,
                sync_height_threshold: 3,
                orphan_buffer_size: 64,
            },
            tracker: TrackerConfig {
                tracker_url: None,
                announce_interval_seconds: 600,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_roundtrips_through_toml() {
        let example = ShadowyConfig::example();
        let text = toml::to_string_pretty(&example).unwrap();
        let back: ShadowyConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.node.chain_name, example.node.chain_name);
        assert_eq!(back.vdf.vdf_time_parameter, example.vdf.vdf_time_parameter);
        assert_eq!(
            back.mempool.mempool_size_cap_bytes,
            example.mempool.mempool_size_cap_bytes
        );
    }

    #[test]
    fn write_and_load_example() {
        let dir = std::env::temp_dir().join(format!("shadowy-config-{}", std::process::id()));
        let path = dir.join("shadowy.toml");
        ShadowyConfig::write_example(&path).unwrap();
        let loaded = ShadowyConfig::load(&path).unwrap();
        assert_eq!(loaded.peers.sync_batch_size, 32);
        std::fs::remove_dir_all(&dir).ok();
    }
}
