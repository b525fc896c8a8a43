pub mod apply;
pub mod difficulty;
pub mod ops;
pub mod validate;
pub mod walk;

use chrono::Duration;
use num_bigint::BigUint;
use shadowy_core::Hash32;
use thiserror::Error;

pub use apply::{apply_transaction, TxError};
pub use difficulty::{retarget, score_meets_target, target_from_bits};
pub use validate::{challenge_at, AppliedBlock, BlockValidator};
pub use walk::{walk_chain, ChainWalkReport};

/// Consensus-relevant chain constants. Every node must agree on these; they
/// come from config at startup and never change mid-run.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub chain_name: String,
    pub initial_block_reward: u64,
    pub halving_interval: u64,
    pub max_satoshis: u64,
    pub target_block_time: Duration,
    pub max_clock_skew: Duration,
    pub difficulty_bits_initial: u32,
    pub retarget_interval: u64,
    /// VDF instance parameters. The time parameter is consensus-fixed so
    /// verifiers can re-derive challenges; local self-tuning applies only
    /// to standalone challenges, never to block validation.
    pub vdf_modulus: BigUint,
    pub vdf_time_parameter: u64,
    pub vdf_security_bits: u16,
    pub pool_creation_fee: u64,
    pub trade_nft_creation_fee: u64,
    pub block_tx_cap: usize,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            chain_name: "shadowy-mainnet".into(),
            initial_block_reward: shadowy_core::INITIAL_BLOCK_REWARD,
            halving_interval: shadowy_core::HALVING_INTERVAL,
            max_satoshis: shadowy_core::MAX_SATOSHIS,
            target_block_time: Duration::seconds(600),
            max_clock_skew: Duration::seconds(120),
            difficulty_bits_initial: 12,
            retarget_interval: 144,
            vdf_modulus: shadowy_vdf::default_modulus(),
            vdf_time_parameter: 1 << 20,
            vdf_security_bits: shadowy_vdf::DEFAULT_SECURITY_BITS,
            pool_creation_fee: shadowy_core::POOL_CREATION_FEE,
            trade_nft_creation_fee: shadowy_core::TRADE_NFT_CREATION_FEE,
            block_tx_cap: 2_000,
        }
    }
}

/// How block acceptance can fail. `Orphan`, `Stale` and `Duplicate` are
/// recoverable states; everything else is fatal to the block and puts its
/// hash on the short-lived blacklist.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("parent {0} not known yet")]
    Orphan(Hash32),
    #[error("block at height {height} is below tip {tip}")]
    Stale { height: u64, tip: u64 },
    #[error("block already stored")]
    Duplicate,
    #[error("claimed height {claimed} does not extend parent height {parent}")]
    BadHeight { claimed: u64, parent: u64 },
    #[error("timestamp does not increase over parent")]
    TimestampNotIncreasing,
    #[error("timestamp too far from local clock")]
    TimestampSkew,
    #[error("merkle root does not match body")]
    BadMerkleRoot,
    #[error("plot proof: {0}")]
    BadPlotProof(String),
    #[error("plot score above target")]
    ScoreAboveTarget,
    #[error("vdf proof: {0}")]
    BadVdf(String),
    #[error("coinbase: {0}")]
    BadCoinbase(String),
    #[error("transaction {index}: {source}")]
    Tx {
        index: usize,
        #[source]
        source: TxError,
    },
    #[error("genesis mismatch")]
    GenesisMismatch,
}

impl BlockError {
    /// Recoverable failures are parked or ignored without penalty.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BlockError::Orphan(_) | BlockError::Stale { .. } | BlockError::Duplicate
        )
    }
}
