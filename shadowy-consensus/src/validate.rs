use crate::apply::{apply_coinbase, apply_transaction};
use crate::difficulty::{score_meets_target, target_from_bits};
use crate::{BlockError, ChainParams};
use chrono::{DateTime, Utc};
use shadowy_core::{
    block_reward, identifier_from_public_key, merkle_root, sha3_digest, Address, Block, Hash32,
    LedgerState,
};
use shadowy_vdf::{generate_challenge, VdfChallenge, VdfProof};
use tracing::debug;

/// Round challenge for height `h` on top of a parent:
/// `sha3(parent_hash || h)`. Seeds both the plot lookup and the VDF.
pub fn challenge_at(parent_hash: &Hash32, height: u64) -> Hash32 {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(parent_hash.as_bytes());
    buf.extend_from_slice(&height.to_le_bytes());
    sha3_digest(&buf)
}

/// A validated block together with the post-application ledger and the
/// reward accounting the writer needs for events.
#[derive(Debug)]
pub struct AppliedBlock {
    pub state: LedgerState,
    pub reward: u64,
    pub fees: u64,
}

/// Stateless-plus-ledger validation of candidate blocks. The chain writer
/// owns one of these and feeds it parents, difficulty and a clock.
#[derive(Debug, Clone)]
pub struct BlockValidator {
    params: ChainParams,
}

impl BlockValidator {
    pub fn new(params: ChainParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// The VDF instance every node derives for this height.
    pub fn vdf_challenge(&self, parent_hash: &Hash32, height: u64) -> VdfChallenge {
        let seed = challenge_at(parent_hash, height);
        generate_challenge(
            seed.as_bytes(),
            self.params.vdf_time_parameter,
            &self.params.vdf_modulus,
            self.params.vdf_security_bits,
        )
    }

    /// Full check of a non-genesis block against its parent and the ledger
    /// at the parent, returning the ledger after the block. The input state
    /// is never mutated; a failed block leaves no trace.
    pub fn validate_and_apply(
        &self,
        block: &Block,
        parent: &Block,
        state: &LedgerState,
        difficulty_bits: u32,
        now: DateTime<Utc>,
    ) -> Result<AppliedBlock, BlockError> {
        let header = &block.header;
        let parent_hash = parent.hash();
        if header.previous_block_hash != parent_hash {
            return Err(BlockError::Orphan(header.previous_block_hash));
        }
        if header.height != parent.height() + 1 {
            return Err(BlockError::BadHeight {
                claimed: header.height,
                parent: parent.height(),
            });
        }

        // space proof
        let challenge = challenge_at(&parent_hash, header.height);
        let proof = &header.plot_proof;
        if identifier_from_public_key(&proof.public_key) != proof.identifier {
            return Err(BlockError::BadPlotProof(
                "identifier does not match public key".into(),
            ));
        }
        if Address::from_identifier(&proof.identifier) != header.farmer_address {
            return Err(BlockError::BadPlotProof(
                "farmer address does not match plot identifier".into(),
            ));
        }
        if shadowy_crypto::verify(&proof.public_key, challenge.as_bytes(), &proof.signature)
            .is_err()
        {
            return Err(BlockError::BadPlotProof("challenge signature invalid".into()));
        }
        let score = proof.identifier.xor_distance(&challenge);
        if !score_meets_target(&score, &target_from_bits(difficulty_bits)) {
            return Err(BlockError::ScoreAboveTarget);
        }

        // time proof
        let vdf_challenge = self.vdf_challenge(&parent_hash, header.height);
        let vdf_proof = VdfProof::from_header_data(&header.vdf_proof)
            .map_err(|e| BlockError::BadVdf(e.to_string()))?;
        shadowy_vdf::verify(&vdf_challenge, &vdf_proof)
            .map_err(|e| BlockError::BadVdf(e.to_string()))?;

        // clock
        if header.timestamp <= parent.header.timestamp {
            return Err(BlockError::TimestampNotIncreasing);
        }
        if header.timestamp > now + self.params.max_clock_skew {
            return Err(BlockError::TimestampSkew);
        }

        // body
        if merkle_root(&block.transactions) != header.merkle_root {
            return Err(BlockError::BadMerkleRoot);
        }
        if block.transactions.is_empty() {
            return Err(BlockError::BadCoinbase("block has no coinbase".into()));
        }
        if block.transactions.len() > self.params.block_tx_cap + 1 {
            return Err(BlockError::BadCoinbase("body exceeds transaction cap".into()));
        }

        let mut working = state.clone();
        let mut fees: u64 = 0;
        for (index, signed) in block.transactions.iter().enumerate().skip(1) {
            let fee = apply_transaction(&mut working, signed, header.timestamp, &self.params)
                .map_err(|source| BlockError::Tx { index, source })?;
            fees = fees
                .checked_add(fee)
                .ok_or(BlockError::BadCoinbase("fee overflow".into()))?;
        }

        let reward = block_reward(
            header.height,
            self.params.initial_block_reward,
            self.params.halving_interval,
        );
        let expected = reward
            .checked_add(fees)
            .ok_or(BlockError::BadCoinbase("reward overflow".into()))?;
        apply_coinbase(&mut working, &block.transactions[0], expected)
            .map_err(|source| BlockError::Tx { index: 0, source })?;

        debug!(
            height = header.height,
            txs = block.transactions.len(),
            fees,
            "block validated"
        );
        Ok(AppliedBlock {
            state: working,
            reward,
            fees,
        })
    }

    /// Genesis check: height 0, zero (or empty-form) parent hash, an empty
    /// body with a zero merkle root.
    pub fn validate_genesis(&self, block: &Block) -> Result<(), BlockError> {
        let header = &block.header;
        if header.height != 0 || !header.previous_block_hash.is_zero() {
            return Err(BlockError::GenesisMismatch);
        }
        if !block.transactions.is_empty() || !header.merkle_root.is_zero() {
            return Err(BlockError::GenesisMismatch);
        }
        Ok(())
    }
}
