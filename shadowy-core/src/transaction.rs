use crate::{hex_bytes, sha3_digest, Address, Hash32, TokenOp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to a prior unspent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_tx: Hash32,
    pub output_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Address,
    pub value: u64,
}

/// Unsigned transaction body. Canonical bytes for hashing are the JSON
/// encoding of this struct with fields in declaration order; every receiver
/// recomputes the hash from these bytes and rejects mismatches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub token_ops: Vec<TokenOp>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_until: Option<DateTime<Utc>>,
    pub nonce: u64,
}

impl Transaction {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("transaction body serializes")
    }

    pub fn hash(&self) -> Hash32 {
        sha3_digest(&self.canonical_bytes())
    }

    /// The input-less reward transaction at position 0 of every block.
    pub fn coinbase(height: u64, reward: u64, farmer: Address, timestamp: DateTime<Utc>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            inputs: Vec::new(),
            outputs: vec![TxOutput {
                address: farmer,
                value: reward,
            }],
            token_ops: Vec::new(),
            timestamp,
            not_until: None,
            // height keeps coinbase hashes distinct across blocks
            nonce: height,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty() && self.token_ops.is_empty()
    }

    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs.iter().try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }

    /// Structural check only; stateful rules live in the consensus crate.
    /// A transaction must move coins or carry at least one token operation.
    pub fn has_effect(&self) -> bool {
        self.outputs.iter().any(|o| o.value > 0) || !self.token_ops.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    MlDsa87,
}

/// A transaction plus the material needed to verify it: the claimed hash,
/// the signer's public key and a detached post-quantum signature over the
/// canonical body bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx_hash: Hash32,
    pub transaction: Transaction,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    pub algorithm: SignatureAlgorithm,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    /// Recomputes the body hash; the claimed `tx_hash` must match.
    pub fn hash_matches(&self) -> bool {
        self.transaction.hash() == self.tx_hash
    }

    /// Wire size in bytes, used for mempool accounting and fee rates.
    pub fn encoded_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}
