pub mod address;
pub mod block;
pub mod reward;
pub mod state;
pub mod token;
pub mod transaction;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Digest, Sha3_256, Shake128};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use address::{Address, AddressKind};
pub use block::{Block, BlockHeader, PlotProof, VdfProofData, merkle_root};
pub use reward::{
    block_reward, HALVING_INTERVAL, INITIAL_BLOCK_REWARD, MAX_SATOSHIS, POOL_CREATION_FEE,
    SATOSHIS_PER_SHADOW, TRADE_NFT_CREATION_FEE,
};
pub use state::LedgerState;
pub use token::{
    derive_token_id, spot_quote, swap_output, PoolState, TokenId, TokenMetadata, TokenOp,
    TokenRef, TradeTerms,
};
pub use transaction::{
    SignatureAlgorithm, SignedTransaction, Transaction, TxInput, TxOutput,
};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid hash string: {0}")]
    InvalidHash(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("value overflow in {0}")]
    Overflow(&'static str),
}

/// 32-byte digest used for block hashes, transaction hashes, token ids and
/// plot identifiers. Serializes as a 64-char lowercase hex string; the empty
/// string deserializes to the zero hash (accepted genesis form).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR with another digest, interpreting the result big-endian. Used to
    /// rank plot identifiers against a challenge: smaller is better.
    pub fn xor_distance(&self, other: &Hash32) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Count of leading zero bits, for difficulty-style checks.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0;
        for byte in self.0 {
            if byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Hash32 {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Hash32::ZERO);
        }
        let bytes = hex::decode(s).map_err(|_| CoreError::InvalidHash(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidHash(s.to_string()))?;
        Ok(Hash32(arr))
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// SHA3-256 of arbitrary bytes.
pub fn sha3_digest(data: &[u8]) -> Hash32 {
    let mut hasher = Sha3_256::new();
    Digest::update(&mut hasher, data);
    Hash32(hasher.finalize().into())
}

/// Plot identifier: SHAKE-128 digest (32-byte output) of a post-quantum
/// public key. The same digest backs standard `S` addresses.
pub fn identifier_from_public_key(public_key: &[u8]) -> Hash32 {
    let mut shake = Shake128::default();
    shake.update(public_key);
    let mut reader = shake.finalize_xof();
    let mut out = [0u8; 32];
    reader.read(&mut out);
    Hash32(out)
}

/// Serde adapter for byte vectors carried as hex strings on the wire.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_roundtrip() {
        let h = sha3_digest(b"shadowy");
        let s = h.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(s.parse::<Hash32>().unwrap(), h);
    }

    #[test]
    fn empty_string_is_zero_hash() {
        assert_eq!("".parse::<Hash32>().unwrap(), Hash32::ZERO);
        let zeros = "0".repeat(64);
        assert_eq!(zeros.parse::<Hash32>().unwrap(), Hash32::ZERO);
    }

    #[test]
    fn identifier_is_deterministic() {
        let a = identifier_from_public_key(b"pk bytes");
        let b = identifier_from_public_key(b"pk bytes");
        assert_eq!(a, b);
        assert_ne!(a, identifier_from_public_key(b"other"));
    }

    #[test]
    fn leading_zero_bits_counts() {
        let mut raw = [0u8; 32];
        raw[2] = 0x0f;
        let h = Hash32(raw);
        assert_eq!(h.leading_zero_bits(), 20);
        assert_eq!(Hash32::ZERO.leading_zero_bits(), 256);
    }
}
