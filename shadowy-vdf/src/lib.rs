pub mod challenge;
pub mod prime;
pub mod solver;
pub mod tuner;
pub mod worker;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use challenge::{generate_challenge, hash_to_group, VdfChallenge};
pub use solver::{solve, verify, VdfProof};
pub use tuner::DifficultyTuner;
pub use worker::{JobHandle, WorkerPool};

#[derive(Debug, Error)]
pub enum VdfError {
    #[error("missing proof")]
    MissingProof,
    #[error("missing challenge")]
    MissingChallenge,
    #[error("proof does not reference this challenge")]
    ChallengeMismatch,
    #[error("modulus mismatch")]
    ModulusMismatch,
    #[error("invalid proof: {0}")]
    InvalidProof(String),
    #[error("solve cancelled")]
    Cancelled,
    #[error("job queue full")]
    QueueFull,
    #[error("job expired before a worker picked it up")]
    Expired,
    #[error("worker pool shut down")]
    PoolClosed,
}

/// Supported RSA modulus widths. The small widths exist for tests only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModulusBits {
    B256,
    B512,
    B1024,
    B2048,
    B3072,
}

impl ModulusBits {
    pub fn bits(&self) -> u32 {
        match self {
            ModulusBits::B256 => 256,
            ModulusBits::B512 => 512,
            ModulusBits::B1024 => 1024,
            ModulusBits::B2048 => 2048,
            ModulusBits::B3072 => 3072,
        }
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            256 => Some(ModulusBits::B256),
            512 => Some(ModulusBits::B512),
            1024 => Some(ModulusBits::B1024),
            2048 => Some(ModulusBits::B2048),
            3072 => Some(ModulusBits::B3072),
            _ => None,
        }
    }
}

pub const DEFAULT_SECURITY_BITS: u16 = 128;

/// The RSA-2048 factoring-challenge modulus. Nobody is known to hold its
/// factors, which is exactly the trust assumption the group needs.
pub const RSA_2048_DECIMAL: &str = "2519590847565789349402718324004839857142928212620403202777713783604366202070\
7595556264018525880784406918290641249515082189298559149176184502808489120072\
8449926873928072877767359714183472702618963750149718246911650776133798590957\
0009733045974880842840179742910064245869181719511874612151517265463228221686\
9987549182422433637259085141865462043576798423387184774447920739934236584823\
8242811981638150106748104516603773060562016196762561338441436038339044149526\
3443219011465754445417842402092461651572335077870774981712577246796292638635\
6373289912154831438167899885040445364023527381951378636564391212010397122822\
120720357";

pub fn default_modulus() -> BigUint {
    RSA_2048_DECIMAL
        .parse()
        .expect("RSA-2048 constant parses")
}

/// Serde adapter carrying `BigUint` as lowercase hex.
pub mod biguint_hex {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value.to_bytes_be()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Ok(BigUint::from_bytes_be(&bytes))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::prime::is_prime;
    use num_bigint::BigUint;
    use num_traits::One;

    /// Deterministic test modulus: the product of the first two primes at or
    /// above fixed 256-bit anchors. Slow enough to matter never, stable
    /// across runs always.
    pub fn small_test_modulus() -> BigUint {
        let p = next_prime(&((BigUint::one() << 255u32) + BigUint::from(977u32)));
        let q = next_prime(&((BigUint::one() << 255u32) + BigUint::from(1337u32)));
        p * q
    }

    pub fn next_prime(start: &BigUint) -> BigUint {
        let mut candidate = start.clone();
        if !candidate.bit(0) {
            candidate += 1u32;
        }
        while !is_prime(&candidate) {
            candidate += 2u32;
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_modulus_has_expected_width() {
        let n = default_modulus();
        assert_eq!(n.bits(), 2048);
    }

    #[test]
    fn modulus_bits_enumeration() {
        assert_eq!(ModulusBits::from_bits(2048), Some(ModulusBits::B2048));
        assert_eq!(ModulusBits::from_bits(1000), None);
        assert_eq!(ModulusBits::B3072.bits(), 3072);
    }
}
