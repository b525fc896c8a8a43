use crate::biguint_hex;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Digest, Sha3_256, Shake256};

/// A fully determined VDF instance. `id` names the instance in block
/// headers and job queues; verifiers re-derive the rest from the same seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdfChallenge {
    #[serde(with = "biguint_hex")]
    pub input: BigUint,
    pub time_parameter: u64,
    #[serde(with = "biguint_hex")]
    pub modulus: BigUint,
    pub security_bits: u16,
    pub id: String,
}

/// Maps seed bytes into the RSA group: a SHAKE-256 stream one byte wider
/// than the modulus, reduced mod N. Deterministic, and the reduction bias
/// from the extra byte is negligible.
pub fn hash_to_group(seed: &[u8], modulus: &BigUint) -> BigUint {
    let byte_len = ((modulus.bits() + 7) / 8 + 1) as usize;
    let mut shake = Shake256::default();
    shake.update(b"vdf-input");
    shake.update(seed);
    let mut reader = shake.finalize_xof();
    let mut buf = vec![0u8; byte_len];
    reader.read(&mut buf);
    BigUint::from_bytes_be(&buf) % modulus
}

/// Deterministic challenge generation: equal seeds yield equal challenges,
/// including the id `hex(sha3(seed || T))`.
pub fn generate_challenge(
    seed: &[u8],
    time_parameter: u64,
    modulus: &BigUint,
    security_bits: u16,
) -> VdfChallenge {
    let input = hash_to_group(seed, modulus);
    let mut hasher = Sha3_256::new();
    Digest::update(&mut hasher, seed);
    Digest::update(&mut hasher, time_parameter.to_le_bytes());
    let id = hex::encode(hasher.finalize());
    VdfChallenge {
        input,
        time_parameter,
        modulus: modulus.clone(),
        security_bits,
        id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_SECURITY_BITS;

    #[test]
    fn same_seed_same_challenge() {
        let n = BigUint::from(10_000_019u64) * BigUint::from(10_000_079u64);
        let a = generate_challenge(b"small test", 10, &n, DEFAULT_SECURITY_BITS);
        let b = generate_challenge(b"small test", 10, &n, DEFAULT_SECURITY_BITS);
        assert_eq!(a, b);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn id_depends_on_time_parameter() {
        let n = BigUint::from(10_000_019u64) * BigUint::from(10_000_079u64);
        let a = generate_challenge(b"seed", 10, &n, DEFAULT_SECURITY_BITS);
        let b = generate_challenge(b"seed", 11, &n, DEFAULT_SECURITY_BITS);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn input_lies_in_group() {
        let n = BigUint::from(10_000_019u64) * BigUint::from(10_000_079u64);
        for seed in [b"a".as_slice(), b"bb", b"ccc"] {
            let x = hash_to_group(seed, &n);
            assert!(x < n);
        }
    }
}
