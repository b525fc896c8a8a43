use crate::prime::hash_to_prime;
use crate::{biguint_hex, VdfChallenge, VdfError};
use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Serialize};
use shadowy_core::VdfProofData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::debug;

/// How many squarings pass between cancellation checks. The inner loop
/// never suspends; this bounds cancel latency instead.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdfProof {
    pub challenge_id: String,
    #[serde(with = "biguint_hex")]
    pub output: BigUint,
    #[serde(with = "biguint_hex")]
    pub proof: BigUint,
    pub compute_ms: u64,
}

impl VdfProof {
    /// Header form: raw big-endian bytes plus the challenge id.
    pub fn to_header_data(&self) -> VdfProofData {
        VdfProofData {
            output: self.output.to_bytes_be(),
            proof: self.proof.to_bytes_be(),
            challenge_id: self.challenge_id.clone(),
        }
    }

    pub fn from_header_data(data: &VdfProofData) -> Result<Self, VdfError> {
        if data.output.is_empty() || data.proof.is_empty() {
            return Err(VdfError::MissingProof);
        }
        Ok(Self {
            challenge_id: data.challenge_id.clone(),
            output: BigUint::from_bytes_be(&data.output),
            proof: BigUint::from_bytes_be(&data.proof),
            compute_ms: 0,
        })
    }
}

/// Computes `y = x^(2^T) mod N` by T sequential squarings, then the
/// Wesolowski proof `π = x^⌊2^T/ℓ⌋` with the streaming long-division
/// square-and-multiply, so `2^T` is never materialised.
pub fn solve(challenge: &VdfChallenge, cancel: &AtomicBool) -> Result<VdfProof, VdfError> {
    let started = Instant::now();
    let n = &challenge.modulus;
    let x = &challenge.input % n;

    let mut y = x.clone();
    for step in 0..challenge.time_parameter {
        if step % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Err(VdfError::Cancelled);
        }
        y = &y * &y % n;
    }

    let ell = hash_to_prime(&x, &y, n, challenge.security_bits);

    // long division of 2^T by ℓ, one bit per squaring step:
    // r tracks the running remainder, b the emitted quotient bit.
    let mut pi = BigUint::one();
    let mut r = BigUint::one();
    for step in 0..challenge.time_parameter {
        if step % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Err(VdfError::Cancelled);
        }
        r <<= 1u32;
        pi = &pi * &pi % n;
        if r >= ell {
            r -= &ell;
            pi = pi * &x % n;
        }
    }

    let compute_ms = started.elapsed().as_millis() as u64;
    debug!(id = %challenge.id, t = challenge.time_parameter, compute_ms, "vdf solved");
    Ok(VdfProof {
        challenge_id: challenge.id.clone(),
        output: y,
        proof: pi,
        compute_ms,
    })
}

/// Wesolowski verification in two modular exponentiations, independent of
/// T: recompute ℓ from (x, y, N), then check `π^ℓ · x^r ≡ y (mod N)` with
/// `r = 2^T mod ℓ`.
pub fn verify(challenge: &VdfChallenge, proof: &VdfProof) -> Result<(), VdfError> {
    if proof.challenge_id != challenge.id {
        return Err(VdfError::ChallengeMismatch);
    }
    let n = &challenge.modulus;
    if n.bits() == 0 {
        return Err(VdfError::MissingChallenge);
    }
    if &proof.output >= n || &proof.proof >= n {
        return Err(VdfError::ModulusMismatch);
    }
    let x = &challenge.input % n;
    let y = &proof.output;

    let ell = hash_to_prime(&x, y, n, challenge.security_bits);
    let r = BigUint::from(2u32).modpow(&BigUint::from(challenge.time_parameter), &ell);
    let lhs = proof.proof.modpow(&ell, n) * x.modpow(&r, n) % n;
    if &lhs == y {
        Ok(())
    } else {
        Err(VdfError::InvalidProof("congruence check failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::generate_challenge;
    use crate::test_support::small_test_modulus;
    use crate::DEFAULT_SECURITY_BITS;

    fn unset() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn small_solve_verifies() {
        let n = small_test_modulus();
        let challenge = generate_challenge(b"small test", 10, &n, DEFAULT_SECURITY_BITS);
        let proof = solve(&challenge, &unset()).unwrap();
        verify(&challenge, &proof).unwrap();
    }

    #[test]
    fn modified_output_fails() {
        let n = small_test_modulus();
        let challenge = generate_challenge(b"small test", 10, &n, DEFAULT_SECURITY_BITS);
        let mut proof = solve(&challenge, &unset()).unwrap();
        proof.output = BigUint::from(12_345u32);
        assert!(matches!(
            verify(&challenge, &proof),
            Err(VdfError::InvalidProof(_))
        ));
    }

    #[test]
    fn modified_proof_fails() {
        let n = small_test_modulus();
        let challenge = generate_challenge(b"seed", 32, &n, DEFAULT_SECURITY_BITS);
        let mut proof = solve(&challenge, &unset()).unwrap();
        proof.proof += 1u32;
        assert!(verify(&challenge, &proof).is_err());
    }

    #[test]
    fn proof_for_other_challenge_rejected() {
        let n = small_test_modulus();
        let a = generate_challenge(b"a", 16, &n, DEFAULT_SECURITY_BITS);
        let b = generate_challenge(b"b", 16, &n, DEFAULT_SECURITY_BITS);
        let proof = solve(&a, &unset()).unwrap();
        assert!(matches!(
            verify(&b, &proof),
            Err(VdfError::ChallengeMismatch)
        ));
    }

    #[test]
    fn solve_is_deterministic() {
        let n = small_test_modulus();
        let challenge = generate_challenge(b"det", 20, &n, DEFAULT_SECURITY_BITS);
        let p1 = solve(&challenge, &unset()).unwrap();
        let p2 = solve(&challenge, &unset()).unwrap();
        assert_eq!(p1.output, p2.output);
        assert_eq!(p1.proof, p2.proof);
    }

    #[test]
    fn cancellation_aborts_solve() {
        let n = small_test_modulus();
        let challenge = generate_challenge(b"cancel", 1 << 20, &n, DEFAULT_SECURITY_BITS);
        let cancelled = AtomicBool::new(true);
        assert!(matches!(
            solve(&challenge, &cancelled),
            Err(VdfError::Cancelled)
        ));
    }

    #[test]
    fn header_data_roundtrip() {
        let n = small_test_modulus();
        let challenge = generate_challenge(b"wire", 8, &n, DEFAULT_SECURITY_BITS);
        let proof = solve(&challenge, &unset()).unwrap();
        let data = proof.to_header_data();
        let back = VdfProof::from_header_data(&data).unwrap();
        verify(&challenge, &back).unwrap();
    }
}
