use num_bigint::BigUint;
use num_traits::One;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;

const SMALL_PRIMES: [u32; 25] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
    97,
];

/// Extra Miller–Rabin rounds beyond the fixed small-prime bases. Bases are
/// derived from the candidate itself so every node reaches the same verdict.
const DERIVED_ROUNDS: usize = 28;

/// Deterministic Miller–Rabin primality check. Sound for the sizes used
/// here: the fixed bases are exact below 3.3e24, and the derived bases give
/// a negligible error bound above.
pub fn is_prime(n: &BigUint) -> bool {
    let two = BigUint::from(2u32);
    if n < &two {
        return false;
    }
    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p) == BigUint::from(0u32) {
            return false;
        }
    }

    // n - 1 = d * 2^s with d odd
    let n_minus_one = n - 1u32;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    let mut bases: Vec<BigUint> = SMALL_PRIMES[..12].iter().map(|p| BigUint::from(*p)).collect();
    bases.extend(derived_bases(n, DERIVED_ROUNDS));

    'base: for a in bases {
        let a = a % n;
        if a < two {
            continue;
        }
        let mut x = a.modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'base;
            }
        }
        return false;
    }
    true
}

fn derived_bases(n: &BigUint, count: usize) -> Vec<BigUint> {
    let n_bytes = n.to_bytes_be();
    let byte_len = n_bytes.len();
    let mut shake = Shake256::default();
    shake.update(b"mr-bases");
    shake.update(&n_bytes);
    let mut reader = shake.finalize_xof();
    let mut out = Vec::with_capacity(count);
    let mut buf = vec![0u8; byte_len];
    for _ in 0..count {
        reader.read(&mut buf);
        out.push(BigUint::from_bytes_be(&buf));
    }
    out
}

/// Rejection-samples an odd prime of exactly `bits` bits from a SHAKE-256
/// stream over the given inputs. Deterministic: the solver and every
/// verifier derive the identical prime from the same (x, y, N).
pub fn hash_to_prime(x: &BigUint, y: &BigUint, n: &BigUint, bits: u16) -> BigUint {
    assert!(bits >= 16, "security parameter too small");
    let byte_len = bits.div_ceil(8) as usize;
    let mut counter: u64 = 0;
    loop {
        let mut shake = Shake256::default();
        shake.update(b"fs-prime");
        absorb(&mut shake, x);
        absorb(&mut shake, y);
        absorb(&mut shake, n);
        shake.update(&counter.to_le_bytes());
        let mut reader = shake.finalize_xof();
        let mut buf = vec![0u8; byte_len];
        reader.read(&mut buf);

        let mut candidate = BigUint::from_bytes_be(&buf);
        let excess = (byte_len as u64) * 8 - bits as u64;
        candidate >>= excess;
        candidate.set_bit(bits as u64 - 1, true);
        candidate.set_bit(0, true);
        if is_prime(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

fn absorb(shake: &mut Shake256, value: &BigUint) {
    let bytes = value.to_bytes_be();
    shake.update(&(bytes.len() as u64).to_le_bytes());
    shake.update(&bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_small_numbers() {
        let primes = [2u32, 3, 5, 97, 101, 7919, 104_729];
        let composites = [0u32, 1, 4, 100, 7917, 104_730, 561, 41041]; // incl. Carmichael
        for p in primes {
            assert!(is_prime(&BigUint::from(p)), "{p} is prime");
        }
        for c in composites {
            assert!(!is_prime(&BigUint::from(c)), "{c} is composite");
        }
    }

    #[test]
    fn hash_to_prime_is_deterministic_and_sized() {
        let x = BigUint::from(123_456u64);
        let y = BigUint::from(987_654u64);
        let n = BigUint::from(1_000_003u64);
        let a = hash_to_prime(&x, &y, &n, 128);
        let b = hash_to_prime(&x, &y, &n, 128);
        assert_eq!(a, b);
        assert_eq!(a.bits(), 128);
        assert!(a.bit(0), "prime must be odd");
        assert!(is_prime(&a));
    }

    #[test]
    fn hash_to_prime_varies_with_input() {
        let n = BigUint::from(1_000_003u64);
        let a = hash_to_prime(&BigUint::from(1u32), &BigUint::from(2u32), &n, 64);
        let b = hash_to_prime(&BigUint::from(1u32), &BigUint::from(3u32), &n, 64);
        assert_ne!(a, b);
    }
}
