use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{
    DetachedSignature as _, PublicKey as _, SecretKey as _,
};
use serde::{Deserialize, Serialize};
use shadowy_core::{
    identifier_from_public_key, Address, Hash32, SignatureAlgorithm, SignedTransaction,
    Transaction,
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed public key")]
    BadPublicKey,
    #[error("malformed secret key")]
    BadSecretKey,
    #[error("malformed signature")]
    BadSignature,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error("transaction hash does not match its body")]
    HashMismatch,
}

/// ML-DSA-87 keypair. The secret half is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    #[zeroize(skip)]
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
}

impl Keypair {
    pub fn generate() -> Self {
        let (pk, sk) = dilithium5::keypair();
        Self {
            public_key: pk.as_bytes().to_vec(),
            secret_key: sk.as_bytes().to_vec(),
        }
    }

    pub fn from_parts(public_key: Vec<u8>, secret_key: Vec<u8>) -> Result<Self, CryptoError> {
        dilithium5::PublicKey::from_bytes(&public_key).map_err(|_| CryptoError::BadPublicKey)?;
        dilithium5::SecretKey::from_bytes(&secret_key).map_err(|_| CryptoError::BadSecretKey)?;
        Ok(Self {
            public_key,
            secret_key,
        })
    }

    /// SHAKE-128 digest of the public key; ranks the key against challenges
    /// and backs the `S` address.
    pub fn identifier(&self) -> Hash32 {
        identifier_from_public_key(&self.public_key)
    }

    pub fn address(&self) -> Address {
        Address::from_identifier(&self.identifier())
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sk = dilithium5::SecretKey::from_bytes(&self.secret_key)
            .map_err(|_| CryptoError::BadSecretKey)?;
        let sig = dilithium5::detached_sign(message, &sk);
        Ok(sig.as_bytes().to_vec())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // secret half intentionally absent
        write!(f, "Keypair({})", self.address())
    }
}

pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let pk =
        dilithium5::PublicKey::from_bytes(public_key).map_err(|_| CryptoError::BadPublicKey)?;
    let sig = dilithium5::DetachedSignature::from_bytes(signature)
        .map_err(|_| CryptoError::BadSignature)?;
    dilithium5::verify_detached_signature(&sig, message, &pk)
        .map_err(|_| CryptoError::VerificationFailed)
}

pub fn address_from_public_key(public_key: &[u8]) -> Address {
    Address::from_identifier(&identifier_from_public_key(public_key))
}

/// Signs a transaction body and wraps it for the wire.
pub fn sign_transaction(
    transaction: Transaction,
    keypair: &Keypair,
) -> Result<SignedTransaction, CryptoError> {
    let bytes = transaction.canonical_bytes();
    let signature = keypair.sign(&bytes)?;
    Ok(SignedTransaction {
        tx_hash: transaction.hash(),
        transaction,
        public_key: keypair.public_key.clone(),
        algorithm: SignatureAlgorithm::MlDsa87,
        signature,
    })
}

/// Full ingress check: claimed hash matches the canonical body, the
/// algorithm is known, and the detached signature verifies under the
/// embedded public key. Ownership checks against referenced outputs are the
/// consensus layer's job.
pub fn verify_signed_transaction(signed: &SignedTransaction) -> Result<(), CryptoError> {
    if signed.algorithm != SignatureAlgorithm::MlDsa87 {
        return Err(CryptoError::UnsupportedAlgorithm);
    }
    if !signed.hash_matches() {
        return Err(CryptoError::HashMismatch);
    }
    verify(
        &signed.public_key,
        &signed.transaction.canonical_bytes(),
        &signed.signature,
    )
}

/// Serializable keypair blob stored inside plot files; sufficient to
/// reconstruct the keypair and re-derive its identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBlob {
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
}

impl KeyBlob {
    pub fn from_keypair(keypair: &Keypair) -> Self {
        Self {
            public_key: keypair.public_key.clone(),
            secret_key: keypair.secret_key.clone(),
        }
    }

    pub fn into_keypair(self) -> Result<Keypair, CryptoError> {
        Keypair::from_parts(self.public_key, self.secret_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shadowy_core::TxOutput;

    #[test]
    fn sign_and_verify_detached() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"challenge bytes").unwrap();
        verify(&kp.public_key, b"challenge bytes", &sig).unwrap();
        assert!(matches!(
            verify(&kp.public_key, b"other bytes", &sig),
            Err(CryptoError::VerificationFailed)
        ));
    }

    #[test]
    fn address_matches_identifier() {
        let kp = Keypair::generate();
        assert_eq!(
            kp.address(),
            address_from_public_key(&kp.public_key)
        );
        assert_eq!(kp.address().payload(), kp.identifier());
    }

    #[test]
    fn signed_transaction_roundtrip() {
        let kp = Keypair::generate();
        let tx = Transaction {
            version: Transaction::CURRENT_VERSION,
            inputs: Vec::new(),
            outputs: vec![TxOutput {
                address: kp.address(),
                value: 10,
            }],
            token_ops: Vec::new(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            not_until: None,
            nonce: 1,
        };
        let signed = sign_transaction(tx, &kp).unwrap();
        verify_signed_transaction(&signed).unwrap();

        let mut tampered = signed;
        tampered.transaction.outputs[0].value = 11;
        assert!(verify_signed_transaction(&tampered).is_err());
    }

    #[test]
    fn keyblob_reconstructs_keypair() {
        let kp = Keypair::generate();
        let blob = KeyBlob::from_keypair(&kp);
        let restored = blob.into_keypair().unwrap();
        assert_eq!(restored.identifier(), kp.identifier());
        let sig = restored.sign(b"msg").unwrap();
        verify(&kp.public_key, b"msg", &sig).unwrap();
    }
}
