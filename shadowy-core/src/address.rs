use crate::{sha3_digest, CoreError, Hash32};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Which family an address belongs to. Standard addresses are controlled by
/// a keypair; pool addresses are derived from pool metadata and owned only
/// by protocol rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Standard,
    Pool,
}

/// Textual address. `S…` wraps the 32-byte identifier of a public key,
/// `L…` wraps the 32-byte digest of a liquidity-pool descriptor.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn from_identifier(id: &Hash32) -> Self {
        Self(format!("S{}", bs58::encode(id.as_bytes()).into_string()))
    }

    pub fn pool_from_digest(digest: &Hash32) -> Self {
        Self(format!("L{}", bs58::encode(digest.as_bytes()).into_string()))
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let rest = s
            .strip_prefix('S')
            .or_else(|| s.strip_prefix('L'))
            .ok_or_else(|| CoreError::InvalidAddress(s.to_string()))?;
        let bytes = bs58::decode(rest)
            .into_vec()
            .map_err(|_| CoreError::InvalidAddress(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(CoreError::InvalidAddress(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn kind(&self) -> AddressKind {
        if self.0.starts_with('L') {
            AddressKind::Pool
        } else {
            AddressKind::Standard
        }
    }

    /// The 32-byte payload behind the prefix.
    pub fn payload(&self) -> Hash32 {
        let bytes = bs58::decode(&self.0[1..])
            .into_vec()
            .expect("validated at construction");
        let arr: [u8; 32] = bytes.try_into().expect("validated at construction");
        Hash32(arr)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Deterministic pool address from its descriptor fields. Every node derives
/// the same `L` address for the same create operation.
pub fn derive_pool_address(
    token_a: &crate::TokenRef,
    token_b: &crate::TokenRef,
    fee_bps: u16,
    creator: &Address,
    nonce: u64,
) -> Address {
    let mut preimage = Vec::new();
    preimage.extend_from_slice(token_a.digest_bytes().as_bytes());
    preimage.extend_from_slice(token_b.digest_bytes().as_bytes());
    preimage.extend_from_slice(&fee_bps.to_le_bytes());
    preimage.extend_from_slice(creator.as_str().as_bytes());
    preimage.extend_from_slice(&nonce.to_le_bytes());
    Address::pool_from_digest(&sha3_digest(&preimage))
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier_from_public_key;

    #[test]
    fn standard_address_roundtrip() {
        let id = identifier_from_public_key(b"some public key");
        let addr = Address::from_identifier(&id);
        assert!(addr.as_str().starts_with('S'));
        assert_eq!(addr.kind(), AddressKind::Standard);
        assert_eq!(addr.payload(), id);
        assert_eq!(Address::parse(addr.as_str()).unwrap(), addr);
    }

    #[test]
    fn pool_address_is_deterministic() {
        let creator = Address::from_identifier(&identifier_from_public_key(b"creator"));
        let a = derive_pool_address(
            &crate::TokenRef::Shadow,
            &crate::TokenRef::Shadow,
            30,
            &creator,
            7,
        );
        let b = derive_pool_address(
            &crate::TokenRef::Shadow,
            &crate::TokenRef::Shadow,
            30,
            &creator,
            7,
        );
        assert_eq!(a, b);
        assert_eq!(a.kind(), AddressKind::Pool);
        assert!(a.as_str().starts_with('L'));
    }

    #[test]
    fn rejects_unknown_prefix() {
        assert!(Address::parse("Xabc").is_err());
        assert!(Address::parse("").is_err());
        assert!(Address::parse("S!!!").is_err());
    }
}
