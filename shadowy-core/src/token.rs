use crate::{sha3_digest, Address, CoreError, Hash32};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TokenId = Hash32;

pub const MAX_TOKEN_NAME_LEN: usize = 64;
pub const MAX_TOKEN_TICKER_LEN: usize = 12;

/// Either the native coin or a created token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TokenRef {
    Shadow,
    Token(TokenId),
}

impl TokenRef {
    pub fn digest_bytes(&self) -> Hash32 {
        match self {
            TokenRef::Shadow => Hash32::ZERO,
            TokenRef::Token(id) => *id,
        }
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self, TokenRef::Shadow)
    }
}

/// Token operations carried by a transaction. Tagged variants; the tag is
/// part of the canonical bytes and therefore of the transaction hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TokenOp {
    Create {
        name: String,
        ticker: String,
        total_supply: u64,
        decimals: u8,
        lock_amount: u64,
        creator: Address,
    },
    Transfer {
        token_id: TokenId,
        amount: u64,
        from: Address,
        to: Address,
    },
    Melt {
        token_id: TokenId,
        amount: u64,
        from: Address,
    },
    PoolCreate {
        token_a: TokenRef,
        token_b: TokenRef,
        initial_a: u64,
        initial_b: u64,
        fee_bps: u16,
        creator: Address,
        nonce: u64,
    },
    PoolSwap {
        pool: Address,
        input: TokenRef,
        output: TokenRef,
        input_amount: u64,
        max_slippage_bps: u16,
        min_received: u64,
        expiration: DateTime<Utc>,
        all_or_nothing: bool,
    },
    TradeOfferCreate {
        locked_token: TokenRef,
        locked_amount: u64,
        asking_token: TokenRef,
        asking_price: u64,
        expiration_hours: u32,
        seller: Address,
    },
    TradePurchase {
        trade_nft: TokenId,
        buyer: Address,
    },
    SyndicateJoin {
        syndicate: Hash32,
        member: Address,
    },
}

/// Escrow terms carried by a 1-of-1 trade-offer NFT. Ownership of the NFT
/// is custody of the locked asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTerms {
    pub seller: Address,
    pub locked_token: TokenRef,
    pub locked_amount: u64,
    pub asking_token: TokenRef,
    pub asking_price: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub token_id: TokenId,
    pub name: String,
    pub ticker: String,
    pub decimals: u8,
    pub total_supply: u64,
    /// SHADOW satoshis locked per base unit, released on melt.
    pub lock_amount: u64,
    pub creator: Address,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade: Option<TradeTerms>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syndicate: Option<SyndicateInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyndicateInfo {
    pub syndicate_id: Hash32,
    pub members: Vec<Address>,
}

/// token_id = digest of the canonical creation metadata. Immutable once
/// minted; re-creating identical metadata yields the same id and is
/// rejected as a duplicate.
pub fn derive_token_id(
    name: &str,
    ticker: &str,
    total_supply: u64,
    decimals: u8,
    lock_amount: u64,
    creator: &Address,
    creation_tx: &Hash32,
) -> TokenId {
    let mut preimage = Vec::new();
    preimage.extend_from_slice(name.as_bytes());
    preimage.push(0);
    preimage.extend_from_slice(ticker.as_bytes());
    preimage.push(0);
    preimage.extend_from_slice(&total_supply.to_le_bytes());
    preimage.push(decimals);
    preimage.extend_from_slice(&lock_amount.to_le_bytes());
    preimage.extend_from_slice(creator.as_str().as_bytes());
    preimage.extend_from_slice(creation_tx.as_bytes());
    sha3_digest(&preimage)
}

/// Constant-product pool keyed by its `L` address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub address: Address,
    pub token_a: TokenRef,
    pub token_b: TokenRef,
    pub reserve_a: u64,
    pub reserve_b: u64,
    pub fee_bps: u16,
    pub share_token: TokenId,
    pub creator: Address,
}

impl PoolState {
    pub fn k(&self) -> u128 {
        self.reserve_a as u128 * self.reserve_b as u128
    }

    /// Orients the reserves for a swap of `input` into the pool. Returns
    /// (reserve_in, reserve_out) or None when the token is not in the pair.
    pub fn oriented_reserves(&self, input: &TokenRef) -> Option<(u64, u64)> {
        if *input == self.token_a {
            Some((self.reserve_a, self.reserve_b))
        } else if *input == self.token_b {
            Some((self.reserve_b, self.reserve_a))
        } else {
            None
        }
    }
}

/// Constant-product output for a fee-adjusted swap:
/// `out = reserve_out * in_fee / (reserve_in * 10000 + in_fee)` with
/// `in_fee = input * (10000 - fee_bps)`. The fee stays in the reserves, so
/// `k` never decreases across a swap.
pub fn swap_output(
    reserve_in: u64,
    reserve_out: u64,
    input_amount: u64,
    fee_bps: u16,
) -> Result<u64, CoreError> {
    if fee_bps >= 10_000 {
        return Err(CoreError::Overflow("swap fee"));
    }
    let in_with_fee = input_amount as u128 * (10_000 - fee_bps as u128);
    let denominator = reserve_in as u128 * 10_000 + in_with_fee;
    if denominator == 0 {
        return Err(CoreError::Overflow("swap denominator"));
    }
    let out = reserve_out as u128 * in_with_fee / denominator;
    u64::try_from(out).map_err(|_| CoreError::Overflow("swap output"))
}

/// Zero-fee spot quote used for slippage comparison.
pub fn spot_quote(reserve_in: u64, reserve_out: u64, input_amount: u64) -> u64 {
    if reserve_in == 0 {
        return 0;
    }
    let out = reserve_out as u128 * input_amount as u128 / reserve_in as u128;
    u64::try_from(out).unwrap_or(u64::MAX)
}
