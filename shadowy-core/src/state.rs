use crate::{sha3_digest, Address, Hash32, PoolState, TokenId, TokenMetadata, TxOutput};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// In-memory ledger reconstructed from the chain: the unspent output set,
/// token balances and metadata, pool reserves and applied-transaction hashes
/// for replay protection. Owned exclusively by the chain-writer task;
/// everything else sees snapshots or query results.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    pub utxos: HashMap<(Hash32, u32), TxOutput>,
    pub token_balances: HashMap<(TokenId, Address), u64>,
    pub tokens: HashMap<TokenId, TokenMetadata>,
    pub pools: HashMap<Address, PoolState>,
    pub melted: HashMap<TokenId, u64>,
    pub syndicates: HashMap<Hash32, Vec<Address>>,
    pub applied_txs: HashSet<Hash32>,
}

impl LedgerState {
    /// SHADOW balance of an address: the sum of its unspent outputs,
    /// including synthetic credit outputs minted by melts and sales.
    pub fn balance(&self, address: &Address) -> u64 {
        self.utxos
            .values()
            .filter(|o| &o.address == address)
            .map(|o| o.value)
            .sum()
    }

    pub fn token_balance(&self, token: &TokenId, address: &Address) -> u64 {
        self.token_balances
            .get(&(*token, address.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Circulating units of a token across all holders.
    pub fn token_circulating(&self, token: &TokenId) -> u64 {
        self.token_balances
            .iter()
            .filter(|((id, _), _)| id == token)
            .map(|(_, amount)| *amount)
            .sum()
    }

    pub fn melted_units(&self, token: &TokenId) -> u64 {
        self.melted.get(token).copied().unwrap_or(0)
    }

    pub fn contains_tx(&self, tx_hash: &Hash32) -> bool {
        self.applied_txs.contains(tx_hash)
    }

    /// Deterministic digest of the whole ledger, used by rollback tests and
    /// snapshot integrity checks. Iteration order is fixed by sorting keys.
    pub fn state_hash(&self) -> Hash32 {
        sha3_digest(&serde_json::to_vec(&self.snapshot()).expect("snapshot serializes"))
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut utxos: Vec<UtxoEntry> = self
            .utxos
            .iter()
            .map(|((tx, index), output)| UtxoEntry {
                tx_hash: *tx,
                output_index: *index,
                output: output.clone(),
            })
            .collect();
        utxos.sort_by(|a, b| (a.tx_hash, a.output_index).cmp(&(b.tx_hash, b.output_index)));

        let mut balances: Vec<TokenBalanceEntry> = self
            .token_balances
            .iter()
            .filter(|(_, amount)| **amount > 0)
            .map(|((token, address), amount)| TokenBalanceEntry {
                token_id: *token,
                address: address.clone(),
                amount: *amount,
            })
            .collect();
        balances.sort_by(|a, b| (a.token_id, &a.address).cmp(&(b.token_id, &b.address)));

        let mut tokens: Vec<TokenMetadata> = self.tokens.values().cloned().collect();
        tokens.sort_by_key(|t| t.token_id);

        let mut pools: Vec<PoolState> = self.pools.values().cloned().collect();
        pools.sort_by(|a, b| a.address.cmp(&b.address));

        let mut melted: Vec<(TokenId, u64)> =
            self.melted.iter().map(|(k, v)| (*k, *v)).collect();
        melted.sort_by_key(|(k, _)| *k);

        let mut syndicates: Vec<(Hash32, Vec<Address>)> = self
            .syndicates
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        syndicates.sort_by_key(|(k, _)| *k);

        let mut applied_txs: Vec<Hash32> = self.applied_txs.iter().copied().collect();
        applied_txs.sort();

        LedgerSnapshot {
            utxos,
            token_balances: balances,
            tokens,
            pools,
            melted,
            syndicates,
            applied_txs,
        }
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let mut state = LedgerState::default();
        for entry in snapshot.utxos {
            state
                .utxos
                .insert((entry.tx_hash, entry.output_index), entry.output);
        }
        for entry in snapshot.token_balances {
            state
                .token_balances
                .insert((entry.token_id, entry.address), entry.amount);
        }
        for token in snapshot.tokens {
            state.tokens.insert(token.token_id, token);
        }
        for pool in snapshot.pools {
            state.pools.insert(pool.address.clone(), pool);
        }
        state.melted = snapshot.melted.into_iter().collect();
        state.syndicates = snapshot.syndicates.into_iter().collect();
        state.applied_txs = snapshot.applied_txs.into_iter().collect();
        state
    }
}

/// Persisted form of the ledger; field order and sorted vectors make the
/// encoding canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub utxos: Vec<UtxoEntry>,
    pub token_balances: Vec<TokenBalanceEntry>,
    pub tokens: Vec<TokenMetadata>,
    pub pools: Vec<PoolState>,
    pub melted: Vec<(TokenId, u64)>,
    pub syndicates: Vec<(Hash32, Vec<Address>)>,
    pub applied_txs: Vec<Hash32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub tx_hash: Hash32,
    pub output_index: u32,
    pub output: TxOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalanceEntry {
    pub token_id: TokenId,
    pub address: Address,
    pub amount: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier_from_public_key;

    fn addr(seed: &[u8]) -> Address {
        Address::from_identifier(&identifier_from_public_key(seed))
    }

    #[test]
    fn balance_sums_unspent_outputs() {
        let mut state = LedgerState::default();
        let owner = addr(b"owner");
        state.utxos.insert(
            (sha3_digest(b"a"), 0),
            TxOutput {
                address: owner.clone(),
                value: 40,
            },
        );
        state.utxos.insert(
            (sha3_digest(b"b"), 2),
            TxOutput {
                address: owner.clone(),
                value: 2,
            },
        );
        state.utxos.insert(
            (sha3_digest(b"c"), 0),
            TxOutput {
                address: addr(b"other"),
                value: 100,
            },
        );
        assert_eq!(state.balance(&owner), 42);
    }

    #[test]
    fn state_hash_ignores_insertion_order() {
        let mut a = LedgerState::default();
        let mut b = LedgerState::default();
        let entries = [(sha3_digest(b"x"), 0u32, 5u64), (sha3_digest(b"y"), 1, 9)];
        for (tx, index, value) in entries {
            a.utxos.insert(
                (tx, index),
                TxOutput {
                    address: addr(b"o"),
                    value,
                },
            );
        }
        for (tx, index, value) in entries.iter().rev() {
            b.utxos.insert(
                (*tx, *index),
                TxOutput {
                    address: addr(b"o"),
                    value: *value,
                },
            );
        }
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn snapshot_roundtrip_preserves_hash() {
        let mut state = LedgerState::default();
        state.utxos.insert(
            (sha3_digest(b"tx"), 0),
            TxOutput {
                address: addr(b"o"),
                value: 1234,
            },
        );
        state
            .token_balances
            .insert((sha3_digest(b"tok"), addr(b"o")), 77);
        state.applied_txs.insert(sha3_digest(b"tx"));
        let snap = state.snapshot();
        let restored = LedgerState::from_snapshot(snap);
        assert_eq!(restored.state_hash(), state.state_hash());
    }
}
