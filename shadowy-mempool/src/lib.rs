use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shadowy_core::{Block, Hash32, SignedTransaction, TxInput, TxOutput};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Where a transaction entered the node. Tracked for observability only;
/// every source passes the identical checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxSource {
    P2p,
    Api,
    Local,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already pending or in chain")]
    DuplicateHash,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("input references an unknown transaction output")]
    UnknownParentTx,
    #[error("fee rate {offered} below minimum {required}")]
    InsufficientFee { required: u64, offered: u64 },
    #[error("transaction does not fit in the mempool size cap")]
    SizeCap,
    #[error("not_until lies beyond the mempool horizon")]
    TemporalConflict,
}

/// Read-only ledger view the mempool validates against. Implemented by the
/// node over its shared ledger state.
pub trait UtxoView: Send + Sync {
    fn output(&self, input: &TxInput) -> Option<TxOutput>;
    fn tx_in_chain(&self, hash: &Hash32) -> bool;
}

#[derive(Debug, Clone)]
pub struct MempoolConfig {
    pub size_cap_bytes: usize,
    pub min_fee_rate: u64,
    pub tx_expiry: Duration,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            size_cap_bytes: 32 * 1024 * 1024,
            min_fee_rate: 0,
            tx_expiry: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    signed: SignedTransaction,
    fee: u64,
    size: usize,
    fee_rate: u64,
    added: Instant,
    sequence: u64,
    source: TxSource,
}

#[derive(Default)]
struct Inner {
    by_hash: HashMap<Hash32, Entry>,
    total_size: usize,
    sequence: u64,
}

/// Fee-priority transaction pool. One lock guards the whole index; reads
/// and writes both take it, which is cheap next to a block interval.
pub struct Mempool {
    inner: Mutex<Inner>,
    config: MempoolConfig,
    view: Arc<dyn UtxoView>,
}

impl Mempool {
    pub fn new(config: MempoolConfig, view: Arc<dyn UtxoView>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            view,
        }
    }

    /// Admission: dedup, canonical hash, signature, input resolution and
    /// ownership, fee floor, temporal horizon, then size-cap eviction.
    pub fn add(&self, signed: SignedTransaction, source: TxSource) -> Result<(), MempoolError> {
        if self.view.tx_in_chain(&signed.tx_hash) {
            return Err(MempoolError::DuplicateHash);
        }
        if shadowy_crypto::verify_signed_transaction(&signed).is_err() {
            return Err(MempoolError::SignatureInvalid);
        }
        let spender = shadowy_crypto::address_from_public_key(&signed.public_key);

        let mut input_total: u64 = 0;
        for input in &signed.transaction.inputs {
            let output = self
                .view
                .output(input)
                .ok_or(MempoolError::UnknownParentTx)?;
            if output.address != spender {
                return Err(MempoolError::SignatureInvalid);
            }
            input_total = input_total
                .checked_add(output.value)
                .ok_or(MempoolError::SignatureInvalid)?;
        }
        let output_total = signed
            .transaction
            .total_output_value()
            .ok_or(MempoolError::SignatureInvalid)?;
        let fee = input_total.saturating_sub(output_total);

        if let Some(not_until) = signed.transaction.not_until {
            let horizon = Utc::now()
                + chrono::Duration::from_std(self.config.tx_expiry)
                    .unwrap_or_else(|_| chrono::Duration::seconds(86_400));
            if not_until > horizon {
                return Err(MempoolError::TemporalConflict);
            }
        }

        let size = signed.encoded_size();
        if size > self.config.size_cap_bytes {
            return Err(MempoolError::SizeCap);
        }
        let fee_rate = fee / size.max(1) as u64;
        if fee_rate < self.config.min_fee_rate {
            return Err(MempoolError::InsufficientFee {
                required: self.config.min_fee_rate,
                offered: fee_rate,
            });
        }

        let mut inner = self.inner.lock();
        if inner.by_hash.contains_key(&signed.tx_hash) {
            return Err(MempoolError::DuplicateHash);
        }
        let hash = signed.tx_hash;
        inner.sequence += 1;
        let entry = Entry {
            signed,
            fee,
            size,
            fee_rate,
            added: Instant::now(),
            sequence: inner.sequence,
            source,
        };
        inner.total_size += size;
        inner.by_hash.insert(hash, entry);

        let evicted = evict_to_cap(&mut inner, self.config.size_cap_bytes);
        if evicted.contains(&hash) {
            return Err(MempoolError::SizeCap);
        }
        debug!(tx = %hash, fee, fee_rate, size, ?source, "mempool accepted");
        Ok(())
    }

    pub fn get(&self, hash: &Hash32) -> Option<SignedTransaction> {
        self.inner.lock().by_hash.get(hash).map(|e| e.signed.clone())
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.inner.lock().by_hash.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_hash.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size
    }

    pub fn fee_of(&self, hash: &Hash32) -> Option<u64> {
        self.inner.lock().by_hash.get(hash).map(|e| e.fee)
    }

    pub fn source_of(&self, hash: &Hash32) -> Option<TxSource> {
        self.inner.lock().by_hash.get(hash).map(|e| e.source)
    }

    /// Up to `n` non-conflicting transactions, fee rate descending, ties to
    /// the earlier arrival. Entries whose `not_until` is still in the
    /// future and entries double-spending a selected input are skipped.
    pub fn highest_priority(&self, n: usize) -> Vec<SignedTransaction> {
        let now = Utc::now();
        let inner = self.inner.lock();
        let mut entries: Vec<&Entry> = inner.by_hash.values().collect();
        entries.sort_by(|a, b| {
            b.fee_rate
                .cmp(&a.fee_rate)
                .then(a.sequence.cmp(&b.sequence))
        });

        let mut selected = Vec::new();
        let mut claimed: HashSet<TxInput> = HashSet::new();
        for entry in entries {
            if selected.len() >= n {
                break;
            }
            if let Some(not_until) = entry.signed.transaction.not_until {
                if not_until > now {
                    continue;
                }
            }
            if entry
                .signed
                .transaction
                .inputs
                .iter()
                .any(|i| claimed.contains(i))
            {
                continue;
            }
            claimed.extend(entry.signed.transaction.inputs.iter().copied());
            selected.push(entry.signed.clone());
        }
        selected
    }

    /// Drops every transaction the block carries. Emitted by the chain
    /// writer on `BlockAccepted` before anyone learns of the new tip.
    pub fn remove_included(&self, block: &Block) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for tx in &block.transactions {
            if let Some(entry) = inner.by_hash.remove(&tx.tx_hash) {
                inner.total_size -= entry.size;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, height = block.height(), "mempool pruned by block");
        }
        removed
    }

    /// Expiry sweep; returns the number of dropped entries.
    pub fn evict_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let expiry = self.config.tx_expiry;
        let stale: Vec<Hash32> = inner
            .by_hash
            .iter()
            .filter(|(_, e)| e.added.elapsed() > expiry)
            .map(|(h, _)| *h)
            .collect();
        for hash in &stale {
            if let Some(entry) = inner.by_hash.remove(hash) {
                inner.total_size -= entry.size;
            }
        }
        stale.len()
    }
}

/// Evicts lowest fee rate first, oldest first among equals, until the pool
/// fits the cap again. Returns the evicted hashes.
fn evict_to_cap(inner: &mut Inner, cap: usize) -> Vec<Hash32> {
    let mut evicted = Vec::new();
    while inner.total_size > cap {
        let victim = inner
            .by_hash
            .values()
            .min_by(|a, b| {
                a.fee_rate
                    .cmp(&b.fee_rate)
                    .then(a.sequence.cmp(&b.sequence))
            })
            .map(|e| e.signed.tx_hash);
        let Some(hash) = victim else { break };
        if let Some(entry) = inner.by_hash.remove(&hash) {
            inner.total_size -= entry.size;
            debug!(tx = %hash, fee_rate = entry.fee_rate, "mempool evicted on size cap");
            evicted.push(hash);
        }
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::RwLock;
    use shadowy_core::{sha3_digest, Transaction};
    use shadowy_crypto::Keypair;

    #[derive(Default)]
    struct MockView {
        outputs: RwLock<HashMap<TxInput, TxOutput>>,
        chain_txs: RwLock<HashSet<Hash32>>,
    }

    impl UtxoView for MockView {
        fn output(&self, input: &TxInput) -> Option<TxOutput> {
            self.outputs.read().get(input).cloned()
        }

        fn tx_in_chain(&self, hash: &Hash32) -> bool {
            self.chain_txs.read().contains(hash)
        }
    }

    struct Fixture {
        view: Arc<MockView>,
        keypair: Keypair,
        counter: u64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                view: Arc::new(MockView::default()),
                keypair: Keypair::generate(),
                counter: 0,
            }
        }

        /// A signed transfer spending one freshly funded output, tuned so
        /// that fee / size equals `fee_rate`.
        fn tx_with_fee_rate(&mut self, fee_rate: u64) -> SignedTransaction {
            self.counter += 1;
            let input = TxInput {
                prev_tx: sha3_digest(&self.counter.to_le_bytes()),
                output_index: 0,
            };
            let body = Transaction {
                version: Transaction::CURRENT_VERSION,
                inputs: vec![input],
                outputs: vec![TxOutput {
                    address: self.keypair.address(),
                    value: 1_000,
                }],
                token_ops: Vec::new(),
                timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                not_until: None,
                nonce: self.counter,
            };
            let signed = shadowy_crypto::sign_transaction(body, &self.keypair).unwrap();
            let size = signed.encoded_size() as u64;
            self.view.outputs.write().insert(
                input,
                TxOutput {
                    address: self.keypair.address(),
                    value: 1_000 + fee_rate * size,
                },
            );
            signed
        }
    }

    fn pool_with(view: Arc<MockView>, config: MempoolConfig) -> Mempool {
        Mempool::new(config, view)
    }

    #[test]
    fn accepts_and_dedups() {
        let mut fx = Fixture::new();
        let pool = pool_with(fx.view.clone(), MempoolConfig::default());
        let tx = fx.tx_with_fee_rate(2);
        pool.add(tx.clone(), TxSource::Local).unwrap();
        assert_eq!(pool.add(tx.clone(), TxSource::P2p), Err(MempoolError::DuplicateHash));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.source_of(&tx.tx_hash), Some(TxSource::Local));
    }

    #[test]
    fn rejects_unknown_parent_and_bad_signature() {
        let mut fx = Fixture::new();
        let pool = pool_with(fx.view.clone(), MempoolConfig::default());

        let mut orphan = fx.tx_with_fee_rate(2);
        fx.view.outputs.write().clear();
        assert_eq!(
            pool.add(orphan.clone(), TxSource::P2p),
            Err(MempoolError::UnknownParentTx)
        );

        orphan.signature[0] ^= 0xff;
        assert_eq!(
            pool.add(orphan, TxSource::P2p),
            Err(MempoolError::SignatureInvalid)
        );
    }

    #[test]
    fn rejects_replayed_chain_tx() {
        let mut fx = Fixture::new();
        let pool = pool_with(fx.view.clone(), MempoolConfig::default());
        let tx = fx.tx_with_fee_rate(2);
        fx.view.chain_txs.write().insert(tx.tx_hash);
        assert_eq!(pool.add(tx, TxSource::Api), Err(MempoolError::DuplicateHash));
    }

    #[test]
    fn enforces_min_fee_rate() {
        let mut fx = Fixture::new();
        let pool = pool_with(
            fx.view.clone(),
            MempoolConfig {
                min_fee_rate: 5,
                ..MempoolConfig::default()
            },
        );
        let cheap = fx.tx_with_fee_rate(2);
        assert!(matches!(
            pool.add(cheap, TxSource::Local),
            Err(MempoolError::InsufficientFee { required: 5, .. })
        ));
        let fine = fx.tx_with_fee_rate(5);
        pool.add(fine, TxSource::Local).unwrap();
    }

    #[test]
    fn size_cap_evicts_lowest_fee_rate() {
        let mut fx = Fixture::new();
        let a = fx.tx_with_fee_rate(10);
        let b = fx.tx_with_fee_rate(5);
        let c = fx.tx_with_fee_rate(20);
        // cap admits two entries but not all three
        let cap = a.encoded_size() + b.encoded_size() + c.encoded_size()
            - c.encoded_size() / 2;
        let pool = pool_with(
            fx.view.clone(),
            MempoolConfig {
                size_cap_bytes: cap,
                ..MempoolConfig::default()
            },
        );
        pool.add(a.clone(), TxSource::Local).unwrap();
        pool.add(b.clone(), TxSource::Local).unwrap();
        pool.add(c.clone(), TxSource::Local).unwrap();

        assert!(!pool.contains(&b.tx_hash), "lowest fee rate evicted");
        assert!(pool.contains(&a.tx_hash));
        assert!(pool.contains(&c.tx_hash));
        assert!(pool.total_size() <= cap);

        let selected = pool.highest_priority(2);
        assert_eq!(selected[0].tx_hash, c.tx_hash);
        assert_eq!(selected[1].tx_hash, a.tx_hash);
    }

    #[test]
    fn priority_ties_break_by_arrival() {
        let mut fx = Fixture::new();
        let pool = pool_with(fx.view.clone(), MempoolConfig::default());
        let first = fx.tx_with_fee_rate(7);
        let second = fx.tx_with_fee_rate(7);
        pool.add(first.clone(), TxSource::Local).unwrap();
        pool.add(second.clone(), TxSource::Local).unwrap();
        let selected = pool.highest_priority(10);
        assert_eq!(selected[0].tx_hash, first.tx_hash);
        assert_eq!(selected[1].tx_hash, second.tx_hash);
    }

    #[test]
    fn conflicting_spends_not_coselected() {
        let mut fx = Fixture::new();
        let pool = pool_with(fx.view.clone(), MempoolConfig::default());
        let tx = fx.tx_with_fee_rate(4);
        // rival spends the same input with a different nonce
        let mut rival_body = tx.transaction.clone();
        rival_body.nonce += 1_000;
        let rival = shadowy_crypto::sign_transaction(rival_body, &fx.keypair).unwrap();

        pool.add(tx, TxSource::Local).unwrap();
        pool.add(rival, TxSource::Local).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.highest_priority(10).len(), 1);
    }

    #[test]
    fn remove_included_prunes_block_txs() {
        let mut fx = Fixture::new();
        let pool = pool_with(fx.view.clone(), MempoolConfig::default());
        let a = fx.tx_with_fee_rate(3);
        let b = fx.tx_with_fee_rate(9);
        pool.add(a.clone(), TxSource::Local).unwrap();
        pool.add(b.clone(), TxSource::Local).unwrap();

        let mut block = Block::genesis(
            "test",
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            fx.keypair.address(),
        );
        block.transactions.push(a.clone());
        assert_eq!(pool.remove_included(&block), 1);
        assert!(!pool.contains(&a.tx_hash));
        assert!(pool.contains(&b.tx_hash));
    }

    #[test]
    fn far_future_not_until_rejected() {
        let mut fx = Fixture::new();
        let pool = pool_with(fx.view.clone(), MempoolConfig::default());
        let mut tx = fx.tx_with_fee_rate(2);
        let mut body = tx.transaction.clone();
        body.not_until = Some(Utc::now() + chrono::Duration::days(30));
        tx = shadowy_crypto::sign_transaction(body, &fx.keypair).unwrap();
        // refund the new hash's input resolution
        assert_eq!(
            pool.add(tx, TxSource::Local),
            Err(MempoolError::TemporalConflict)
        );
    }
}
