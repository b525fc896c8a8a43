use crate::{NodeEvent, SharedLedger, TipInfo};
use chrono::{DateTime, Utc};
use shadowy_consensus::{retarget, BlockError, BlockValidator, ChainParams};
use shadowy_core::{identifier_from_public_key, Address, Block, Hash32};
use shadowy_mempool::Mempool;
use shadowy_storage::{with_backoff, ChainStore, SqliteStore, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const BLACKLIST_COOLDOWN: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    Local,
    Peer,
}

/// How a submission was turned away. `Invalid` is the only kind a peer is
/// penalised for; `Internal` is a local storage fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    Recoverable,
    Invalid,
    Internal,
}

#[derive(Debug, Clone)]
pub struct BlockRejection {
    pub kind: RejectKind,
    pub reason: String,
}

impl From<&WriterError> for BlockRejection {
    fn from(error: &WriterError) -> Self {
        let kind = match error {
            WriterError::Block(b) if b.is_recoverable() => RejectKind::Recoverable,
            WriterError::Block(_) => RejectKind::Invalid,
            WriterError::Storage(_) => RejectKind::Internal,
        };
        Self {
            kind,
            reason: error.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum WriterCommand {
    SubmitBlock {
        block: Box<Block>,
        origin: BlockOrigin,
        respond: Option<oneshot::Sender<Result<(), BlockRejection>>>,
    },
}

/// Deterministic genesis for a parameter set; its hash is the chain id
/// every peer must share.
pub fn genesis_block_for(params: &ChainParams, timestamp: DateTime<Utc>) -> Block {
    let treasury = Address::from_identifier(&identifier_from_public_key(
        params.chain_name.as_bytes(),
    ));
    Block::genesis(&params.chain_name, timestamp, treasury)
}

pub fn genesis_hash_for(params: &ChainParams, timestamp: DateTime<Utc>) -> Hash32 {
    genesis_block_for(params, timestamp).hash()
}

/// The single task with write access to the chain store, tip and ledger.
/// Everyone else submits candidates over the command queue; commits are
/// serial, so tip advancement is linearizable.
pub struct ChainWriter {
    store: SqliteStore,
    validator: BlockValidator,
    ledger: SharedLedger,
    mempool: Arc<Mempool>,
    events: broadcast::Sender<NodeEvent>,
    tip_tx: watch::Sender<TipInfo>,
    tip_rx: watch::Receiver<TipInfo>,
    difficulty_bits: u32,
    orphans: HashMap<Hash32, Vec<Block>>,
    orphan_capacity: usize,
    blacklist: HashMap<Hash32, Instant>,
}

impl ChainWriter {
    /// Opens (or creates) the chain: writes genesis on first start and
    /// replays retarget boundaries to recover the current difficulty.
    pub async fn bootstrap(
        store: SqliteStore,
        validator: BlockValidator,
        ledger: SharedLedger,
        mempool: Arc<Mempool>,
        events: broadcast::Sender<NodeEvent>,
        orphan_capacity: usize,
        genesis_time: DateTime<Utc>,
    ) -> Result<Self, WriterError> {
        let params = validator.params().clone();
        let tip = match store.tip().await? {
            Some((height, hash)) => {
                let block = store
                    .block_by_hash(&hash)
                    .await?
                    .ok_or_else(|| StorageError::Corrupt("tip points at missing block".into()))?;
                TipInfo {
                    height,
                    hash,
                    timestamp: block.header.timestamp,
                }
            }
            None => {
                let genesis = genesis_block_for(&params, genesis_time);
                validator.validate_genesis(&genesis)?;
                let hash = genesis.hash();
                let snapshot = ledger.0.read().snapshot();
                store.put_block(&genesis).await?;
                store.set_canonical(0, &hash).await?;
                store.set_tip(0, &hash).await?;
                store.save_snapshot(0, &snapshot).await?;
                info!(%hash, chain = %params.chain_name, "genesis written");
                TipInfo {
                    height: 0,
                    hash,
                    timestamp: genesis.header.timestamp,
                }
            }
        };

        rebuild_ledger(&store, &ledger, &params, tip.height).await?;
        let difficulty_bits = replay_difficulty(&store, &params).await?;
        let (tip_tx, tip_rx) = watch::channel(tip);
        Ok(Self {
            store,
            validator,
            ledger,
            mempool,
            events,
            tip_tx,
            tip_rx,
            difficulty_bits,
            orphans: HashMap::new(),
            orphan_capacity: orphan_capacity.max(1),
            blacklist: HashMap::new(),
        })
    }

    pub fn tip_watch(&self) -> watch::Receiver<TipInfo> {
        self.tip_rx.clone()
    }

    pub fn difficulty_bits(&self) -> u32 {
        self.difficulty_bits
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<WriterCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                WriterCommand::SubmitBlock {
                    block,
                    origin,
                    respond,
                } => {
                    let result = self.accept(*block, origin).await;
                    match &result {
                        Ok(()) => self.drain_orphans().await,
                        Err(WriterError::Block(b)) if b.is_recoverable() => {
                            debug!(error = %b, "block not committed")
                        }
                        Err(e) => warn!(error = %e, "block rejected"),
                    }
                    if let Some(respond) = respond {
                        let _ = respond.send(result.map_err(|e| BlockRejection::from(&e)));
                    }
                }
            }
        }
        info!("chain writer stopped");
    }

    /// Acceptance pipeline: duplicate/stale/orphan classification, full
    /// validation against the tip ledger, then the atomic commit.
    async fn accept(&mut self, block: Block, origin: BlockOrigin) -> Result<(), WriterError> {
        let hash = block.hash();
        self.sweep_blacklist();
        if self.blacklist.contains_key(&hash) {
            return Err(BlockError::Duplicate.into());
        }
        if self.store.block_by_hash(&hash).await?.is_some() {
            return Err(BlockError::Duplicate.into());
        }

        let tip = self.tip_rx.borrow().clone();
        if block.height() <= tip.height {
            return Err(BlockError::Stale {
                height: block.height(),
                tip: tip.height,
            }
            .into());
        }

        let parent_hash = block.header.previous_block_hash;
        let Some(parent) = self.store.block_by_hash(&parent_hash).await? else {
            self.park_orphan(parent_hash, block);
            return Err(BlockError::Orphan(parent_hash).into());
        };
        if parent.hash() != tip.hash {
            // competing parent beside the tip; the first-seen tip wins
            return Err(BlockError::Stale {
                height: block.height(),
                tip: tip.height,
            }
            .into());
        }

        let state = self.ledger.snapshot();
        let applied = match self.validator.validate_and_apply(
            &block,
            &parent,
            &state,
            self.difficulty_bits,
            Utc::now(),
        ) {
            Ok(applied) => applied,
            Err(e) => {
                if !e.is_recoverable() {
                    self.blacklist.insert(hash, Instant::now());
                }
                return Err(e.into());
            }
        };

        // commit; lock contention on the store is retried, real faults
        // bubble up and pause acceptance
        let height = block.height();
        let snapshot = applied.state.snapshot();
        let store = &self.store;
        with_backoff(|| store.put_block(&block)).await?;
        with_backoff(|| store.set_canonical(height, &hash)).await?;
        with_backoff(|| store.set_tip(height, &hash)).await?;
        with_backoff(|| store.save_snapshot(height, &snapshot)).await?;
        *self.ledger.0.write() = applied.state;

        // mempool learns about inclusions before anyone sees the new tip
        self.mempool.remove_included(&block);
        let _ = self.tip_tx.send(TipInfo {
            height,
            hash,
            timestamp: block.header.timestamp,
        });
        let _ = self.events.send(NodeEvent::BlockAccepted { height, hash });
        info!(
            height,
            %hash,
            txs = block.transactions.len(),
            fees = applied.fees,
            ?origin,
            "block committed"
        );

        self.maybe_retarget(&block).await?;
        Ok(())
    }

    /// Accepts parked children now that their parent is the tip, repeating
    /// while the tip keeps advancing.
    async fn drain_orphans(&mut self) {
        loop {
            let tip_hash = self.tip_rx.borrow().hash;
            let Some(children) = self.orphans.remove(&tip_hash) else {
                break;
            };
            let mut advanced = false;
            for child in children {
                let height = child.height();
                match self.accept(child, BlockOrigin::Peer).await {
                    Ok(()) => advanced = true,
                    Err(e) => debug!(height, error = %e, "parked orphan rejected"),
                }
            }
            if !advanced {
                break;
            }
        }
    }

    async fn maybe_retarget(&mut self, block: &Block) -> Result<(), WriterError> {
        let params = self.validator.params();
        let interval = params.retarget_interval;
        if interval == 0 || block.height() == 0 || block.height() % interval != 0 {
            return Ok(());
        }
        let window_start = block.height() - interval;
        if let Some(start) = self.store.block_by_height(window_start).await? {
            self.difficulty_bits = retarget(
                self.difficulty_bits,
                start.header.timestamp,
                block.header.timestamp,
                interval,
                params.target_block_time,
            );
        }
        Ok(())
    }

    fn park_orphan(&mut self, parent: Hash32, block: Block) {
        let parked: usize = self.orphans.values().map(|v| v.len()).sum();
        if parked >= self.orphan_capacity {
            // short-lived buffer; drop an arbitrary bucket wholesale
            if let Some(key) = self.orphans.keys().next().copied() {
                self.orphans.remove(&key);
            }
        }
        debug!(%parent, height = block.height(), "orphan parked");
        self.orphans.entry(parent).or_default().push(block);
    }

    fn sweep_blacklist(&mut self) {
        let now = Instant::now();
        self.blacklist
            .retain(|_, since| now.duration_since(*since) < BLACKLIST_COOLDOWN);
    }
}

/// Catches the ledger up to the stored tip by replaying blocks above the
/// snapshot height. The blocks were fully validated when committed, so the
/// replay re-applies their transactions without redoing the PoST/VDF work;
/// any application failure here means the store is corrupt.
async fn rebuild_ledger(
    store: &SqliteStore,
    ledger: &SharedLedger,
    params: &ChainParams,
    tip_height: u64,
) -> Result<(), WriterError> {
    let snapshot_height = store.load_snapshot().await?.map(|(h, _)| h).unwrap_or(0);
    if snapshot_height >= tip_height {
        return Ok(());
    }
    info!(
        snapshot_height,
        tip_height, "ledger snapshot behind tip, replaying blocks"
    );
    let mut state = ledger.snapshot();
    for height in snapshot_height + 1..=tip_height {
        let block = store.block_by_height(height).await?.ok_or_else(|| {
            StorageError::Corrupt(format!("canonical block at height {height} missing"))
        })?;
        let mut fees = 0u64;
        for signed in block.transactions.iter().skip(1) {
            let fee =
                shadowy_consensus::apply_transaction(&mut state, signed, block.header.timestamp, params)
                    .map_err(|e| {
                        StorageError::Corrupt(format!("replay failed at height {height}: {e}"))
                    })?;
            fees += fee;
        }
        if let Some(coinbase) = block.transactions.first() {
            let reward = shadowy_core::block_reward(
                height,
                params.initial_block_reward,
                params.halving_interval,
            );
            shadowy_consensus::apply::apply_coinbase(&mut state, coinbase, reward + fees)
                .map_err(|e| {
                    StorageError::Corrupt(format!("coinbase replay failed at height {height}: {e}"))
                })?;
        }
    }
    let snapshot = state.snapshot();
    store.save_snapshot(tip_height, &snapshot).await?;
    *ledger.0.write() = state;
    Ok(())
}

async fn replay_difficulty(
    store: &SqliteStore,
    params: &ChainParams,
) -> Result<u32, WriterError> {
    let mut bits = params.difficulty_bits_initial;
    let interval = params.retarget_interval;
    if interval == 0 {
        return Ok(bits);
    }
    let tip_height = store.tip().await?.map(|(h, _)| h).unwrap_or(0);
    let mut boundary = interval;
    while boundary <= tip_height {
        let start = store.block_by_height(boundary - interval).await?;
        let end = store.block_by_height(boundary).await?;
        if let (Some(start), Some(end)) = (start, end) {
            bits = retarget(
                bits,
                start.header.timestamp,
                end.header.timestamp,
                interval,
                params.target_block_time,
            );
        }
        boundary += interval;
    }
    Ok(bits)
}
