pub mod miner;
pub mod sync;
pub mod writer;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use num_bigint::BigUint;
use parking_lot::RwLock;
use shadowy_config::ShadowyConfig;
use shadowy_consensus::{BlockValidator, ChainParams};
use shadowy_core::{Hash32, LedgerState, TxInput, TxOutput};
use shadowy_mempool::{Mempool, MempoolConfig, UtxoView};
use shadowy_network::{NetworkConfig, NetworkService};
use shadowy_plot::Farm;
use shadowy_storage::{ChainStore, SqliteStore};
use shadowy_vdf::WorkerPool;
use shadowy_wallet::WalletStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub use miner::Miner;
pub use sync::SyncManager;
pub use writer::{BlockOrigin, BlockRejection, ChainWriter, RejectKind, WriterCommand};

/// All chains share one deterministic genesis instant; the chain name
/// diversifies the genesis hash through the header nonce.
pub const GENESIS_TIMESTAMP_SECS: i64 = 1_735_689_600;

pub fn genesis_timestamp() -> DateTime<Utc> {
    Utc.timestamp_opt(GENESIS_TIMESTAMP_SECS, 0).unwrap()
}

/// Snapshot of the current tip published over a watch channel. Everything
/// outside the writer keys its work off this.
#[derive(Debug, Clone, PartialEq)]
pub struct TipInfo {
    pub height: u64,
    pub hash: Hash32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    BlockAccepted { height: u64, hash: Hash32 },
}

/// Read side of the writer-owned ledger. Mempool and miner validate
/// against this; the writer swaps in the post-block state on every commit.
#[derive(Clone)]
pub struct SharedLedger(pub Arc<RwLock<LedgerState>>);

impl SharedLedger {
    pub fn new(state: LedgerState) -> Self {
        Self(Arc::new(RwLock::new(state)))
    }

    pub fn snapshot(&self) -> LedgerState {
        self.0.read().clone()
    }
}

impl UtxoView for SharedLedger {
    fn output(&self, input: &TxInput) -> Option<TxOutput> {
        self.0
            .read()
            .utxos
            .get(&(input.prev_tx, input.output_index))
            .cloned()
    }

    fn tx_in_chain(&self, hash: &Hash32) -> bool {
        self.0.read().contains_tx(hash)
    }
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn chain_params(cfg: &ShadowyConfig) -> Result<ChainParams> {
    let width = shadowy_vdf::ModulusBits::from_bits(cfg.vdf.vdf_modulus_bits)
        .ok_or_else(|| anyhow!("unsupported vdf_modulus_bits {}", cfg.vdf.vdf_modulus_bits))?;
    let vdf_modulus = match &cfg.vdf.vdf_modulus_decimal {
        Some(decimal) => decimal
            .parse::<BigUint>()
            .map_err(|e| anyhow!("bad vdf modulus override: {e}"))?,
        None => shadowy_vdf::default_modulus(),
    };
    if vdf_modulus.bits() as u32 != width.bits() {
        return Err(anyhow!(
            "vdf modulus is {} bits but config declares {}",
            vdf_modulus.bits(),
            width.bits()
        ));
    }
    Ok(ChainParams {
        chain_name: cfg.node.chain_name.clone(),
        initial_block_reward: cfg.tokenomics.initial_block_reward,
        halving_interval: cfg.tokenomics.halving_interval,
        max_satoshis: cfg.tokenomics.max_satoshis,
        target_block_time: chrono::Duration::seconds(cfg.node.target_block_time_seconds as i64),
        max_clock_skew: chrono::Duration::seconds(cfg.node.max_clock_skew_seconds as i64),
        difficulty_bits_initial: cfg.node.difficulty_bits_initial,
        retarget_interval: cfg.node.retarget_interval,
        vdf_modulus,
        vdf_time_parameter: cfg.vdf.vdf_time_parameter,
        vdf_security_bits: cfg.vdf.vdf_security_bits,
        pool_creation_fee: cfg.tokenomics.pool_creation_fee_satoshis,
        trade_nft_creation_fee: cfg.tokenomics.trade_nft_creation_fee_satoshis,
        block_tx_cap: cfg.node.block_tx_cap,
    })
}

/// Control surface a running node hands back to its embedder (the CLI, or
/// an integration test).
#[derive(Clone)]
pub struct NodeHandle {
    pub tip: watch::Receiver<TipInfo>,
    pub events: broadcast::Sender<NodeEvent>,
    pub writer: mpsc::Sender<WriterCommand>,
    pub mempool: Arc<Mempool>,
    force_block: mpsc::Sender<()>,
}

impl NodeHandle {
    /// Admin force-block: skips only the miner's interval wait; every
    /// other check still applies.
    pub async fn force_block(&self) -> Result<()> {
        self.force_block
            .send(())
            .await
            .map_err(|_| anyhow!("miner not running"))
    }
}

/// A started node: the handle plus the spine tasks to await.
pub struct RunningNode {
    pub handle: NodeHandle,
    writer_task: tokio::task::JoinHandle<()>,
    sync_task: tokio::task::JoinHandle<()>,
    miner_task: tokio::task::JoinHandle<()>,
}

impl RunningNode {
    pub async fn wait(self) -> Result<()> {
        let result = tokio::try_join!(self.writer_task, self.sync_task, self.miner_task);
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "node task failed");
                Err(e.into())
            }
        }
    }
}

/// Brings the whole node up and runs until the process is stopped.
pub async fn run_node(config_path: &Path, wallet_password: &str) -> Result<()> {
    let node = start_node(config_path, wallet_password).await?;
    node.wait().await
}

/// Brings the whole node up: storage, ledger, farm, wallet, mempool,
/// swarm, chain writer, sync manager, miner, janitor and tracker tasks.
pub async fn start_node(config_path: &Path, wallet_password: &str) -> Result<RunningNode> {
    let cfg = ShadowyConfig::load(config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    init_logging();
    info!(config = %config_path.display(), chain = %cfg.node.chain_name, "starting shadowy node");

    let params = chain_params(&cfg)?;
    let validator = BlockValidator::new(params.clone());

    let store = SqliteStore::open(&cfg.node.blockchain_directory).await?;

    // farmer identity
    let wallets = WalletStore::new(cfg.node.wallet_directory.clone())?;
    let farmer = match wallets.load(&cfg.node.farmer_wallet) {
        Ok(wallet) => wallets.unlock(&wallet, wallet_password)?,
        Err(shadowy_wallet::WalletError::NotFound(_)) => {
            info!(name = %cfg.node.farmer_wallet, "creating farmer wallet");
            let wallet = wallets.create(&cfg.node.farmer_wallet, wallet_password)?;
            wallets.unlock(&wallet, wallet_password)?
        }
        Err(e) => return Err(e.into()),
    };
    info!(farmer = %farmer.address(), "farmer wallet unlocked");

    let farm = Farm::load(&cfg.node.plot_directory)?;
    info!(
        plots = farm.plot_count(),
        entries = farm.entry_count(),
        "farm loaded"
    );

    // writer-owned ledger, restored from the latest snapshot
    let restored = match store.load_snapshot().await? {
        Some((height, snapshot)) => {
            info!(height, "ledger snapshot restored");
            LedgerState::from_snapshot(snapshot)
        }
        None => LedgerState::default(),
    };
    let ledger = SharedLedger::new(restored);

    let mempool = Arc::new(Mempool::new(
        MempoolConfig {
            size_cap_bytes: cfg.mempool.mempool_size_cap_bytes,
            min_fee_rate: cfg.mempool.mempool_min_fee_rate,
            tx_expiry: Duration::from_secs(cfg.mempool.mempool_tx_expiry_seconds),
        },
        Arc::new(ledger.clone()),
    ));

    let vdf_pool = Arc::new(WorkerPool::new(
        cfg.vdf.vdf_worker_pool_size,
        cfg.vdf.max_pending_vdf_challenges,
        Duration::from_secs(cfg.vdf.vdf_challenge_timeout_seconds),
    ));

    // swarm
    let network = NetworkService::new(NetworkConfig {
        listen_addr: cfg.peers.peer_listen_address.clone(),
        seed_nodes: cfg.peers.peer_seed_nodes.clone(),
        max_outbound: cfg.peers.peer_max_outbound,
        ban_duration_secs: cfg.peers.peer_ban_duration_seconds,
        forwarded_cache: 4_096,
    })?;
    let local_peer_id = network.local_peer_id();
    let (net_handle, net_events, _net_task) = network.spawn()?;

    // chain writer: the single task allowed to move the tip
    let (writer_tx, writer_rx) = mpsc::channel::<WriterCommand>(64);
    let (events_tx, _) = broadcast::channel::<NodeEvent>(256);
    let writer = ChainWriter::bootstrap(
        store.clone(),
        validator.clone(),
        ledger.clone(),
        mempool.clone(),
        events_tx.clone(),
        cfg.peers.orphan_buffer_size,
        genesis_timestamp(),
    )
    .await?;
    let tip_watch = writer.tip_watch();
    let writer_task = tokio::spawn(writer.run(writer_rx));

    // sync + gossip intake
    let sync = SyncManager::new(
        sync::SyncConfig {
            chain_id: writer::genesis_hash_for(&params, genesis_timestamp()),
            node_id: local_peer_id.to_string(),
            software_version: format!("shadowy/{}", env!("CARGO_PKG_VERSION")),
            batch_size: cfg.peers.sync_batch_size,
            height_threshold: cfg.peers.sync_height_threshold,
        },
        store.clone(),
        net_handle.clone(),
        writer_tx.clone(),
        mempool.clone(),
        tip_watch.clone(),
        events_tx.subscribe(),
    );
    let sync_task = tokio::spawn(sync.run(net_events));

    // miner
    let (force_tx, force_rx) = mpsc::channel::<()>(1);
    let miner = Miner::new(
        miner::MinerConfig {
            interval: Duration::from_secs(cfg.node.target_block_time_seconds),
            block_tx_cap: cfg.node.block_tx_cap,
            auto_adjust: cfg.vdf.vdf_auto_adjust,
            target_solving_time: Duration::from_secs(cfg.vdf.vdf_target_solving_time_seconds),
        },
        validator.clone(),
        Arc::new(farm),
        farmer,
        mempool.clone(),
        ledger.clone(),
        vdf_pool,
        writer_tx.clone(),
        net_handle.clone(),
        tip_watch.clone(),
    );
    let miner_task = tokio::spawn(miner.run(force_rx));

    // mempool expiry janitor
    let janitor_pool = mempool.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let dropped = janitor_pool.evict_expired();
            if dropped > 0 {
                info!(dropped, "mempool expiry sweep");
            }
        }
    });

    // optional tracker announcements
    if let Some(url) = cfg.tracker.tracker_url.clone() {
        let client = shadowy_tracker::TrackerClient::new(url);
        let chain_id = writer::genesis_hash_for(&params, genesis_timestamp());
        let listen = cfg.peers.peer_listen_address.clone();
        let tips = tip_watch.clone();
        let node_id = local_peer_id.to_string();
        let every = Duration::from_secs(cfg.tracker.announce_interval_seconds.max(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let tip = tips.borrow().clone();
                shadowy_tracker::announce_quietly(
                    &client,
                    shadowy_tracker::Announce {
                        node_id: node_id.clone(),
                        chain_id,
                        listen_addr: listen.clone(),
                        tip_height: tip.height,
                        software_version: format!("shadowy/{}", env!("CARGO_PKG_VERSION")),
                    },
                )
                .await;
            }
        });
    }

    let handle = NodeHandle {
        tip: tip_watch,
        events: events_tx,
        writer: writer_tx,
        mempool,
        force_block: force_tx,
    };
    Ok(RunningNode {
        handle,
        writer_task,
        sync_task,
        miner_task,
    })
}
