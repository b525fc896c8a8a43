use crate::writer::{BlockOrigin, WriterCommand};
use crate::{SharedLedger, TipInfo};
use chrono::Utc;
use shadowy_consensus::{apply_transaction, challenge_at, BlockValidator};
use shadowy_core::{
    block_reward, merkle_root, Block, BlockHeader, SignedTransaction, Transaction,
};
use shadowy_crypto::Keypair;
use shadowy_mempool::Mempool;
use shadowy_network::{NetworkCommand, NetworkHandle};
use shadowy_plot::Farm;
use shadowy_vdf::{DifficultyTuner, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub interval: Duration,
    pub block_tx_cap: usize,
    pub auto_adjust: bool,
    pub target_solving_time: Duration,
}

/// The block production loop: interval clock, plot scan, VDF gate,
/// mempool drain, submit, broadcast. A competing block for the same parent
/// cancels the in-flight round and restarts on the new tip.
pub struct Miner {
    config: MinerConfig,
    validator: BlockValidator,
    farm: Arc<Farm>,
    farmer: Keypair,
    mempool: Arc<Mempool>,
    ledger: SharedLedger,
    vdf_pool: Arc<WorkerPool>,
    writer: mpsc::Sender<WriterCommand>,
    network: NetworkHandle,
    tip: watch::Receiver<TipInfo>,
    tuner: DifficultyTuner,
}

impl Miner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MinerConfig,
        validator: BlockValidator,
        farm: Arc<Farm>,
        farmer: Keypair,
        mempool: Arc<Mempool>,
        ledger: SharedLedger,
        vdf_pool: Arc<WorkerPool>,
        writer: mpsc::Sender<WriterCommand>,
        network: NetworkHandle,
        tip: watch::Receiver<TipInfo>,
    ) -> Self {
        let tuner = DifficultyTuner::new(config.target_solving_time, config.auto_adjust);
        Self {
            config,
            validator,
            farm,
            farmer,
            mempool,
            ledger,
            vdf_pool,
            writer,
            network,
            tip,
            tuner,
        }
    }

    pub async fn run(mut self, mut force: mpsc::Receiver<()>) {
        loop {
            // 1. interval clock, measured from the tip's timestamp. A force
            // command (admin) bypasses only this wait.
            let tip = self.tip.borrow().clone();
            let since_tip = (Utc::now() - tip.timestamp)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let wait = self.config.interval.saturating_sub(since_tip);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                Some(()) = force.recv() => {
                    info!("force-block: skipping interval wait");
                }
                _ = self.tip.changed() => continue,
            }

            match self.mine_round().await {
                Ok(true) => {}
                Ok(false) => {
                    // nothing to prove this round; idle briefly and retry
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(e) => {
                    warn!(error = %e, "mining round failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// One production attempt on the current tip. Returns false when the
    /// farm has no plots or the round was cancelled by a competing block.
    async fn mine_round(&mut self) -> Result<bool, String> {
        let tip = self.tip.borrow().clone();
        let height = tip.height + 1;
        let challenge = challenge_at(&tip.hash, height);

        // 2-3. best plot proof across the farm
        let farm = Arc::clone(&self.farm);
        let plot_proof = tokio::task::spawn_blocking(move || farm.prove(&challenge))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        let Some(plot_proof) = plot_proof else {
            debug!("no viable plot this round");
            return Ok(false);
        };

        // 4. time gate; cancelled when the tip moves under us
        let vdf_challenge = self.validator.vdf_challenge(&tip.hash, height);
        let handle = self
            .vdf_pool
            .submit(vdf_challenge, 1)
            .map_err(|e| e.to_string())?;
        let vdf_proof = tokio::select! {
            proof = handle.proof() => proof.map_err(|e| e.to_string())?,
            _ = self.tip.changed() => {
                info!("competing block arrived, cancelling vdf job");
                return Ok(false);
            }
        };
        let observed = Duration::from_millis(vdf_proof.compute_ms);
        let params = self.validator.params();
        let advisory = self.tuner.adjust(params.vdf_time_parameter, observed);
        if advisory != params.vdf_time_parameter {
            warn!(
                configured = params.vdf_time_parameter,
                advisory, "vdf time parameter is off the solving-time target"
            );
        }

        // 5. drain the mempool against a scratch ledger
        let block_time = Utc::now().max(tip.timestamp + chrono::Duration::seconds(1));
        let mut scratch = self.ledger.snapshot();
        let mut included: Vec<SignedTransaction> = Vec::new();
        let mut fees: u64 = 0;
        for tx in self.mempool.highest_priority(self.config.block_tx_cap) {
            match apply_transaction(&mut scratch, &tx, block_time, params) {
                Ok(fee) => {
                    fees = fees.saturating_add(fee);
                    included.push(tx);
                }
                Err(e) => debug!(tx = %tx.tx_hash, error = %e, "left out of block"),
            }
        }

        if self.tip.has_changed().unwrap_or(false) {
            info!("competing block arrived, discarding drained round");
            return Ok(false);
        }

        // 6. assemble, sign, submit, broadcast
        let reward = block_reward(height, params.initial_block_reward, params.halving_interval);
        let coinbase = Transaction::coinbase(
            height,
            reward + fees,
            self.farmer.address(),
            block_time,
        );
        let coinbase =
            shadowy_crypto::sign_transaction(coinbase, &self.farmer).map_err(|e| e.to_string())?;

        let mut body = vec![coinbase];
        body.append(&mut included);
        let farmer_address = shadowy_core::Address::from_identifier(&plot_proof.identifier);
        let header = BlockHeader {
            height,
            previous_block_hash: tip.hash,
            merkle_root: merkle_root(&body),
            timestamp: block_time,
            farmer_address,
            plot_proof,
            vdf_proof: vdf_proof.to_header_data(),
            nonce: height,
        };
        let block = Block {
            header,
            transactions: body,
        };

        let (respond_tx, respond_rx) = oneshot::channel();
        self.writer
            .send(WriterCommand::SubmitBlock {
                block: Box::new(block.clone()),
                origin: BlockOrigin::Local,
                respond: Some(respond_tx),
            })
            .await
            .map_err(|_| "writer gone".to_string())?;
        match respond_rx.await {
            Ok(Ok(())) => {
                info!(height, hash = %block.hash(), "mined block committed");
                let _ = self
                    .network
                    .send(NetworkCommand::BroadcastBlock(Box::new(block)))
                    .await;
                Ok(true)
            }
            Ok(Err(rejection)) => {
                // a competing commit racing us is normal; anything else is not
                debug!(height, reason = rejection.reason, "mined block not committed");
                Ok(false)
            }
            Err(_) => Err("writer dropped response".into()),
        }
    }
}
