use crate::writer::{BlockOrigin, RejectKind, WriterCommand};
use crate::{NodeEvent, TipInfo};
use shadowy_core::{Block, Hash32};
use shadowy_mempool::{Mempool, MempoolError, TxSource};
use shadowy_network::{
    HelloInfo, NetworkCommand, NetworkEvent, NetworkHandle, PeerId, SyncRequest, SyncResponse,
};
use shadowy_storage::{ChainStore, SqliteStore};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const MAX_HEADERS_PER_REQUEST: u64 = 256;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub chain_id: Hash32,
    pub node_id: String,
    pub software_version: String,
    pub batch_size: u64,
    /// how far a peer must be ahead before batched sync kicks in
    pub height_threshold: u64,
}

struct ActiveSync {
    peer: PeerId,
    pending: VecDeque<Hash32>,
    target_height: u64,
}

/// Consumes swarm events: answers the sync protocol from the store, feeds
/// gossip into the writer and mempool, and drives batched catch-up against
/// the best-known peer.
pub struct SyncManager {
    config: SyncConfig,
    store: SqliteStore,
    network: NetworkHandle,
    writer: mpsc::Sender<WriterCommand>,
    mempool: Arc<Mempool>,
    tip: watch::Receiver<TipInfo>,
    node_events: broadcast::Receiver<NodeEvent>,
    active: Option<ActiveSync>,
    /// advertised tips, for re-issuing a failed sync elsewhere
    peer_tips: HashMap<PeerId, u64>,
}

impl SyncManager {
    pub fn new(
        config: SyncConfig,
        store: SqliteStore,
        network: NetworkHandle,
        writer: mpsc::Sender<WriterCommand>,
        mempool: Arc<Mempool>,
        tip: watch::Receiver<TipInfo>,
        node_events: broadcast::Receiver<NodeEvent>,
    ) -> Self {
        Self {
            config,
            store,
            network,
            writer,
            mempool,
            tip,
            node_events,
            active: None,
            peer_tips: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut net_events: mpsc::Receiver<NetworkEvent>) {
        loop {
            tokio::select! {
                event = net_events.recv() => {
                    let Some(event) = event else {
                        info!("network event stream closed, sync manager stopping");
                        return;
                    };
                    self.handle_network_event(event).await;
                }
                event = self.node_events.recv() => {
                    match event {
                        Ok(NodeEvent::BlockAccepted { height, .. }) => {
                            if let Some(active) = &self.active {
                                if height >= active.target_height {
                                    info!(height, "sync target reached");
                                    self.active = None;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "sync manager lagged node events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    fn hello(&self) -> HelloInfo {
        let tip = self.tip.borrow().clone();
        HelloInfo {
            node_id: self.config.node_id.clone(),
            chain_id: self.config.chain_id,
            software_version: self.config.software_version.clone(),
            tip_height: tip.height,
            tip_hash: tip.hash,
        }
    }

    async fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerConnected(peer) => {
                let _ = self
                    .network
                    .send(NetworkCommand::SendRequest {
                        peer,
                        request: SyncRequest::Hello(self.hello()),
                    })
                    .await;
            }
            NetworkEvent::PeerDisconnected(peer) => {
                self.peer_tips.remove(&peer);
                if self.active.as_ref().map(|a| a.peer) == Some(peer) {
                    info!(%peer, "sync source disconnected, re-issuing elsewhere");
                    self.active = None;
                    self.restart_sync_from_best().await;
                }
            }
            NetworkEvent::HelloReceived { peer, info } => {
                if info.chain_id != self.config.chain_id {
                    warn!(%peer, "peer is on a different chain, banning");
                    let _ = self.network.send(NetworkCommand::Ban(peer)).await;
                    return;
                }
                self.peer_tips.insert(peer, info.tip_height);
                self.maybe_start_sync(peer, info.tip_height).await;
            }
            NetworkEvent::BlockGossip { peer, block } => {
                self.submit_block(*block, Some(peer)).await;
            }
            NetworkEvent::TransactionGossip { peer, tx } => {
                match self.mempool.add(*tx, TxSource::P2p) {
                    Ok(())
                    | Err(MempoolError::DuplicateHash)
                    | Err(MempoolError::UnknownParentTx)
                    | Err(MempoolError::InsufficientFee { .. })
                    | Err(MempoolError::SizeCap)
                    | Err(MempoolError::TemporalConflict) => {}
                    Err(MempoolError::SignatureInvalid) => {
                        let _ = self
                            .network
                            .send(NetworkCommand::ScoreDown { peer, penalty: 20 })
                            .await;
                    }
                }
            }
            NetworkEvent::SyncRequest {
                peer,
                request,
                channel,
            } => {
                let response = self.answer(peer, request).await;
                let _ = self
                    .network
                    .send(NetworkCommand::Respond { channel, response })
                    .await;
            }
            NetworkEvent::SyncResponse { peer, response } => {
                self.handle_response(peer, response).await;
            }
            NetworkEvent::RequestFailed { peer } => {
                if self.active.as_ref().map(|a| a.peer) == Some(peer) {
                    info!(%peer, "sync request failed, re-issuing elsewhere");
                    self.active = None;
                    self.restart_sync_from_best().await;
                }
            }
        }
    }

    /// Serves the sync protocol out of the canonical store.
    async fn answer(&self, peer: PeerId, request: SyncRequest) -> SyncResponse {
        match request {
            SyncRequest::Hello(_) => SyncResponse::Hello(self.hello()),
            SyncRequest::Ping(nonce) => SyncResponse::Pong(nonce),
            SyncRequest::GetHeaders { start, count } => {
                let count = count.min(MAX_HEADERS_PER_REQUEST);
                let mut headers = Vec::new();
                for height in start..start.saturating_add(count) {
                    match self.store.block_by_height(height).await {
                        Ok(Some(block)) => headers.push(block.header),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%peer, error = %e, "header read failed");
                            break;
                        }
                    }
                }
                SyncResponse::Headers(headers)
            }
            SyncRequest::GetBlock(hash) => match self.store.block_by_hash(&hash).await {
                Ok(block) => SyncResponse::Block(block.map(Box::new)),
                Err(e) => {
                    warn!(%peer, error = %e, "block read failed");
                    SyncResponse::Block(None)
                }
            },
            // the swarm task answers GetPeers from its address book before
            // the request reaches this far; empty keeps the protocol total
            SyncRequest::GetPeers => SyncResponse::Peers(Vec::new()),
        }
    }

    async fn handle_response(&mut self, peer: PeerId, response: SyncResponse) {
        match response {
            SyncResponse::Hello(_) | SyncResponse::Pong(_) | SyncResponse::Peers(_) => {}
            SyncResponse::Headers(headers) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                if active.peer != peer {
                    return;
                }
                if headers.is_empty() {
                    info!(%peer, "peer had no further headers, sync done");
                    self.active = None;
                    return;
                }
                active.pending = headers.iter().map(|h| h.hash()).collect();
                self.request_next_block().await;
            }
            SyncResponse::Block(Some(block)) => {
                let is_sync_source = self.active.as_ref().map(|a| a.peer) == Some(peer);
                if !is_sync_source {
                    self.submit_block(*block, Some(peer)).await;
                    return;
                }
                let accepted = self.submit_block(*block, Some(peer)).await;
                if !accepted {
                    self.active = None;
                    return;
                }
                if let Some(active) = self.active.as_mut() {
                    active.pending.pop_front();
                }
                self.request_next_block().await;
            }
            SyncResponse::Block(None) => {
                if self.active.as_ref().map(|a| a.peer) == Some(peer) {
                    let _ = self
                        .network
                        .send(NetworkCommand::ScoreDown { peer, penalty: 10 })
                        .await;
                    self.active = None;
                    self.peer_tips.remove(&peer);
                    self.restart_sync_from_best().await;
                }
            }
        }
    }

    /// Picks the best remaining advertised tip and resumes sync there.
    async fn restart_sync_from_best(&mut self) {
        let best = self
            .peer_tips
            .iter()
            .max_by_key(|(_, height)| **height)
            .map(|(peer, height)| (*peer, *height));
        if let Some((peer, height)) = best {
            self.maybe_start_sync(peer, height).await;
        }
    }

    async fn maybe_start_sync(&mut self, peer: PeerId, their_tip: u64) {
        if self.active.is_some() {
            return;
        }
        let our_tip = self.tip.borrow().height;
        if their_tip < our_tip.saturating_add(self.config.height_threshold) {
            return;
        }
        info!(%peer, our_tip, their_tip, "starting batched sync");
        self.active = Some(ActiveSync {
            peer,
            pending: VecDeque::new(),
            target_height: their_tip,
        });
        let _ = self
            .network
            .send(NetworkCommand::SendRequest {
                peer,
                request: SyncRequest::GetHeaders {
                    start: our_tip + 1,
                    count: self.config.batch_size,
                },
            })
            .await;
    }

    /// Requests the next queued block, or the next header batch when the
    /// queue drains below the target.
    async fn request_next_block(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let peer = active.peer;
        if let Some(hash) = active.pending.front().copied() {
            let _ = self
                .network
                .send(NetworkCommand::SendRequest {
                    peer,
                    request: SyncRequest::GetBlock(hash),
                })
                .await;
            return;
        }
        let our_tip = self.tip.borrow().height;
        if our_tip < active.target_height {
            let _ = self
                .network
                .send(NetworkCommand::SendRequest {
                    peer,
                    request: SyncRequest::GetHeaders {
                        start: our_tip + 1,
                        count: self.config.batch_size,
                    },
                })
                .await;
        } else {
            info!(our_tip, "sync caught up");
            self.active = None;
        }
    }

    /// Hands a block to the chain writer; recoverable outcomes pass,
    /// fatal ones score the peer down. Returns whether the block was
    /// committed or recoverably ignored.
    async fn submit_block(&mut self, block: Block, from: Option<PeerId>) -> bool {
        let (respond_tx, respond_rx) = oneshot::channel();
        if self
            .writer
            .send(WriterCommand::SubmitBlock {
                block: Box::new(block),
                origin: BlockOrigin::Peer,
                respond: Some(respond_tx),
            })
            .await
            .is_err()
        {
            return false;
        }
        match respond_rx.await {
            Ok(Ok(())) => true,
            Ok(Err(rejection)) => {
                match rejection.kind {
                    RejectKind::Recoverable => true,
                    RejectKind::Internal => false,
                    RejectKind::Invalid => {
                        if let Some(peer) = from {
                            warn!(%peer, reason = rejection.reason, "peer sent an invalid block");
                            let _ = self
                                .network
                                .send(NetworkCommand::ScoreDown { peer, penalty: 50 })
                                .await;
                        }
                        false
                    }
                }
            }
            Err(_) => false,
        }
    }
}
