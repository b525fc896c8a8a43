use crate::codec::{SyncCodec, SyncProtocol};
use crate::peers::PeerBook;
use crate::{NetworkCommand, NetworkConfig, NetworkError, NetworkEvent};
use futures::prelude::*;
use libp2p::gossipsub::{self, IdentTopic as Topic, MessageAuthenticity, MessageId, ValidationMode};
use libp2p::identity::Keypair;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::{SwarmBuilder, SwarmEvent};
use libp2p::{identify, mdns, noise, ping, tcp, yamux, Multiaddr, PeerId, Transport};
use shadowy_core::{sha3_digest, Block, SignedTransaction};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BLOCK_TOPIC: &str = "shadowy-blocks";
const TX_TOPIC: &str = "shadowy-transactions";

#[derive(libp2p::swarm::NetworkBehaviour)]
struct ShadowyBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    mdns: mdns::tokio::Behaviour,
    sync: request_response::Behaviour<SyncCodec>,
}

/// Cheap clonable handle the node keeps to talk to the swarm task.
#[derive(Clone)]
pub struct NetworkHandle {
    commands: mpsc::Sender<NetworkCommand>,
    local_peer_id: PeerId,
}

impl NetworkHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub async fn send(&self, command: NetworkCommand) -> Result<(), NetworkError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetworkError::ChannelClosed)
    }
}

/// Owns the libp2p swarm. `spawn` moves it onto its own task; the node
/// talks through the returned handle and event stream.
pub struct NetworkService {
    swarm: libp2p::swarm::Swarm<ShadowyBehaviour>,
    config: NetworkConfig,
    block_topic: Topic,
    tx_topic: Topic,
    peers: PeerBook,
}

impl NetworkService {
    pub fn new(config: NetworkConfig) -> Result<Self, NetworkError> {
        let local_key = Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(local_key.public());

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(libp2p::core::upgrade::Version::V1)
            .authenticate(
                noise::Config::new(&local_key).map_err(|e| NetworkError::Transport(e.to_string()))?,
            )
            .multiplex(yamux::Config::default())
            .boxed();

        let message_id_fn = |m: &gossipsub::Message| {
            MessageId::from(blake3::hash(&m.data).to_hex().to_string())
        };
        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .message_id_fn(message_id_fn)
            .validation_mode(ValidationMode::Strict)
            .build()
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        let gossipsub = gossipsub::Behaviour::new(
            MessageAuthenticity::Signed(local_key.clone()),
            gossipsub_config,
        )
        .map_err(|e| NetworkError::Transport(e.to_string()))?;

        let identify = identify::Behaviour::new(identify::Config::new(
            "/shadowy/1.0".into(),
            local_key.public(),
        ));
        let ping = ping::Behaviour::new(ping::Config::new());
        let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        let sync = request_response::Behaviour::with_codec(
            SyncCodec,
            std::iter::once((SyncProtocol, ProtocolSupport::Full)),
            request_response::Config::default(),
        );

        let behaviour = ShadowyBehaviour {
            gossipsub,
            identify,
            ping,
            mdns,
            sync,
        };
        let mut swarm =
            SwarmBuilder::with_tokio_executor(transport, behaviour, local_peer_id).build();

        let listen_addr: Multiaddr = config
            .listen_addr
            .parse()
            .map_err(|_| NetworkError::BadAddress(config.listen_addr.clone()))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| NetworkError::Transport(e.to_string()))?;

        for seed in &config.seed_nodes {
            match seed.parse::<Multiaddr>() {
                Ok(addr) => {
                    if let Err(e) = swarm.dial(addr) {
                        warn!(seed, error = %e, "seed dial failed");
                    }
                }
                Err(_) => warn!(seed, "bad seed multiaddr"),
            }
        }

        let peers = PeerBook::new(
            Duration::from_secs(config.ban_duration_secs),
            config.forwarded_cache,
        );
        Ok(Self {
            swarm,
            config,
            block_topic: Topic::new(BLOCK_TOPIC),
            tx_topic: Topic::new(TX_TOPIC),
            peers,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// Subscribes the gossip topics and moves the swarm onto its own task.
    pub fn spawn(
        mut self,
    ) -> Result<(NetworkHandle, mpsc::Receiver<NetworkEvent>, JoinHandle<()>), NetworkError> {
        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&self.block_topic)
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&self.tx_topic)
            .map_err(|e| NetworkError::Transport(e.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let handle = NetworkHandle {
            commands: command_tx,
            local_peer_id: self.local_peer_id(),
        };
        let task = tokio::spawn(self.run(command_rx, event_tx));
        Ok((handle, event_rx, task))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<NetworkCommand>,
        events: mpsc::Sender<NetworkEvent>,
    ) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event, &events).await;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        info!("network command channel closed, stopping swarm");
                        return;
                    };
                    self.handle_command(command).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::BroadcastBlock(block) => {
                let hash = block.hash();
                match serde_json::to_vec(&*block) {
                    Ok(data) => {
                        for peer in self.peers.active_peers() {
                            self.peers.first_contact(&peer, &hash);
                        }
                        if let Err(e) = self
                            .swarm
                            .behaviour_mut()
                            .gossipsub
                            .publish(self.block_topic.clone(), data)
                        {
                            debug!(error = %e, "block publish failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "block encode failed"),
                }
            }
            NetworkCommand::BroadcastTransaction(tx) => {
                let hash = tx.tx_hash;
                match serde_json::to_vec(&*tx) {
                    Ok(data) => {
                        for peer in self.peers.active_peers() {
                            self.peers.first_contact(&peer, &hash);
                        }
                        if let Err(e) = self
                            .swarm
                            .behaviour_mut()
                            .gossipsub
                            .publish(self.tx_topic.clone(), data)
                        {
                            debug!(error = %e, "tx publish failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "tx encode failed"),
                }
            }
            NetworkCommand::SendRequest { peer, request } => {
                self.swarm.behaviour_mut().sync.send_request(&peer, request);
            }
            NetworkCommand::Respond { channel, response } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .sync
                    .send_response(channel, response)
                    .is_err()
                {
                    debug!("sync response channel already closed");
                }
            }
            NetworkCommand::ScoreDown { peer, penalty } => {
                if self.peers.score_down(&peer, penalty) {
                    let _ = self.swarm.disconnect_peer_id(peer);
                }
            }
            NetworkCommand::Ban(peer) => {
                self.peers.ban(&peer);
                let _ = self.swarm.disconnect_peer_id(peer);
            }
        }
    }

    async fn handle_swarm_event<E: std::fmt::Debug>(
        &mut self,
        event: SwarmEvent<ShadowyBehaviourEvent, E>,
        events: &mpsc::Sender<NetworkEvent>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                if self.peers.is_banned(&peer_id) {
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                    return;
                }
                if self.peers.active_peers().len() >= self.config.max_outbound {
                    debug!(%peer_id, "connection slots exhausted");
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                    return;
                }
                self.peers.connected(peer_id);
                let _ = events.send(NetworkEvent::PeerConnected(peer_id)).await;
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                self.peers.disconnected(&peer_id);
                let _ = events.send(NetworkEvent::PeerDisconnected(peer_id)).await;
            }
            SwarmEvent::Behaviour(ShadowyBehaviourEvent::Gossipsub(
                gossipsub::Event::Message {
                    propagation_source,
                    message,
                    ..
                },
            )) => {
                self.handle_gossip(propagation_source, &message, events).await;
            }
            SwarmEvent::Behaviour(ShadowyBehaviourEvent::Mdns(mdns::Event::Discovered(
                discovered,
            ))) => {
                for (peer, addr) in discovered {
                    if self.peers.is_banned(&peer) {
                        continue;
                    }
                    self.peers.record_address(peer, addr.clone());
                    self.swarm
                        .behaviour_mut()
                        .gossipsub
                        .add_explicit_peer(&peer);
                    debug!(%peer, %addr, "mdns discovered");
                }
            }
            SwarmEvent::Behaviour(ShadowyBehaviourEvent::Sync(event)) => {
                self.handle_sync_event(event, events).await;
            }
            SwarmEvent::Behaviour(ShadowyBehaviourEvent::Ping(ping::Event {
                peer,
                result: Err(_),
                ..
            })) => {
                if self.peers.score_down(&peer, 5) {
                    let _ = self.swarm.disconnect_peer_id(peer);
                }
            }
            SwarmEvent::Behaviour(ShadowyBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
            })) => {
                if let Some(addr) = info.listen_addrs.into_iter().next() {
                    self.peers.record_address(peer_id, addr);
                }
                debug!(%peer_id, "identified");
            }
            _ => {}
        }
    }

    async fn handle_gossip(
        &mut self,
        from: PeerId,
        message: &gossipsub::Message,
        events: &mpsc::Sender<NetworkEvent>,
    ) {
        let topic = message.topic.as_str();
        if topic == Topic::new(BLOCK_TOPIC).hash().as_str() {
            match serde_json::from_slice::<Block>(&message.data) {
                Ok(block) => {
                    if !self.peers.first_contact(&from, &block.hash()) {
                        return;
                    }
                    let _ = events
                        .send(NetworkEvent::BlockGossip {
                            peer: from,
                            block: Box::new(block),
                        })
                        .await;
                }
                Err(e) => {
                    debug!(%from, error = %e, "undecodable block gossip");
                    if self.peers.score_down(&from, 20) {
                        let _ = self.swarm.disconnect_peer_id(from);
                    }
                }
            }
        } else if topic == Topic::new(TX_TOPIC).hash().as_str() {
            match serde_json::from_slice::<SignedTransaction>(&message.data) {
                Ok(tx) => {
                    if !self.peers.first_contact(&from, &tx.tx_hash) {
                        return;
                    }
                    let _ = events
                        .send(NetworkEvent::TransactionGossip {
                            peer: from,
                            tx: Box::new(tx),
                        })
                        .await;
                }
                Err(e) => {
                    debug!(%from, error = %e, "undecodable tx gossip");
                    if self.peers.score_down(&from, 20) {
                        let _ = self.swarm.disconnect_peer_id(from);
                    }
                }
            }
        } else {
            debug!(topic, "gossip on unknown topic ignored");
        }
    }

    async fn handle_sync_event(
        &mut self,
        event: request_response::Event<crate::SyncRequest, crate::SyncResponse>,
        events: &mpsc::Sender<NetworkEvent>,
    ) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    // address exchange is served straight from the book;
                    // everything else goes up to the node
                    if matches!(request, crate::SyncRequest::GetPeers) {
                        let _ = self.swarm.behaviour_mut().sync.send_response(
                            channel,
                            crate::SyncResponse::Peers(self.peers.known_addresses()),
                        );
                        return;
                    }
                    if let crate::SyncRequest::Hello(info) = &request {
                        self.peers.hello(peer, info.clone());
                        let _ = events
                            .send(NetworkEvent::HelloReceived {
                                peer,
                                info: info.clone(),
                            })
                            .await;
                    }
                    let _ = events
                        .send(NetworkEvent::SyncRequest {
                            peer,
                            request,
                            channel,
                        })
                        .await;
                }
                request_response::Message::Response { response, .. } => {
                    if let crate::SyncResponse::Hello(info) = &response {
                        self.peers.hello(peer, info.clone());
                        let _ = events
                            .send(NetworkEvent::HelloReceived {
                                peer,
                                info: info.clone(),
                            })
                            .await;
                    }
                    if let crate::SyncResponse::Peers(addresses) = &response {
                        for address in addresses.iter().take(8) {
                            if let Ok(addr) = address.parse::<Multiaddr>() {
                                let _ = self.swarm.dial(addr);
                            }
                        }
                    }
                    let _ = events
                        .send(NetworkEvent::SyncResponse { peer, response })
                        .await;
                }
            },
            request_response::Event::OutboundFailure { peer, error, .. } => {
                debug!(%peer, %error, "sync request failed");
                if self.peers.score_down(&peer, 10) {
                    let _ = self.swarm.disconnect_peer_id(peer);
                }
                let _ = events.send(NetworkEvent::RequestFailed { peer }).await;
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, %error, "inbound sync stream failed");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }
}

/// Convenience for callers that only have a seed string list.
pub fn chain_id_for(genesis_name: &str) -> shadowy_core::Hash32 {
    sha3_digest(genesis_name.as_bytes())
}
