pub mod codec;
pub mod peers;
pub mod service;

use libp2p::request_response::ResponseChannel;
pub use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use shadowy_core::{Block, BlockHeader, Hash32, SignedTransaction};
use thiserror::Error;

pub use codec::{SyncCodec, SyncProtocol};
pub use peers::{PeerBook, PeerState};
pub use service::{NetworkHandle, NetworkService};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("gossip publish: {0}")]
    Publish(String),
    #[error("bad listen address: {0}")]
    BadAddress(String),
    #[error("service channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub listen_addr: String,
    pub seed_nodes: Vec<String>,
    pub max_outbound: usize,
    pub ban_duration_secs: u64,
    /// entries per peer in the recently-forwarded LRU
    pub forwarded_cache: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "/ip4/0.0.0.0/tcp/7744".into(),
            seed_nodes: Vec::new(),
            max_outbound: 32,
            ban_duration_secs: 900,
            forwarded_cache: 4_096,
        }
    }
}

/// Handshake payload exchanged right after a connection opens. The
/// chain id is the genesis hash; disagreement is grounds for a ban.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloInfo {
    pub node_id: String,
    pub chain_id: Hash32,
    pub software_version: String,
    pub tip_height: u64,
    pub tip_hash: Hash32,
}

/// Logical sync protocol carried over request-response streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncRequest {
    Hello(HelloInfo),
    Ping(u64),
    GetHeaders { start: u64, count: u64 },
    GetBlock(Hash32),
    GetPeers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncResponse {
    Hello(HelloInfo),
    Pong(u64),
    Headers(Vec<BlockHeader>),
    Block(Option<Box<Block>>),
    Peers(Vec<String>),
}

/// What the swarm task reports up to the node.
#[derive(Debug)]
pub enum NetworkEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    HelloReceived {
        peer: PeerId,
        info: HelloInfo,
    },
    BlockGossip {
        peer: PeerId,
        block: Box<Block>,
    },
    TransactionGossip {
        peer: PeerId,
        tx: Box<SignedTransaction>,
    },
    SyncRequest {
        peer: PeerId,
        request: SyncRequest,
        channel: ResponseChannel<SyncResponse>,
    },
    SyncResponse {
        peer: PeerId,
        response: SyncResponse,
    },
    /// An outstanding request failed or timed out; the peer was scored down.
    RequestFailed {
        peer: PeerId,
    },
}

/// What the node asks the swarm task to do.
#[derive(Debug)]
pub enum NetworkCommand {
    BroadcastBlock(Box<Block>),
    BroadcastTransaction(Box<SignedTransaction>),
    SendRequest {
        peer: PeerId,
        request: SyncRequest,
    },
    Respond {
        channel: ResponseChannel<SyncResponse>,
        response: SyncResponse,
    },
    ScoreDown {
        peer: PeerId,
        penalty: i32,
    },
    Ban(PeerId),
}
