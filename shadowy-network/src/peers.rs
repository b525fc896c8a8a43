use crate::HelloInfo;
use libp2p::{Multiaddr, PeerId};
use shadowy_core::Hash32;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const INITIAL_SCORE: i32 = 0;
const BAN_THRESHOLD: i32 = -100;
const MAX_KNOWN_ADDRESSES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Handshaking,
    Active,
    Disconnected,
    Banned,
}

#[derive(Debug)]
struct PeerRecord {
    state: PeerState,
    score: i32,
    hello: Option<HelloInfo>,
    banned_until: Option<Instant>,
    forwarded: LruSet,
}

/// Per-peer LRU of hashes already forwarded to (or seen from) that peer;
/// bounds gossip loops.
#[derive(Debug)]
struct LruSet {
    cap: usize,
    order: VecDeque<Hash32>,
    members: HashSet<Hash32>,
}

impl LruSet {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Inserts and reports whether the hash was new.
    fn insert(&mut self, hash: Hash32) -> bool {
        if !self.members.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }
}

/// Lifecycle and scoring book for every peer the swarm has spoken to,
/// plus the dialable addresses learned from mdns and identify. Served to
/// peers that ask for them.
pub struct PeerBook {
    peers: HashMap<PeerId, PeerRecord>,
    addresses: HashMap<PeerId, Multiaddr>,
    ban_duration: Duration,
    forwarded_cache: usize,
}

impl PeerBook {
    pub fn new(ban_duration: Duration, forwarded_cache: usize) -> Self {
        Self {
            peers: HashMap::new(),
            addresses: HashMap::new(),
            ban_duration,
            forwarded_cache,
        }
    }

    pub fn record_address(&mut self, peer: PeerId, address: Multiaddr) {
        if self.addresses.len() >= MAX_KNOWN_ADDRESSES
            && !self.addresses.contains_key(&peer)
        {
            return;
        }
        self.addresses.insert(peer, address);
    }

    /// Dialable addresses of non-banned peers, for `GetPeers` answers.
    pub fn known_addresses(&self) -> Vec<String> {
        self.addresses
            .iter()
            .filter(|(peer, _)| !self.is_banned(peer))
            .map(|(_, addr)| addr.to_string())
            .collect()
    }

    pub fn connected(&mut self, peer: PeerId) -> PeerState {
        let cache = self.forwarded_cache;
        let record = self.peers.entry(peer).or_insert_with(|| PeerRecord {
            state: PeerState::Handshaking,
            score: INITIAL_SCORE,
            hello: None,
            banned_until: None,
            forwarded: LruSet::new(cache),
        });
        if let Some(until) = record.banned_until {
            if Instant::now() < until {
                record.state = PeerState::Banned;
                return PeerState::Banned;
            }
            record.banned_until = None;
            record.score = INITIAL_SCORE;
        }
        record.state = PeerState::Handshaking;
        record.state
    }

    pub fn disconnected(&mut self, peer: &PeerId) {
        if let Some(record) = self.peers.get_mut(peer) {
            if record.state != PeerState::Banned {
                record.state = PeerState::Disconnected;
            }
        }
    }

    pub fn hello(&mut self, peer: PeerId, info: HelloInfo) {
        if let Some(record) = self.peers.get_mut(&peer) {
            record.hello = Some(info);
            record.state = PeerState::Active;
        }
    }

    pub fn state(&self, peer: &PeerId) -> Option<PeerState> {
        self.peers.get(peer).map(|r| r.state)
    }

    pub fn tip_of(&self, peer: &PeerId) -> Option<(u64, Hash32)> {
        self.peers
            .get(peer)
            .and_then(|r| r.hello.as_ref())
            .map(|h| (h.tip_height, h.tip_hash))
    }

    /// The active peer with the highest advertised tip, if any.
    pub fn best_peer(&self) -> Option<(PeerId, u64)> {
        self.peers
            .iter()
            .filter(|(_, r)| r.state == PeerState::Active)
            .filter_map(|(peer, r)| r.hello.as_ref().map(|h| (*peer, h.tip_height)))
            .max_by_key(|(_, height)| *height)
    }

    pub fn active_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, r)| r.state == PeerState::Active)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Applies a penalty; a peer falling through the threshold is banned
    /// and the caller should disconnect it. Returns true on ban.
    pub fn score_down(&mut self, peer: &PeerId, penalty: i32) -> bool {
        let Some(record) = self.peers.get_mut(peer) else {
            return false;
        };
        record.score -= penalty;
        if record.score <= BAN_THRESHOLD {
            record.state = PeerState::Banned;
            record.banned_until = Some(Instant::now() + self.ban_duration);
            warn!(%peer, score = record.score, "peer banned");
            return true;
        }
        false
    }

    pub fn ban(&mut self, peer: &PeerId) {
        if let Some(record) = self.peers.get_mut(peer) {
            record.state = PeerState::Banned;
            record.banned_until = Some(Instant::now() + self.ban_duration);
            info!(%peer, "peer banned by command");
        }
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.peers
            .get(peer)
            .and_then(|r| r.banned_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// True when this hash was not yet forwarded to/seen from the peer;
    /// marks it either way. A node forwards a message at most once per peer.
    pub fn first_contact(&mut self, peer: &PeerId, hash: &Hash32) -> bool {
        match self.peers.get_mut(peer) {
            Some(record) => record.forwarded.insert(*hash),
            None => true,
        }
    }
}
