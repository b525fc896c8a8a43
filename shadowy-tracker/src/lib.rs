use reqwest::Client;
use serde::{Deserialize, Serialize};
use shadowy_core::Hash32;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http: {0}")]
    Http(String),
    #[error("tracker rejected announce: {0}")]
    Rejected(String),
}

/// What a node publishes to the directory. Announces are idempotent; the
/// tracker keys them by node id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    pub node_id: String,
    pub chain_id: Hash32,
    pub listen_addr: String,
    pub tip_height: u64,
    pub software_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerPeer {
    pub node_id: String,
    pub addr: String,
    pub tip_height: u64,
}

#[derive(Debug, Deserialize)]
struct AnnounceReply {
    accepted: bool,
    #[serde(default)]
    reason: String,
}

/// Thin outbound client for the optional tracker directory. Strictly
/// non-consensus: every failure is survivable and only logged.
pub struct TrackerClient {
    client: Client,
    base_url: String,
}

impl TrackerClient {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self { client, base_url }
    }

    pub async fn announce(&self, announce: &Announce) -> Result<(), TrackerError> {
        let url = format!("{}/announce", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(announce)
            .send()
            .await
            .map_err(|e| TrackerError::Http(e.to_string()))?;
        let reply: AnnounceReply = response
            .json()
            .await
            .map_err(|e| TrackerError::Http(e.to_string()))?;
        if reply.accepted {
            debug!(node = %announce.node_id, "tracker announce accepted");
            Ok(())
        } else {
            Err(TrackerError::Rejected(reply.reason))
        }
    }

    pub async fn peers(&self, chain_id: &Hash32) -> Result<Vec<TrackerPeer>, TrackerError> {
        let url = format!(
            "{}/peers?chain={}",
            self.base_url.trim_end_matches('/'),
            chain_id
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TrackerError::Http(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| TrackerError::Http(e.to_string()))
    }
}

/// Fire-and-forget announce used from the node loop; logs instead of
/// propagating, the chain never depends on it.
pub async fn announce_quietly(client: &TrackerClient, announce: Announce) {
    if let Err(e) = client.announce(&announce).await {
        warn!(error = %e, "tracker announce failed");
    }
}
