//! Event endpoints, peer discovery and transport messages.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::block::{Block, FilteredBlock};
use crate::error::EventError;

/// A peer that serves the ledger event feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Address of the event service, e.g. `"grpcs://peer0.org1:7051"`.
    pub url: String,
    /// Organisation the peer belongs to, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msp_id: Option<String>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            msp_id: None,
        }
    }

    pub fn with_msp_id(mut self, msp_id: impl Into<String>) -> Self {
        self.msp_id = Some(msp_id.into());
        self
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Supplies candidate endpoints for the event connection.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    /// Return the peers currently eligible to serve events.
    async fn peers(&self) -> Result<Vec<Endpoint>, EventError>;
}

/// A [`DiscoveryService`] over a fixed list of endpoints.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<Endpoint>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<Endpoint>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl DiscoveryService for StaticDiscovery {
    async fn peers(&self) -> Result<Vec<Endpoint>, EventError> {
        Ok(self.peers.clone())
    }
}

/// A message received from the event stream of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Block(Block),
    FilteredBlock(FilteredBlock),
}

/// Inbound messages of one connected episode.
pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<TransportMessage, EventError>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_discovery_returns_its_peers() {
        let discovery = StaticDiscovery::new(vec![
            Endpoint::new("grpcs://peer0:7051").with_msp_id("Org1MSP"),
            Endpoint::new("grpcs://peer1:7051"),
        ]);
        let peers = discovery.peers().await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].msp_id.as_deref(), Some("Org1MSP"));
        assert_eq!(peers[1].to_string(), "grpcs://peer1:7051");
    }

    #[tokio::test]
    async fn empty_discovery() {
        let discovery = StaticDiscovery::default();
        assert!(discovery.peers().await.unwrap().is_empty());
    }
}
