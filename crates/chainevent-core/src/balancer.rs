//! Endpoint selection policies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::EventError;

/// Chooses one endpoint out of a candidate list.
///
/// Implementations must be safe to call concurrently.
pub trait LoadBalancePolicy: Send + Sync {
    /// Pick an endpoint. Fails if `candidates` is empty.
    fn choose<'a>(&self, candidates: &'a [Endpoint]) -> Result<&'a Endpoint, EventError>;
}

/// Cycles through the candidates in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancePolicy for RoundRobin {
    fn choose<'a>(&self, candidates: &'a [Endpoint]) -> Result<&'a Endpoint, EventError> {
        if candidates.is_empty() {
            return Err(EventError::NoCandidates);
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(&candidates[idx])
    }
}

/// Picks a candidate uniformly at random.
#[derive(Debug, Default, Clone, Copy)]
pub struct Random;

impl LoadBalancePolicy for Random {
    fn choose<'a>(&self, candidates: &'a [Endpoint]) -> Result<&'a Endpoint, EventError> {
        if candidates.is_empty() {
            return Err(EventError::NoCandidates);
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Ok(&candidates[idx])
    }
}

/// Named policy, as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceKind {
    #[default]
    RoundRobin,
    Random,
}

impl LoadBalanceKind {
    /// Instantiate the policy.
    pub fn build(self) -> Arc<dyn LoadBalancePolicy> {
        match self {
            Self::RoundRobin => Arc::new(RoundRobin::new()),
            Self::Random => Arc::new(Random),
        }
    }
}
