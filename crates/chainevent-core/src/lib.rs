//! chainevent-core — ledger block model and shared building blocks for ChainEvent.
//!
//! # Overview
//!
//! ChainEvent streams ledger blocks from a peer's event feed and fans them
//! out to registered consumers. The core crate defines:
//!
//! - [`Block`] / [`FilteredBlock`] — raw blocks and their summarised projection
//! - [`transform`] — the pure block → filtered block transformation
//! - [`wire`] — the envelope format carried inside raw blocks
//! - [`notification`] — events delivered to consumers
//! - [`LoadBalancePolicy`] — endpoint selection (round-robin, random)
//! - [`DiscoveryService`] / [`Endpoint`] — connection candidates
//! - [`EventServiceConfig`] — configuration surface
//! - [`EventError`] — structured error type
//! - [`telemetry`] — tracing initialisation

pub mod balancer;
pub mod block;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod notification;
pub mod telemetry;
pub mod transform;
pub mod wire;

pub use balancer::{LoadBalanceKind, LoadBalancePolicy, Random, RoundRobin};
pub use block::{
    Block, ChaincodeEvent, FilteredBlock, FilteredTransaction, HeaderType, TxValidationCode,
};
pub use config::{Backpressure, EventServiceConfig};
pub use endpoint::{DiscoveryService, Endpoint, MessageStream, StaticDiscovery, TransportMessage};
pub use error::EventError;
pub use notification::{BlockEvent, CcEvent, ConnectionEvent, FilteredBlockEvent, TxStatusEvent};
pub use transform::to_filtered_block;
pub use wire::Envelope;
