//! Events delivered to registered consumers.

use std::sync::Arc;

use crate::block::{Block, FilteredBlock, TxValidationCode};
use crate::error::EventError;

/// A full block, delivered to block registrations.
#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub block: Arc<Block>,
    /// Endpoint the block was received from.
    pub source_url: String,
}

/// A filtered block, delivered to filtered-block registrations.
#[derive(Debug, Clone)]
pub struct FilteredBlockEvent {
    pub filtered_block: Arc<FilteredBlock>,
    pub source_url: String,
}

/// Commit status of a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatusEvent {
    pub tx_id: String,
    pub validation_code: TxValidationCode,
    pub block_number: u64,
    pub source_url: String,
}

/// A chaincode event from a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcEvent {
    pub tx_id: String,
    pub chaincode_id: String,
    pub event_name: String,
    pub payload: Vec<u8>,
    pub block_number: u64,
    pub source_url: String,
}

/// Connection state change of the event client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub connected: bool,
    /// Cause of a disconnect, if known.
    pub error: Option<EventError>,
}

impl ConnectionEvent {
    pub fn connected() -> Self {
        Self {
            connected: true,
            error: None,
        }
    }

    pub fn disconnected(error: Option<EventError>) -> Self {
        Self {
            connected: false,
            error,
        }
    }
}
