//! Registration handles and the dispatcher-owned registration table.
//!
//! The table is only ever touched from the dispatcher task, so it needs no
//! locking. Closing a registration drops its sender, which the consumer
//! observes as the end of its output queue.

use std::collections::HashMap;

use regex::Regex;
use tokio::sync::mpsc;
use tracing::debug;

use chainevent_core::{BlockEvent, CcEvent, EventError, FilteredBlockEvent, TxStatusEvent};

use crate::event::BlockFilter;

/// Handle identifying a live registration; pass it back to unregister.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Registration {
    Block { id: u64 },
    FilteredBlock { id: u64 },
    TxStatus { id: u64, tx_id: String },
    Chaincode { id: u64, chaincode_id: String, event_filter: String },
    Connection { id: u64 },
}

impl Registration {
    pub fn id(&self) -> u64 {
        match self {
            Self::Block { id }
            | Self::FilteredBlock { id }
            | Self::TxStatus { id, .. }
            | Self::Chaincode { id, .. }
            | Self::Connection { id } => *id,
        }
    }
}

/// Common capability of every table entry.
pub trait Subscriber {
    /// The handle this entry was registered under.
    fn registration(&self) -> Registration;

    /// Close the consumer's output queue.
    fn close(self)
    where
        Self: Sized,
    {
        debug!(registration = ?self.registration(), "closing registration");
    }
}

pub struct BlockReg {
    pub id: u64,
    pub filter: BlockFilter,
    pub sender: mpsc::Sender<BlockEvent>,
}

pub struct FilteredBlockReg {
    pub id: u64,
    pub sender: mpsc::Sender<FilteredBlockEvent>,
}

pub struct TxStatusReg {
    pub id: u64,
    pub tx_id: String,
    pub sender: mpsc::Sender<TxStatusEvent>,
}

pub struct ChaincodeReg {
    pub id: u64,
    pub chaincode_id: String,
    pub event_filter: String,
    pub pattern: Regex,
    pub sender: mpsc::Sender<CcEvent>,
}

impl ChaincodeReg {
    /// Returns `true` if this registration wants `event_name` from `chaincode_id`.
    pub fn matches(&self, chaincode_id: &str, event_name: &str) -> bool {
        self.chaincode_id == chaincode_id && self.pattern.is_match(event_name)
    }
}

impl Subscriber for BlockReg {
    fn registration(&self) -> Registration {
        Registration::Block { id: self.id }
    }
}

impl Subscriber for FilteredBlockReg {
    fn registration(&self) -> Registration {
        Registration::FilteredBlock { id: self.id }
    }
}

impl Subscriber for TxStatusReg {
    fn registration(&self) -> Registration {
        Registration::TxStatus {
            id: self.id,
            tx_id: self.tx_id.clone(),
        }
    }
}

impl Subscriber for ChaincodeReg {
    fn registration(&self) -> Registration {
        Registration::Chaincode {
            id: self.id,
            chaincode_id: self.chaincode_id.clone(),
            event_filter: self.event_filter.clone(),
        }
    }
}

/// Snapshot of registration counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub total: usize,
    pub block: usize,
    pub filtered_block: usize,
    pub tx_status: usize,
    pub chaincode: usize,
}

/// Active subscriptions, one sub-table per event category.
#[derive(Default)]
pub struct RegistrationTable {
    next_id: u64,
    blocks: Vec<BlockReg>,
    filtered_blocks: Vec<FilteredBlockReg>,
    tx_status: HashMap<String, TxStatusReg>,
    chaincode: HashMap<(String, String), ChaincodeReg>,
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a registration id.
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_block(
        &mut self,
        filter: BlockFilter,
        sender: mpsc::Sender<BlockEvent>,
    ) -> Registration {
        let reg = BlockReg {
            id: self.next_id(),
            filter,
            sender,
        };
        let handle = reg.registration();
        self.blocks.push(reg);
        handle
    }

    pub fn add_filtered_block(&mut self, sender: mpsc::Sender<FilteredBlockEvent>) -> Registration {
        let reg = FilteredBlockReg {
            id: self.next_id(),
            sender,
        };
        let handle = reg.registration();
        self.filtered_blocks.push(reg);
        handle
    }

    /// Fails without touching the table if `tx_id` is already registered.
    pub fn add_tx_status(
        &mut self,
        tx_id: String,
        sender: mpsc::Sender<TxStatusEvent>,
    ) -> Result<Registration, EventError> {
        if self.tx_status.contains_key(&tx_id) {
            return Err(EventError::TxRegistrationExists { tx_id });
        }
        let reg = TxStatusReg {
            id: self.next_id(),
            tx_id: tx_id.clone(),
            sender,
        };
        let handle = reg.registration();
        self.tx_status.insert(tx_id, reg);
        Ok(handle)
    }

    /// Fails if the (chaincode, filter) pair is taken or the filter is not a
    /// valid regular expression.
    pub fn add_chaincode(
        &mut self,
        chaincode_id: String,
        event_filter: String,
        sender: mpsc::Sender<CcEvent>,
    ) -> Result<Registration, EventError> {
        let key = (chaincode_id, event_filter);
        if self.chaincode.contains_key(&key) {
            let (chaincode_id, event_filter) = key;
            return Err(EventError::ChaincodeRegistrationExists {
                chaincode_id,
                event_filter,
            });
        }
        let pattern = Regex::new(&key.1).map_err(|e| EventError::InvalidEventFilter {
            chaincode_id: key.0.clone(),
            event_filter: key.1.clone(),
            reason: e.to_string(),
        })?;
        let reg = ChaincodeReg {
            id: self.next_id(),
            chaincode_id: key.0.clone(),
            event_filter: key.1.clone(),
            pattern,
            sender,
        };
        let handle = reg.registration();
        self.chaincode.insert(key, reg);
        Ok(handle)
    }

    /// Remove and close a registration. Returns `false` if it was not found.
    pub fn remove(&mut self, registration: &Registration) -> bool {
        match registration {
            Registration::Block { id } => {
                match self.blocks.iter().position(|r| r.id == *id) {
                    Some(pos) => {
                        self.blocks.swap_remove(pos).close();
                        true
                    }
                    None => false,
                }
            }
            Registration::FilteredBlock { id } => {
                match self.filtered_blocks.iter().position(|r| r.id == *id) {
                    Some(pos) => {
                        self.filtered_blocks.swap_remove(pos).close();
                        true
                    }
                    None => false,
                }
            }
            Registration::TxStatus { id, tx_id } => match self.tx_status.get(tx_id) {
                Some(reg) if reg.id == *id => {
                    if let Some(reg) = self.tx_status.remove(tx_id) {
                        reg.close();
                    }
                    true
                }
                _ => false,
            },
            Registration::Chaincode {
                id,
                chaincode_id,
                event_filter,
            } => {
                let key = (chaincode_id.clone(), event_filter.clone());
                match self.chaincode.get(&key) {
                    Some(reg) if reg.id == *id => {
                        if let Some(reg) = self.chaincode.remove(&key) {
                            reg.close();
                        }
                        true
                    }
                    _ => false,
                }
            }
            Registration::Connection { .. } => false,
        }
    }

    /// Close every registration in all four tables.
    pub fn clear(&mut self) {
        self.blocks.drain(..).for_each(Subscriber::close);
        self.filtered_blocks.drain(..).for_each(Subscriber::close);
        self.tx_status.drain().for_each(|(_, r)| r.close());
        self.chaincode.drain().for_each(|(_, r)| r.close());
    }

    pub fn info(&self) -> RegistrationInfo {
        let block = self.blocks.len();
        let filtered_block = self.filtered_blocks.len();
        let tx_status = self.tx_status.len();
        let chaincode = self.chaincode.len();
        RegistrationInfo {
            total: block + filtered_block + tx_status + chaincode,
            block,
            filtered_block,
            tx_status,
            chaincode,
        }
    }

    pub fn blocks(&self) -> &[BlockReg] {
        &self.blocks
    }

    pub fn filtered_blocks(&self) -> &[FilteredBlockReg] {
        &self.filtered_blocks
    }

    pub fn tx_status(&self, tx_id: &str) -> Option<&TxStatusReg> {
        self.tx_status.get(tx_id)
    }

    /// Chaincode registrations interested in this event.
    pub fn chaincode_matches<'a>(
        &'a self,
        chaincode_id: &'a str,
        event_name: &'a str,
    ) -> impl Iterator<Item = &'a ChaincodeReg> + 'a {
        self.chaincode
            .values()
            .filter(move |r| r.matches(chaincode_id, event_name))
    }
}
