//! Messages accepted on the dispatcher input queue.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use chainevent_core::{
    Block, BlockEvent, CcEvent, ConnectionEvent, EventError, FilteredBlock, FilteredBlockEvent,
    TransportMessage, TxStatusEvent,
};

use crate::registration::{Registration, RegistrationInfo};

/// One-shot reply channel for a request posted to the dispatcher.
pub type Responder<T> = oneshot::Sender<Result<T, EventError>>;

/// Predicate deciding whether a block registration receives a block.
#[derive(Clone)]
pub struct BlockFilter(Arc<dyn Fn(&Block) -> bool + Send + Sync>);

impl BlockFilter {
    pub fn new(predicate: impl Fn(&Block) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// A filter that accepts every block.
    pub fn accept_all() -> Self {
        Self::new(|_| true)
    }

    pub fn matches(&self, block: &Block) -> bool {
        (self.0)(block)
    }
}

impl Default for BlockFilter {
    fn default() -> Self {
        Self::accept_all()
    }
}

impl std::fmt::Debug for BlockFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlockFilter(..)")
    }
}

/// Everything the dispatcher task processes, in arrival order.
#[derive(Debug)]
pub enum Event {
    RegisterBlock {
        filter: BlockFilter,
        sender: mpsc::Sender<BlockEvent>,
        respond: Responder<Registration>,
    },
    RegisterFilteredBlock {
        sender: mpsc::Sender<FilteredBlockEvent>,
        respond: Responder<Registration>,
    },
    RegisterTxStatus {
        tx_id: String,
        sender: mpsc::Sender<TxStatusEvent>,
        respond: Responder<Registration>,
    },
    RegisterChaincode {
        chaincode_id: String,
        event_filter: String,
        sender: mpsc::Sender<CcEvent>,
        respond: Responder<Registration>,
    },
    Unregister {
        registration: Registration,
    },
    RegistrationInfo {
        respond: Responder<RegistrationInfo>,
    },
    LastBlockNum {
        respond: Responder<Option<u64>>,
    },
    Block {
        block: Block,
        source_url: String,
    },
    FilteredBlock {
        block: FilteredBlock,
        source_url: String,
    },
    Stop {
        respond: Responder<()>,
    },
    Connect {
        respond: Responder<()>,
    },
    Disconnect {
        respond: Responder<()>,
    },
    Connected,
    Disconnected {
        error: Option<EventError>,
    },
    RegisterConnection {
        sender: mpsc::Sender<ConnectionEvent>,
        respond: Responder<Registration>,
    },
}

/// Tag of an [`Event`] variant; key of the handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RegisterBlock,
    RegisterFilteredBlock,
    RegisterTxStatus,
    RegisterChaincode,
    Unregister,
    RegistrationInfo,
    LastBlockNum,
    Block,
    FilteredBlock,
    Stop,
    Connect,
    Disconnect,
    Connected,
    Disconnected,
    RegisterConnection,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RegisterBlock { .. } => EventKind::RegisterBlock,
            Self::RegisterFilteredBlock { .. } => EventKind::RegisterFilteredBlock,
            Self::RegisterTxStatus { .. } => EventKind::RegisterTxStatus,
            Self::RegisterChaincode { .. } => EventKind::RegisterChaincode,
            Self::Unregister { .. } => EventKind::Unregister,
            Self::RegistrationInfo { .. } => EventKind::RegistrationInfo,
            Self::LastBlockNum { .. } => EventKind::LastBlockNum,
            Self::Block { .. } => EventKind::Block,
            Self::FilteredBlock { .. } => EventKind::FilteredBlock,
            Self::Stop { .. } => EventKind::Stop,
            Self::Connect { .. } => EventKind::Connect,
            Self::Disconnect { .. } => EventKind::Disconnect,
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::RegisterConnection { .. } => EventKind::RegisterConnection,
        }
    }

    /// Wrap a message received from `source_url`.
    pub fn from_message(message: TransportMessage, source_url: impl Into<String>) -> Self {
        let source_url = source_url.into();
        match message {
            TransportMessage::Block(block) => Self::Block { block, source_url },
            TransportMessage::FilteredBlock(block) => Self::FilteredBlock { block, source_url },
        }
    }
}
