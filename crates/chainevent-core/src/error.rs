//! Error types for the event service.

use thiserror::Error;

/// Errors surfaced by the dispatcher, the connection layer and the client.
///
/// `Clone` so that a disconnect cause can be forwarded inside
/// [`ConnectionEvent`](crate::notification::ConnectionEvent) notifications.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// A tx-status registration for this transaction id is already live.
    #[error("registration already exists for TX ID [{tx_id}]")]
    TxRegistrationExists { tx_id: String },

    /// A chaincode registration for this (chaincode, filter) pair is already live.
    #[error("registration already exists for chaincode [{chaincode_id}] and event [{event_filter}]")]
    ChaincodeRegistrationExists {
        chaincode_id: String,
        event_filter: String,
    },

    /// The chaincode event filter is not a valid regular expression.
    #[error("invalid event filter [{event_filter}] for chaincode [{chaincode_id}]: {reason}")]
    InvalidEventFilter {
        chaincode_id: String,
        event_filter: String,
        reason: String,
    },

    /// Only one connection-event subscriber may be registered at a time.
    #[error("registration already exists for connection events")]
    ConnectionRegistrationExists,

    #[error("dispatcher is not started")]
    DispatcherNotStarted,

    #[error("cannot start dispatcher: state is [{state}]")]
    DispatcherAlreadyStarted { state: String },

    /// The dispatcher stopped before answering a request.
    #[error("dispatcher stopped")]
    DispatcherStopped,

    /// Discovery returned no candidate endpoints.
    #[error("no peers to connect to on channel [{channel_id}]")]
    NoPeers { channel_id: String },

    #[error("no candidate endpoints to choose from")]
    NoCandidates,

    /// Dialing or opening the event stream failed.
    #[error("connection to {url} failed: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("connection already closed")]
    ConnectionClosed,

    /// The remote peer ended the event stream.
    #[error("event stream from {url} ended")]
    StreamEnded { url: String },

    /// Mid-stream transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Another connect attempt owns the connection state.
    #[error("unable to connect event client since client is [{state}], expecting [disconnected]")]
    ConnectInProgress { state: String },

    #[error("event client is closed")]
    ClientClosed,

    #[error("maximum connect attempts exceeded ({attempts})")]
    MaxConnectAttemptsExceeded { attempts: u32 },

    /// The client was built without permission to receive full blocks.
    #[error("block events are not permitted")]
    BlockEventsNotPermitted,

    #[error("timeout waiting for {operation} response after {ms}ms")]
    Timeout { operation: String, ms: u64 },

    /// A caller-supplied hook returned an error.
    #[error("error invoking {hook} handler: {reason}")]
    Hook { hook: String, reason: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl EventError {
    /// Returns `true` for dial and stream failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::StreamEnded { .. }
                | Self::Transport(_)
                | Self::ConnectionClosed
        )
    }

    /// Returns `true` for errors caused by a bad registration request.
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            Self::TxRegistrationExists { .. }
                | Self::ChaincodeRegistrationExists { .. }
                | Self::InvalidEventFilter { .. }
                | Self::ConnectionRegistrationExists
                | Self::BlockEventsNotPermitted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let dial = EventError::ConnectionFailed {
            url: "grpcs://peer0:7051".into(),
            reason: "refused".into(),
        };
        assert!(dial.is_transport());
        assert!(!dial.is_registration());

        let dup = EventError::TxRegistrationExists { tx_id: "tx1".into() };
        assert!(dup.is_registration());
        assert!(!dup.is_transport());
    }

    #[test]
    fn messages_name_the_key() {
        let err = EventError::ChaincodeRegistrationExists {
            chaincode_id: "mycc".into(),
            event_filter: "event.*".into(),
        };
        assert_eq!(
            err.to_string(),
            "registration already exists for chaincode [mycc] and event [event.*]"
        );
    }
}
