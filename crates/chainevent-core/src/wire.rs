//! Wire format of transaction envelopes carried inside a [`Block`].
//!
//! Envelopes are JSON documents. Endorser transactions nest two further
//! encoded layers, mirroring the ledger's envelope structure:
//!
//! ```text
//! Envelope { header: ChannelHeader, data }
//!   └─ data = EndorserTransaction { actions: [TransactionAction] }
//!        └─ action.payload = ProposalResponsePayload { extension: ChaincodeAction }
//!             └─ extension.events: Option<ChaincodeEvent>
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::{Block, ChaincodeEvent, HeaderType, TxValidationCode};

/// Errors decoding a single envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed {layer}: {source}")]
    Malformed {
        layer: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Channel header of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHeader {
    pub header_type: HeaderType,
    pub channel_id: String,
    pub tx_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// A signed transaction envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: ChannelHeader,
    /// Encoded transaction body; layout depends on `header.header_type`.
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub signature: Vec<u8>,
}

/// Body of an endorser transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EndorserTransaction {
    pub actions: Vec<TransactionAction>,
}

/// One chaincode invocation inside an endorser transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAction {
    /// Encoded [`ProposalResponsePayload`].
    pub payload: Vec<u8>,
}

/// The endorsed proposal response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalResponsePayload {
    #[serde(default)]
    pub proposal_hash: Vec<u8>,
    pub extension: ChaincodeAction,
}

/// Chaincode execution result carried in the response extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeAction {
    pub chaincode_id: String,
    #[serde(default)]
    pub events: Option<ChaincodeEvent>,
}

fn decode<T: DeserializeOwned>(bytes: &[u8], layer: &'static str) -> Result<T, DecodeError> {
    serde_json::from_slice(bytes).map_err(|source| DecodeError::Malformed { layer, source })
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    // Serializing these plain structs cannot fail.
    serde_json::to_vec(value).unwrap_or_default()
}

impl Envelope {
    /// Decode an envelope from its serialized form.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes, "envelope")
    }

    /// Serialize the envelope.
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    /// Build an endorser transaction envelope. Each event becomes one action.
    pub fn endorser_transaction(
        channel_id: impl Into<String>,
        tx_id: impl Into<String>,
        events: Vec<ChaincodeEvent>,
    ) -> Self {
        let actions = events
            .into_iter()
            .map(|event| TransactionAction {
                payload: encode(&ProposalResponsePayload {
                    proposal_hash: vec![],
                    extension: ChaincodeAction {
                        chaincode_id: event.chaincode_id.clone(),
                        events: Some(event),
                    },
                }),
            })
            .collect();
        Self {
            header: ChannelHeader {
                header_type: HeaderType::EndorserTransaction,
                channel_id: channel_id.into(),
                tx_id: tx_id.into(),
                timestamp: 0,
            },
            data: encode(&EndorserTransaction { actions }),
            signature: vec![],
        }
    }

    /// Build a config transaction envelope.
    pub fn config(channel_id: impl Into<String>, tx_id: impl Into<String>) -> Self {
        Self {
            header: ChannelHeader {
                header_type: HeaderType::Config,
                channel_id: channel_id.into(),
                tx_id: tx_id.into(),
                timestamp: 0,
            },
            data: vec![],
            signature: vec![],
        }
    }

    /// Decode the chaincode events of an endorser transaction body.
    ///
    /// Actions whose response carries no event, or an event with an empty
    /// chaincode id, contribute nothing.
    pub fn chaincode_events(&self) -> Result<Vec<ChaincodeEvent>, DecodeError> {
        let tx: EndorserTransaction = decode(&self.data, "endorser transaction")?;
        let mut events = Vec::new();
        for action in &tx.actions {
            let response: ProposalResponsePayload =
                decode(&action.payload, "proposal response payload")?;
            if let Some(event) = response.extension.events {
                if !event.chaincode_id.is_empty() {
                    events.push(event);
                }
            }
        }
        Ok(events)
    }
}

impl Block {
    /// Assemble a block from envelopes and their validation codes.
    pub fn from_envelopes(
        channel_id: impl Into<String>,
        number: u64,
        txs: Vec<(Envelope, TxValidationCode)>,
    ) -> Self {
        let (data, validation_flags) = txs
            .into_iter()
            .map(|(env, code)| (env.encode(), code.flag()))
            .unzip();
        Self {
            channel_id: channel_id.into(),
            number,
            data,
            validation_flags,
        }
    }
}
