//! Ledger block model: raw blocks and their filtered projection.

use serde::{Deserialize, Serialize};

/// Validation outcome the committing peer recorded for a transaction.
///
/// Numeric values match the ledger's validation-flag bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxValidationCode {
    Valid,
    NilEnvelope,
    BadPayload,
    BadCommonHeader,
    BadCreatorSignature,
    InvalidEndorserTransaction,
    InvalidConfigTransaction,
    UnsupportedTxPayload,
    BadProposalTxid,
    DuplicateTxid,
    EndorsementPolicyFailure,
    MvccReadConflict,
    PhantomReadConflict,
    UnknownTxType,
    TargetChainNotFound,
    MarshalTxError,
    NilTxaction,
    ExpiredChaincode,
    ChaincodeVersionConflict,
    BadHeaderExtension,
    BadChannelHeader,
    BadResponsePayload,
    BadRwset,
    IllegalWriteset,
    InvalidWriteset,
    InvalidChaincode,
    NotValidated,
    InvalidOtherReason,
}

impl TxValidationCode {
    /// Map a bitmap flag to a validation code. Unknown flags are treated as
    /// `InvalidOtherReason`.
    pub fn from_flag(flag: u8) -> Self {
        match flag {
            0 => Self::Valid,
            1 => Self::NilEnvelope,
            2 => Self::BadPayload,
            3 => Self::BadCommonHeader,
            4 => Self::BadCreatorSignature,
            5 => Self::InvalidEndorserTransaction,
            6 => Self::InvalidConfigTransaction,
            7 => Self::UnsupportedTxPayload,
            8 => Self::BadProposalTxid,
            9 => Self::DuplicateTxid,
            10 => Self::EndorsementPolicyFailure,
            11 => Self::MvccReadConflict,
            12 => Self::PhantomReadConflict,
            13 => Self::UnknownTxType,
            14 => Self::TargetChainNotFound,
            15 => Self::MarshalTxError,
            16 => Self::NilTxaction,
            17 => Self::ExpiredChaincode,
            18 => Self::ChaincodeVersionConflict,
            19 => Self::BadHeaderExtension,
            20 => Self::BadChannelHeader,
            21 => Self::BadResponsePayload,
            22 => Self::BadRwset,
            23 => Self::IllegalWriteset,
            24 => Self::InvalidWriteset,
            25 => Self::InvalidChaincode,
            254 => Self::NotValidated,
            _ => Self::InvalidOtherReason,
        }
    }

    /// The bitmap flag for this code.
    pub fn flag(self) -> u8 {
        match self {
            Self::Valid => 0,
            Self::NilEnvelope => 1,
            Self::BadPayload => 2,
            Self::BadCommonHeader => 3,
            Self::BadCreatorSignature => 4,
            Self::InvalidEndorserTransaction => 5,
            Self::InvalidConfigTransaction => 6,
            Self::UnsupportedTxPayload => 7,
            Self::BadProposalTxid => 8,
            Self::DuplicateTxid => 9,
            Self::EndorsementPolicyFailure => 10,
            Self::MvccReadConflict => 11,
            Self::PhantomReadConflict => 12,
            Self::UnknownTxType => 13,
            Self::TargetChainNotFound => 14,
            Self::MarshalTxError => 15,
            Self::NilTxaction => 16,
            Self::ExpiredChaincode => 17,
            Self::ChaincodeVersionConflict => 18,
            Self::BadHeaderExtension => 19,
            Self::BadChannelHeader => 20,
            Self::BadResponsePayload => 21,
            Self::BadRwset => 22,
            Self::IllegalWriteset => 23,
            Self::InvalidWriteset => 24,
            Self::InvalidChaincode => 25,
            Self::NotValidated => 254,
            Self::InvalidOtherReason => 255,
        }
    }

    /// Returns `true` if the transaction was committed to the ledger state.
    pub fn is_valid(self) -> bool {
        self == Self::Valid
    }
}

impl std::fmt::Display for TxValidationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Type of a transaction envelope, taken from its channel header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeaderType {
    Message,
    Config,
    ConfigUpdate,
    EndorserTransaction,
    OrdererTransaction,
    DeliverSeekInfo,
    ChaincodePackage,
}

/// A raw ledger block as received from the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Ledger channel the block belongs to.
    pub channel_id: String,
    /// Block sequence number.
    pub number: u64,
    /// Serialized transaction envelopes, in block order.
    pub data: Vec<Vec<u8>>,
    /// Validation flag per envelope, parallel to `data`.
    pub validation_flags: Vec<u8>,
}

impl Block {
    /// Validation code of the envelope at `index`. A missing flag reads as
    /// `NotValidated`.
    pub fn validation_code(&self, index: usize) -> TxValidationCode {
        self.validation_flags
            .get(index)
            .map(|f| TxValidationCode::from_flag(*f))
            .unwrap_or(TxValidationCode::NotValidated)
    }

    /// Number of transaction envelopes in the block.
    pub fn tx_count(&self) -> usize {
        self.data.len()
    }
}

/// An application event emitted by chaincode during a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeEvent {
    pub chaincode_id: String,
    pub tx_id: String,
    pub event_name: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Summary of one transaction inside a [`FilteredBlock`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredTransaction {
    pub tx_id: String,
    pub header_type: HeaderType,
    pub validation_code: TxValidationCode,
    /// Populated only when `validation_code` is `Valid`.
    #[serde(default)]
    pub chaincode_events: Vec<ChaincodeEvent>,
}

/// Lossy projection of a [`Block`]: identifiers, outcomes and chaincode events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredBlock {
    pub channel_id: String,
    pub number: u64,
    pub transactions: Vec<FilteredTransaction>,
}
