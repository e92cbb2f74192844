//! Block → filtered block transformation.

use tracing::warn;

use crate::block::{Block, FilteredBlock, FilteredTransaction, HeaderType, TxValidationCode};
use crate::wire::{DecodeError, Envelope};

/// Derive the filtered projection of a raw block.
///
/// Best-effort: an envelope that fails to decode is logged and left out, the
/// rest of the block is still transformed. Chaincode events are attached only
/// to committed endorser transactions.
pub fn to_filtered_block(block: &Block) -> FilteredBlock {
    let transactions = block
        .data
        .iter()
        .enumerate()
        .filter_map(|(index, raw)| {
            let code = block.validation_code(index);
            match filter_transaction(raw, code) {
                Ok(tx) => Some(tx),
                Err(e) => {
                    warn!(
                        block = block.number,
                        index,
                        error = %e,
                        "skipping undecodable transaction"
                    );
                    None
                }
            }
        })
        .collect();

    FilteredBlock {
        channel_id: block.channel_id.clone(),
        number: block.number,
        transactions,
    }
}

fn filter_transaction(
    raw: &[u8],
    validation_code: TxValidationCode,
) -> Result<FilteredTransaction, DecodeError> {
    let env = Envelope::decode(raw)?;
    let chaincode_events = if env.header.header_type == HeaderType::EndorserTransaction
        && validation_code.is_valid()
    {
        env.chaincode_events()?
    } else {
        vec![]
    };

    Ok(FilteredTransaction {
        tx_id: env.header.tx_id,
        header_type: env.header.header_type,
        validation_code,
        chaincode_events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ChaincodeEvent;

    fn cc_event(tx: &str, name: &str) -> ChaincodeEvent {
        ChaincodeEvent {
            chaincode_id: "mycc1".into(),
            tx_id: tx.into(),
            event_name: name.into(),
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn committed_endorser_tx_keeps_events() {
        let block = Block::from_envelopes(
            "mychannel",
            7,
            vec![(
                Envelope::endorser_transaction("mychannel", "tx1", vec![cc_event("tx1", "event1")]),
                TxValidationCode::Valid,
            )],
        );
        let fb = to_filtered_block(&block);
        assert_eq!(fb.number, 7);
        assert_eq!(fb.channel_id, "mychannel");
        assert_eq!(fb.transactions.len(), 1);
        let tx = &fb.transactions[0];
        assert_eq!(tx.tx_id, "tx1");
        assert_eq!(tx.header_type, HeaderType::EndorserTransaction);
        assert_eq!(tx.chaincode_events, vec![cc_event("tx1", "event1")]);
    }

    #[test]
    fn invalid_tx_has_no_events() {
        let block = Block::from_envelopes(
            "mychannel",
            1,
            vec![(
                Envelope::endorser_transaction("mychannel", "tx1", vec![cc_event("tx1", "event1")]),
                TxValidationCode::MvccReadConflict,
            )],
        );
        let fb = to_filtered_block(&block);
        assert_eq!(fb.transactions[0].validation_code, TxValidationCode::MvccReadConflict);
        assert!(fb.transactions[0].chaincode_events.is_empty());
    }

    #[test]
    fn malformed_transaction_is_skipped() {
        let mut block = Block::from_envelopes(
            "mychannel",
            2,
            vec![
                (Envelope::config("mychannel", "cfg"), TxValidationCode::Valid),
                (
                    Envelope::endorser_transaction("mychannel", "tx2", vec![]),
                    TxValidationCode::Valid,
                ),
            ],
        );
        block.data.insert(1, b"garbage".to_vec());
        block.validation_flags.insert(1, 0);

        let fb = to_filtered_block(&block);
        assert_eq!(block.tx_count(), 3);
        assert_eq!(fb.transactions.len(), 2);
        assert_eq!(fb.transactions[0].tx_id, "cfg");
        assert_eq!(fb.transactions[0].header_type, HeaderType::Config);
        assert_eq!(fb.transactions[1].tx_id, "tx2");
    }

    #[test]
    fn empty_block() {
        let block = Block::from_envelopes("mychannel", 0, vec![]);
        let fb = to_filtered_block(&block);
        assert!(fb.transactions.is_empty());
        assert_eq!(fb.number, 0);
    }
}
