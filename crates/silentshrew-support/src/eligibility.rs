//! Silent-payment eligibility rules.
//!
//! A transaction can carry a silent payment when it pays at least one
//! taproot output, is not a coinbase, and none of its witnesses is an
//! ordinals inscription envelope.

use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_ENDIF, OP_IF};
use bitcoin::opcodes::OP_0;
use bitcoin::{Transaction, Txid, Witness};

const TAPROOT_ANNEX_PREFIX: u8 = 0x50;

/// A transaction is eligible iff it has no coinbase input, no
/// inscription-bearing witness, and at least one P2TR output.
pub fn is_silent_payment_eligible(tx: &Transaction) -> bool {
    for input in &tx.input {
        if input.previous_output.txid == Txid::all_zeros() {
            return false;
        }
        if is_inscription(&input.witness) {
            return false;
        }
    }

    tx.output.iter().any(|out| out.script_pubkey.is_p2tr())
}

/// Assuming the witness spends a taproot input, returns true when its
/// tapscript is the canonical inscription envelope
/// `OP_0 OP_IF ... OP_ENDIF`.
pub fn is_inscription(witness: &Witness) -> bool {
    let mut items: Vec<&[u8]> = witness.iter().collect();
    if items.is_empty() {
        return false;
    }

    if items.len() > 1 {
        let last = items[items.len() - 1];
        if !last.is_empty() && last[0] == TAPROOT_ANNEX_PREFIX {
            items.pop();
        }
    }

    if items.len() < 2 {
        return false;
    }

    let tapscript = items[items.len() - 2];

    let if_index = match tapscript.iter().position(|&b| b == OP_IF.to_u8()) {
        Some(index) => index,
        None => return false,
    };
    let endif_index = match tapscript.iter().position(|&b| b == OP_ENDIF.to_u8()) {
        Some(index) => index,
        None => return false,
    };

    if if_index > endif_index || if_index == 0 {
        return false;
    }

    tapscript[if_index - 1] == OP_0.to_u8()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut};

    fn taproot_out() -> TxOut {
        TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: ScriptBuf::from_bytes({
                let mut script = vec![0x51, 0x20];
                script.extend_from_slice(&[0xab; 32]);
                script
            }),
        }
    }

    fn tx(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: outputs,
        }
    }

    fn spend_of(txid_byte: u8, witness: Witness) -> TxIn {
        TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([txid_byte; 32]),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness,
        }
    }

    #[test]
    fn coinbase_is_not_eligible() {
        let coinbase = TxIn {
            previous_output: OutPoint {
                txid: Txid::all_zeros(),
                vout: u32::MAX,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        };
        assert!(!is_silent_payment_eligible(&tx(
            vec![coinbase],
            vec![taproot_out()]
        )));
    }

    #[test]
    fn inscription_envelope_is_not_eligible() {
        // OP_0 OP_IF PUSH1 0xAA OP_ENDIF
        let tapscript = vec![0x00, 0x63, 0x01, 0xaa, 0x68];
        let witness = Witness::from_slice(&[tapscript, vec![0xc0; 33]]);
        assert!(!is_silent_payment_eligible(&tx(
            vec![spend_of(0x01, witness)],
            vec![taproot_out()]
        )));
    }

    #[test]
    fn inscription_is_detected_behind_annex() {
        let tapscript = vec![0x00, 0x63, 0x01, 0xaa, 0x68];
        let witness = Witness::from_slice(&[tapscript, vec![0xc0; 33], vec![0x50, 0x01]]);
        assert!(is_inscription(&witness));
    }

    #[test]
    fn envelope_needs_op0_immediately_before_op_if() {
        // OP_1 OP_IF ... OP_ENDIF is not an inscription
        let tapscript = vec![0x51, 0x63, 0x01, 0xaa, 0x68];
        let witness = Witness::from_slice(&[tapscript, vec![0xc0; 33]]);
        assert!(!is_inscription(&witness));

        // OP_IF at position 0 has no preceding byte
        let tapscript = vec![0x63, 0x68];
        let witness = Witness::from_slice(&[tapscript, vec![0xc0; 33]]);
        assert!(!is_inscription(&witness));
    }

    #[test]
    fn op_endif_before_op_if_is_not_an_envelope() {
        let tapscript = vec![0x68, 0x00, 0x63];
        let witness = Witness::from_slice(&[tapscript, vec![0xc0; 33]]);
        assert!(!is_inscription(&witness));
    }

    #[test]
    fn key_path_witness_is_never_an_inscription() {
        let witness = Witness::from_slice(&[vec![0u8; 64]]);
        assert!(!is_inscription(&witness));
    }

    #[test]
    fn taproot_paying_spend_is_eligible() {
        let witness = Witness::from_slice(&[vec![0u8; 64]]);
        assert!(is_silent_payment_eligible(&tx(
            vec![spend_of(0x02, witness)],
            vec![taproot_out()]
        )));
    }

    #[test]
    fn no_taproot_output_means_not_eligible() {
        let witness = Witness::from_slice(&[vec![0u8; 64]]);
        let out = TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::from_byte_array(
                [0x11; 20],
            )),
        };
        assert!(!is_silent_payment_eligible(&tx(
            vec![spend_of(0x03, witness)],
            vec![out]
        )));
    }

    #[test]
    fn verdict_is_stable_across_calls() {
        let witness = Witness::from_slice(&[vec![0u8; 64]]);
        let tx = tx(vec![spend_of(0x04, witness)], vec![taproot_out()]);
        assert_eq!(
            is_silent_payment_eligible(&tx),
            is_silent_payment_eligible(&tx)
        );
    }
}
