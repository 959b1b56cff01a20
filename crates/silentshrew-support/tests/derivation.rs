//! End-to-end derivation checks: the scalar produced from a transaction's
//! inputs must let a recipient holding the scan key reach the same shared
//! secret, and thus the same candidate output keys, that a sender would
//! construct from the input private keys.

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{Message, Parity, PublicKey, Scalar, Secp256k1, SecretKey};
use bitcoin::{OutPoint, ScriptBuf, Sequence, TxIn, Txid, Witness};
use silentshrew_support::{PrevoutResolver, SilentScalar, TaprootOutput};
use std::collections::HashMap;

struct MapResolver(HashMap<OutPoint, ScriptBuf>);

#[async_trait]
impl PrevoutResolver for MapResolver {
    async fn prevout_script(&self, outpoint: &OutPoint) -> anyhow::Result<ScriptBuf> {
        self.0
            .get(outpoint)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("scriptPubKey not found"))
    }
}

// independent tagged-hash composition, deliberately not the library helper
fn tagged(tag: &[u8], msg: &[u8]) -> [u8; 32] {
    let tag_hash = sha256::Hash::hash(tag);
    let mut engine = sha256::Hash::engine();
    engine.input(tag_hash.as_byte_array());
    engine.input(tag_hash.as_byte_array());
    engine.input(msg);
    sha256::Hash::from_engine(engine).to_byte_array()
}

fn key(byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
    (sk, PublicKey::from_secret_key(&secp, &sk))
}

fn p2wpkh_input(outpoint: OutPoint, sk: &SecretKey, pk: &PublicKey) -> TxIn {
    let secp = Secp256k1::new();
    let digest = sha256::Hash::hash(b"derivation test").to_byte_array();
    let mut sig = secp
        .sign_ecdsa(&Message::from_digest(digest), sk)
        .serialize_der()
        .to_vec();
    sig.push(0x01);

    TxIn {
        previous_output: outpoint,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::from_slice(&[pk.serialize().to_vec(), sig]),
    }
}

fn entry(inputs: Vec<TxIn>) -> SilentScalar {
    SilentScalar {
        txid: Txid::all_zeros(),
        taproot_outputs: vec![TaprootOutput {
            index: 0,
            spent: false,
        }],
        scalar: Vec::new(),
        inputs,
    }
}

#[tokio::test]
async fn recipient_reaches_the_sender_shared_secret() {
    let secp = Secp256k1::new();

    let (a1, p1) = key(0x31);
    let (a2, p2) = key(0x32);
    let (scan_priv, scan_pub) = key(0x41);
    let (_, spend_pub) = key(0x42);

    let op1 = OutPoint {
        txid: Txid::from_byte_array([0x11; 32]),
        vout: 3,
    };
    let op2 = OutPoint {
        txid: Txid::from_byte_array([0x22; 32]),
        vout: 0,
    };

    let mut scalar = entry(vec![
        p2wpkh_input(op1, &a1, &p1),
        p2wpkh_input(op2, &a2, &p2),
    ]);
    scalar
        .compute_scalar(&MapResolver(HashMap::new()))
        .await
        .unwrap();
    let derived = PublicKey::from_slice(&scalar.scalar).unwrap();

    // receiver side: scan_priv * S
    let receiver_secret = derived.mul_tweak(&secp, &Scalar::from(scan_priv)).unwrap();

    // sender side: input_hash * (a1 + a2) * B_scan, built from the secrets
    let a_sum = a1.add_tweak(&Scalar::from(a2)).unwrap();
    let sum_point = p1.combine(&p2).unwrap();

    // op1's txid bytes sort below op2's
    let mut msg = Vec::new();
    msg.extend_from_slice(&op1.txid.to_byte_array());
    msg.extend_from_slice(&op1.vout.to_le_bytes());
    msg.extend_from_slice(&sum_point.serialize());
    let input_hash = tagged(b"BIP0352/Inputs", &msg);

    let sender_secret = scan_pub
        .mul_tweak(&secp, &Scalar::from_be_bytes(input_hash).unwrap())
        .unwrap()
        .mul_tweak(&secp, &Scalar::from(a_sum))
        .unwrap();

    assert_eq!(receiver_secret.serialize(), sender_secret.serialize());

    // candidate output key for k = 0 matches on both sides
    let mut shared = receiver_secret.serialize().to_vec();
    shared.extend_from_slice(&0u32.to_be_bytes());
    let t0 = tagged(b"BIP0352/SharedSecret", &shared);

    let receiver_candidate = spend_pub
        .add_exp_tweak(&secp, &Scalar::from_be_bytes(t0).unwrap())
        .unwrap();
    let (xonly, _) = receiver_candidate.x_only_public_key();

    let mut sender_shared = sender_secret.serialize().to_vec();
    sender_shared.extend_from_slice(&0u32.to_be_bytes());
    let sender_t0 = tagged(b"BIP0352/SharedSecret", &sender_shared);
    let sender_candidate = spend_pub
        .add_exp_tweak(&secp, &Scalar::from_be_bytes(sender_t0).unwrap())
        .unwrap();

    assert_eq!(
        xonly.serialize(),
        sender_candidate.x_only_public_key().0.serialize()
    );
}

#[tokio::test]
async fn derivation_is_deterministic() {
    let (a1, p1) = key(0x51);
    let op = OutPoint {
        txid: Txid::from_byte_array([0x33; 32]),
        vout: 1,
    };

    let mut first = entry(vec![p2wpkh_input(op, &a1, &p1)]);
    let mut second = entry(vec![p2wpkh_input(op, &a1, &p1)]);

    let resolver = MapResolver(HashMap::new());
    first.compute_scalar(&resolver).await.unwrap();
    second.compute_scalar(&resolver).await.unwrap();

    assert!(!first.scalar.is_empty());
    assert_eq!(first.scalar, second.scalar);
}

#[tokio::test]
async fn all_non_standard_inputs_yield_a_base_point_scalar() {
    // no key is recoverable, so the scalar falls back to input_hash * G
    let op = OutPoint {
        txid: Txid::from_byte_array([0x44; 32]),
        vout: 0,
    };
    let input = TxIn {
        previous_output: op,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    };

    let mut prevouts = HashMap::new();
    prevouts.insert(op, ScriptBuf::from_bytes(vec![0x6a])); // OP_RETURN

    let mut scalar = entry(vec![input]);
    scalar.compute_scalar(&MapResolver(prevouts)).await.unwrap();

    let secp = Secp256k1::new();
    let mut msg = Vec::new();
    msg.extend_from_slice(&op.txid.to_byte_array());
    msg.extend_from_slice(&op.vout.to_le_bytes());
    let hash = tagged(b"BIP0352/Inputs", &msg);
    let expected = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&hash).unwrap());

    assert_eq!(scalar.scalar, expected.serialize().to_vec());
}

#[tokio::test]
async fn nums_reveal_input_is_dropped_from_the_sum() {
    let secp = Secp256k1::new();
    let (a1, p1) = key(0x61);
    let (_, p2) = key(0x62);
    let (xonly2, _) = p2.x_only_public_key();

    let op1 = OutPoint {
        txid: Txid::from_byte_array([0x55; 32]),
        vout: 0,
    };
    let op2 = OutPoint {
        txid: Txid::from_byte_array([0x66; 32]),
        vout: 0,
    };

    // script-path spend revealing the nothing-up-my-sleeve internal key
    let mut control_block = vec![0xc0];
    control_block.extend_from_slice(&silentshrew_support::extract::NUMS_INTERNAL_KEY);
    let nums_input = TxIn {
        previous_output: op2,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::from_slice(&[vec![0x51], control_block]),
    };

    let mut p2tr_prevout = vec![0x51, 0x20];
    p2tr_prevout.extend_from_slice(&xonly2.serialize());
    let mut prevouts = HashMap::new();
    prevouts.insert(op2, ScriptBuf::from_bytes(p2tr_prevout));

    let mut scalar = entry(vec![p2wpkh_input(op1, &a1, &p1), nums_input]);
    scalar.compute_scalar(&MapResolver(prevouts)).await.unwrap();

    // only p1 contributes, but op2's outpoint still competes for smallest
    let mut msg = Vec::new();
    msg.extend_from_slice(&op1.txid.to_byte_array());
    msg.extend_from_slice(&op1.vout.to_le_bytes());
    msg.extend_from_slice(&p1.serialize());
    let hash = tagged(b"BIP0352/Inputs", &msg);
    let expected = p1
        .mul_tweak(&secp, &Scalar::from_be_bytes(hash).unwrap())
        .unwrap();

    assert_eq!(scalar.scalar, expected.serialize().to_vec());
}

#[tokio::test]
async fn p2tr_inputs_use_the_even_lift_of_the_output_key() {
    let secp = Secp256k1::new();
    let (_, pk) = key(0x71);
    let (xonly, _) = pk.x_only_public_key();
    let lifted = PublicKey::from_x_only_public_key(xonly, Parity::Even);

    let op = OutPoint {
        txid: Txid::from_byte_array([0x77; 32]),
        vout: 2,
    };
    let input = TxIn {
        previous_output: op,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::from_slice(&[vec![0u8; 64]]),
    };

    let mut p2tr_prevout = vec![0x51, 0x20];
    p2tr_prevout.extend_from_slice(&xonly.serialize());
    let mut prevouts = HashMap::new();
    prevouts.insert(op, ScriptBuf::from_bytes(p2tr_prevout));

    let mut scalar = entry(vec![input]);
    scalar.compute_scalar(&MapResolver(prevouts)).await.unwrap();

    let mut msg = Vec::new();
    msg.extend_from_slice(&op.txid.to_byte_array());
    msg.extend_from_slice(&op.vout.to_le_bytes());
    msg.extend_from_slice(&lifted.serialize());
    let hash = tagged(b"BIP0352/Inputs", &msg);
    let expected = lifted
        .mul_tweak(&secp, &Scalar::from_be_bytes(hash).unwrap())
        .unwrap();

    assert_eq!(scalar.scalar, expected.serialize().to_vec());
}
