//! Input classification and public-key recovery.
//!
//! BIP-352 defines key recovery for exactly four input script kinds:
//! P2SH-wrapped P2WPKH, native P2WPKH, P2TR and compressed-key P2PKH.
//! Everything else (bare P2PK, uncompressed P2PKH keys, multisig, ...) is
//! `NonStandard` and contributes nothing to the scalar.

use async_trait::async_trait;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::{ecdsa, Parity, PublicKey, XOnlyPublicKey};
use bitcoin::{OutPoint, Script, ScriptBuf, TxIn};
use hex_lit::hex;

use crate::errors::ExtractError;

/// BIP-341 nothing-up-my-sleeve x-only key. A control block carrying it as
/// the internal key proves the output has no key-path spend.
pub const NUMS_INTERNAL_KEY: [u8; 32] =
    hex!("50929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0");

const TAPROOT_ANNEX_PREFIX: u8 = 0x50;

/// Resolves the `scriptPubKey` of a previous output, typically against a
/// bitcoind node. The scalar deriver only calls this for inputs that are not
/// recognizable from their own signature data.
#[async_trait]
pub trait PrevoutResolver: Send + Sync {
    async fn prevout_script(&self, outpoint: &OutPoint) -> anyhow::Result<ScriptBuf>;
}

/// Script kind of a transaction input, as far as silent payments care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    P2shP2wpkh,
    P2wpkh,
    P2tr,
    P2pkh,
    Other,
}

/// Classifies an input. The first two kinds are decided from the input's own
/// signature data; `P2tr` and `P2pkh` need the prevout script, so they
/// resolve to `Other` when it is not supplied.
pub fn classify(input: &TxIn, prevout_script: Option<&Script>) -> InputKind {
    let script_sig = input.script_sig.as_bytes();
    if !script_sig.is_empty() && Script::from_bytes(&script_sig[1..]).is_p2wpkh() {
        return InputKind::P2shP2wpkh;
    }

    if input.witness.len() == 2 {
        if let Some(sig) = input.witness.nth(1) {
            if parse_ecdsa_signature(sig).is_some() {
                return InputKind::P2wpkh;
            }
        }
    }

    match prevout_script {
        Some(script) if script.is_p2tr() => InputKind::P2tr,
        Some(script) if script.is_p2pkh() => InputKind::P2pkh,
        _ => InputKind::Other,
    }
}

/// Recovers the signing public key of `input` per BIP-352, resolving the
/// prevout script only when the witness alone is not conclusive.
pub async fn input_public_key<R>(input: &TxIn, resolver: &R) -> Result<PublicKey, ExtractError>
where
    R: PrevoutResolver + ?Sized,
{
    match classify(input, None) {
        InputKind::P2shP2wpkh => return p2sh_p2wpkh_key(input),
        InputKind::P2wpkh => return p2wpkh_key(input),
        _ => {}
    }

    let prevout = resolver
        .prevout_script(&input.previous_output)
        .await
        .map_err(|e| ExtractError::PrevoutUnavailable(e.to_string()))?;

    match classify(input, Some(&prevout)) {
        InputKind::P2tr => p2tr_key(input, &prevout),
        InputKind::P2pkh => p2pkh_key(input, &prevout),
        _ => Err(ExtractError::NonStandard),
    }
}

fn p2sh_p2wpkh_key(input: &TxIn) -> Result<PublicKey, ExtractError> {
    let key = match input.witness.last() {
        Some(key) if key.len() == 33 => key,
        _ => return Err(ExtractError::NonStandard),
    };
    Ok(PublicKey::from_slice(key)?)
}

fn p2wpkh_key(input: &TxIn) -> Result<PublicKey, ExtractError> {
    let key = match input.witness.nth(0) {
        Some(key) if key.len() == 33 => key,
        _ => return Err(ExtractError::NonStandard),
    };
    Ok(PublicKey::from_slice(key)?)
}

fn p2tr_key(input: &TxIn, prevout: &Script) -> Result<PublicKey, ExtractError> {
    let mut witness: Vec<&[u8]> = input.witness.iter().collect();
    if witness.is_empty() {
        return Err(ExtractError::InvalidTaprootWitness);
    }

    if witness.len() > 1 {
        let last = witness[witness.len() - 1];
        if !last.is_empty() && last[0] == TAPROOT_ANNEX_PREFIX {
            witness.pop();
        }
    }

    // more than one element after annex stripping = script-path spend
    if witness.len() > 1 {
        let control_block = witness[witness.len() - 1];
        if control_block.len() < 33 {
            return Err(ExtractError::InvalidTaprootWitness);
        }
        if control_block[1..33] == NUMS_INTERNAL_KEY {
            return Err(ExtractError::UnspendableTaprootInternalKey);
        }
    }

    let output_key = XOnlyPublicKey::from_slice(&prevout.as_bytes()[2..34])?;
    Ok(PublicKey::from_x_only_public_key(output_key, Parity::Even))
}

fn p2pkh_key(input: &TxIn, prevout: &Script) -> Result<PublicKey, ExtractError> {
    let pubkey_hash = &prevout.as_bytes()[3..23];
    let script_sig = input.script_sig.as_bytes();

    // the key is pushed last, so scan 33-byte windows from the end
    for end in (33..=script_sig.len()).rev() {
        let window = &script_sig[end - 33..end];
        if hash160::Hash::hash(window).as_byte_array() == pubkey_hash {
            return Ok(PublicKey::from_slice(window)?);
        }
    }

    Err(ExtractError::NonStandard)
}

/// Witness signatures carry a trailing sighash-type byte; accept DER with or
/// without it.
fn parse_ecdsa_signature(bytes: &[u8]) -> Option<ecdsa::Signature> {
    if let Ok(sig) = ecdsa::Signature::from_der(bytes) {
        return Some(sig);
    }
    bytes
        .split_last()
        .and_then(|(_, der)| ecdsa::Signature::from_der(der).ok())
}
