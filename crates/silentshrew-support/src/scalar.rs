//! BIP-352 per-transaction scalar derivation.
//!
//! The scalar of a transaction is `input_hash * A` where `A` is the sum of
//! the recoverable input public keys and `input_hash` is the tagged hash of
//! the smallest input outpoint (plus `A` when present). Wallets combine the
//! scalar with their scan key over ECDH to enumerate candidate outputs
//! without touching the chain themselves.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use bitcoin::{OutPoint, Transaction, Txid, TxIn};
use log::warn;

use crate::errors::{ExtractError, ScalarError};
use crate::extract::{input_public_key, PrevoutResolver};

const INPUT_HASH_TAG: &str = "BIP0352/Inputs";

/// `SHA256(SHA256(tag) || SHA256(tag) || msg)` per BIP-340.
pub fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = sha256::Hash::hash(tag.as_bytes());
    let mut engine = sha256::Hash::engine();
    engine.input(tag_hash.as_byte_array());
    engine.input(tag_hash.as_byte_array());
    engine.input(msg);
    sha256::Hash::from_engine(engine).to_byte_array()
}

/// One taproot output of an indexed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaprootOutput {
    pub index: u32,
    pub spent: bool,
}

/// Per-transaction silent-payment entry.
///
/// `inputs` is only carried until the scalar is computed; the repositories
/// never persist it. A stored entry always has a non-empty `scalar` and at
/// least one unspent taproot output.
#[derive(Debug, Clone)]
pub struct SilentScalar {
    pub txid: Txid,
    pub taproot_outputs: Vec<TaprootOutput>,
    /// 33-byte compressed secp256k1 point once computed, empty before.
    pub scalar: Vec<u8>,
    pub inputs: Vec<TxIn>,
}

impl SilentScalar {
    /// Builds the entry skeleton for a transaction, collecting its taproot
    /// outputs. Fails when the transaction has none.
    pub fn from_tx(tx: &Transaction) -> Result<Self, ScalarError> {
        let taproot_outputs: Vec<TaprootOutput> = tx
            .output
            .iter()
            .enumerate()
            .filter(|(_, out)| out.script_pubkey.is_p2tr())
            .map(|(index, _)| TaprootOutput {
                index: index as u32,
                spent: false,
            })
            .collect();

        if taproot_outputs.is_empty() {
            return Err(ScalarError::NoTaprootOutputs);
        }

        Ok(Self {
            txid: tx.compute_txid(),
            taproot_outputs,
            scalar: Vec::new(),
            inputs: tx.input.clone(),
        })
    }

    pub fn mark_output_spent(&mut self, index: u32) {
        for out in &mut self.taproot_outputs {
            if out.index == index {
                out.spent = true;
                return;
            }
        }
    }

    pub fn has_unspent_taproot(&self) -> bool {
        self.taproot_outputs.iter().any(|out| !out.spent)
    }

    /// Derives the scalar from the retained inputs. Idempotent; leaves
    /// `scalar` empty when the derivation lands on a zero scalar or the
    /// point at infinity, in which case the transaction carries no scalar.
    pub async fn compute_scalar<R>(&mut self, resolver: &R) -> Result<(), ScalarError>
    where
        R: PrevoutResolver + ?Sized,
    {
        if !self.scalar.is_empty() {
            return Ok(());
        }
        if self.inputs.is_empty() {
            return Err(ScalarError::UnableToComputeScalar);
        }

        self.scalar = derive_scalar(&self.inputs, resolver)
            .await
            .unwrap_or_default();
        Ok(())
    }
}

/// Smallest outpoint of the input set under
/// `(txid wire bytes ascending, vout ascending)`.
pub fn lowest_outpoint(inputs: &[TxIn]) -> Option<OutPoint> {
    inputs
        .iter()
        .map(|input| input.previous_output)
        .min_by(|a, b| {
            a.txid
                .to_byte_array()
                .cmp(&b.txid.to_byte_array())
                .then(a.vout.cmp(&b.vout))
        })
}

async fn derive_scalar<R>(inputs: &[TxIn], resolver: &R) -> Option<Vec<u8>>
where
    R: PrevoutResolver + ?Sized,
{
    let keys = input_public_keys(inputs, resolver).await;

    let sum = if keys.is_empty() {
        None
    } else {
        let refs: Vec<&PublicKey> = keys.iter().collect();
        match PublicKey::combine_keys(&refs) {
            Ok(sum) => Some(sum),
            Err(_) => {
                warn!("input public keys sum to the point at infinity, skipping");
                return None;
            }
        }
    };

    let hash = input_hash(inputs, sum.as_ref())?;

    let secp = Secp256k1::new();
    let point = match sum {
        // no recoverable key: scalar = input_hash * G
        None => SecretKey::from_slice(&hash)
            .ok()
            .map(|sk| PublicKey::from_secret_key(&secp, &sk)),
        Some(sum) => Scalar::from_be_bytes(hash)
            .ok()
            .and_then(|tweak| sum.mul_tweak(&secp, &tweak).ok()),
    };

    point.map(|point| point.serialize().to_vec())
}

fn input_hash(inputs: &[TxIn], sum: Option<&PublicKey>) -> Option<[u8; 32]> {
    let outpoint = lowest_outpoint(inputs)?;

    let mut msg = Vec::with_capacity(36 + 33);
    msg.extend_from_slice(&outpoint.txid.to_byte_array());
    msg.extend_from_slice(&outpoint.vout.to_le_bytes());
    if let Some(sum) = sum {
        msg.extend_from_slice(&sum.serialize());
    }

    Some(tagged_hash(INPUT_HASH_TAG, &msg))
}

async fn input_public_keys<R>(inputs: &[TxIn], resolver: &R) -> Vec<PublicKey>
where
    R: PrevoutResolver + ?Sized,
{
    let mut keys = Vec::new();
    for input in inputs {
        match input_public_key(input, resolver).await {
            Ok(key) => keys.push(key),
            Err(ExtractError::NonStandard) | Err(ExtractError::UnspendableTaprootInternalKey) => {}
            Err(err) => warn!("error extracting public key from input: {err}"),
        }
    }
    keys
}
