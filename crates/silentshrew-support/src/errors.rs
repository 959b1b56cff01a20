use thiserror::Error;

/// Failures while recovering a signing public key from a transaction input.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The input is not one of the four script kinds BIP-352 recovers keys from.
    #[error("non standard script")]
    NonStandard,
    #[error("invalid taproot witness")]
    InvalidTaprootWitness,
    /// The taproot internal key is the BIP-341 nothing-up-my-sleeve point.
    #[error("internal taproot key is unspendable")]
    UnspendableTaprootInternalKey,
    #[error("prevout script unavailable: {0}")]
    PrevoutUnavailable(String),
    #[error("secp256k1: {0}")]
    Secp(#[from] bitcoin::secp256k1::Error),
}

#[derive(Debug, Error)]
pub enum ScalarError {
    #[error("no taproot outputs")]
    NoTaprootOutputs,
    #[error("unable to compute scalar")]
    UnableToComputeScalar,
}
