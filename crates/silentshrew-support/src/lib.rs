//! Domain core for the silentshrew silent-payment indexer.
//!
//! This crate implements the pure-logic half of the indexer: deciding which
//! transactions can carry a BIP-352 silent payment, recovering the signing
//! public keys from their inputs, and deriving the per-transaction
//! input-tweak scalar that wallets scan for.

pub mod eligibility;
pub mod errors;
pub mod extract;
pub mod scalar;

pub use eligibility::{is_inscription, is_silent_payment_eligible};
pub use errors::{ExtractError, ScalarError};
pub use extract::{classify, input_public_key, InputKind, PrevoutResolver};
pub use scalar::{lowest_outpoint, tagged_hash, SilentScalar, TaprootOutput};
