//! Synchronization framework for the silentshrew indexer.
//!
//! This crate defines the ports the syncer works against (a chain source and
//! a scalar repository) and the pipelined engine that follows the chain,
//! derives silent-payment scalars block by block and keeps the unspent
//! taproot bookkeeping current.

pub mod engine;
pub mod traits;


pub use engine::{ScalarSync, SyncConfig};
pub use traits::*;

/// Re-export commonly used types
pub use anyhow::{Error, Result};
pub use async_trait::async_trait;
