//! Generic traits for the scalar synchronization system

use async_trait::async_trait;
use bitcoin::{Block, OutPoint, Txid};
use silentshrew_support::{PrevoutResolver, SilentScalar};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("chain source error: {0}")]
    ChainSource(String),
    #[error("storage error: {0}")]
    Storage(String),
    /// Repository lookup miss. Expected and ignored in the update lane,
    /// surfaced to callers of the read API.
    #[error("scalar not found ({0})")]
    ScalarNotFound(&'static str),
}

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::ScalarNotFound(_))
    }
}

/// A block paired with the height it was fetched at.
#[derive(Debug, Clone)]
pub struct IndexedBlock {
    pub height: i32,
    pub block: Block,
}

/// Live-tip notification stream plus the handle that stops the notifier.
pub struct BlockSubscription {
    pub blocks: mpsc::Receiver<IndexedBlock>,
    pub cancel: oneshot::Sender<()>,
}

/// Read access to chain data, typically a bitcoind node.
///
/// The `PrevoutResolver` supertrait supplies `prevout_script`, which the
/// scalar deriver consumes directly.
#[async_trait]
pub trait ChainSource: PrevoutResolver {
    async fn get_chain_tip_height(&self) -> SyncResult<i32>;

    async fn get_block_by_height(&self, height: i32) -> SyncResult<IndexedBlock>;

    /// BIP-157 basic filter for the block at `height`, as
    /// `(filter_hex, blockhash_hex)`.
    async fn get_block_filter_by_height(&self, height: i32) -> SyncResult<(String, String)>;

    /// New-tip notifications. Implementations may poll.
    async fn subscribe_blocks(&self) -> SyncResult<BlockSubscription>;

    async fn is_utxo(&self, outpoint: &OutPoint) -> SyncResult<bool>;
}

/// What `mark_spent` did to the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpentOutcome {
    Updated,
    /// The last unspent taproot output was spent; the entry is gone.
    Deleted,
}

/// Height-keyed durable store of per-transaction scalars.
///
/// Implementations must keep every persisted entry with a non-empty scalar
/// and at least one unspent taproot output, keep spent flags monotone, and
/// never let the watermark regress.
#[async_trait]
pub trait ScalarRepository: Send + Sync {
    /// Highest height for which `write` has completed; 0 if never written.
    async fn latest_height(&self) -> SyncResult<i32>;

    /// Atomically replaces the entries stored for `height` and advances the
    /// watermark when `height` exceeds it. `scalars` may be empty.
    async fn write(&self, scalars: &[SilentScalar], height: i32) -> SyncResult<()>;

    async fn get_by_height(&self, height: i32) -> SyncResult<Vec<SilentScalar>>;

    async fn get_by_txid(&self, txid: &Txid) -> SyncResult<SilentScalar>;

    /// Flips the spent flag of one taproot output, deleting the entry when
    /// nothing unspent remains.
    async fn mark_spent(&self, txid: &Txid, index: u32) -> SyncResult<SpentOutcome>;
}

/// Synchronization status information
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub indexed_height: i32,
    pub tip_height: i32,
    pub is_running: bool,
}

/// Generic trait for blockchain synchronization
#[async_trait]
pub trait SyncEngine {
    /// Start synchronization
    async fn start(&mut self) -> SyncResult<()>;

    /// Stop synchronization; returns once all workers have exited
    async fn stop(&mut self) -> SyncResult<()>;

    /// Get current synchronization status
    async fn status(&self) -> SyncResult<SyncStatus>;
}
