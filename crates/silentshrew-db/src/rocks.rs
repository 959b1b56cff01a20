//! Embedded RocksDB repository.
//!
//! Layout: one Borsh-encoded record per block height holding that block's
//! entries, a `by-txid -> height` secondary index, and a watermark key. All
//! mutations go through a single `WriteBatch` so a block's entries and the
//! watermark bump land together or not at all.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::Txid;
use borsh::{BorshDeserialize, BorshSerialize};
use rocksdb::{Options, WriteBatch, DB};

use silentshrew_support::{SilentScalar, TaprootOutput};
use silentshrew_sync::{ScalarRepository, SpentOutcome, SyncError, SyncResult};

const WATERMARK_KEY: &[u8] = b"__INTERNAL/height";

fn height_key(height: i32) -> Vec<u8> {
    format!("/scalars/by-height/{height}").into_bytes()
}

fn txid_key(txid: &Txid) -> Vec<u8> {
    format!("/scalars/by-txid/{txid}").into_bytes()
}

#[derive(BorshSerialize, BorshDeserialize)]
struct TaprootOutputRecord {
    index: u32,
    spent: bool,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct ScalarRecord {
    txid: [u8; 32],
    scalar: Vec<u8>,
    taproot_outputs: Vec<TaprootOutputRecord>,
}

#[derive(BorshSerialize, BorshDeserialize, Default)]
struct BlockScalarsRecord {
    entries: Vec<ScalarRecord>,
}

impl ScalarRecord {
    fn from_scalar(scalar: &SilentScalar) -> Self {
        Self {
            txid: scalar.txid.to_byte_array(),
            scalar: scalar.scalar.clone(),
            taproot_outputs: scalar
                .taproot_outputs
                .iter()
                .map(|out| TaprootOutputRecord {
                    index: out.index,
                    spent: out.spent,
                })
                .collect(),
        }
    }

    fn into_scalar(self) -> SilentScalar {
        SilentScalar {
            txid: Txid::from_byte_array(self.txid),
            scalar: self.scalar,
            taproot_outputs: self
                .taproot_outputs
                .into_iter()
                .map(|out| TaprootOutput {
                    index: out.index,
                    spent: out.spent,
                })
                .collect(),
            inputs: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct RocksScalarRepository {
    db: Arc<DB>,
}

impl RocksScalarRepository {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let opts = configure_options();
        let db = DB::open(&opts, path).map_err(|e| anyhow!("failed to open database: {e}"))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn read_block_record(&self, height: i32) -> SyncResult<Option<BlockScalarsRecord>> {
        match self.db.get(height_key(height)) {
            Ok(Some(bytes)) => BlockScalarsRecord::try_from_slice(&bytes)
                .map(Some)
                .map_err(|e| SyncError::Storage(format!("corrupt block record: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(SyncError::Storage(format!("database error: {e}"))),
        }
    }

    fn read_height_of(&self, txid: &Txid) -> SyncResult<Option<i32>> {
        match self.db.get(txid_key(txid)) {
            Ok(Some(bytes)) if bytes.len() >= 4 => Ok(Some(i32::from_le_bytes(
                bytes[..4]
                    .try_into()
                    .map_err(|_| SyncError::Storage("invalid height data".to_string()))?,
            ))),
            Ok(Some(_)) => Err(SyncError::Storage("invalid height data".to_string())),
            Ok(None) => Ok(None),
            Err(e) => Err(SyncError::Storage(format!("database error: {e}"))),
        }
    }
}

#[async_trait]
impl ScalarRepository for RocksScalarRepository {
    async fn latest_height(&self) -> SyncResult<i32> {
        match self.db.get(WATERMARK_KEY) {
            Ok(Some(bytes)) if bytes.len() >= 4 => Ok(i32::from_le_bytes(
                bytes[..4]
                    .try_into()
                    .map_err(|_| SyncError::Storage("invalid height data".to_string()))?,
            )),
            Ok(_) => Ok(0),
            Err(e) => Err(SyncError::Storage(format!("database error: {e}"))),
        }
    }

    async fn write(&self, scalars: &[SilentScalar], height: i32) -> SyncResult<()> {
        let mut batch = WriteBatch::default();

        // overwriting a height must drop the stale txid index entries
        if let Some(existing) = self.read_block_record(height)? {
            for entry in &existing.entries {
                batch.delete(txid_key(&Txid::from_byte_array(entry.txid)));
            }
        }

        let record = BlockScalarsRecord {
            entries: scalars.iter().map(ScalarRecord::from_scalar).collect(),
        };
        let bytes = borsh::to_vec(&record)
            .map_err(|e| SyncError::Storage(format!("encode block record: {e}")))?;
        batch.put(height_key(height), bytes);

        for scalar in scalars {
            batch.put(txid_key(&scalar.txid), height.to_le_bytes());
        }

        if height > self.latest_height().await? {
            batch.put(WATERMARK_KEY, height.to_le_bytes());
        }

        self.db
            .write(batch)
            .map_err(|e| SyncError::Storage(format!("database error: {e}")))
    }

    async fn get_by_height(&self, height: i32) -> SyncResult<Vec<SilentScalar>> {
        Ok(self
            .read_block_record(height)?
            .map(|record| {
                record
                    .entries
                    .into_iter()
                    .map(ScalarRecord::into_scalar)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_by_txid(&self, txid: &Txid) -> SyncResult<SilentScalar> {
        let height = self
            .read_height_of(txid)?
            .ok_or(SyncError::ScalarNotFound("get_by_txid"))?;
        let record = self
            .read_block_record(height)?
            .ok_or(SyncError::ScalarNotFound("get_by_txid"))?;

        let txid_bytes = txid.to_byte_array();
        record
            .entries
            .into_iter()
            .find(|entry| entry.txid == txid_bytes)
            .map(ScalarRecord::into_scalar)
            .ok_or(SyncError::ScalarNotFound("get_by_txid"))
    }

    async fn mark_spent(&self, txid: &Txid, index: u32) -> SyncResult<SpentOutcome> {
        let height = self
            .read_height_of(txid)?
            .ok_or(SyncError::ScalarNotFound("mark_spent"))?;
        let mut record = self
            .read_block_record(height)?
            .ok_or(SyncError::ScalarNotFound("mark_spent"))?;

        let txid_bytes = txid.to_byte_array();
        let position = record
            .entries
            .iter()
            .position(|entry| entry.txid == txid_bytes)
            .ok_or(SyncError::ScalarNotFound("mark_spent"))?;

        let entry = &mut record.entries[position];
        let mut at_least_one_unspent = false;
        for out in &mut entry.taproot_outputs {
            if out.index == index {
                out.spent = true;
                continue;
            }
            if !out.spent {
                at_least_one_unspent = true;
            }
        }

        let mut batch = WriteBatch::default();
        let outcome = if at_least_one_unspent {
            SpentOutcome::Updated
        } else {
            record.entries.remove(position);
            batch.delete(txid_key(txid));
            SpentOutcome::Deleted
        };

        let bytes = borsh::to_vec(&record)
            .map_err(|e| SyncError::Storage(format!("encode block record: {e}")))?;
        batch.put(height_key(height), bytes);

        self.db
            .write(batch)
            .map_err(|e| SyncError::Storage(format!("database error: {e}")))?;
        Ok(outcome)
    }
}

fn configure_options() -> Options {
    let available_cpus = num_cpus::get();
    let background_jobs = std::cmp::min(std::cmp::max(4, available_cpus / 4), 16) as i32;

    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.optimize_for_point_lookup(1024);
    opts.set_max_background_jobs(background_jobs);
    opts.set_bytes_per_sync(8388608);
    opts
}
