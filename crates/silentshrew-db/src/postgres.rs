//! Postgres repository.
//!
//! Relational layout: `scalars(tx_hash, scalar, block_height)` with a
//! `taproot_outputs` row per *unspent* taproot output, so an entry is fully
//! spent precisely when it has no output rows left. A `sync_state` row
//! carries the watermark, which lets an empty-block `write` still advance it.

use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::Txid;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use silentshrew_support::{SilentScalar, TaprootOutput};
use silentshrew_sync::{ScalarRepository, SpentOutcome, SyncError, SyncResult};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS scalars (
        tx_hash TEXT PRIMARY KEY,
        scalar TEXT NOT NULL,
        block_height INT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS scalars_block_height_idx ON scalars (block_height)",
    "CREATE TABLE IF NOT EXISTS taproot_outputs (
        id BIGSERIAL PRIMARY KEY,
        tx_hash TEXT NOT NULL REFERENCES scalars (tx_hash) ON DELETE CASCADE,
        output_index BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS taproot_outputs_tx_hash_idx ON taproot_outputs (tx_hash)",
    "CREATE TABLE IF NOT EXISTS sync_state (
        id INT PRIMARY KEY,
        max_height INT NOT NULL
    )",
    "INSERT INTO sync_state (id, max_height) VALUES (1, 0) ON CONFLICT (id) DO NOTHING",
];

pub struct PgScalarRepository {
    pool: PgPool,
}

impl PgScalarRepository {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(8).connect(dsn).await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    async fn outputs_of(&self, tx_hash: &str) -> SyncResult<Vec<TaprootOutput>> {
        let rows = sqlx::query("SELECT output_index FROM taproot_outputs WHERE tx_hash = $1")
            .bind(tx_hash)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(rows
            .iter()
            .map(|row| TaprootOutput {
                index: row.get::<i64, _>("output_index") as u32,
                spent: false,
            })
            .collect())
    }
}

fn storage_error(err: sqlx::Error) -> SyncError {
    SyncError::Storage(err.to_string())
}

fn scalar_from_row(tx_hash: &str, scalar_hex: &str, outputs: Vec<TaprootOutput>) -> SyncResult<SilentScalar> {
    let txid = Txid::from_str(tx_hash)
        .map_err(|e| SyncError::Storage(format!("corrupt tx hash: {e}")))?;
    let scalar = hex::decode(scalar_hex)
        .map_err(|e| SyncError::Storage(format!("corrupt scalar: {e}")))?;
    Ok(SilentScalar {
        txid,
        scalar,
        taproot_outputs: outputs,
        inputs: Vec::new(),
    })
}

#[async_trait]
impl ScalarRepository for PgScalarRepository {
    async fn latest_height(&self) -> SyncResult<i32> {
        let row = sqlx::query("SELECT max_height FROM sync_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(row.map(|row| row.get::<i32, _>("max_height")).unwrap_or(0))
    }

    async fn write(&self, scalars: &[SilentScalar], height: i32) -> SyncResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        sqlx::query("DELETE FROM scalars WHERE block_height = $1")
            .bind(height)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

        for scalar in scalars {
            sqlx::query("INSERT INTO scalars (tx_hash, scalar, block_height) VALUES ($1, $2, $3)")
                .bind(scalar.txid.to_string())
                .bind(hex::encode(&scalar.scalar))
                .bind(height)
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;

            for out in scalar.taproot_outputs.iter().filter(|out| !out.spent) {
                sqlx::query(
                    "INSERT INTO taproot_outputs (tx_hash, output_index) VALUES ($1, $2)",
                )
                .bind(scalar.txid.to_string())
                .bind(out.index as i64)
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;
            }
        }

        sqlx::query("UPDATE sync_state SET max_height = $1 WHERE id = 1 AND max_height < $1")
            .bind(height)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)
    }

    async fn get_by_height(&self, height: i32) -> SyncResult<Vec<SilentScalar>> {
        let rows = sqlx::query("SELECT tx_hash, scalar FROM scalars WHERE block_height = $1")
            .bind(height)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        let mut scalars = Vec::with_capacity(rows.len());
        for row in rows {
            let tx_hash: String = row.get("tx_hash");
            let outputs = self.outputs_of(&tx_hash).await?;
            scalars.push(scalar_from_row(
                &tx_hash,
                row.get::<String, _>("scalar").as_str(),
                outputs,
            )?);
        }
        Ok(scalars)
    }

    async fn get_by_txid(&self, txid: &Txid) -> SyncResult<SilentScalar> {
        let tx_hash = txid.to_string();
        let row = sqlx::query("SELECT scalar FROM scalars WHERE tx_hash = $1")
            .bind(&tx_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?
            .ok_or(SyncError::ScalarNotFound("get_by_txid"))?;

        let outputs = self.outputs_of(&tx_hash).await?;
        scalar_from_row(&tx_hash, row.get::<String, _>("scalar").as_str(), outputs)
    }

    async fn mark_spent(&self, txid: &Txid, index: u32) -> SyncResult<SpentOutcome> {
        let tx_hash = txid.to_string();
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let removed =
            sqlx::query("DELETE FROM taproot_outputs WHERE tx_hash = $1 AND output_index = $2")
                .bind(&tx_hash)
                .bind(index as i64)
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?
                .rows_affected();

        if removed == 0 {
            let exists = sqlx::query("SELECT 1 FROM scalars WHERE tx_hash = $1")
                .bind(&tx_hash)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage_error)?;
            return match exists {
                Some(_) => Ok(SpentOutcome::Updated),
                None => Err(SyncError::ScalarNotFound("mark_spent")),
            };
        }

        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM taproot_outputs WHERE tx_hash = $1")
                .bind(&tx_hash)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage_error)?;

        let outcome = if remaining == 0 {
            sqlx::query("DELETE FROM scalars WHERE tx_hash = $1")
                .bind(&tx_hash)
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;
            SpentOutcome::Deleted
        } else {
            SpentOutcome::Updated
        };

        tx.commit().await.map_err(storage_error)?;
        Ok(outcome)
    }
}
