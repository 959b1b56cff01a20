//! Chain-source adapter over a bitcoind node's JSON-RPC interface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bitcoin::{OutPoint, ScriptBuf};
use bitcoincore_rpc::{Auth, Client, RpcApi};
use log::error;
use tokio::sync::{mpsc, oneshot};

use silentshrew_support::PrevoutResolver;
use silentshrew_sync::{BlockSubscription, ChainSource, IndexedBlock, SyncError, SyncResult};

const TIP_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Bitcoin node adapter that connects to a real Bitcoin node via RPC.
pub struct BitcoinRpcAdapter {
    rpc: Arc<Client>,
}

impl BitcoinRpcAdapter {
    pub fn new(url: &str, auth: Auth) -> Result<Self> {
        let rpc = Client::new(url, auth).map_err(|e| anyhow!("rpc client: {e}"))?;
        Ok(Self { rpc: Arc::new(rpc) })
    }
}

#[async_trait]
impl PrevoutResolver for BitcoinRpcAdapter {
    async fn prevout_script(&self, outpoint: &OutPoint) -> Result<ScriptBuf> {
        let tx = self.rpc.get_raw_transaction(&outpoint.txid, None)?;
        let output = tx
            .output
            .get(outpoint.vout as usize)
            .ok_or_else(|| anyhow!("index out of range"))?;
        Ok(output.script_pubkey.clone())
    }
}

#[async_trait]
impl ChainSource for BitcoinRpcAdapter {
    async fn get_chain_tip_height(&self) -> SyncResult<i32> {
        self.rpc
            .get_block_count()
            .map(|height| height as i32)
            .map_err(|e| SyncError::ChainSource(e.to_string()))
    }

    async fn get_block_by_height(&self, height: i32) -> SyncResult<IndexedBlock> {
        let hash = self
            .rpc
            .get_block_hash(height as u64)
            .map_err(|e| SyncError::ChainSource(e.to_string()))?;
        let block = self
            .rpc
            .get_block(&hash)
            .map_err(|e| SyncError::ChainSource(e.to_string()))?;
        Ok(IndexedBlock { height, block })
    }

    async fn get_block_filter_by_height(&self, height: i32) -> SyncResult<(String, String)> {
        let hash = self
            .rpc
            .get_block_hash(height as u64)
            .map_err(|e| SyncError::ChainSource(e.to_string()))?;
        let filter = self
            .rpc
            .get_block_filter(&hash)
            .map_err(|e| SyncError::ChainSource(e.to_string()))?;
        Ok((hex::encode(&filter.filter), hash.to_string()))
    }

    /// bitcoind has no push notifications over JSON-RPC; poll the tip and
    /// emit every newly seen height in order.
    async fn subscribe_blocks(&self) -> SyncResult<BlockSubscription> {
        let mut current_height = self.get_chain_tip_height().await?;
        let rpc = self.rpc.clone();

        let (block_tx, block_rx) = mpsc::channel(1);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TIP_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    _ = ticker.tick() => {
                        let new_height = match rpc.get_block_count() {
                            Ok(height) => height as i32,
                            Err(err) => {
                                error!("{err}");
                                continue;
                            }
                        };
                        if new_height <= current_height {
                            continue;
                        }

                        for height in (current_height + 1)..=new_height {
                            let hash = match rpc.get_block_hash(height as u64) {
                                Ok(hash) => hash,
                                Err(err) => {
                                    error!("{err}");
                                    continue;
                                }
                            };
                            let block = match rpc.get_block(&hash) {
                                Ok(block) => block,
                                Err(err) => {
                                    error!("{err}");
                                    continue;
                                }
                            };
                            if block_tx.send(IndexedBlock { height, block }).await.is_err() {
                                return;
                            }
                        }
                        current_height = new_height;
                    }
                }
            }
        });

        Ok(BlockSubscription {
            blocks: block_rx,
            cancel: cancel_tx,
        })
    }

    async fn is_utxo(&self, outpoint: &OutPoint) -> SyncResult<bool> {
        self.rpc
            .get_tx_out(&outpoint.txid, outpoint.vout, Some(false))
            .map(|result| result.is_some())
            .map_err(|e| SyncError::ChainSource(e.to_string()))
    }
}
