//! The pipelined block syncer.
//!
//! Four tasks cooperate over two bounded channels: a catch-up producer and a
//! tip follower feed blocks into the compute lane; the compute worker writes
//! a block's scalars before handing the same block to the update lane, so an
//! output is always committed before any later block can spend it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use silentshrew_support::{is_silent_payment_eligible, SilentScalar};

use crate::traits::{
    BlockSubscription, ChainSource, IndexedBlock, ScalarRepository, SpentOutcome, SyncEngine,
    SyncResult, SyncStatus,
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Minimum height to begin from.
    pub start_height: i32,
    /// Heights below taproot activation can never carry a silent payment.
    pub taproot_activation_height: i32,
    /// Capacity of both lane channels.
    pub pipeline_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            start_height: 0,
            taproot_activation_height: 0,
            pipeline_size: 16,
        }
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Silent-payment scalar sync engine.
pub struct ScalarSync {
    chain: Arc<dyn ChainSource>,
    repo: Arc<dyn ScalarRepository>,
    config: SyncConfig,
    start_height: i32,
    running: Option<Running>,
}

impl ScalarSync {
    /// Clamps the configured start height against the watermark and the
    /// taproot activation height.
    pub async fn new(
        chain: Arc<dyn ChainSource>,
        repo: Arc<dyn ScalarRepository>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let mut start_height = config.start_height;

        let latest = repo.latest_height().await?;
        if latest > start_height {
            start_height = latest;
        }

        if config.taproot_activation_height > 0 && start_height < config.taproot_activation_height
        {
            start_height = config.taproot_activation_height;
        }

        info!("start block: {start_height}");

        Ok(Self {
            chain,
            repo,
            config,
            start_height,
            running: None,
        })
    }

    /// Effective start height after clamping.
    pub fn start_height(&self) -> i32 {
        self.start_height
    }
}

#[async_trait]
impl SyncEngine for ScalarSync {
    async fn start(&mut self) -> SyncResult<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let (stop_tx, _) = watch::channel(false);
        let (compute_tx, compute_rx) = mpsc::channel(self.config.pipeline_size);
        let (update_tx, update_rx) = mpsc::channel(self.config.pipeline_size);

        let handles = vec![
            tokio::spawn(compute_worker(
                self.chain.clone(),
                self.repo.clone(),
                compute_rx,
                update_tx,
                stop_tx.subscribe(),
            )),
            tokio::spawn(update_worker(
                self.repo.clone(),
                update_rx,
                stop_tx.subscribe(),
            )),
            tokio::spawn(catch_up(
                self.chain.clone(),
                self.repo.clone(),
                self.start_height,
                compute_tx.clone(),
                stop_tx.subscribe(),
            )),
            tokio::spawn(follow_tip(
                self.chain.clone(),
                compute_tx,
                stop_tx.subscribe(),
            )),
        ];

        self.running = Some(Running {
            stop: stop_tx,
            handles,
        });
        Ok(())
    }

    async fn stop(&mut self) -> SyncResult<()> {
        if let Some(running) = self.running.take() {
            let _ = running.stop.send(true);
            for handle in running.handles {
                let _ = handle.await;
            }
            info!("syncer stopped");
        }
        Ok(())
    }

    async fn status(&self) -> SyncResult<SyncStatus> {
        Ok(SyncStatus {
            indexed_height: self.repo.latest_height().await?,
            tip_height: self.chain.get_chain_tip_height().await?,
            is_running: self.running.is_some(),
        })
    }
}

/// Feeds every missing block between the watermark and the chain tip into
/// the compute lane. Fetch failures skip the height.
async fn catch_up(
    chain: Arc<dyn ChainSource>,
    repo: Arc<dyn ScalarRepository>,
    start_height: i32,
    compute_tx: mpsc::Sender<IndexedBlock>,
    mut stop: watch::Receiver<bool>,
) {
    let tip_height = match chain.get_chain_tip_height().await {
        Ok(height) => height,
        Err(err) => {
            error!("{err}");
            return;
        }
    };

    let mut latest_height = match repo.latest_height().await {
        Ok(height) => height,
        Err(err) => {
            error!("{err}");
            return;
        }
    };
    if latest_height < start_height {
        latest_height = start_height;
    }

    if latest_height >= tip_height {
        return;
    }

    info!("latest block height: {latest_height}, tip height: {tip_height}");
    info!("syncing {} blocks", tip_height - latest_height);

    for height in (latest_height + 1)..=tip_height {
        let block = match chain.get_block_by_height(height).await {
            Ok(block) => block,
            Err(err) => {
                error!("{err}");
                continue;
            }
        };

        tokio::select! {
            _ = stop.changed() => {
                info!("stop sync blocks");
                return;
            }
            sent = compute_tx.send(block) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Forwards live-tip notifications into the compute lane.
async fn follow_tip(
    chain: Arc<dyn ChainSource>,
    compute_tx: mpsc::Sender<IndexedBlock>,
    mut stop: watch::Receiver<bool>,
) {
    let BlockSubscription { mut blocks, cancel } = match chain.subscribe_blocks().await {
        Ok(subscription) => subscription,
        Err(err) => {
            error!("{err}");
            return;
        }
    };
    let mut cancel = Some(cancel);

    loop {
        tokio::select! {
            _ = stop.changed() => {
                info!("stop block watcher");
                if let Some(cancel) = cancel.take() {
                    let _ = cancel.send(());
                }
                return;
            }
            block = blocks.recv() => {
                let block = match block {
                    Some(block) => block,
                    None => return,
                };
                info!("new block {}", block.height);
                tokio::select! {
                    _ = stop.changed() => return,
                    sent = compute_tx.send(block) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn compute_worker(
    chain: Arc<dyn ChainSource>,
    repo: Arc<dyn ScalarRepository>,
    mut compute_rx: mpsc::Receiver<IndexedBlock>,
    update_tx: mpsc::Sender<IndexedBlock>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                info!("stop compute block scalars");
                return;
            }
            block = compute_rx.recv() => {
                let block = match block {
                    Some(block) => block,
                    None => return,
                };
                compute_block_scalars(chain.as_ref(), repo.as_ref(), &block).await;

                // hand off without blocking on the update lane draining
                let update_tx = update_tx.clone();
                tokio::spawn(async move {
                    let _ = update_tx.send(block).await;
                });
            }
        }
    }
}

async fn compute_block_scalars(
    chain: &dyn ChainSource,
    repo: &dyn ScalarRepository,
    block: &IndexedBlock,
) {
    let started = Instant::now();
    let mut scalars = Vec::new();

    for tx in &block.block.txdata {
        if !is_silent_payment_eligible(tx) {
            continue;
        }

        let mut scalar = match SilentScalar::from_tx(tx) {
            Ok(scalar) => scalar,
            Err(err) => {
                error!("{err}");
                continue;
            }
        };

        if !scalar.has_unspent_taproot() {
            continue;
        }

        if let Err(err) = scalar.compute_scalar(chain).await {
            error!("{err}");
            continue;
        }

        if !scalar.scalar.is_empty() {
            scalars.push(scalar);
        }
    }

    match repo.write(&scalars, block.height).await {
        Ok(()) => info!(
            "[{}] computed {} scalars ({:?})",
            block.height,
            scalars.len(),
            started.elapsed()
        ),
        Err(err) => error!("[{}] write failed: {err}", block.height),
    }
}

async fn update_worker(
    repo: Arc<dyn ScalarRepository>,
    mut update_rx: mpsc::Receiver<IndexedBlock>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                info!("stop update unspents");
                return;
            }
            block = update_rx.recv() => {
                let block = match block {
                    Some(block) => block,
                    None => return,
                };
                update_unspents(repo.as_ref(), &block).await;
            }
        }
    }
}

/// Marks every output spent by this block's inputs. Misses are expected:
/// most inputs do not spend an indexed taproot output.
async fn update_unspents(repo: &dyn ScalarRepository, block: &IndexedBlock) {
    let mut updated = 0u32;
    let mut deleted = 0u32;

    for tx in &block.block.txdata {
        for input in &tx.input {
            let outpoint = input.previous_output;
            match repo.mark_spent(&outpoint.txid, outpoint.vout).await {
                Ok(SpentOutcome::Updated) => updated += 1,
                Ok(SpentOutcome::Deleted) => deleted += 1,
                Err(err) if err.is_not_found() => {}
                Err(err) => error!("{err}"),
            }
        }
    }

    info!(
        "[{}] update done ({updated} updated, {deleted} deleted)",
        block.height
    );
}
