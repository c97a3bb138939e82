//! Treasury tracker: maps coinbase-payment transactions to their containing
//! block and turns maturity reports into coinbase events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use kaspa_addresses::{Address, Prefix};
use kaspa_rpc_core::{RpcBlock, RpcHash};
use kaspa_txscript::extract_script_pub_key_address;
use storage_kas::PoolPersistence;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::PoolResult;
use crate::metrics::unix_now;
use crate::task_manager::TaskManager;
use crate::treasury::utxo::UtxoBridge;
use crate::treasury::{CoinbaseEvent, MaturityEvent};
use crate::upstream::NodeClient;
use crate::utils::ShutdownMessage;

/// Block queue bound; the block-added handler drops the oldest entries on
/// overflow rather than stalling the notification pump.
const BLOCK_QUEUE_CAP: usize = 1000;
const BLOCK_QUEUE_DROP: usize = 100;

/// In-process `tx_id -> reward block hash` cache bound.
const REWARD_CACHE_CAP: usize = 10_000;

struct BlockQueueInner {
    order: VecDeque<RpcHash>,
    blocks: HashMap<RpcHash, RpcBlock>,
}

/// Bounded unique-block queue feeding the scan worker pool.
pub struct BlockQueue {
    inner: Mutex<BlockQueueInner>,
    notify: Notify,
}

impl BlockQueue {
    pub fn new() -> Self {
        BlockQueue {
            inner: Mutex::new(BlockQueueInner {
                order: VecDeque::new(),
                blocks: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a unique block, shedding the oldest entries on overflow.
    pub async fn push(&self, block: RpcBlock) {
        let hash = block.header.hash;
        let mut inner = self.inner.lock().await;
        if inner.blocks.contains_key(&hash) {
            return;
        }
        if inner.order.len() >= BLOCK_QUEUE_CAP {
            warn!(
                dropped = BLOCK_QUEUE_DROP,
                "block queue overflow; shedding oldest entries"
            );
            for _ in 0..BLOCK_QUEUE_DROP {
                if let Some(old) = inner.order.pop_front() {
                    inner.blocks.remove(&old);
                }
            }
        }
        inner.order.push_back(hash);
        inner.blocks.insert(hash, block);
        drop(inner);
        self.notify.notify_one();
    }

    /// Take the oldest queued block, waiting when the queue is empty.
    pub async fn pop(&self) -> RpcBlock {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(hash) = inner.order.pop_front() {
                    if let Some(block) = inner.blocks.remove(&hash) {
                        return block;
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the pool treasury: scans added blocks for payments to the pool
/// address and emits [`CoinbaseEvent`]s when coinbases mature.
pub struct TreasuryTracker {
    node: Arc<NodeClient>,
    storage: Arc<dyn PoolPersistence>,
    utxo: Arc<UtxoBridge>,
    pool_address: Address,
    prefix: Prefix,
    fee_bps: u64,
    workers: usize,
    coinbase_tx: async_channel::Sender<CoinbaseEvent>,
    queue: BlockQueue,
    reward_cache: Mutex<HashMap<String, String>>,
    /// Guards listener re-registration after a UTXO-processor reconnect.
    reconnecting: Mutex<bool>,
    /// Maturity events whose estimated block time predates this are ignored.
    pool_start_unix_ms: u64,
}

impl TreasuryTracker {
    pub fn new(
        node: Arc<NodeClient>,
        storage: Arc<dyn PoolPersistence>,
        utxo: Arc<UtxoBridge>,
        pool_address: Address,
        fee_bps: u64,
        workers: usize,
    ) -> (Arc<Self>, async_channel::Receiver<CoinbaseEvent>) {
        let (coinbase_tx, coinbase_rx) = async_channel::unbounded();
        let prefix = pool_address.prefix;
        let tracker = Arc::new(TreasuryTracker {
            node,
            storage,
            utxo,
            pool_address,
            prefix,
            fee_bps,
            workers,
            coinbase_tx,
            queue: BlockQueue::new(),
            reward_cache: Mutex::new(HashMap::new()),
            reconnecting: Mutex::new(false),
            pool_start_unix_ms: unix_now() * 1000,
        });
        (tracker, coinbase_rx)
    }

    /// Spawn the scan worker pool and the maturity pump.
    pub async fn start(
        self: &Arc<Self>,
        task_manager: Arc<TaskManager>,
        notify_shutdown: broadcast::Sender<ShutdownMessage>,
    ) -> PoolResult<()> {
        self.utxo
            .start(task_manager.clone(), notify_shutdown.clone())
            .await?;

        for worker in 0..self.workers.max(1) {
            let tracker = self.clone();
            let mut shutdown = notify_shutdown.subscribe();
            task_manager.spawn(async move {
                debug!(worker, "treasury scan worker started");
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        block = tracker.queue.pop() => {
                            if let Err(e) = tracker.process_block(block).await {
                                warn!(worker, error = %e, "block scan failed");
                            }
                        }
                    }
                }
            });
        }

        // maturity pump
        let tracker = self.clone();
        let maturity_rx = self.utxo.maturity_events();
        let mut shutdown = notify_shutdown.subscribe();
        task_manager.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = maturity_rx.recv() => {
                        match event {
                            Ok(event) => {
                                if let Err(e) = tracker.handle_maturity(event).await {
                                    warn!(error = %e, "maturity handling failed");
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        // utxo-processor restart pump: re-register listeners exactly once
        let tracker = self.clone();
        let restart_rx = self.utxo.restart_events();
        let mut shutdown = notify_shutdown.subscribe();
        task_manager.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = restart_rx.recv() => {
                        if event.is_err() {
                            break;
                        }
                        if let Err(e) = tracker.register().await {
                            warn!(error = %e, "treasury re-registration failed");
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// (Re-)register the treasury address with the UTXO processor. A single
    /// mutex-guarded flag prevents double registration when reconnect
    /// signals overlap.
    pub async fn register(&self) -> PoolResult<()> {
        let mut reconnecting = self.reconnecting.lock().await;
        if *reconnecting {
            debug!("treasury registration already in flight");
            return Ok(());
        }
        *reconnecting = true;
        drop(reconnecting);

        let result = self.utxo.register(&self.pool_address).await;

        *self.reconnecting.lock().await = false;
        result?;
        info!(address = %self.pool_address, "treasury address registered");
        Ok(())
    }

    /// Stop the UTXO processor; part of the shutdown sequence.
    pub async fn stop(&self) {
        self.utxo.stop().await;
    }

    /// Queue an added block for scanning.
    pub async fn enqueue_block(&self, block: RpcBlock) {
        self.queue.push(block).await;
    }

    /// Scan every output of every transaction for the pool address and
    /// record the reward mapping.
    async fn process_block(&self, block: RpcBlock) -> PoolResult<()> {
        let block_hash = block.header.hash.to_string();
        let is_chain_block = block
            .verbose_data
            .as_ref()
            .map(|v| v.is_chain_block)
            .unwrap_or(false);

        for tx in &block.transactions {
            let tx_id = match tx.verbose_data.as_ref() {
                Some(verbose) => verbose.transaction_id.to_string(),
                None => continue,
            };
            let pays_pool = tx.outputs.iter().any(|output| {
                extract_script_pub_key_address(&output.script_public_key, self.prefix)
                    .map(|address| address == self.pool_address)
                    .unwrap_or(false)
            });
            if pays_pool {
                self.record_reward_mapping(&tx_id, &block_hash, is_chain_block)
                    .await?;
            }
        }
        Ok(())
    }

    /// Insert the `tx_id -> block hash` mapping, or move it only when the
    /// replacement is a chain block (reorg-safe update).
    async fn record_reward_mapping(
        &self,
        tx_id: &str,
        block_hash: &str,
        is_chain_block: bool,
    ) -> PoolResult<()> {
        let existing = match self.cached_reward_hash(tx_id).await {
            Some(hash) => Some(hash),
            None => self.storage.get_reward_block_hash(tx_id).await?,
        };
        match existing {
            None => {
                self.storage.add_reward_details(block_hash, tx_id).await?;
                self.cache_reward_hash(tx_id, block_hash).await;
                debug!(tx_id, block_hash, "reward mapping recorded");
            }
            Some(current) if current != block_hash && is_chain_block => {
                self.storage.add_reward_details(block_hash, tx_id).await?;
                self.cache_reward_hash(tx_id, block_hash).await;
                info!(tx_id, old = %current, new = %block_hash, "reward mapping moved to chain block");
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn cached_reward_hash(&self, tx_id: &str) -> Option<String> {
        self.reward_cache.lock().await.get(tx_id).cloned()
    }

    async fn cache_reward_hash(&self, tx_id: &str, block_hash: &str) {
        let mut cache = self.reward_cache.lock().await;
        if cache.len() >= REWARD_CACHE_CAP {
            cache.clear();
        }
        cache.insert(tx_id.to_string(), block_hash.to_string());
    }

    /// Turn a maturity report into a coinbase event.
    async fn handle_maturity(&self, event: MaturityEvent) -> PoolResult<()> {
        if !event.is_coinbase {
            return Ok(());
        }

        match self
            .node
            .get_daa_score_timestamp_estimate(vec![event.block_daa_score])
            .await
        {
            Ok(timestamps) => {
                if let Some(estimate) = timestamps.first() {
                    if *estimate < self.pool_start_unix_ms {
                        info!(
                            tx_id = %event.tx_id,
                            estimate,
                            "ignoring coinbase predating pool start"
                        );
                        return Ok(());
                    }
                }
            }
            Err(e) => warn!(error = %e, "timestamp estimate unavailable; accepting maturity"),
        }

        let pool_fee = (event.amount as u128 * self.fee_bps as u128 / 10_000) as u64;
        let miner_reward = event.amount - pool_fee;

        let reward_block_hash = match self.cached_reward_hash(&event.tx_id).await {
            Some(hash) => hash,
            None => self
                .storage
                .get_reward_block_hash(&event.tx_id)
                .await?
                .unwrap_or_default(),
        };

        info!(
            tx_id = %event.tx_id,
            miner_reward,
            pool_fee,
            reward_block_hash = %reward_block_hash,
            daa_score = event.block_daa_score,
            "coinbase matured"
        );
        self.coinbase_tx
            .send(CoinbaseEvent {
                miner_reward,
                pool_fee,
                reward_block_hash,
                tx_id: event.tx_id,
                daa_score: event.block_daa_score,
            })
            .await?;
        Ok(())
    }
}
