//! Upstream feed: template subscription, block-added fan-in and the
//! connection watchdog.

pub mod rpc;

pub use rpc::NodeClient;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kaspa_addresses::Address;
use kaspa_math::Uint256;
use kaspa_notify::listener::ListenerId;
use kaspa_notify::scope::{BlockAddedScope, NewBlockTemplateScope, Scope};
use kaspa_rpc_core::Notification;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::jobs::{consensus_header, BlockSubmitter, JobStore, SubmitOutcome, Template};
use crate::metrics::PoolMetrics;
use crate::status::Status;
use crate::task_manager::TaskManager;
use crate::treasury::TreasuryTracker;
use crate::utils::ShutdownMessage;

/// Watchdog cadence.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Node silence beyond this re-establishes subscriptions.
const BLOCK_SILENCE_LIMIT: Duration = Duration::from_secs(120);

/// What the stratum layer needs to announce a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotification {
    pub job_id: String,
    pub pre_pow: Uint256,
    pub timestamp: u64,
    pub daa_score: u64,
}

/// Maintains the node connection and feeds templates and block-added events
/// into the rest of the pool.
pub struct UpstreamFeed {
    node: Arc<NodeClient>,
    jobs: Arc<JobStore>,
    treasury: Arc<TreasuryTracker>,
    metrics: Arc<PoolMetrics>,
    job_tx: watch::Sender<Option<JobNotification>>,
    pool_address: Address,
    extra_data: Vec<u8>,
    listener: Mutex<Option<ListenerId>>,
    resubscribe_lock: Mutex<()>,
}

impl UpstreamFeed {
    pub fn new(
        node: Arc<NodeClient>,
        jobs: Arc<JobStore>,
        treasury: Arc<TreasuryTracker>,
        metrics: Arc<PoolMetrics>,
        pool_address: Address,
        pool_tag: &str,
    ) -> (Arc<Self>, watch::Receiver<Option<JobNotification>>) {
        let (job_tx, job_rx) = watch::channel(None);
        let feed = Arc::new(UpstreamFeed {
            node,
            jobs,
            treasury,
            metrics,
            job_tx,
            pool_address,
            extra_data: pool_tag.as_bytes().to_vec(),
            listener: Mutex::new(None),
            resubscribe_lock: Mutex::new(()),
        });
        (feed, job_rx)
    }

    /// Connect, verify the node, subscribe and spawn the feed tasks.
    pub async fn start(
        self: &Arc<Self>,
        expected_network: kaspa_consensus_core::network::NetworkId,
        task_manager: Arc<TaskManager>,
        notify_shutdown: broadcast::Sender<ShutdownMessage>,
        status_sender: async_channel::Sender<Status>,
    ) -> PoolResult<()> {
        self.node.ensure_connected().await?;

        let info = self.node.get_server_info().await?;
        if info.network_id != expected_network {
            return Err(PoolError::Config(format!(
                "node network {} does not match configured {}",
                info.network_id, expected_network
            )));
        }
        if !info.has_utxo_index {
            return Err(PoolError::Config(
                "node is running without --utxoindex; treasury tracking requires it".to_string(),
            ));
        }
        if !info.is_synced {
            warn!("node is not synced yet; templates will be rejected until it is");
        }
        info!(
            version = %info.server_version,
            network = %info.network_id,
            "connected to upstream node"
        );

        let (notification_tx, notification_rx) = async_channel::unbounded::<Notification>();
        let listener = self.node.register_listener(notification_tx);
        *self.listener.lock().await = Some(listener);
        self.subscribe(listener).await?;
        self.treasury.register().await?;

        if let Err(e) = self.refresh_template().await {
            warn!(error = %e, "initial template fetch failed");
        }

        // notification pump
        let feed = self.clone();
        let mut shutdown = notify_shutdown.subscribe();
        let status = status_sender.clone();
        task_manager.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        feed.shutdown().await;
                        break;
                    }
                    notification = notification_rx.recv() => {
                        match notification {
                            Ok(notification) => feed.handle_notification(notification).await,
                            Err(_) => {
                                let _ = status.send(Status::upstream("notification channel closed")).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        // watchdog
        let feed = self.clone();
        let mut shutdown = notify_shutdown.subscribe();
        task_manager.spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if feed.metrics.block_added_age() > BLOCK_SILENCE_LIMIT.as_secs() {
                            warn!(
                                age_secs = feed.metrics.block_added_age(),
                                "no block-added event within the silence limit; re-establishing subscriptions"
                            );
                            if let Err(e) = feed.resubscribe().await {
                                error!(error = %e, "resubscription failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn handle_notification(&self, notification: Notification) {
        match notification {
            Notification::NewBlockTemplate(_) => {
                if let Err(e) = self.refresh_template().await {
                    warn!(error = %e, "template refresh failed");
                    if let Err(e) = self.node.reconnect().await {
                        error!(error = %e, "node reconnect failed");
                    }
                }
            }
            Notification::BlockAdded(added) => {
                self.metrics.mark_block_added();
                self.treasury.enqueue_block((*added.block).clone()).await;
            }
            other => debug!(?other, "ignoring notification"),
        }
    }

    /// Fetch a template, cache it and fan the job out to every session.
    pub async fn refresh_template(&self) -> PoolResult<()> {
        let block = self
            .node
            .get_block_template(self.pool_address.clone(), self.extra_data.clone())
            .await?;
        let template = Template::from_block(block);
        let daa_score = template.daa_score;
        let timestamp = template.timestamp;
        let pre_pow = Uint256::from_be_bytes(template.pre_pow_hash.as_bytes());
        let (job_id, _) = self.jobs.insert(template).await;
        self.metrics
            .templates_received
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        self.job_tx
            .send(Some(JobNotification {
                job_id,
                pre_pow,
                timestamp,
                daa_score,
            }))
            .map_err(|_| PoolError::Channel("job watch closed".to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, listener: ListenerId) -> PoolResult<()> {
        self.node
            .start_notify(listener, Scope::NewBlockTemplate(NewBlockTemplateScope {}))
            .await?;
        self.node
            .start_notify(listener, Scope::BlockAdded(BlockAddedScope {}))
            .await?;
        Ok(())
    }

    async fn unsubscribe(&self, listener: ListenerId) {
        let _ = self
            .node
            .stop_notify(listener, Scope::NewBlockTemplate(NewBlockTemplateScope {}))
            .await;
        let _ = self
            .node
            .stop_notify(listener, Scope::BlockAdded(BlockAddedScope {}))
            .await;
    }

    /// Tear down and re-establish both subscriptions, then re-register the
    /// treasury tracker. Serialized so overlapping watchdog firings cannot
    /// race.
    async fn resubscribe(&self) -> PoolResult<()> {
        let _guard = self.resubscribe_lock.lock().await;
        let listener = match *self.listener.lock().await {
            Some(listener) => listener,
            None => return Ok(()),
        };
        self.unsubscribe(listener).await;
        self.node.reconnect().await?;
        self.subscribe(listener).await?;
        self.treasury.register().await?;
        self.metrics
            .upstream_reconnections
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.metrics.mark_block_added();
        Ok(())
    }

    /// Shutdown path: unsubscribe both topics and stop the tracker.
    async fn shutdown(&self) {
        info!("upstream feed shutting down");
        if let Some(listener) = self.listener.lock().await.take() {
            self.unsubscribe(listener).await;
            let _ = self.node.unregister_listener(listener).await;
        }
        self.treasury.stop().await;
    }
}

#[async_trait]
impl BlockSubmitter for UpstreamFeed {
    async fn submit_block(&self, template: &Template, nonce: u64) -> PoolResult<SubmitOutcome> {
        let mut block = template.block.clone();
        block.header.nonce = nonce;
        let block_hash = consensus_header(&block.header).hash;
        match self.node.submit_block(block).await? {
            None => Ok(SubmitOutcome::Accepted { block_hash }),
            Some(reason) => Ok(SubmitOutcome::Rejected { reason }),
        }
    }
}
