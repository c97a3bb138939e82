//! kpool: a stratum mining pool server for kaspa-family networks.
//!
//! The daemon wires nine collaborators together: the upstream feed caches
//! node templates and derives jobs, stratum sessions fan them out and take
//! submissions, the shares manager classifies work, the treasury pipeline
//! turns coinbase maturities into events, and the allocator credits
//! balances through the persistence gateway.

use std::sync::Arc;
use std::time::Duration;

use storage_kas::backends::postgres::PostgresStorage;
use storage_kas::PoolPersistence;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::allocator::RewardAllocator;
use crate::config::PoolConfig;
use crate::error::PoolResult;
use crate::jobs::JobStore;
use crate::metrics::PoolMetrics;
use crate::shares::ShareManager;
use crate::status::{State, Status};
use crate::stratum::StratumServer;
use crate::task_manager::TaskManager;
use crate::treasury::{MinedBlockResolver, RestClient, TreasuryTracker, UtxoBridge};
use crate::upstream::{NodeClient, UpstreamFeed};
use crate::utils::ShutdownMessage;

pub mod allocator;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod shares;
pub mod status;
pub mod stratum;
pub mod target;
pub mod task_manager;
pub mod treasury;
pub mod upstream;
pub mod utils;

/// Interval of the metrics summary log line.
const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for tasks to finish after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct KaspaPool {
    config: PoolConfig,
    notify_shutdown: broadcast::Sender<ShutdownMessage>,
}

impl KaspaPool {
    pub fn new(config: PoolConfig) -> Self {
        let (notify_shutdown, _) = broadcast::channel::<ShutdownMessage>(100);
        KaspaPool {
            config,
            notify_shutdown,
        }
    }

    /// Starts the pool main loop.
    pub async fn start(&self) -> PoolResult<()> {
        let config = &self.config;
        let network_id = config.network_id()?;
        let pool_address = config.pool_address()?;

        let task_manager = Arc::new(TaskManager::new());
        let (status_sender, status_receiver) = async_channel::unbounded::<Status>();
        let metrics = Arc::new(PoolMetrics::new());

        let storage: Arc<dyn PoolPersistence> = Arc::new(
            PostgresStorage::connect(&config.database_url, config.database_max_connections)
                .await?,
        );
        storage.initialize().await?;
        info!("persistence gateway ready");

        let node = Arc::new(NodeClient::new(
            &config.node_rpc_url,
            Duration::from_secs(config.rpc_request_timeout_secs),
            Duration::from_secs(config.rpc_retry_interval_secs),
        )?);

        let jobs = Arc::new(JobStore::new(config.template_cache_size));

        let utxo = UtxoBridge::new(node.raw(), network_id);
        let (treasury, coinbase_rx) = TreasuryTracker::new(
            node.clone(),
            storage.clone(),
            utxo,
            pool_address.clone(),
            config.pool_fee_bps,
            config.treasury_workers,
        );
        treasury
            .start(task_manager.clone(), self.notify_shutdown.clone())
            .await?;

        let (feed, job_rx) = UpstreamFeed::new(
            node.clone(),
            jobs.clone(),
            treasury.clone(),
            metrics.clone(),
            pool_address.clone(),
            &config.pool_tag,
        );
        feed.start(
            network_id,
            task_manager.clone(),
            self.notify_shutdown.clone(),
            status_sender.clone(),
        )
        .await?;
        info!("upstream feed started");

        let share_manager = Arc::new(ShareManager::new(
            jobs.clone(),
            storage.clone(),
            feed.clone(),
            metrics.clone(),
            config.pool_address.clone(),
        ));
        task_manager.spawn(crate::shares::stats::run_vardiff_loop(
            share_manager.clone(),
            self.notify_shutdown.subscribe(),
        ));
        task_manager.spawn(crate::shares::stats::run_stats_loop(
            share_manager.clone(),
            self.notify_shutdown.subscribe(),
        ));
        task_manager.spawn(crate::metrics::run_reporter(
            metrics.clone(),
            METRICS_REPORT_INTERVAL,
            self.notify_shutdown.subscribe(),
        ));

        let rest = config.rest_api_url.as_deref().map(RestClient::new);
        let resolver = MinedBlockResolver::new(node.clone(), rest, config.pool_tag.clone());
        let allocator = RewardAllocator::new(
            share_manager.clone(),
            storage.clone(),
            resolver,
            config.pool_address.clone(),
            config.rebate_bps,
        );
        task_manager.spawn(allocator.run(coinbase_rx, self.notify_shutdown.subscribe()));

        let server = StratumServer::new(
            share_manager.clone(),
            storage.clone(),
            pool_address.prefix,
            job_rx,
        );
        server
            .start(
                config.stratum.clone(),
                task_manager.clone(),
                self.notify_shutdown.clone(),
            )
            .await?;
        info!("pool is serving");

        let mut sigterm = unix::signal(SignalKind::terminate())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("SIGINT received; initiating graceful shutdown");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received; initiating graceful shutdown");
                    break;
                }
                message = status_receiver.recv() => {
                    if let Ok(status) = message {
                        match status.state {
                            State::UpstreamShutdown(reason) => {
                                warn!(reason = %reason, "upstream feed requested shutdown");
                                break;
                            }
                            State::TreasuryShutdown(reason) => {
                                warn!(reason = %reason, "treasury requested shutdown");
                                break;
                            }
                            State::StratumShutdown(reason) => {
                                warn!(reason = %reason, "stratum layer requested shutdown");
                                break;
                            }
                        }
                    }
                }
            }
        }

        let _ = self.notify_shutdown.send(ShutdownMessage::ShutdownAll);
        info!("waiting for tasks to complete");
        match tokio::time::timeout(SHUTDOWN_GRACE, task_manager.join_all()).await {
            Ok(()) => info!("all tasks completed gracefully"),
            Err(_) => {
                warn!("graceful shutdown timeout exceeded; aborting remaining tasks");
                task_manager.abort_all().await;
                task_manager.join_all().await;
            }
        }

        if let Err(e) = storage.close().await {
            warn!(error = %e, "closing persistence gateway");
        }
        info!("pool shutdown complete");
        Ok(())
    }
}

impl Drop for KaspaPool {
    fn drop(&mut self) {
        let _ = self.notify_shutdown.send(ShutdownMessage::ShutdownAll);
    }
}
