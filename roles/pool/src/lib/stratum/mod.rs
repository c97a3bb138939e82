//! Downstream stratum interface: newline-delimited JSON over TCP.

pub mod connection;
pub mod encoding;
pub mod messages;

use std::sync::Arc;

use kaspa_addresses::Prefix;
use storage_kas::PoolPersistence;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::config::StratumPortConfig;
use crate::error::{PoolError, PoolResult};
use crate::shares::ShareManager;
use crate::stratum::connection::Session;
use crate::task_manager::TaskManager;
use crate::upstream::JobNotification;
use crate::utils::ShutdownMessage;

/// One listener per configured stratum port.
pub struct StratumServer {
    manager: Arc<ShareManager>,
    storage: Arc<dyn PoolPersistence>,
    network_prefix: Prefix,
    job_rx: watch::Receiver<Option<JobNotification>>,
}

impl StratumServer {
    pub fn new(
        manager: Arc<ShareManager>,
        storage: Arc<dyn PoolPersistence>,
        network_prefix: Prefix,
        job_rx: watch::Receiver<Option<JobNotification>>,
    ) -> Self {
        StratumServer {
            manager,
            storage,
            network_prefix,
            job_rx,
        }
    }

    /// Bind every configured port and spawn its accept loop.
    pub async fn start(
        &self,
        ports: Vec<StratumPortConfig>,
        task_manager: Arc<TaskManager>,
        notify_shutdown: broadcast::Sender<ShutdownMessage>,
    ) -> PoolResult<()> {
        for port_config in ports {
            let listener = TcpListener::bind(("0.0.0.0", port_config.port))
                .await
                .map_err(|e| {
                    PoolError::Config(format!("binding stratum port {}: {e}", port_config.port))
                })?;
            info!(port = port_config.port, "stratum listener started");

            let manager = self.manager.clone();
            let storage = self.storage.clone();
            let network_prefix = self.network_prefix;
            let job_rx = self.job_rx.clone();
            let inner_tasks = task_manager.clone();
            let mut shutdown = notify_shutdown.subscribe();

            task_manager.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            info!(port = port_config.port, "stratum listener shutting down");
                            break;
                        }
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, peer)) => {
                                    if let Err(e) = stream.set_nodelay(true) {
                                        warn!(%peer, error = %e, "failed to set TCP_NODELAY");
                                    }
                                    let (session_id, token) = manager.open_session(peer).await;
                                    let session = Session::new(
                                        session_id,
                                        peer,
                                        stream,
                                        port_config.clone(),
                                        manager.clone(),
                                        storage.clone(),
                                        network_prefix,
                                        job_rx.clone(),
                                        token,
                                    );
                                    inner_tasks.spawn(session.run());
                                }
                                Err(e) => {
                                    error!(port = port_config.port, error = %e, "accept failed");
                                }
                            }
                        }
                    }
                }
            });
        }
        Ok(())
    }
}
