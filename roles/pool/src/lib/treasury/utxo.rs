//! Boundary around the wallet-core UTXO processor.
//!
//! The processor owns UTXO tracking for the treasury address; this bridge
//! reduces its event stream to the two signals the tracker cares about:
//! coinbase maturity and processor (re)starts.

use std::sync::Arc;

use kaspa_addresses::Address;
use kaspa_consensus_core::network::NetworkId;
use kaspa_wallet_core::events::Events;
use kaspa_wallet_core::rpc::Rpc;
use kaspa_wallet_core::utxo::{UtxoContext, UtxoContextBinding, UtxoProcessor};
use kaspa_wrpc_client::KaspaRpcClient;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::task_manager::TaskManager;
use crate::treasury::MaturityEvent;
use crate::utils::ShutdownMessage;

pub struct UtxoBridge {
    processor: UtxoProcessor,
    context: UtxoContext,
    maturity_tx: async_channel::Sender<MaturityEvent>,
    maturity_rx: async_channel::Receiver<MaturityEvent>,
    restart_tx: async_channel::Sender<()>,
    restart_rx: async_channel::Receiver<()>,
}

impl UtxoBridge {
    pub fn new(client: Arc<KaspaRpcClient>, network_id: NetworkId) -> Arc<Self> {
        let rpc_ctl = client.ctl().clone();
        let rpc = Rpc::new(client, rpc_ctl);
        let processor = UtxoProcessor::new(Some(rpc), Some(network_id), None, None);
        let context = UtxoContext::new(&processor, UtxoContextBinding::default());
        let (maturity_tx, maturity_rx) = async_channel::unbounded();
        let (restart_tx, restart_rx) = async_channel::unbounded();
        Arc::new(UtxoBridge {
            processor,
            context,
            maturity_tx,
            maturity_rx,
            restart_tx,
            restart_rx,
        })
    }

    /// Matured-coinbase stream consumed by the tracker.
    pub fn maturity_events(&self) -> async_channel::Receiver<MaturityEvent> {
        self.maturity_rx.clone()
    }

    /// Fires when the processor (re)starts and listeners must be
    /// re-registered.
    pub fn restart_events(&self) -> async_channel::Receiver<()> {
        self.restart_rx.clone()
    }

    /// Start the processor and the event pump.
    pub async fn start(
        self: &Arc<Self>,
        task_manager: Arc<TaskManager>,
        notify_shutdown: broadcast::Sender<ShutdownMessage>,
    ) -> PoolResult<()> {
        self.processor
            .start()
            .await
            .map_err(|e| PoolError::Upstream(format!("starting UTXO processor: {e}")))?;
        info!("UTXO processor started");

        let bridge = self.clone();
        let mut shutdown = notify_shutdown.subscribe();
        let events = self.processor.multiplexer().channel();
        task_manager.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = events.recv() => {
                        match event {
                            Ok(event) => bridge.handle_event(&event).await,
                            Err(_) => {
                                warn!("UTXO processor event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_event(&self, event: &Events) {
        match event {
            Events::UtxoProcStart => {
                debug!("UTXO processor start event");
                let _ = self.restart_tx.send(()).await;
            }
            Events::Maturity { record, .. } => {
                let maturity = MaturityEvent {
                    tx_id: record.id().to_string(),
                    amount: record.value(),
                    block_daa_score: record.block_daa_score(),
                    is_coinbase: record.is_coinbase(),
                };
                debug!(tx_id = %maturity.tx_id, amount = maturity.amount, "maturity event");
                let _ = self.maturity_tx.send(maturity).await;
            }
            _ => {}
        }
    }

    /// Track the treasury address.
    pub async fn register(&self, address: &Address) -> PoolResult<()> {
        self.context
            .scan_and_register_addresses(vec![address.clone()], None)
            .await
            .map_err(|e| PoolError::Upstream(format!("tracking treasury address: {e}")))?;
        Ok(())
    }

    /// Stop the processor; part of the shutdown sequence.
    pub async fn stop(&self) {
        if let Err(e) = self.processor.stop().await {
            warn!(error = %e, "stopping UTXO processor");
        }
    }
}
