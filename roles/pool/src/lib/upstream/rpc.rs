//! wRPC client wrapper.
//!
//! All node traffic funnels through [`NodeClient`]: requests get a
//! wall-clock timeout, and reconnection is serialized by a single-flight
//! guard so concurrent callers join the in-flight attempt instead of racing
//! their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kaspa_addresses::Address;
use kaspa_notify::listener::ListenerId;
use kaspa_notify::scope::Scope;
use kaspa_rpc_core::api::rpc::RpcApi;
use kaspa_rpc_core::notify::connection::{ChannelConnection, ChannelType};
use kaspa_rpc_core::{
    GetServerInfoResponse, Notification, RpcBlock, RpcHash, RpcRawBlock, SubmitBlockReport,
};
use kaspa_wrpc_client::prelude::{ConnectOptions, ConnectStrategy};
use kaspa_wrpc_client::{KaspaRpcClient, WrpcEncoding};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{PoolError, PoolResult};

pub struct NodeClient {
    client: Arc<KaspaRpcClient>,
    url: String,
    request_timeout: Duration,
    retry_interval: Duration,
    connected: AtomicBool,
    reconnect_lock: Mutex<()>,
}

impl NodeClient {
    pub fn new(url: &str, request_timeout: Duration, retry_interval: Duration) -> PoolResult<Self> {
        let client = KaspaRpcClient::new(WrpcEncoding::Borsh, Some(url), None, None, None)
            .map_err(|e| PoolError::Config(format!("building wRPC client: {e}")))?;
        Ok(NodeClient {
            client: Arc::new(client),
            url: url.to_string(),
            request_timeout,
            retry_interval,
            connected: AtomicBool::new(false),
            reconnect_lock: Mutex::new(()),
        })
    }

    /// The underlying client, for collaborators that need the raw RPC
    /// surface (the UTXO processor bridge).
    pub fn raw(&self) -> Arc<KaspaRpcClient> {
        self.client.clone()
    }

    /// Connect if not connected, retrying forever on the configured
    /// interval. Concurrent callers await the same in-flight attempt.
    pub async fn ensure_connected(&self) -> PoolResult<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.reconnect_lock.lock().await;
        if self.connected.load(Ordering::Acquire) {
            // another caller finished the reconnect while we waited
            return Ok(());
        }
        loop {
            let options = ConnectOptions {
                block_async_connect: true,
                connect_timeout: Some(Duration::from_secs(10)),
                strategy: ConnectStrategy::Fallback,
                ..Default::default()
            };
            match self.client.connect(Some(options)).await {
                Ok(_) => {
                    self.connected.store(true, Ordering::Release);
                    info!(url = %self.url, "node connection established");
                    return Ok(());
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "node connection failed; retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    /// Tear the connection down and bring it back up under the
    /// single-flight guard.
    pub async fn reconnect(&self) -> PoolResult<()> {
        {
            let _guard = self.reconnect_lock.lock().await;
            if self.connected.swap(false, Ordering::AcqRel) {
                let _ = self.client.disconnect().await;
            }
        }
        self.ensure_connected().await
    }

    /// Apply the request timeout; a timeout poisons the connection so the
    /// next caller reconnects.
    async fn with_timeout<T, F>(&self, future: F) -> PoolResult<T>
    where
        F: std::future::Future<Output = Result<T, kaspa_rpc_core::RpcError>>,
    {
        match tokio::time::timeout(self.request_timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PoolError::Upstream(e.to_string())),
            Err(_) => {
                self.connected.store(false, Ordering::Release);
                Err(PoolError::Upstream("RPC request timeout".to_string()))
            }
        }
    }

    pub async fn get_server_info(&self) -> PoolResult<GetServerInfoResponse> {
        self.with_timeout(self.client.get_server_info()).await
    }

    pub async fn get_block_template(
        &self,
        pay_address: Address,
        extra_data: Vec<u8>,
    ) -> PoolResult<RpcRawBlock> {
        let response = self
            .with_timeout(self.client.get_block_template(pay_address, extra_data))
            .await?;
        if !response.is_synced {
            return Err(PoolError::Upstream("node is not synced".to_string()));
        }
        Ok(response.block)
    }

    /// Forward a solved block. `Ok(None)` means accepted; `Ok(Some(reason))`
    /// carries the node's rejection.
    pub async fn submit_block(&self, block: RpcRawBlock) -> PoolResult<Option<String>> {
        let response = self
            .with_timeout(self.client.submit_block(block, false))
            .await?;
        match response.report {
            SubmitBlockReport::Success => Ok(None),
            SubmitBlockReport::Reject(reason) => Ok(Some(format!("{reason:?}"))),
        }
    }

    pub async fn get_block(&self, hash: RpcHash, include_transactions: bool) -> PoolResult<RpcBlock> {
        self.with_timeout(self.client.get_block(hash, include_transactions))
            .await
    }

    pub async fn get_daa_score_timestamp_estimate(
        &self,
        daa_scores: Vec<u64>,
    ) -> PoolResult<Vec<u64>> {
        let response = self
            .with_timeout(self.client.get_daa_score_timestamp_estimate(daa_scores))
            .await?;
        Ok(response)
    }

    // === Notifications ===

    pub fn register_listener(&self, sender: async_channel::Sender<Notification>) -> ListenerId {
        self.client
            .register_new_listener(ChannelConnection::new("kpool", sender, ChannelType::Persistent))
    }

    pub async fn start_notify(&self, listener: ListenerId, scope: Scope) -> PoolResult<()> {
        self.with_timeout(self.client.start_notify(listener, scope))
            .await
    }

    pub async fn stop_notify(&self, listener: ListenerId, scope: Scope) -> PoolResult<()> {
        self.with_timeout(self.client.stop_notify(listener, scope))
            .await
    }

    pub async fn unregister_listener(&self, listener: ListenerId) -> PoolResult<()> {
        self.with_timeout(self.client.unregister_listener(listener))
            .await
    }
}
