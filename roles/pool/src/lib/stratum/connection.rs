//! One stratum session: framing, state machine and method dispatch.
//!
//! Per-connection state walks `Connected -> Subscribed -> Authorized(1..N)
//! -> submitting* -> Closed`. Responses are written in request order; all
//! writes go through the single framed sink owned by this task, so lines can
//! never interleave.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use kaspa_addresses::{Address, Prefix};
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Value};
use storage_kas::PoolPersistence;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StratumPortConfig;
use crate::error::{PoolError, PoolResult};
use crate::shares::vardiff::VarDiffConfig;
use crate::shares::worker::{WorkerIdentity, WorkerStats};
use crate::shares::{ShareManager, ShareOutcome};
use crate::stratum::encoding::{compose_nonce, notify_params, MinerEncoding};
use crate::stratum::messages::{ErrorCode, Id, Notification, Request, Response};
use crate::target::clamp_difficulty;
use crate::upstream::JobNotification;

/// Inbound lines beyond this length end the session.
pub const MAX_LINE_LENGTH: usize = 512;

pub struct Session {
    id: u64,
    peer: SocketAddr,
    port_config: StratumPortConfig,
    manager: Arc<ShareManager>,
    storage: Arc<dyn PoolPersistence>,
    network_prefix: Prefix,
    framed: Framed<TcpStream, LinesCodec>,
    job_rx: watch::Receiver<Option<JobNotification>>,
    token: CancellationToken,

    subscribed: bool,
    closing: bool,
    encoding: MinerEncoding,
    extranonce: Option<String>,
    /// identity string -> worker
    workers: HashMap<String, (WorkerIdentity, Arc<Mutex<WorkerStats>>)>,
    /// first authorized identity; its stats drive difficulty renegotiation
    primary: Option<String>,
    difficulty: u64,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        peer: SocketAddr,
        stream: TcpStream,
        port_config: StratumPortConfig,
        manager: Arc<ShareManager>,
        storage: Arc<dyn PoolPersistence>,
        network_prefix: Prefix,
        job_rx: watch::Receiver<Option<JobNotification>>,
        token: CancellationToken,
    ) -> Self {
        let difficulty = port_config.initial_difficulty;
        Session {
            id,
            peer,
            port_config,
            manager,
            storage,
            network_prefix,
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            job_rx,
            token,
            subscribed: false,
            closing: false,
            encoding: MinerEncoding::BigHeader,
            extranonce: None,
            workers: HashMap::new(),
            primary: None,
            difficulty,
        }
    }

    /// Drive the session to completion, then run close-handler cleanup.
    pub async fn run(mut self) {
        match self.drive().await {
            Ok(()) => debug!(peer = %self.peer, "session ended"),
            Err(e) => debug!(peer = %self.peer, error = %e, "session ended with error"),
        }
        self.manager.close_session(self.id).await;
    }

    async fn drive(&mut self) -> PoolResult<()> {
        loop {
            if self.closing {
                return Ok(());
            }
            tokio::select! {
                _ = self.token.cancelled() => {
                    // close-reason for the sweep-initiated disconnect
                    let _ = self
                        .write_json(&Response::err(Id::Number(0), ErrorCode::Unknown))
                        .await;
                    info!(peer = %self.peer, "closing idle session");
                    self.closing = true;
                }
                changed = self.job_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    self.announce_job().await?;
                }
                line = self.framed.next() => {
                    match line {
                        None => return Ok(()),
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            warn!(peer = %self.peer, "inbound line over {MAX_LINE_LENGTH} bytes");
                            return Err(PoolError::Protocol("oversized request line".to_string()));
                        }
                        Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                        Some(Ok(text)) => {
                            if text.trim().is_empty() {
                                continue;
                            }
                            let request: Request = serde_json::from_str(&text).map_err(|e| {
                                PoolError::Protocol(format!("malformed request: {e}"))
                            })?;
                            self.handle_request(request).await?;
                        }
                    }
                }
            }
        }
    }

    async fn handle_request(&mut self, request: Request) -> PoolResult<()> {
        let id = request.id.clone().unwrap_or(Id::Number(0));
        match request.method.as_str() {
            "mining.subscribe" => self.handle_subscribe(id, request.params).await,
            "mining.authorize" => self.handle_authorize(id, request.params).await,
            "mining.submit" => self.handle_submit(id, request.params).await,
            "mining.extranonce.subscribe" => {
                self.write_json(&Response::ok(id, json!(true))).await
            }
            other => {
                debug!(peer = %self.peer, method = other, "unrecognized method");
                self.write_json(&Response::err(id, ErrorCode::Unknown)).await
            }
        }
    }

    async fn handle_subscribe(&mut self, id: Id, params: Option<Value>) -> PoolResult<()> {
        if self.subscribed {
            return self.write_json(&Response::err(id, ErrorCode::Unknown)).await;
        }

        let user_agent = params
            .as_ref()
            .and_then(|p| p.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        self.encoding = MinerEncoding::from_user_agent(&user_agent);

        if self.port_config.extra_nonce_size > 0 {
            let mut bytes = vec![0u8; self.port_config.extra_nonce_size as usize];
            rand::thread_rng().fill_bytes(&mut bytes);
            self.extranonce = Some(hex::encode(bytes));
        }
        self.subscribed = true;
        info!(peer = %self.peer, user_agent = %user_agent, encoding = ?self.encoding, "subscribed");

        let result = match self.encoding {
            MinerEncoding::BigHeader => json!([true, "EthereumStratum/1.0.0"]),
            MinerEncoding::Bitmain => {
                let remaining = 8 - self.port_config.extra_nonce_size as u64;
                json!([self.extranonce.clone().unwrap_or_default(), remaining])
            }
        };
        self.write_json(&Response::ok(id, result)).await
    }

    async fn handle_authorize(&mut self, id: Id, params: Option<Value>) -> PoolResult<()> {
        let params: Vec<Value> = match params.and_then(|p| serde_json::from_value(p).ok()) {
            Some(v) => v,
            None => return self.write_json(&Response::err(id, ErrorCode::Unknown)).await,
        };
        let identity_str = match params.first().and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return self.write_json(&Response::err(id, ErrorCode::Unknown)).await,
        };

        let (address, worker_name) = match identity_str.split_once('.') {
            Some((address, worker)) if !worker.is_empty() => (address.to_string(), worker.to_string()),
            _ => (identity_str.clone(), "default".to_string()),
        };

        if !self.validate_address(&address).await? {
            warn!(peer = %self.peer, address = %address, "authorize rejected: unknown address");
            return self.write_json(&Response::err(id, ErrorCode::Unauthorized)).await;
        }

        if self
            .workers
            .values()
            .any(|(identity, _)| identity.worker_name == worker_name)
        {
            warn!(peer = %self.peer, worker_name = %worker_name, "authorize rejected: duplicate worker name");
            return self.write_json(&Response::err(id, ErrorCode::Unauthorized)).await;
        }

        let mut difficulty = self.port_config.initial_difficulty;
        if self.port_config.allow_custom_difficulty {
            if let Some(requested) = params.get(1).and_then(parse_difficulty) {
                difficulty = clamp_difficulty(
                    requested,
                    self.port_config.min_diff,
                    self.port_config.max_diff,
                );
            }
        }

        let identity = WorkerIdentity {
            payout_address: address,
            worker_name,
        };
        let miner_id = identity.miner_id();
        let vardiff = VarDiffConfig {
            expected_share_rate: self.port_config.shares_per_minute,
            clamp_pow2: self.port_config.clamp_pow2,
            min_diff: self.port_config.min_diff,
            max_diff: self.port_config.max_diff,
        };
        let stats = self
            .manager
            .register_worker(
                self.id,
                identity.clone(),
                self.encoding,
                difficulty,
                vardiff,
                self.port_config.var_diff,
            )
            .await;

        if self.primary.is_none() {
            self.primary = Some(miner_id.clone());
            self.difficulty = difficulty;
        }
        self.workers.insert(miner_id.clone(), (identity, stats));
        info!(peer = %self.peer, miner = %miner_id, difficulty, "authorized");

        self.write_json(&Response::ok(id, json!(true))).await?;
        if let Some(extranonce) = self.extranonce.clone() {
            self.write_json(&Notification::new(
                "mining.set_extranonce",
                json!([extranonce, self.port_config.extra_nonce_size]),
            ))
            .await?;
        }
        self.write_json(&Notification::new(
            "mining.set_difficulty",
            json!([self.difficulty]),
        ))
        .await?;
        self.announce_job().await
    }

    async fn handle_submit(&mut self, id: Id, params: Option<Value>) -> PoolResult<()> {
        if !self.subscribed {
            return self.write_json(&Response::err(id, ErrorCode::NotSubscribed)).await;
        }
        let params: Vec<String> = match params.and_then(|p| serde_json::from_value(p).ok()) {
            Some(v) => v,
            None => return self.write_json(&Response::err(id, ErrorCode::Unknown)).await,
        };
        if params.len() < 3 {
            return self.write_json(&Response::err(id, ErrorCode::Unknown)).await;
        }
        let identity_str = normalize_identity(&params[0]);
        let job_id = params[1].clone();

        // workers that authorized bare addresses submit without the
        // ".default" suffix the pool keyed them under
        let identity = match self
            .workers
            .get(&identity_str)
            .or_else(|| self.workers.get(&format!("{identity_str}.default")))
        {
            Some((identity, _)) => identity.clone(),
            None => {
                warn!(peer = %self.peer, identity = %identity_str, "submit from unauthorized worker");
                return self.write_json(&Response::err(id, ErrorCode::Unauthorized)).await;
            }
        };

        let nonce = match compose_nonce(self.encoding, self.extranonce.as_deref(), &params[2]) {
            Ok(nonce) => nonce,
            Err(code) => return self.write_json(&Response::err(id, code)).await,
        };

        let outcome = self
            .manager
            .add_share(&identity, &job_id, self.difficulty, nonce)
            .await?;
        let response = match outcome {
            // duplicates are deliberately reported as success
            ShareOutcome::Valid | ShareOutcome::Block { .. } | ShareOutcome::Duplicate => {
                Response::ok(id, json!(true))
            }
            ShareOutcome::Stale => Response::err(id, ErrorCode::JobNotFound),
            ShareOutcome::LowDifficulty => Response::err(id, ErrorCode::LowDifficultyShare),
            ShareOutcome::UnknownWorker => Response::err(id, ErrorCode::Unauthorized),
        };
        self.write_json(&response).await
    }

    /// Protocol-level address rules with the custodian-user fallback.
    async fn validate_address(&self, address: &str) -> PoolResult<bool> {
        if let Ok(parsed) = Address::try_from(address) {
            return Ok(parsed.prefix == self.network_prefix);
        }
        Ok(self.storage.get_user(address).await?.is_some())
    }

    /// Push the current job, renegotiating difficulty inline when VarDiff
    /// moved it.
    async fn announce_job(&mut self) -> PoolResult<()> {
        if !self.subscribed || self.workers.is_empty() {
            return Ok(());
        }
        self.maybe_update_difficulty().await?;
        let job = self.job_rx.borrow_and_update().clone();
        if let Some(job) = job {
            let params = notify_params(self.encoding, &job.job_id, job.pre_pow, job.timestamp);
            self.write_json(&Notification::new("mining.notify", params)).await?;
        }
        Ok(())
    }

    async fn maybe_update_difficulty(&mut self) -> PoolResult<()> {
        let new_diff = match &self.primary {
            Some(primary) => match self.workers.get(primary) {
                Some((_, stats)) => {
                    let stats = stats.lock().await;
                    (stats.min_diff != self.difficulty).then_some(stats.min_diff)
                }
                None => None,
            },
            None => None,
        };
        if let Some(new_diff) = new_diff {
            self.difficulty = new_diff;
            info!(peer = %self.peer, difficulty = new_diff, "difficulty renegotiated");
            self.write_json(&Notification::new(
                "mining.set_difficulty",
                json!([new_diff]),
            ))
            .await?;
        }
        Ok(())
    }

    async fn write_json<T: Serialize>(&mut self, value: &T) -> PoolResult<()> {
        let line = serde_json::to_string(value)
            .map_err(|e| PoolError::Protocol(format!("encoding response: {e}")))?;
        self.framed.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(e) => PoolError::Io(e),
            other => PoolError::Protocol(other.to_string()),
        })
    }
}

/// Miners occasionally quote or 0x-prefix the identity; strip both.
fn normalize_identity(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

fn parse_difficulty(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|d| *d >= 1.0).map(|d| d as u64),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    }
}
