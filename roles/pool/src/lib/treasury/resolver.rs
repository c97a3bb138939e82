//! Mined-block resolution.
//!
//! The coinbase that pays the pool lives in a chain block; the block the
//! pool actually mined is one of that block's merge-set blues. Each
//! candidate header is fetched and its coinbase miner-info string checked
//! for the pool tag; the first match is authoritative. A REST explorer
//! serves as fallback when the node cannot answer.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use kaspa_rpc_core::{RpcBlock, RpcHash};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::error::{PoolError, PoolResult};
use crate::upstream::NodeClient;

const REST_ATTEMPTS: u32 = 3;
const RETRYABLE_STATUS: [u16; 6] = [404, 422, 429, 500, 501, 503];

/// Explorer client with linear-backoff retries.
pub struct RestClient {
    base: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(base_url: &str) -> Self {
        RestClient {
            base: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> PoolResult<T> {
        let url = format!("{}{}", self.base, path);
        for attempt in 1..=REST_ATTEMPTS {
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<T>()
                        .await
                        .map_err(|e| PoolError::Upstream(format!("decoding {url}: {e}")));
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !RETRYABLE_STATUS.contains(&status) || attempt == REST_ATTEMPTS {
                        return Err(PoolError::Upstream(format!("{url} returned {status}")));
                    }
                    debug!(url = %url, status, attempt, "retryable explorer response");
                }
                Err(e) => {
                    if attempt == REST_ATTEMPTS {
                        return Err(PoolError::Upstream(format!("{url}: {e}")));
                    }
                    debug!(url = %url, error = %e, attempt, "explorer request failed");
                }
            }
            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
        }
        Err(PoolError::Upstream(format!("{url}: retries exhausted")))
    }

    pub async fn transaction_block_hashes(&self, tx_id: &str) -> PoolResult<Vec<String>> {
        let tx: RestTransaction = self.get_json(&format!("/transactions/{tx_id}")).await?;
        Ok(tx.block_hash)
    }

    pub async fn block(&self, hash: &str) -> PoolResult<RestBlock> {
        self.get_json(&format!("/blocks/{hash}")).await
    }
}

/// The explorer encodes u64 fields as either numbers or strings.
fn u64_lenient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(u64),
        Text(String),
    }
    match Lenient::deserialize(deserializer)? {
        Lenient::Number(n) => Ok(n),
        Lenient::Text(s) => s.parse::<u64>().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
pub struct RestTransaction {
    #[serde(default)]
    pub block_hash: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestBlock {
    #[serde(rename = "verboseData", default)]
    pub verbose_data: RestBlockVerbose,
    pub header: RestHeader,
    #[serde(default)]
    pub extra: RestExtra,
}

#[derive(Debug, Default, Deserialize)]
pub struct RestBlockVerbose {
    #[serde(rename = "mergeSetBluesHashes", default)]
    pub merge_set_blues_hashes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestHeader {
    #[serde(rename = "daaScore", deserialize_with = "u64_lenient")]
    pub daa_score: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct RestExtra {
    #[serde(rename = "minerInfo", default)]
    pub miner_info: String,
}

/// Resolves the block the pool mined from the chain block that paid it.
pub struct MinedBlockResolver {
    node: Arc<NodeClient>,
    rest: Option<RestClient>,
    pool_tag: String,
}

impl MinedBlockResolver {
    pub fn new(node: Arc<NodeClient>, rest: Option<RestClient>, pool_tag: String) -> Arc<Self> {
        Arc::new(MinedBlockResolver {
            node,
            rest,
            pool_tag,
        })
    }

    /// Find the pool's own block among the reward block's merge-set blues.
    ///
    /// Returns `(mined_block_hash, daa_score)`; an empty hash with score 0
    /// means resolution failed and the caller falls back to time-weighted
    /// allocation.
    pub async fn resolve(&self, reward_block_hash: &str) -> (String, u64) {
        if reward_block_hash.is_empty() {
            return (String::new(), 0);
        }
        let blues = match self.merge_set_blues(reward_block_hash).await {
            Ok(blues) => blues,
            Err(e) => {
                warn!(reward_block_hash, error = %e, "reward block fetch failed");
                return (String::new(), 0);
            }
        };

        for blue in blues {
            match self.miner_info(&blue).await {
                Ok((miner_info, daa_score)) => {
                    if miner_info.contains(&self.pool_tag) {
                        debug!(mined = %blue, daa_score, "mined block resolved");
                        return (blue, daa_score);
                    }
                }
                Err(e) => warn!(block = %blue, error = %e, "merge-set blue fetch failed"),
            }
        }
        (String::new(), 0)
    }

    /// REST-only fallback for a missing `tx -> block` mapping.
    pub async fn reward_block_by_tx(&self, tx_id: &str) -> Option<String> {
        let rest = self.rest.as_ref()?;
        match rest.transaction_block_hashes(tx_id).await {
            Ok(hashes) => hashes.into_iter().next(),
            Err(e) => {
                warn!(tx_id, error = %e, "explorer transaction lookup failed");
                None
            }
        }
    }

    async fn merge_set_blues(&self, block_hash: &str) -> PoolResult<Vec<String>> {
        match self.node_block(block_hash).await {
            Ok(block) => Ok(block
                .verbose_data
                .as_ref()
                .map(|v| v.merge_set_blues_hashes.iter().map(|h| h.to_string()).collect())
                .unwrap_or_default()),
            Err(node_err) => match &self.rest {
                Some(rest) => Ok(rest.block(block_hash).await?.verbose_data.merge_set_blues_hashes),
                None => Err(node_err),
            },
        }
    }

    /// Miner-info string and DAA score of a block, node first, explorer
    /// second.
    async fn miner_info(&self, block_hash: &str) -> PoolResult<(String, u64)> {
        match self.node_block(block_hash).await {
            Ok(block) => {
                let miner_info = block
                    .transactions
                    .first()
                    .map(|coinbase| String::from_utf8_lossy(&coinbase.payload).into_owned())
                    .unwrap_or_default();
                Ok((miner_info, block.header.daa_score))
            }
            Err(node_err) => match &self.rest {
                Some(rest) => {
                    let block = rest.block(block_hash).await?;
                    Ok((block.extra.miner_info, block.header.daa_score))
                }
                None => Err(node_err),
            },
        }
    }

    async fn node_block(&self, block_hash: &str) -> PoolResult<RpcBlock> {
        let hash = RpcHash::from_str(block_hash)
            .map_err(|e| PoolError::Upstream(format!("invalid block hash {block_hash}: {e}")))?;
        self.node.get_block(hash, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_block_parses_string_daa_score() {
        let json = r#"{
            "verboseData": { "mergeSetBluesHashes": ["aa", "bb"] },
            "header": { "daaScore": "38601136" },
            "extra": { "minerInfo": "0.13.4/kpool" }
        }"#;
        let block: RestBlock = serde_json::from_str(json).unwrap();
        assert_eq!(block.header.daa_score, 38_601_136);
        assert_eq!(block.verbose_data.merge_set_blues_hashes.len(), 2);
        assert_eq!(block.extra.miner_info, "0.13.4/kpool");
    }

    #[test]
    fn rest_block_parses_numeric_daa_score_and_defaults() {
        let json = r#"{ "header": { "daaScore": 77 } }"#;
        let block: RestBlock = serde_json::from_str(json).unwrap();
        assert_eq!(block.header.daa_score, 77);
        assert!(block.verbose_data.merge_set_blues_hashes.is_empty());
        assert!(block.extra.miner_info.is_empty());
    }

    #[test]
    fn rest_transaction_parses_block_hashes() {
        let json = r#"{ "block_hash": ["deadbeef"] }"#;
        let tx: RestTransaction = serde_json::from_str(json).unwrap();
        assert_eq!(tx.block_hash, vec!["deadbeef".to_string()]);
    }
}
