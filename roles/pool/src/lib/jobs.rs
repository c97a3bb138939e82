//! Job registry and template cache.
//!
//! Every accepted block template is cached together with its proof-of-work
//! state and assigned a compact job identifier that the stratum wire can
//! carry. The registry and the cache are a single structure so their key
//! sets can never diverge: a job id resolves to a template for exactly as
//! long as the template lives, and both are expired together in insertion
//! order once the cache exceeds its configured size.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use kaspa_consensus_core::hashing;
use kaspa_consensus_core::header::Header;
use kaspa_hashes::Hash;
use kaspa_math::Uint256;
use kaspa_pow::State as PowState;
use kaspa_rpc_core::{RpcRawBlock, RpcRawHeader};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::PoolResult;

/// A cached block template and everything needed to validate work against it.
pub struct Template {
    /// Hash of the template header as received (nonce still zero)
    pub header_hash: Hash,
    /// Hash the miners grind on (nonce and timestamp zeroed)
    pub pre_pow_hash: Hash,
    /// The raw block, kept verbatim for submission
    pub block: RpcRawBlock,
    /// Proof-of-work state derived from the header
    pub pow: PowState,
    /// DAA score of the template
    pub daa_score: u64,
    /// Header timestamp, used by the Bitmain notify encoding
    pub timestamp: u64,
    /// Network target the block itself must meet
    pub block_target: Uint256,
}

impl Template {
    /// Build a template from a raw block received from the node.
    pub fn from_block(block: RpcRawBlock) -> Self {
        let header = consensus_header(&block.header);
        let pre_pow_hash = hashing::header::hash_override_nonce_time(&header, 0, 0);
        let pow = PowState::new(&header);
        let block_target = Uint256::from_compact_target_bits(header.bits);
        Template {
            header_hash: header.hash,
            pre_pow_hash,
            daa_score: header.daa_score,
            timestamp: header.timestamp,
            block,
            pow,
            block_target,
        }
    }
}

/// Rebuild a consensus header from the raw RPC form, finalizing its hash.
pub fn consensus_header(raw: &RpcRawHeader) -> Header {
    Header::new_finalized(
        raw.version,
        raw.parents_by_level.clone(),
        raw.hash_merkle_root,
        raw.accepted_id_merkle_root,
        raw.utxo_commitment,
        raw.timestamp,
        raw.bits,
        raw.nonce,
        raw.daa_score,
        raw.blue_work,
        raw.blue_score,
        raw.pruning_point,
    )
}

/// Outcome of forwarding a block to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { block_hash: Hash },
    Rejected { reason: String },
}

/// Seam between share validation and the upstream node: applied when a share
/// meets the network target.
#[async_trait]
pub trait BlockSubmitter: Send + Sync {
    async fn submit_block(&self, template: &Template, nonce: u64) -> PoolResult<SubmitOutcome>;
}

struct JobStoreInner {
    next_id: u32,
    max_size: usize,
    order: VecDeque<Hash>,
    by_hash: HashMap<Hash, (String, Arc<Template>)>,
    by_id: HashMap<String, Hash>,
}

/// Bounded template cache with the job registry kept in lockstep.
pub struct JobStore {
    inner: RwLock<JobStoreInner>,
}

impl JobStore {
    pub fn new(max_size: usize) -> Self {
        JobStore {
            inner: RwLock::new(JobStoreInner {
                next_id: 0,
                max_size,
                order: VecDeque::new(),
                by_hash: HashMap::new(),
                by_id: HashMap::new(),
            }),
        }
    }

    /// Insert a template, deriving a fresh job id.
    ///
    /// Idempotent on the header hash: re-inserting an already cached
    /// template returns the existing job unchanged.
    pub async fn insert(&self, template: Template) -> (String, Arc<Template>) {
        let mut inner = self.inner.write().await;
        let hash = template.header_hash;
        if let Some((job_id, existing)) = inner.by_hash.get(&hash) {
            return (job_id.clone(), existing.clone());
        }

        let job_id = format!("{:x}", inner.next_id);
        inner.next_id = inner.next_id.wrapping_add(1);
        let template = Arc::new(template);
        inner.order.push_back(hash);
        inner.by_id.insert(job_id.clone(), hash);
        inner.by_hash.insert(hash, (job_id.clone(), template.clone()));

        while inner.order.len() > inner.max_size {
            expire_oldest(&mut inner);
        }

        debug!(job_id = %job_id, daa_score = template.daa_score, "new job cached");
        (job_id, template)
    }

    /// Resolve a job id to its template.
    pub async fn get(&self, job_id: &str) -> Option<Arc<Template>> {
        let inner = self.inner.read().await;
        let hash = inner.by_id.get(job_id)?;
        inner.by_hash.get(hash).map(|(_, t)| t.clone())
    }

    /// Header hash a job id refers to.
    pub async fn get_hash(&self, job_id: &str) -> Option<Hash> {
        self.inner.read().await.by_id.get(job_id).copied()
    }

    /// DAA score of a job's template.
    pub async fn get_daa_score(&self, job_id: &str) -> Option<u64> {
        self.get(job_id).await.map(|t| t.daa_score)
    }

    /// Lookup by header hash.
    pub async fn get_by_hash(&self, hash: &Hash) -> Option<Arc<Template>> {
        let inner = self.inner.read().await;
        inner.by_hash.get(hash).map(|(_, t)| t.clone())
    }

    /// Expire the oldest job/template pair.
    pub async fn expire_next(&self) {
        let mut inner = self.inner.write().await;
        expire_oldest(&mut inner);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }
}

fn expire_oldest(inner: &mut JobStoreInner) {
    if let Some(hash) = inner.order.pop_front() {
        if let Some((job_id, _)) = inner.by_hash.remove(&hash) {
            inner.by_id.remove(&job_id);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::template;
    use super::*;

    #[tokio::test]
    async fn job_ids_are_monotonic_short_hex() {
        let store = JobStore::new(8);
        let (id0, _) = store.insert(template(10)).await;
        let (id1, _) = store.insert(template(11)).await;
        assert_eq!(id0, "0");
        assert_eq!(id1, "1");
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_header_hash() {
        let store = JobStore::new(8);
        let (id0, _) = store.insert(template(10)).await;
        let (id1, _) = store.insert(template(10)).await;
        assert_eq!(id0, id1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn eviction_keeps_registry_and_cache_in_lockstep() {
        let store = JobStore::new(2);
        let (id0, t0) = store.insert(template(10)).await;
        store.insert(template(11)).await;
        store.insert(template(12)).await;

        // oldest evicted from both maps
        assert_eq!(store.len().await, 2);
        assert!(store.get(&id0).await.is_none());
        assert!(store.get_hash(&id0).await.is_none());
        assert!(store.get_by_hash(&t0.header_hash).await.is_none());
    }

    #[tokio::test]
    async fn resolves_job_metadata() {
        let store = JobStore::new(4);
        let (id, t) = store.insert(template(42)).await;
        assert_eq!(store.get_daa_score(&id).await, Some(42));
        assert_eq!(store.get_hash(&id).await, Some(t.header_hash));
    }

    #[tokio::test]
    async fn expire_next_removes_in_insertion_order() {
        let store = JobStore::new(8);
        let (id0, _) = store.insert(template(10)).await;
        let (id1, _) = store.insert(template(11)).await;
        store.expire_next().await;
        assert!(store.get(&id0).await.is_none());
        assert!(store.get(&id1).await.is_some());
    }
}
