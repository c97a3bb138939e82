//! Reward allocator: turns matured coinbases into proportional balance
//! credits.
//!
//! Two allocation paths coexist. The primary path drains the share window up
//! to the mined block's DAA score. When the mined block cannot be resolved
//! (or the window is empty) a lower-fidelity fallback synthesizes shares
//! from currently active workers. The path taken is recorded in
//! `block_details` for auditability.

use std::collections::HashMap;
use std::sync::Arc;

use storage_kas::{AllocationPath, BlockDetails, PoolPersistence};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::PoolResult;
use crate::metrics::unix_now;
use crate::shares::ShareManager;
use crate::treasury::{CoinbaseEvent, MinedBlockResolver};
use crate::utils::ShutdownMessage;

/// Synthetic account the fee residual is credited to.
const POOL_ACCOUNT: &str = "pool";

/// One balance credit produced by an allocation round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credit {
    pub miner_id: String,
    pub address: String,
    pub amount: u64,
    pub rebate: u64,
}

pub struct RewardAllocator {
    shares: Arc<ShareManager>,
    storage: Arc<dyn PoolPersistence>,
    resolver: Arc<MinedBlockResolver>,
    pool_address: String,
    rebate_bps: u64,
}

impl RewardAllocator {
    pub fn new(
        shares: Arc<ShareManager>,
        storage: Arc<dyn PoolPersistence>,
        resolver: Arc<MinedBlockResolver>,
        pool_address: String,
        rebate_bps: u64,
    ) -> Arc<Self> {
        Arc::new(RewardAllocator {
            shares,
            storage,
            resolver,
            pool_address,
            rebate_bps,
        })
    }

    /// Consume coinbase events until shutdown.
    pub async fn run(
        self: Arc<Self>,
        coinbase_rx: async_channel::Receiver<CoinbaseEvent>,
        mut shutdown: broadcast::Receiver<ShutdownMessage>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = coinbase_rx.recv() => {
                    match event {
                        Ok(event) => {
                            if let Err(e) = self.handle(event).await {
                                warn!(error = %e, "allocation failed");
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    }

    async fn handle(&self, event: CoinbaseEvent) -> PoolResult<()> {
        let mut reward_block_hash = event.reward_block_hash.clone();
        if reward_block_hash.is_empty() {
            if let Some(hash) = self.resolver.reward_block_by_tx(&event.tx_id).await {
                reward_block_hash = hash;
            }
        }

        let (mined_block_hash, mined_daa) = self.resolver.resolve(&reward_block_hash).await;

        let primary = if mined_daa > 0 {
            self.shares.drain_window(mined_daa).await
        } else {
            Vec::new()
        };

        let (path, works) = if primary.is_empty() {
            let weights = self.shares.fallback_weights().await;
            (AllocationPath::TimeWeighted, aggregate(weights))
        } else {
            let contributions = primary
                .into_iter()
                .map(|c| {
                    let miner_id = format!("{}.{}", c.address, c.worker_name);
                    (miner_id, c.address, c.difficulty)
                })
                .collect();
            (AllocationPath::DaaWindow, aggregate(contributions))
        };

        // block_details carries the gross reward (miner reward + pool fee);
        // flag it so operators know which convention this pool uses.
        let gross = event.miner_reward + event.pool_fee;
        warn!(
            tx_id = %event.tx_id,
            gross,
            "recording gross reward (miner reward + pool fee) in block details"
        );

        let details_key = if !mined_block_hash.is_empty() {
            mined_block_hash.clone()
        } else if !reward_block_hash.is_empty() {
            reward_block_hash.clone()
        } else {
            event.tx_id.clone()
        };
        let details = BlockDetails {
            mined_block_hash: details_key,
            miner_id: works
                .first()
                .map(|(miner_id, _, _)| miner_id.clone())
                .unwrap_or_default(),
            pool_address: self.pool_address.clone(),
            reward_block_hash: reward_block_hash.clone(),
            miner_reward: gross,
            daa_score: mined_daa,
            timestamp: unix_now(),
            allocation_path: path,
        };
        self.storage.add_block_details(&details).await?;

        if works.is_empty() {
            warn!(tx_id = %event.tx_id, "no work to allocate against; reward left unassigned");
            return Ok(());
        }

        let (credits, pool_residual) =
            allocate(&works, event.miner_reward, event.pool_fee, self.rebate_bps);
        let total_work: u64 = works.iter().map(|(_, _, work)| *work).sum();
        info!(
            tx_id = %event.tx_id,
            path = path.as_str(),
            addresses = credits.len(),
            total_work,
            miner_reward = event.miner_reward,
            "allocating coinbase"
        );

        for credit in &credits {
            if let Err(e) = self
                .storage
                .add_balance(&credit.miner_id, &credit.address, credit.amount, credit.rebate)
                .await
            {
                warn!(
                    address = %credit.address,
                    amount = credit.amount,
                    error = %e,
                    "balance credit failed; transaction rolled back"
                );
            }
        }

        if event.pool_fee > 0 && pool_residual > 0 {
            self.storage
                .add_balance(POOL_ACCOUNT, &self.pool_address, pool_residual, 0)
                .await?;
        }
        Ok(())
    }
}

/// Aggregate per-worker entries into per-address work totals. The first-seen
/// miner id stays associated with the address for display.
fn aggregate(entries: Vec<(String, String, u64)>) -> Vec<(String, String, u64)> {
    let mut order = Vec::new();
    let mut totals: HashMap<String, (String, u64)> = HashMap::new();
    for (miner_id, address, work) in entries {
        match totals.get_mut(&address) {
            Some((_, total)) => *total += work,
            None => {
                order.push(address.clone());
                totals.insert(address, (miner_id, work));
            }
        }
    }
    order
        .into_iter()
        .filter_map(|address| {
            totals
                .remove(&address)
                .map(|(miner_id, work)| (miner_id, address, work))
        })
        .collect()
}

/// Proportional split with scaled integer division.
///
/// Conservation: the sum of all credits never exceeds the reward; every
/// fractional sompi lands in the returned pool residual together with the
/// unrebated part of the fee.
fn allocate(
    works: &[(String, String, u64)],
    miner_reward: u64,
    pool_fee: u64,
    rebate_bps: u64,
) -> (Vec<Credit>, u64) {
    let total_work: u128 = works.iter().map(|(_, _, work)| *work as u128).sum();
    if total_work == 0 {
        return (Vec::new(), 0);
    }

    let rebate_pool = (pool_fee as u128 * rebate_bps as u128 / 10_000) as u64;
    let mut credited = 0u64;
    let mut rebated = 0u64;
    let mut credits = Vec::with_capacity(works.len());

    for (miner_id, address, work) in works {
        let work = *work as u128;
        let amount = (work * 100 * miner_reward as u128) / (total_work * 100);
        let rebate = (work * 100 * rebate_pool as u128) / (total_work * 100);
        let amount = amount as u64;
        let rebate = rebate as u64;
        credited += amount;
        rebated += rebate;
        credits.push(Credit {
            miner_id: miner_id.clone(),
            address: address.clone(),
            amount,
            rebate,
        });
    }

    let residual = (miner_reward - credited) + (pool_fee - rebated);
    (credits, residual)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn works() -> Vec<(String, String, u64)> {
        vec![
            ("kaspa:qza.rig01".to_string(), "kaspa:qza".to_string(), 300),
            ("kaspa:qzb.rig01".to_string(), "kaspa:qzb".to_string(), 100),
        ]
    }

    #[test]
    fn allocation_splits_proportionally() {
        // 1 KAS coinbase at 2% fee: miner reward 980M, fee 20M, rebate 3.3%
        let (credits, residual) = allocate(&works(), 980_000_000, 20_000_000, 330);
        assert_eq!(credits.len(), 2);
        assert_eq!(credits[0].amount, 735_000_000);
        assert_eq!(credits[1].amount, 245_000_000);
        assert_eq!(credits[0].rebate, 495_000);
        assert_eq!(credits[1].rebate, 165_000);
        // pool keeps the fee minus the rebate pool
        assert_eq!(residual, 20_000_000 - 660_000);
    }

    #[test]
    fn conservation_holds_with_awkward_divisions() {
        let works = vec![
            ("a.w".to_string(), "a".to_string(), 7),
            ("b.w".to_string(), "b".to_string(), 11),
            ("c.w".to_string(), "c".to_string(), 13),
        ];
        let miner_reward = 999_999_999;
        let pool_fee = 1_000_003;
        let (credits, residual) = allocate(&works, miner_reward, pool_fee, 330);

        let credited: u64 = credits.iter().map(|c| c.amount).sum();
        let rebated: u64 = credits.iter().map(|c| c.rebate).sum();
        assert!(credited <= miner_reward);
        assert_eq!(credited + rebated + residual, miner_reward + pool_fee);
    }

    #[test]
    fn zero_work_allocates_nothing() {
        let works = vec![("a.w".to_string(), "a".to_string(), 0)];
        let (credits, residual) = allocate(&works, 1_000, 100, 330);
        assert!(credits.is_empty());
        assert_eq!(residual, 0);
    }

    #[test]
    fn aggregate_sums_by_address_keeping_first_miner_id() {
        let entries = vec![
            ("kaspa:qza.rig01".to_string(), "kaspa:qza".to_string(), 100),
            ("kaspa:qza.rig02".to_string(), "kaspa:qza".to_string(), 200),
            ("kaspa:qzb.rig01".to_string(), "kaspa:qzb".to_string(), 50),
        ];
        let aggregated = aggregate(entries);
        assert_eq!(aggregated.len(), 2);
        assert_eq!(
            aggregated[0],
            ("kaspa:qza.rig01".to_string(), "kaspa:qza".to_string(), 300)
        );
        assert_eq!(
            aggregated[1],
            ("kaspa:qzb.rig01".to_string(), "kaspa:qzb".to_string(), 50)
        );
    }

    #[test]
    fn rebate_disabled_leaves_full_fee_with_pool() {
        let (credits, residual) = allocate(&works(), 980_000_000, 20_000_000, 0);
        assert!(credits.iter().all(|c| c.rebate == 0));
        assert_eq!(residual, 20_000_000);
    }
}
