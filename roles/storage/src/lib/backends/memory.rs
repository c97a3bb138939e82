//! In-memory storage backend for testing and development.
//!
//! Data is stored in HashMap collections protected by RwLock and is lost
//! when the process stops.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{
    error::StorageResult,
    gateway::PoolPersistence,
    types::{BlockDetails, CustodianUser, MinerBalance},
};

/// In-memory implementation of [`PoolPersistence`].
#[derive(Default)]
pub struct MemoryStorage {
    balances: RwLock<HashMap<(String, String), MinerBalance>>,
    wallet_totals: RwLock<HashMap<String, u64>>,
    block_details: RwLock<HashMap<String, BlockDetails>>,
    reward_details: RwLock<HashMap<String, String>>,
    users: RwLock<HashMap<String, CustodianUser>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a custodian user (test setup helper).
    pub async fn insert_user(&self, user: CustodianUser) {
        self.users.write().await.insert(user.identifier.clone(), user);
    }
}

#[async_trait]
impl PoolPersistence for MemoryStorage {
    async fn initialize(&self) -> StorageResult<()> {
        tracing::info!("initializing memory storage backend");
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        tracing::info!("closing memory storage backend");
        self.balances.write().await.clear();
        self.wallet_totals.write().await.clear();
        self.block_details.write().await.clear();
        self.reward_details.write().await.clear();
        self.users.write().await.clear();
        Ok(())
    }

    async fn add_balance(
        &self,
        miner_id: &str,
        wallet: &str,
        amount: u64,
        rebate: u64,
    ) -> StorageResult<()> {
        let mut balances = self.balances.write().await;
        let entry = balances
            .entry((miner_id.to_string(), wallet.to_string()))
            .or_insert_with(|| MinerBalance {
                miner_id: miner_id.to_string(),
                wallet: wallet.to_string(),
                balance: 0,
                rebate: 0,
            });
        entry.balance += amount;
        entry.rebate += rebate;

        let mut totals = self.wallet_totals.write().await;
        *totals.entry(wallet.to_string()).or_insert(0) += amount;
        Ok(())
    }

    async fn get_balance(
        &self,
        miner_id: &str,
        wallet: &str,
    ) -> StorageResult<Option<MinerBalance>> {
        let balances = self.balances.read().await;
        Ok(balances
            .get(&(miner_id.to_string(), wallet.to_string()))
            .cloned())
    }

    async fn get_wallet_total(&self, wallet: &str) -> StorageResult<Option<u64>> {
        Ok(self.wallet_totals.read().await.get(wallet).copied())
    }

    async fn add_block_details(&self, details: &BlockDetails) -> StorageResult<()> {
        let mut blocks = self.block_details.write().await;
        match blocks.get_mut(&details.mined_block_hash) {
            Some(existing) => {
                // Conflict path: only reward fields and the audit column move.
                existing.reward_block_hash = details.reward_block_hash.clone();
                existing.miner_reward = details.miner_reward;
                existing.allocation_path = details.allocation_path;
            }
            None => {
                blocks.insert(details.mined_block_hash.clone(), details.clone());
            }
        }
        Ok(())
    }

    async fn get_block_details(
        &self,
        mined_block_hash: &str,
    ) -> StorageResult<Option<BlockDetails>> {
        Ok(self.block_details.read().await.get(mined_block_hash).cloned())
    }

    async fn add_reward_details(
        &self,
        reward_block_hash: &str,
        reward_tx_id: &str,
    ) -> StorageResult<()> {
        self.reward_details
            .write()
            .await
            .insert(reward_tx_id.to_string(), reward_block_hash.to_string());
        Ok(())
    }

    async fn get_reward_block_hash(&self, reward_tx_id: &str) -> StorageResult<Option<String>> {
        Ok(self.reward_details.read().await.get(reward_tx_id).cloned())
    }

    async fn get_user(&self, identifier: &str) -> StorageResult<Option<CustodianUser>> {
        Ok(self.users.read().await.get(identifier).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AllocationPath;

    fn block_details(hash: &str) -> BlockDetails {
        BlockDetails {
            mined_block_hash: hash.to_string(),
            miner_id: "kaspa:qztest.rig01".to_string(),
            pool_address: "kaspa:qzpool".to_string(),
            reward_block_hash: String::new(),
            miner_reward: 0,
            daa_score: 0,
            timestamp: 1_700_000_000,
            allocation_path: AllocationPath::Pending,
        }
    }

    #[tokio::test]
    async fn balance_credits_accumulate() {
        let storage = MemoryStorage::new();
        storage.add_balance("m1", "kaspa:qzw", 100, 3).await.unwrap();
        storage.add_balance("m1", "kaspa:qzw", 50, 2).await.unwrap();

        let balance = storage.get_balance("m1", "kaspa:qzw").await.unwrap().unwrap();
        assert_eq!(balance.balance, 150);
        assert_eq!(balance.rebate, 5);
    }

    #[tokio::test]
    async fn wallet_total_aggregates_across_miner_ids() {
        let storage = MemoryStorage::new();
        storage.add_balance("m1", "kaspa:qzw", 100, 0).await.unwrap();
        storage.add_balance("m2", "kaspa:qzw", 40, 0).await.unwrap();

        assert_eq!(storage.get_wallet_total("kaspa:qzw").await.unwrap(), Some(140));
        assert_eq!(storage.get_wallet_total("kaspa:other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn block_details_conflict_updates_reward_fields_only() {
        let storage = MemoryStorage::new();
        storage.add_block_details(&block_details("deadbeef")).await.unwrap();

        let mut update = block_details("deadbeef");
        update.miner_id = "someone-else".to_string();
        update.reward_block_hash = "cafebabe".to_string();
        update.miner_reward = 500_000_000;
        update.allocation_path = AllocationPath::DaaWindow;
        storage.add_block_details(&update).await.unwrap();

        let stored = storage.get_block_details("deadbeef").await.unwrap().unwrap();
        assert_eq!(stored.reward_block_hash, "cafebabe");
        assert_eq!(stored.miner_reward, 500_000_000);
        assert_eq!(stored.allocation_path, AllocationPath::DaaWindow);
        // miner_id comes from the provisional insert, not the upsert
        assert_eq!(stored.miner_id, "kaspa:qztest.rig01");
    }

    #[tokio::test]
    async fn reward_details_upsert_by_tx_id() {
        let storage = MemoryStorage::new();
        storage.add_reward_details("hash1", "tx1").await.unwrap();
        assert_eq!(
            storage.get_reward_block_hash("tx1").await.unwrap(),
            Some("hash1".to_string())
        );

        storage.add_reward_details("hash2", "tx1").await.unwrap();
        assert_eq!(
            storage.get_reward_block_hash("tx1").await.unwrap(),
            Some("hash2".to_string())
        );
    }

    #[tokio::test]
    async fn custodian_user_lookup() {
        let storage = MemoryStorage::new();
        storage
            .insert_user(CustodianUser {
                identifier: "user-7f2c".to_string(),
                wallet: "kaspa:qzcustodian".to_string(),
                created_at: 1_700_000_000,
            })
            .await;

        let user = storage.get_user("user-7f2c").await.unwrap().unwrap();
        assert_eq!(user.wallet, "kaspa:qzcustodian");
        assert!(storage.get_user("missing").await.unwrap().is_none());
    }
}
