//! Trait interface for the pool's persistence backends.

use async_trait::async_trait;

use crate::{
    error::StorageResult,
    types::{BlockDetails, CustodianUser, MinerBalance},
};

/// Trait defining the ACID surface the pool needs from a relational store.
///
/// This trait abstracts the persistence layer so different backends
/// (Postgres for production, in-memory for tests) can be used
/// interchangeably. Every write either commits atomically or rolls back and
/// propagates its error; no operation may leave a partial credit behind.
#[async_trait]
pub trait PoolPersistence: Send + Sync {
    /// Initialize the backend (create tables, verify connectivity)
    async fn initialize(&self) -> StorageResult<()>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;

    // === Balances ===

    /// Credit `amount` and `rebate` (sompi) to the `(miner_id, wallet)` pair
    /// and to the per-wallet aggregate, in one transaction.
    ///
    /// Both counters are read-modify-write and idempotent on key conflict:
    /// an existing row is incremented, a missing row is created.
    async fn add_balance(
        &self,
        miner_id: &str,
        wallet: &str,
        amount: u64,
        rebate: u64,
    ) -> StorageResult<()>;

    /// Current counters for one `(miner_id, wallet)` pair
    async fn get_balance(&self, miner_id: &str, wallet: &str)
        -> StorageResult<Option<MinerBalance>>;

    /// Aggregate credited sompi for a wallet across all its miner ids
    async fn get_wallet_total(&self, wallet: &str) -> StorageResult<Option<u64>>;

    // === Block details ===

    /// Insert or upsert a block-detail row keyed by `mined_block_hash`.
    ///
    /// On conflict only `reward_block_hash`, `miner_reward` and
    /// `allocation_path` are updated; the provisional fields written at
    /// submit time are preserved.
    async fn add_block_details(&self, details: &BlockDetails) -> StorageResult<()>;

    /// Fetch a block-detail row by mined block hash
    async fn get_block_details(&self, mined_block_hash: &str)
        -> StorageResult<Option<BlockDetails>>;

    // === Reward mapping ===

    /// Upsert the `reward_tx_id -> reward_block_hash` mapping
    async fn add_reward_details(
        &self,
        reward_block_hash: &str,
        reward_tx_id: &str,
    ) -> StorageResult<()>;

    /// Single-row lookup of the block hash a reward transaction was mined in
    async fn get_reward_block_hash(&self, reward_tx_id: &str) -> StorageResult<Option<String>>;

    // === Custodian users ===

    /// Resolve a non-protocol authorize identifier against the custodian
    /// user table.
    async fn get_user(&self, identifier: &str) -> StorageResult<Option<CustodianUser>>;
}
