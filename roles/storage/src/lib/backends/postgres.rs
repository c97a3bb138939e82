//! Postgres storage backend.
//!
//! Production backend with full ACID guarantees. Balance credits run inside
//! an explicit transaction so the per-miner row and the per-wallet aggregate
//! can never diverge.

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::str::FromStr;

use crate::{
    error::{StorageError, StorageResult},
    gateway::PoolPersistence,
    types::{AllocationPath, BlockDetails, CustodianUser, MinerBalance},
};

/// Postgres implementation of [`PoolPersistence`].
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to the database and build the backend.
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::ConfigError(format!("database connection: {e}")))?;
        Ok(Self { pool })
    }

    async fn create_tables(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS miners_balance (
                miner_id TEXT NOT NULL,
                wallet TEXT NOT NULL,
                balance BIGINT NOT NULL DEFAULT 0,
                rebate BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (miner_id, wallet)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_total (
                wallet TEXT PRIMARY KEY,
                total BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS block_details (
                mined_block_hash TEXT PRIMARY KEY,
                miner_id TEXT NOT NULL,
                pool_address TEXT NOT NULL,
                reward_block_hash TEXT NOT NULL DEFAULT '',
                miner_reward BIGINT NOT NULL DEFAULT 0,
                daa_score BIGINT NOT NULL DEFAULT 0,
                timestamp BIGINT NOT NULL,
                allocation_path TEXT NOT NULL DEFAULT 'pending'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reward_details (
                reward_tx_id TEXT PRIMARY KEY,
                reward_block_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS custodian_users (
                identifier TEXT PRIMARY KEY,
                wallet TEXT NOT NULL,
                created_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_block_details_timestamp ON block_details(timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn to_db_amount(amount: u64, what: &str) -> StorageResult<i64> {
    i64::try_from(amount)
        .map_err(|_| StorageError::InvalidData(format!("{what} overflows BIGINT: {amount}")))
}

#[async_trait]
impl PoolPersistence for PostgresStorage {
    async fn initialize(&self) -> StorageResult<()> {
        tracing::info!("initializing postgres storage backend");
        self.create_tables().await
    }

    async fn close(&self) -> StorageResult<()> {
        tracing::info!("closing postgres storage backend");
        self.pool.close().await;
        Ok(())
    }

    async fn add_balance(
        &self,
        miner_id: &str,
        wallet: &str,
        amount: u64,
        rebate: u64,
    ) -> StorageResult<()> {
        let amount = to_db_amount(amount, "balance credit")?;
        let rebate = to_db_amount(rebate, "rebate credit")?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO miners_balance (miner_id, wallet, balance, rebate)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (miner_id, wallet)
            DO UPDATE SET balance = miners_balance.balance + EXCLUDED.balance,
                          rebate = miners_balance.rebate + EXCLUDED.rebate
            "#,
        )
        .bind(miner_id)
        .bind(wallet)
        .bind(amount)
        .bind(rebate)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO wallet_total (wallet, total)
            VALUES ($1, $2)
            ON CONFLICT (wallet)
            DO UPDATE SET total = wallet_total.total + EXCLUDED.total
            "#,
        )
        .bind(wallet)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        // An error before this point drops the transaction, which rolls back.
        tx.commit().await?;
        Ok(())
    }

    async fn get_balance(
        &self,
        miner_id: &str,
        wallet: &str,
    ) -> StorageResult<Option<MinerBalance>> {
        let row = sqlx::query(
            "SELECT balance, rebate FROM miners_balance WHERE miner_id = $1 AND wallet = $2",
        )
        .bind(miner_id)
        .bind(wallet)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| MinerBalance {
            miner_id: miner_id.to_string(),
            wallet: wallet.to_string(),
            balance: row.get::<i64, _>("balance") as u64,
            rebate: row.get::<i64, _>("rebate") as u64,
        }))
    }

    async fn get_wallet_total(&self, wallet: &str) -> StorageResult<Option<u64>> {
        let row = sqlx::query("SELECT total FROM wallet_total WHERE wallet = $1")
            .bind(wallet)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<i64, _>("total") as u64))
    }

    async fn add_block_details(&self, details: &BlockDetails) -> StorageResult<()> {
        let miner_reward = to_db_amount(details.miner_reward, "miner reward")?;
        let daa_score = to_db_amount(details.daa_score, "daa score")?;
        let timestamp = to_db_amount(details.timestamp, "timestamp")?;

        sqlx::query(
            r#"
            INSERT INTO block_details
                (mined_block_hash, miner_id, pool_address, reward_block_hash,
                 miner_reward, daa_score, timestamp, allocation_path)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (mined_block_hash)
            DO UPDATE SET reward_block_hash = EXCLUDED.reward_block_hash,
                          miner_reward = EXCLUDED.miner_reward,
                          allocation_path = EXCLUDED.allocation_path
            "#,
        )
        .bind(&details.mined_block_hash)
        .bind(&details.miner_id)
        .bind(&details.pool_address)
        .bind(&details.reward_block_hash)
        .bind(miner_reward)
        .bind(daa_score)
        .bind(timestamp)
        .bind(details.allocation_path.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_block_details(
        &self,
        mined_block_hash: &str,
    ) -> StorageResult<Option<BlockDetails>> {
        let row = sqlx::query(
            r#"
            SELECT miner_id, pool_address, reward_block_hash, miner_reward,
                   daa_score, timestamp, allocation_path
            FROM block_details WHERE mined_block_hash = $1
            "#,
        )
        .bind(mined_block_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let path: String = row.get("allocation_path");
            Ok(BlockDetails {
                mined_block_hash: mined_block_hash.to_string(),
                miner_id: row.get("miner_id"),
                pool_address: row.get("pool_address"),
                reward_block_hash: row.get("reward_block_hash"),
                miner_reward: row.get::<i64, _>("miner_reward") as u64,
                daa_score: row.get::<i64, _>("daa_score") as u64,
                timestamp: row.get::<i64, _>("timestamp") as u64,
                allocation_path: AllocationPath::from_str(&path)
                    .map_err(StorageError::InvalidData)?,
            })
        })
        .transpose()
    }

    async fn add_reward_details(
        &self,
        reward_block_hash: &str,
        reward_tx_id: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reward_details (reward_tx_id, reward_block_hash)
            VALUES ($1, $2)
            ON CONFLICT (reward_tx_id)
            DO UPDATE SET reward_block_hash = EXCLUDED.reward_block_hash
            "#,
        )
        .bind(reward_tx_id)
        .bind(reward_block_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_reward_block_hash(&self, reward_tx_id: &str) -> StorageResult<Option<String>> {
        let row = sqlx::query("SELECT reward_block_hash FROM reward_details WHERE reward_tx_id = $1")
            .bind(reward_tx_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("reward_block_hash")))
    }

    async fn get_user(&self, identifier: &str) -> StorageResult<Option<CustodianUser>> {
        let row = sqlx::query(
            "SELECT wallet, created_at FROM custodian_users WHERE identifier = $1",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| CustodianUser {
            identifier: identifier.to_string(),
            wallet: row.get("wallet"),
            created_at: row.get::<i64, _>("created_at") as u64,
        }))
    }
}
