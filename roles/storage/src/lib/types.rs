//! Data types persisted by the pool's relational gateway.

use serde::{Deserialize, Serialize};

/// Balance counters for one `(miner_id, wallet)` pair.
///
/// Both counters only ever grow; payouts are executed by an external job and
/// are not part of this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinerBalance {
    /// First-seen miner identifier associated with the wallet (display only)
    pub miner_id: String,
    /// Payout wallet address (or custodian user identifier)
    pub wallet: String,
    /// Credited reward, in sompi
    pub balance: u64,
    /// Credited fee rebate, in sompi
    pub rebate: u64,
}

/// Which allocation path produced the credits for a mined block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AllocationPath {
    /// Row inserted provisionally at submit time, not yet allocated
    Pending,
    /// Shares drained from the DAA-score window
    DaaWindow,
    /// Time-weighted synthetic shares from active workers (fallback)
    TimeWeighted,
}

impl AllocationPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationPath::Pending => "pending",
            AllocationPath::DaaWindow => "daa_window",
            AllocationPath::TimeWeighted => "time_weighted",
        }
    }
}

impl std::str::FromStr for AllocationPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AllocationPath::Pending),
            "daa_window" => Ok(AllocationPath::DaaWindow),
            "time_weighted" => Ok(AllocationPath::TimeWeighted),
            other => Err(format!("unknown allocation path: {other}")),
        }
    }
}

/// Detail row for a block the pool mined.
///
/// Inserted provisionally (empty reward fields) when the block is forwarded
/// to the node, then completed by the allocator once the coinbase matures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockDetails {
    /// Hash of the block the pool mined (primary key)
    pub mined_block_hash: String,
    /// Miner that found the block
    pub miner_id: String,
    /// Pool treasury address the coinbase pays to
    pub pool_address: String,
    /// Hash of the chain block whose coinbase paid the reward
    pub reward_block_hash: String,
    /// Gross reward (miner reward + pool fee), in sompi
    pub miner_reward: u64,
    /// DAA score of the mined block (0 when unresolved)
    pub daa_score: u64,
    /// Unix timestamp of the row
    pub timestamp: u64,
    /// Allocation path used for the credits
    pub allocation_path: AllocationPath,
}

/// Mapping from a coinbase reward transaction to its containing block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardDetails {
    pub reward_tx_id: String,
    pub reward_block_hash: String,
}

/// A custodian-managed user whose identifier stands in for a payout address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustodianUser {
    /// Opaque identifier miners authorize with
    pub identifier: String,
    /// Wallet the custodian settles this user against
    pub wallet: String,
    /// Unix timestamp of registration
    pub created_at: u64,
}
