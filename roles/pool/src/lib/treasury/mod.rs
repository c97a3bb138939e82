//! Treasury pipeline: block-added scanning, coinbase maturity and the
//! reward-block mapping.

pub mod resolver;
pub mod tracker;
pub mod utxo;

pub use resolver::{MinedBlockResolver, RestClient};
pub use tracker::TreasuryTracker;
pub use utxo::UtxoBridge;

/// Emitted once per matured coinbase the pool earned; consumed by the
/// reward allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseEvent {
    /// Reward net of the pool fee, in sompi
    pub miner_reward: u64,
    /// Pool fee share, in sompi
    pub pool_fee: u64,
    /// Hash of the chain block whose coinbase paid out (empty when
    /// unresolved)
    pub reward_block_hash: String,
    /// Coinbase transaction id
    pub tx_id: String,
    /// DAA score of the block the coinbase was created in
    pub daa_score: u64,
}

/// Maturity report crossing the UTXO-processor boundary.
#[derive(Debug, Clone)]
pub struct MaturityEvent {
    pub tx_id: String,
    /// Matured value, in sompi
    pub amount: u64,
    pub block_daa_score: u64,
    pub is_coinbase: bool,
}
