pub mod gateway;
pub mod types;
pub mod backends;
pub mod error;

pub use gateway::*;
pub use types::*;
pub use error::*;
