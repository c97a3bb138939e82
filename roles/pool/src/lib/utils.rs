//! Small shared types.

/// Broadcast on the shutdown channel.
#[derive(Debug, Clone)]
pub enum ShutdownMessage {
    ShutdownAll,
}
