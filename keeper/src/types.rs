use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub type KeeperResult<T> = Result<T, KeeperError>;

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("{0}")]
    Engine(#[from] engine::EngineError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(String),
}

/// A keeper duty with its own polling loop.
#[async_trait]
pub trait Bot: Send + Sync {
    fn name(&self) -> &str;

    /// Start the bot loop. This is generally a polling loop.
    async fn start_interval_loop(self: Arc<Self>);

    /// Returns true if bot is healthy, else false. Typically used for
    /// monitoring liveness.
    async fn health_check(&self) -> bool;
}

pub fn wall_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
