use serde::{Deserialize, Serialize};

use crate::math::wei::Wei;

/// One aggregated price level: displayed size summed across the FIFO queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelView {
    pub price: Wei,
    pub size: Wei,
}

/// Depth snapshot. Bids are ordered best (highest) first, asks best
/// (lowest) first; hidden iceberg quantity is not included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub pair: String,
    pub bids: Vec<LevelView>,
    pub asks: Vec<LevelView>,
    pub ts_ms: u64,
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<Wei> {
        self.bids.first().map(|level| level.price)
    }

    pub fn best_ask(&self) -> Option<Wei> {
        self.asks.first().map(|level| level.price)
    }
}
