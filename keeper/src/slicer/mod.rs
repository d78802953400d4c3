use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine::Scheduler;
use log::{debug, info};
use tokio::time;

use crate::types::{wall_now_ms, Bot};

/// Emits due TWAP/VWAP child slices.
pub struct SlicerBot {
    name: String,
    dry_run: bool,
    default_interval_ms: u64,
    scheduler: Arc<Scheduler>,
    last_tick_ms: AtomicU64,
}

impl SlicerBot {
    pub fn new(scheduler: Arc<Scheduler>, default_interval_ms: u64, dry_run: bool) -> Self {
        SlicerBot {
            name: "parentSlicer".to_string(),
            dry_run,
            default_interval_ms,
            scheduler,
            last_tick_ms: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Bot for SlicerBot {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start_interval_loop(self: Arc<Self>) {
        info!("{} polling every {}ms", self.name, self.default_interval_ms);
        let mut ticker = time::interval(Duration::from_millis(self.default_interval_ms));
        loop {
            ticker.tick().await;
            let now = wall_now_ms();
            self.last_tick_ms.store(now, Ordering::Relaxed);
            if self.dry_run {
                debug!("{}: dry run, skipping slices", self.name);
                continue;
            }
            self.scheduler.run_parent_slices(now);
        }
    }

    async fn health_check(&self) -> bool {
        let last = self.last_tick_ms.load(Ordering::Relaxed);
        last != 0 && wall_now_ms().saturating_sub(last) < self.default_interval_ms * 3
    }
}
