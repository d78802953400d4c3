use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine::Scheduler;
use log::info;
use tokio::time;

use crate::types::{wall_now_ms, Bot};

const DAY_MS: u64 = 86_400_000;

/// Expires DAY orders at the configured session boundary (ms past UTC
/// midnight).
pub struct ExpiryBot {
    name: String,
    session_end_utc_ms: u64,
    scheduler: Arc<Scheduler>,
    last_rollover_ms: AtomicU64,
}

impl ExpiryBot {
    pub fn new(scheduler: Arc<Scheduler>, session_end_utc_ms: u64) -> Self {
        ExpiryBot {
            name: "sessionExpiry".to_string(),
            session_end_utc_ms: session_end_utc_ms % DAY_MS,
            scheduler,
            last_rollover_ms: AtomicU64::new(0),
        }
    }

    fn next_boundary(&self, now_ms: u64) -> u64 {
        let today = now_ms - now_ms % DAY_MS + self.session_end_utc_ms;
        if today > now_ms {
            today
        } else {
            today + DAY_MS
        }
    }
}

#[async_trait]
impl Bot for ExpiryBot {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start_interval_loop(self: Arc<Self>) {
        loop {
            let now = wall_now_ms();
            let boundary = self.next_boundary(now);
            info!("{}: next session end in {}ms", self.name, boundary - now);
            time::sleep(Duration::from_millis(boundary - now)).await;
            let now = wall_now_ms();
            self.scheduler.expire_session(now);
            self.last_rollover_ms.store(now, Ordering::Relaxed);
        }
    }

    async fn health_check(&self) -> bool {
        // healthy as long as the loop has not missed a full day
        let last = self.last_rollover_ms.load(Ordering::Relaxed);
        last == 0 || wall_now_ms().saturating_sub(last) < 2 * DAY_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{EngineConfig, Exchange, MemorySink};

    fn bot(session_end: u64) -> ExpiryBot {
        let exchange = Arc::new(Exchange::new(
            EngineConfig::default(),
            Arc::new(MemorySink::default()),
        ));
        ExpiryBot::new(Arc::new(engine::Scheduler::new(exchange)), session_end)
    }

    #[test]
    fn test_next_boundary_today_and_tomorrow() {
        let bot = bot(3_600_000); // 01:00 UTC
        // 00:30 -> later today
        assert_eq!(bot.next_boundary(1_800_000), 3_600_000);
        // 02:00 -> tomorrow
        assert_eq!(bot.next_boundary(7_200_000), DAY_MS + 3_600_000);
    }
}
