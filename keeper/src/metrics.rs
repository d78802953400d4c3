use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use engine::Exchange;
use log::info;
use tokio::time;

/// RuntimeSpec is the attributes of the runtime environment, used to
/// distinguish this metric set from others.
pub struct RuntimeSpec {
    pub commit: String,
    pub env: String,
}

impl RuntimeSpec {
    pub fn from_env() -> Self {
        RuntimeSpec {
            commit: std::env::var("GIT_COMMIT").unwrap_or_else(|_| "unknown".to_string()),
            env: std::env::var("ENGINE_ENV").unwrap_or_else(|_| "dev".to_string()),
        }
    }
}

/// Point-in-time engine gauges: persistence lag and event-bus health.
pub struct EngineGauges {
    pub store_queue_depth: usize,
    pub store_last_drain_ms: u64,
    pub dropped_subscribers: u64,
    pub insurance_fund: String,
}

impl EngineGauges {
    pub fn gather(exchange: &Exchange) -> Self {
        EngineGauges {
            store_queue_depth: exchange.store().queue_depth(),
            store_last_drain_ms: exchange.store().last_drain_ms(),
            dropped_subscribers: exchange.events().dropped_subscribers(),
            insurance_fund: exchange.insurance_fund().to_string(),
        }
    }
}

impl fmt::Display for EngineGauges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "store_queue_depth={} store_last_drain_ms={} dropped_subscribers={} insurance_fund={}",
            self.store_queue_depth,
            self.store_last_drain_ms,
            self.dropped_subscribers,
            self.insurance_fund
        )
    }
}

/// Periodically logs the gauges; the log stream is the metrics transport.
pub async fn run_metrics_loop(exchange: Arc<Exchange>, spec: RuntimeSpec, interval_ms: u64) {
    if interval_ms == 0 {
        return;
    }
    let mut ticker = time::interval(Duration::from_millis(interval_ms));
    loop {
        ticker.tick().await;
        let gauges = EngineGauges::gather(&exchange);
        info!("[{}@{}] {gauges}", spec.env, spec.commit);
    }
}
