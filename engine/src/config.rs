use serde::{Deserialize, Serialize};

use crate::math::wei::Wei;

/// Engine-wide configuration. Every field has a production default so a
/// bare `EngineConfig::default()` runs; the keeper overlays JSON/env.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fees: FeeConfig,
    pub perp: PerpConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub events: EventsConfig,
    pub risk: RiskConfig,
}

/// Fees in basis points applied to quote notional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub spot_maker_bps: u32,
    pub spot_taker_bps: u32,
    pub perp_maker_bps: u32,
    pub perp_taker_bps: u32,
    /// Liquidation fee credited to the insurance fund.
    pub liquidation_bps: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        FeeConfig {
            spot_maker_bps: 10,
            spot_taker_bps: 20,
            perp_maker_bps: 10,
            perp_taker_bps: 20,
            liquidation_bps: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerpConfig {
    /// Cap applied when a market registration omits its own.
    pub default_max_leverage: u32,
    pub funding_interval_seconds: u64,
    /// Symmetric clamp on the per-interval funding rate.
    pub funding_rate_cap: Wei,
}

impl Default for PerpConfig {
    fn default() -> Self {
        PerpConfig {
            default_max_leverage: 20,
            funding_interval_seconds: 3600,
            funding_rate_cap: "0.0075".parse().expect("static literal"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Mark updates closer together than this are coalesced.
    pub mark_quiescent_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            mark_quiescent_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Write-queue high-water mark; producers block once reached.
    pub queue_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            queue_capacity: 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// A subscriber that stalls `publish` longer than this is dropped.
    pub subscriber_timeout_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        EventsConfig {
            subscriber_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub self_trade_prevent: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            self_trade_prevent: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let config = EngineConfig::default();
        assert_eq!(config.fees.liquidation_bps, 50);
        assert_eq!(config.perp.funding_rate_cap, "0.0075".parse().unwrap());
        assert!(config.risk.self_trade_prevent);
    }

    #[test]
    fn test_partial_json_overlay() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"fees":{"spot_taker_bps":25}}"#).unwrap();
        assert_eq!(config.fees.spot_taker_bps, 25);
        // untouched sections keep defaults
        assert_eq!(config.fees.spot_maker_bps, 10);
        assert_eq!(config.store.queue_capacity, 8192);
    }
}
