use std::env;
use std::fs;

use engine::markets::PairConfig;
use engine::EngineConfig;
use serde::Deserialize;

use crate::types::{KeeperError, KeeperResult};

/// Per-bot knobs, overlaid from the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub dry_run: bool,

    pub funding_poll_ms: u64,

    pub slice_poll_ms: u64,

    /// Session rollover as milliseconds past UTC midnight; DAY orders
    /// expire there.
    pub session_end_utc_ms: u64,

    /// Directory the JSONL store sink appends to.
    pub data_dir: String,

    /// Metrics log cadence; 0 disables the loop.
    pub metrics_interval_ms: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        BotConfig {
            dry_run: false,
            funding_poll_ms: 5_000,
            slice_poll_ms: 1_000,
            session_end_utc_ms: 0,
            data_dir: "./data".to_string(),
            metrics_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub engine: EngineConfig,
    pub pairs: Vec<PairConfig>,
    pub bots: BotConfig,
}

/// Loads the JSON config named by `ENGINE_CONFIG`; absent the variable,
/// everything runs on defaults (no pairs, default fees).
pub fn load() -> KeeperResult<KeeperConfig> {
    match env::var("ENGINE_CONFIG") {
        Ok(path) => {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|err| KeeperError::Config(format!("{path}: {err}")))
        }
        Err(_) => Ok(KeeperConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_overlays_defaults() {
        let config: KeeperConfig = serde_json::from_str(
            r#"{"bots":{"funding_poll_ms":250},"engine":{"fees":{"spot_taker_bps":30}}}"#,
        )
        .unwrap();
        assert_eq!(config.bots.funding_poll_ms, 250);
        assert_eq!(config.bots.slice_poll_ms, 1_000);
        assert_eq!(config.engine.fees.spot_taker_bps, 30);
        assert!(config.pairs.is_empty());
    }
}
