use dashmap::DashMap;
use log::info;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::math::wei::{Wei, BPS_DENOM};
use crate::types::{
    EngineError, EngineResult, MarketKind, MarketStatus, Order, OrderKind, PairId,
};

/// Perpetual-only parameters carried by a pair registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerpParams {
    pub max_leverage: u32,
    pub initial_margin_bps: u32,
    pub maintenance_margin_bps: u32,
    pub funding_interval_s: u64,
    /// Symmetric per-interval funding-rate clamp.
    pub funding_rate_cap: Wei,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub id: PairId,
    pub base: String,
    pub quote: String,
    pub kind: MarketKind,
    pub min_size: Wei,
    pub max_size: Wei,
    pub tick_size: Wei,
    pub size_increment: Wei,
    pub maker_fee_bps: u32,
    pub taker_fee_bps: u32,
    pub status: MarketStatus,
    pub perp: Option<PerpParams>,
}

impl PairConfig {
    pub fn accepts_orders(&self) -> bool {
        self.status == MarketStatus::Trading
    }
}

/// Registry of tradable pairs. Each entry is written under its own dashmap
/// shard lock; dynamic perpetual state (mark/index, open interest) lives in
/// the perpetual engine, not here.
pub struct MarketRegistry {
    pairs: DashMap<PairId, PairConfig>,
    default_max_leverage: u32,
}

impl MarketRegistry {
    pub fn new(config: &EngineConfig) -> Self {
        MarketRegistry {
            pairs: DashMap::new(),
            default_max_leverage: config.perp.default_max_leverage,
        }
    }

    pub fn register_pair(&self, mut params: PairConfig) -> EngineResult<()> {
        validate_pair_params(&mut params, self.default_max_leverage)?;
        match self.pairs.entry(params.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(EngineError::DuplicatePair(params.id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!("registered pair {} ({:?})", params.id, params.kind);
                slot.insert(params);
                Ok(())
            }
        }
    }

    pub fn get_pair(&self, id: &str) -> EngineResult<PairConfig> {
        self.pairs
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| EngineError::UnknownPair(id.to_string()))
    }

    pub fn update_status(&self, id: &str, status: MarketStatus) -> EngineResult<MarketStatus> {
        let mut entry = self
            .pairs
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownPair(id.to_string()))?;
        let previous = entry.status;
        entry.status = status;
        info!("pair {id} status {previous:?} -> {status:?}");
        Ok(previous)
    }

    pub fn pair_ids(&self) -> Vec<PairId> {
        self.pairs.iter().map(|e| e.key().clone()).collect()
    }

    pub fn perpetual_ids(&self) -> Vec<PairId> {
        self.pairs
            .iter()
            .filter(|e| e.kind == MarketKind::Perpetual)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Order admission checks shared by spot and perpetual flow: market
    /// status, side/kind agreement, tick and increment alignment, size
    /// bounds, leverage range.
    pub fn validate_order(&self, order: &Order) -> EngineResult<()> {
        let pair = self.get_pair(&order.pair)?;
        if !pair.accepts_orders() {
            return Err(EngineError::Halted(pair.id));
        }

        match pair.kind {
            MarketKind::Spot if order.side.is_perp() => {
                return Err(EngineError::InvalidParams(format!(
                    "spot pair {} takes BUY/SELL, got {:?}",
                    pair.id, order.side
                )));
            }
            MarketKind::Perpetual if !order.side.is_perp() => {
                return Err(EngineError::InvalidParams(format!(
                    "perpetual market {} takes LONG/SHORT, got {:?}",
                    pair.id, order.side
                )));
            }
            _ => {}
        }

        if order.quantity.is_zero() || order.quantity.is_negative() {
            return Err(EngineError::InvalidParams(
                "quantity must be positive".to_string(),
            ));
        }
        if order.quantity < pair.min_size || order.quantity > pair.max_size {
            return Err(EngineError::InvalidParams(format!(
                "quantity outside [{}, {}]",
                pair.min_size, pair.max_size
            )));
        }
        if !order.quantity.is_multiple_of(pair.size_increment) {
            return Err(EngineError::SizeIncrement {
                increment: pair.size_increment,
            });
        }

        let needs_price = matches!(
            order.kind,
            OrderKind::Limit | OrderKind::StopLimit | OrderKind::Iceberg | OrderKind::Oco
        );
        match order.price {
            None if needs_price => return Err(EngineError::MissingPriceForLimit),
            Some(price) => {
                if price.is_zero() || price.is_negative() {
                    return Err(EngineError::InvalidParams(
                        "price must be positive".to_string(),
                    ));
                }
                if !price.is_multiple_of(pair.tick_size) {
                    return Err(EngineError::TickSize {
                        tick: pair.tick_size,
                    });
                }
            }
            None => {}
        }
        if let Some(stop) = order.stop_price {
            if !stop.is_multiple_of(pair.tick_size) {
                return Err(EngineError::TickSize {
                    tick: pair.tick_size,
                });
            }
        }

        let max_leverage = pair
            .perp
            .as_ref()
            .map(|p| p.max_leverage)
            .unwrap_or(1);
        if order.leverage < 1 || order.leverage > max_leverage {
            return Err(EngineError::LeverageRange {
                requested: order.leverage,
                max: max_leverage,
            });
        }

        Ok(())
    }
}

fn validate_pair_params(params: &mut PairConfig, default_max_leverage: u32) -> EngineResult<()> {
    let invalid = |msg: String| Err(EngineError::InvalidParams(msg));

    if params.tick_size.is_zero() || params.tick_size.is_negative() {
        return invalid("tick_size must be positive".to_string());
    }
    if params.size_increment.is_zero() || params.size_increment.is_negative() {
        return invalid("size_increment must be positive".to_string());
    }
    if params.min_size.is_negative() || params.min_size > params.max_size {
        return invalid("min_size must be within [0, max_size]".to_string());
    }

    match (params.kind, params.perp.as_mut()) {
        (MarketKind::Spot, Some(_)) => {
            invalid("spot pair carries perpetual params".to_string())
        }
        (MarketKind::Perpetual, None) => {
            invalid("perpetual market missing perpetual params".to_string())
        }
        (MarketKind::Spot, None) => Ok(()),
        (MarketKind::Perpetual, Some(perp)) => {
            if perp.max_leverage == 0 {
                perp.max_leverage = default_max_leverage;
            }
            if perp.maintenance_margin_bps >= perp.initial_margin_bps {
                return invalid(format!(
                    "maintenance margin {} must be below initial margin {}",
                    perp.maintenance_margin_bps, perp.initial_margin_bps
                ));
            }
            if perp.initial_margin_bps == 0 {
                return invalid("initial margin must be positive".to_string());
            }
            let leverage_cap = BPS_DENOM as u32 / perp.initial_margin_bps;
            if perp.max_leverage > leverage_cap {
                return invalid(format!(
                    "max leverage {} exceeds 1e4/{} = {}",
                    perp.max_leverage, perp.initial_margin_bps, leverage_cap
                ));
            }
            if perp.funding_rate_cap.is_negative() {
                return invalid("funding rate cap must be non-negative".to_string());
            }
            if perp.funding_interval_s == 0 {
                return invalid("funding interval must be positive".to_string());
            }
            Ok(())
        }
    }
}
