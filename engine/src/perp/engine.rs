use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::{error, info, warn};
use uuid::Uuid;

use crate::collateral::CollateralLedger;
use crate::event_emitter::{EngineEvent, EventEmitter};
use crate::markets::{PairConfig, PerpParams};
use crate::math::margin::{
    funding_payment, funding_rate, is_liquidatable, liquidation_price, required_margin,
};
use crate::math::wei::Wei;
use crate::store::{PositionRow, StoreHandle};
use crate::types::{
    EngineError, EngineResult, OwnerId, PairId, Position, PositionId, PositionSide,
    PositionStatus,
};

/// Everything one perpetual market owns, guarded by a single mutex so mark
/// updates, funding passes, liquidations and position flow are totally
/// ordered per market.
struct MarketState {
    params: PerpParams,
    quote: String,
    mark: Wei,
    index: Wei,
    open_interest: Wei,
    last_funding_ms: u64,
    positions: HashMap<PositionId, Position>,
    open_by_key: HashMap<(OwnerId, PositionSide), PositionId>,
}

/// Full position snapshot with mark-dependent fields resolved.
#[derive(Debug, Clone)]
pub struct PositionView {
    pub position: Position,
    pub mark: Wei,
    pub unrealized_pnl: Wei,
}

/// Perpetual position, margin, funding and liquidation engine (it never
/// matches orders; the integration layer feeds it fills).
pub struct PerpEngine {
    markets: DashMap<PairId, Mutex<MarketState>>,
    insurance_fund: Mutex<Wei>,
    liquidation_bps: u32,
    ledger: Arc<CollateralLedger>,
    events: Arc<EventEmitter>,
    store: StoreHandle,
}

impl PerpEngine {
    pub fn new(
        liquidation_bps: u32,
        ledger: Arc<CollateralLedger>,
        events: Arc<EventEmitter>,
        store: StoreHandle,
    ) -> Self {
        PerpEngine {
            markets: DashMap::new(),
            insurance_fund: Mutex::new(Wei::zero()),
            liquidation_bps,
            ledger,
            events,
            store,
        }
    }

    /// Registers the dynamic state for a perpetual pair. Mark and index
    /// start unset and arrive through the scheduler.
    pub fn register_market(&self, pair: &PairConfig) -> EngineResult<()> {
        let params = pair
            .perp
            .clone()
            .ok_or_else(|| EngineError::InvalidParams(format!("{} is not perpetual", pair.id)))?;
        self.markets.insert(
            pair.id.clone(),
            Mutex::new(MarketState {
                params,
                quote: pair.quote.clone(),
                mark: Wei::zero(),
                index: Wei::zero(),
                open_interest: Wei::zero(),
                last_funding_ms: 0,
                positions: HashMap::new(),
                open_by_key: HashMap::new(),
            }),
        );
        Ok(())
    }

    pub fn insurance_fund(&self) -> Wei {
        *self.insurance_fund.lock().expect("insurance lock")
    }

    pub fn ledger(&self) -> &Arc<CollateralLedger> {
        &self.ledger
    }

    pub fn mark_price(&self, market: &str) -> EngineResult<Wei> {
        let state = self.market(market)?;
        let state = state.lock().expect("market lock");
        Ok(state.mark)
    }

    pub fn index_price(&self, market: &str) -> EngineResult<Wei> {
        let state = self.market(market)?;
        let state = state.lock().expect("market lock");
        Ok(state.index)
    }

    pub fn open_interest(&self, market: &str) -> EngineResult<Wei> {
        let state = self.market(market)?;
        let state = state.lock().expect("market lock");
        Ok(state.open_interest)
    }

    pub fn last_funding_ms(&self, market: &str) -> EngineResult<u64> {
        let state = self.market(market)?;
        let state = state.lock().expect("market lock");
        Ok(state.last_funding_ms)
    }

    pub fn funding_interval_ms(&self, market: &str) -> EngineResult<u64> {
        let state = self.market(market)?;
        let state = state.lock().expect("market lock");
        Ok(state.params.funding_interval_s * 1000)
    }

    /// Anchors the funding clock for a market that has never settled, so
    /// the first interval starts now instead of at the epoch.
    pub fn seed_funding_clock(&self, market: &str, now_ms: u64) -> EngineResult<()> {
        let state = self.market(market)?;
        let mut state = state.lock().expect("market lock");
        if state.last_funding_ms == 0 {
            state.last_funding_ms = now_ms;
        }
        Ok(())
    }

    pub fn get_position(&self, market: &str, position_id: &PositionId) -> EngineResult<PositionView> {
        let state = self.market(market)?;
        let state = state.lock().expect("market lock");
        let position = state
            .positions
            .get(position_id)
            .ok_or(EngineError::PositionNotFound(*position_id))?;
        Ok(PositionView {
            position: position.clone(),
            mark: state.mark,
            unrealized_pnl: position.unrealized_pnl(state.mark)?,
        })
    }

    /// The single OPEN position for `(owner, market, side)`, if any.
    pub fn find_open(
        &self,
        market: &str,
        owner: &str,
        side: PositionSide,
    ) -> EngineResult<Option<Position>> {
        let state = self.market(market)?;
        let state = state.lock().expect("market lock");
        Ok(state
            .open_by_key
            .get(&(owner.to_string(), side))
            .and_then(|id| state.positions.get(id))
            .cloned())
    }

    /// Opens or aggregates a position at `fill_price`.
    ///
    /// Margin comes out of the owner's free quote collateral; the owner
    /// ledger shard is always taken before the market lock.
    pub fn open_position(
        &self,
        owner: &str,
        market: &str,
        side: PositionSide,
        size: Wei,
        leverage: u32,
        fill_price: Wei,
        now_ms: u64,
    ) -> EngineResult<Position> {
        if size.is_zero() || size.is_negative() {
            return Err(EngineError::InvalidParams("size must be positive".to_string()));
        }
        let state = self.market(market)?;
        // Validate leverage against market params without holding the lock
        // across the ledger call.
        let quote = {
            let state = state.lock().expect("market lock");
            let max = state.params.max_leverage;
            if leverage < 1 || leverage > max {
                return Err(EngineError::LeverageRange {
                    requested: leverage,
                    max,
                });
            }
            state.quote.clone()
        };

        let margin = required_margin(size, fill_price, leverage)?;
        self.ledger
            .debit(owner, &quote, margin)
            .map_err(|err| match err {
                EngineError::InsufficientBalance { required, available } => {
                    EngineError::InsufficientMargin { required, available }
                }
                other => other,
            })?;

        let mut state = state.lock().expect("market lock");
        // First trade on a market before any oracle sample seeds the mark.
        if state.mark.is_zero() {
            state.mark = fill_price;
        }

        let key = (owner.to_string(), side);
        let position = match state.open_by_key.get(&key).copied() {
            Some(existing_id) => {
                let maintenance_bps = state.params.maintenance_margin_bps;
                let position = state
                    .positions
                    .get_mut(&existing_id)
                    .expect("indexed position exists");
                // Aggregate: size-weighted entry, summed margin, same id.
                let old_notional = position.entry_price.mul_wei(position.size)?;
                let add_notional = fill_price.mul_wei(size)?;
                let total_size = position.size.checked_add(size)?;
                position.entry_price = old_notional
                    .checked_add(add_notional)?
                    .div_wei(total_size)?;
                position.size = total_size;
                position.margin = position.margin.checked_add(margin)?;
                position.liquidation_price = liquidation_price(
                    position.entry_price,
                    position.leverage,
                    maintenance_bps,
                    side,
                )?;
                position.updated_at_ms = now_ms;
                position.clone()
            }
            None => {
                let position = Position {
                    id: Uuid::new_v4(),
                    owner: owner.to_string(),
                    market: market.to_string(),
                    side,
                    size,
                    entry_price: fill_price,
                    margin,
                    leverage,
                    realized_pnl: Wei::zero(),
                    funding_payment: Wei::zero(),
                    last_funding_ms: now_ms,
                    liquidation_price: liquidation_price(
                        fill_price,
                        leverage,
                        state.params.maintenance_margin_bps,
                        side,
                    )?,
                    status: PositionStatus::Open,
                    created_at_ms: now_ms,
                    updated_at_ms: now_ms,
                };
                state.open_by_key.insert(key, position.id);
                state.positions.insert(position.id, position.clone());
                position
            }
        };
        state.open_interest = state.open_interest.checked_add(size)?;

        let mark = state.mark;
        drop(state);
        info!(
            "position {} {side:?} {market}: size {} @ {} ({}x)",
            position.id, position.size, position.entry_price, position.leverage
        );
        self.events.emit(EngineEvent::PositionOpened(position.clone()));
        self.store
            .upsert_position(PositionRow::from_position(&position, mark));
        Ok(position)
    }

    /// Closes a position in part or in full at `fill_price` (defaults to
    /// the current mark). Realized PnL and the proportional margin release
    /// settle back into the owner's free collateral.
    pub fn close_position(
        &self,
        market: &str,
        position_id: &PositionId,
        size: Option<Wei>,
        fill_price: Option<Wei>,
        now_ms: u64,
    ) -> EngineResult<Position> {
        let state = self.market(market)?;
        let mut state = state.lock().expect("market lock");
        let position = state
            .positions
            .get(position_id)
            .ok_or(EngineError::PositionNotFound(*position_id))?;
        if position.status != PositionStatus::Open {
            return Err(EngineError::PositionNotFound(*position_id));
        }

        let close_size = size.unwrap_or(position.size);
        if close_size.is_zero() || close_size.is_negative() || close_size > position.size {
            return Err(EngineError::InvalidParams(format!(
                "close size {close_size} outside (0, {}]",
                position.size
            )));
        }
        let price = match fill_price {
            Some(p) => p,
            None if !state.mark.is_zero() => state.mark,
            None => position.entry_price,
        };

        // All arithmetic first; the position only mutates when every step
        // has succeeded.
        let diff = match position.side {
            PositionSide::Long => price.checked_sub(position.entry_price)?,
            PositionSide::Short => position.entry_price.checked_sub(price)?,
        };
        let pnl = diff.mul_wei(close_size)?;
        let released = position
            .margin
            .mul_wei(close_size)?
            .div_wei(position.size)?;
        let payout = released.checked_add(pnl)?;
        let (credit, shortfall) = if payout.is_negative() {
            (Wei::zero(), payout)
        } else {
            (payout, Wei::zero())
        };

        let owner = position.owner.clone();
        let full_close = close_size == position.size;
        let position = state
            .positions
            .get_mut(position_id)
            .expect("checked above");
        position.size = position.size.checked_sub(close_size)?;
        position.margin = position.margin.checked_sub(released)?;
        position.realized_pnl = position.realized_pnl.checked_add(pnl)?;
        position.updated_at_ms = now_ms;
        if full_close {
            position.status = PositionStatus::Closed;
        }
        let position = position.clone();
        if full_close {
            state
                .open_by_key
                .remove(&(owner.clone(), position.side));
        }
        state.open_interest = state.open_interest.checked_sub(close_size)?;
        let mark = state.mark;
        let quote = state.quote.clone();
        drop(state);

        if !credit.is_zero() {
            self.ledger.credit(&owner, &quote, credit)?;
        }
        if !shortfall.is_zero() {
            // Losses past the posted margin are socialized into the fund.
            warn!(
                "position {position_id} closed with shortfall {shortfall}; insurance fund absorbs"
            );
            let mut fund = self.insurance_fund.lock().expect("insurance lock");
            *fund = fund.checked_add(shortfall)?;
        }

        self.events.emit(EngineEvent::PositionClosed {
            position: position.clone(),
            pnl,
        });
        self.store
            .upsert_position(PositionRow::from_position(&position, mark));
        Ok(position)
    }

    /// Re-levers an open position; the posted margin must still satisfy
    /// the initial requirement at the new leverage.
    pub fn update_leverage(
        &self,
        market: &str,
        position_id: &PositionId,
        new_leverage: u32,
        now_ms: u64,
    ) -> EngineResult<Position> {
        let state = self.market(market)?;
        let mut state = state.lock().expect("market lock");
        let max = state.params.max_leverage;
        let maintenance_bps = state.params.maintenance_margin_bps;
        if new_leverage < 1 || new_leverage > max {
            return Err(EngineError::LeverageRange {
                requested: new_leverage,
                max,
            });
        }
        let position = state
            .positions
            .get_mut(position_id)
            .ok_or(EngineError::PositionNotFound(*position_id))?;
        if position.status != PositionStatus::Open {
            return Err(EngineError::PositionNotFound(*position_id));
        }
        let required = required_margin(position.size, position.entry_price, new_leverage)?;
        if position.margin < required {
            return Err(EngineError::InsufficientMargin {
                required,
                available: position.margin,
            });
        }
        position.leverage = new_leverage;
        position.liquidation_price = liquidation_price(
            position.entry_price,
            new_leverage,
            maintenance_bps,
            position.side,
        )?;
        position.updated_at_ms = now_ms;
        let position = position.clone();
        let mark = state.mark;
        drop(state);

        self.events
            .emit(EngineEvent::PositionLeverageUpdated(position.clone()));
        self.store
            .upsert_position(PositionRow::from_position(&position, mark));
        Ok(position)
    }

    /// Sets the mark. The caller (scheduler) follows up with the
    /// liquidation sweep; unrealized PnL is always derived on read.
    pub fn update_mark_price(&self, market: &str, price: Wei) -> EngineResult<()> {
        let state = self.market(market)?;
        let mut state = state.lock().expect("market lock");
        state.mark = price;
        Ok(())
    }

    pub fn update_index_price(&self, market: &str, price: Wei) -> EngineResult<()> {
        let state = self.market(market)?;
        let mut state = state.lock().expect("market lock");
        state.index = price;
        Ok(())
    }

    /// One atomic funding pass over every open position in the market.
    /// Longs pay shorts when the clamped rate is positive. Returns the
    /// applied rate, or `None` when either oracle leg is missing.
    pub fn apply_funding(&self, market: &str, interval_end_ms: u64) -> EngineResult<Option<Wei>> {
        let state = self.market(market)?;
        let mut state = state.lock().expect("market lock");
        if state.mark.is_zero() || state.index.is_zero() {
            state.last_funding_ms = interval_end_ms;
            return Ok(None);
        }
        let rate = funding_rate(state.mark, state.index, state.params.funding_rate_cap)?;
        let mark = state.mark;

        let mut rows = Vec::new();
        for position in state.positions.values_mut() {
            if position.status != PositionStatus::Open {
                continue;
            }
            let payment = funding_payment(rate, position.size, mark)?;
            match position.side {
                PositionSide::Long => {
                    position.margin = position.margin.checked_sub(payment)?;
                    position.funding_payment = position.funding_payment.checked_sub(payment)?;
                }
                PositionSide::Short => {
                    position.margin = position.margin.checked_add(payment)?;
                    position.funding_payment = position.funding_payment.checked_add(payment)?;
                }
            }
            position.last_funding_ms = interval_end_ms;
            rows.push(PositionRow::from_position(position, mark));
        }
        state.last_funding_ms = interval_end_ms;
        drop(state);

        for row in rows {
            self.store.upsert_position(row);
        }
        self.events.emit(EngineEvent::FundingProcessed {
            market: market.to_string(),
            rate,
            ts_ms: interval_end_ms,
        });
        Ok(Some(rate))
    }

    /// Liquidation sweep at the current mark. Each position commits
    /// all-or-nothing; one position's failure is logged and isolated, and
    /// the sweep continues. Returns liquidated position ids.
    pub fn check_liquidations(&self, market: &str, now_ms: u64) -> EngineResult<Vec<PositionId>> {
        let state = self.market(market)?;
        let mut state = state.lock().expect("market lock");
        if state.mark.is_zero() {
            return Ok(Vec::new());
        }
        let mark = state.mark;
        let maintenance_bps = state.params.maintenance_margin_bps;

        let candidates: Vec<PositionId> = state
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| p.id)
            .collect();

        let mut liquidated = Vec::new();
        let mut emissions = Vec::new();
        for position_id in candidates {
            let outcome = self.liquidate_one(
                &mut state,
                &position_id,
                mark,
                maintenance_bps,
                now_ms,
            );
            match outcome {
                Ok(Some(emission)) => {
                    liquidated.push(position_id);
                    emissions.push(emission);
                }
                Ok(None) => {}
                Err(err) => {
                    error!("liquidation of {position_id} in {market} failed: {err}");
                }
            }
        }
        drop(state);

        for (position, fee, mark) in emissions {
            self.events.emit(EngineEvent::PositionLiquidated {
                position_id: position.id,
                trader: position.owner.clone(),
                market: position.market.clone(),
                fee,
            });
            self.store
                .upsert_position(PositionRow::from_position(&position, mark));
        }
        Ok(liquidated)
    }

    /// Evaluates and, when under maintenance, liquidates one position.
    /// Every fallible step runs before the first mutation.
    fn liquidate_one(
        &self,
        state: &mut MarketState,
        position_id: &PositionId,
        mark: Wei,
        maintenance_bps: u32,
        now_ms: u64,
    ) -> EngineResult<Option<(Position, Wei, Wei)>> {
        let position = state
            .positions
            .get(position_id)
            .ok_or(EngineError::PositionNotFound(*position_id))?;
        let pnl = position.unrealized_pnl(mark)?;
        if !is_liquidatable(position.margin, pnl, position.size, mark, maintenance_bps)? {
            return Ok(None);
        }

        let residual_equity = position.margin.checked_add(pnl)?;
        let fee = position.notional(mark)?.fee_bps(self.liquidation_bps)?;
        let remaining = residual_equity.checked_sub(fee)?;
        let new_realized = position.realized_pnl.checked_add(pnl)?;
        let new_open_interest = state.open_interest.checked_sub(position.size)?;
        let owner = position.owner.clone();
        let side = position.side;
        {
            let mut fund = self.insurance_fund.lock().expect("insurance lock");
            // Fee always accrues; the post-fee remainder credits or, on a
            // shortfall, debits the fund. Held across the update so
            // concurrent sweeps on other markets cannot lose writes.
            *fund = fund.checked_add(fee)?.checked_add(remaining)?;
        }

        // Commit point: nothing below fails.
        let position = state
            .positions
            .get_mut(position_id)
            .expect("present above");
        position.status = PositionStatus::Liquidated;
        position.realized_pnl = new_realized;
        position.updated_at_ms = now_ms;
        let position = position.clone();
        state.open_by_key.remove(&(owner, side));
        state.open_interest = new_open_interest;

        warn!(
            "liquidated {} ({:?} {} @ mark {mark}), fee {fee}, residual {residual_equity}",
            position.id, position.side, position.market
        );
        Ok(Some((position, fee, mark)))
    }

    fn market(
        &self,
        market: &str,
    ) -> EngineResult<dashmap::mapref::one::Ref<'_, PairId, Mutex<MarketState>>> {
        self.markets
            .get(market)
            .ok_or_else(|| EngineError::UnknownPair(market.to_string()))
    }

}
