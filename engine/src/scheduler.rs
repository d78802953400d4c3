use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::time;

use crate::event_emitter::EngineEvent;
use crate::exchange::{Exchange, PairShard};
use crate::math::wei::{to_wei, Wei};
use crate::orderbook::TriggerAction;
use crate::store::OrderRow;
use crate::types::{
    EngineResult, MarketKind, Order, OrderKind, OrderStatus, PairId,
};

struct PriceSample {
    price: Wei,
    ts_ms: u64,
}

/// The only writer of mark/index prices, and the driver of everything
/// periodic: conditional triggers, liquidation sweeps, funding intervals,
/// DAY expiry and TWAP/VWAP slicing. Other components submit price samples
/// through it so every market sees one serialized stream.
pub struct Scheduler {
    exchange: Arc<Exchange>,
    last_mark: DashMap<PairId, PriceSample>,
    last_index: DashMap<PairId, u64>,
    quiescent_ms: u64,
}

impl Scheduler {
    pub fn new(exchange: Arc<Exchange>) -> Self {
        let quiescent_ms = exchange.config().scheduler.mark_quiescent_ms;
        Scheduler {
            exchange,
            last_mark: DashMap::new(),
            last_index: DashMap::new(),
            quiescent_ms,
        }
    }

    /// Applies a mark (or, for spot pairs, last-price) sample. Samples
    /// older than the last applied one are ignored, and an identical price
    /// inside the quiescent window is coalesced. Returns whether the
    /// sample was applied.
    pub fn submit_mark_update(
        &self,
        market: &str,
        price: &str,
        ts_ms: u64,
    ) -> EngineResult<bool> {
        let price = to_wei(price)?;
        if let Some(prev) = self.last_mark.get(market) {
            if ts_ms < prev.ts_ms {
                debug!("stale mark for {market} at {ts_ms} ignored");
                return Ok(false);
            }
            if price == prev.price && ts_ms.saturating_sub(prev.ts_ms) < self.quiescent_ms {
                return Ok(false);
            }
        }
        let pair = self.exchange.registry().get_pair(market)?;
        self.last_mark
            .insert(market.to_string(), PriceSample { price, ts_ms });

        if pair.kind == MarketKind::Perpetual {
            self.exchange.perp().update_mark_price(market, price)?;
        }

        self.fire_conditionals(market, pair.kind, price, ts_ms)?;

        if pair.kind == MarketKind::Perpetual {
            let liquidated = self.exchange.perp().check_liquidations(market, ts_ms)?;
            if !liquidated.is_empty() {
                info!("mark {price} liquidated {} position(s) in {market}", liquidated.len());
            }
        }
        Ok(true)
    }

    pub fn submit_index_update(
        &self,
        market: &str,
        price: &str,
        ts_ms: u64,
    ) -> EngineResult<bool> {
        let price = to_wei(price)?;
        if let Some(prev) = self.last_index.get(market) {
            if ts_ms < *prev {
                debug!("stale index for {market} at {ts_ms} ignored");
                return Ok(false);
            }
        }
        self.last_index.insert(market.to_string(), ts_ms);
        self.exchange.perp().update_index_price(market, price)?;
        Ok(true)
    }

    /// Settles every funding interval that has elapsed, in order, each at
    /// the latest available mark. Per-market failures are logged and do
    /// not stop the pass.
    pub fn run_funding_once(&self, now_ms: u64) {
        for market in self.exchange.registry().perpetual_ids() {
            if let Err(err) = self.settle_market_funding(&market, now_ms) {
                error!("funding pass for {market} failed: {err}");
            }
        }
    }

    fn settle_market_funding(&self, market: &str, now_ms: u64) -> EngineResult<()> {
        let perp = self.exchange.perp();
        let interval = perp.funding_interval_ms(market)?;
        let mut last = perp.last_funding_ms(market)?;
        if last == 0 {
            return perp.seed_funding_clock(market, now_ms);
        }
        // A paused process applies every missed interval on catch-up.
        while now_ms >= last + interval {
            last += interval;
            match perp.apply_funding(market, last)? {
                Some(rate) => debug!("funding {market} @ {last}: rate {rate}"),
                None => debug!("funding {market} @ {last}: no oracle yet"),
            }
        }
        Ok(())
    }

    /// Emits due TWAP/VWAP child slices across all pairs.
    pub fn run_parent_slices(&self, now_ms: u64) {
        for pair_id in self.exchange.registry().pair_ids() {
            let result = self.exchange.with_shard(&pair_id, |shard| {
                self.slice_shard(shard, &pair_id, now_ms)
            });
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) | Err(err) => {
                    error!("slice pass for {pair_id} failed: {err}");
                }
            }
        }
    }

    /// DAY-session rollover.
    pub fn expire_session(&self, now_ms: u64) {
        self.exchange.expire_session(now_ms);
    }

    /// Timer loop for funding settlement; poll is a fraction of the
    /// shortest funding interval.
    pub async fn run_funding_loop(self: Arc<Self>, poll: Duration) {
        let mut ticker = time::interval(poll);
        loop {
            ticker.tick().await;
            self.run_funding_once(wall_now_ms());
        }
    }

    pub async fn run_slice_loop(self: Arc<Self>, poll: Duration) {
        let mut ticker = time::interval(poll);
        loop {
            ticker.tick().await;
            self.run_parent_slices(wall_now_ms());
        }
    }

    // --- internals -------------------------------------------------------

    fn fire_conditionals(
        &self,
        market: &str,
        kind: MarketKind,
        price: Wei,
        now_ms: u64,
    ) -> EngineResult<()> {
        let triggered = self
            .exchange
            .with_shard(market, |shard| -> EngineResult<Vec<(Order, TriggerAction)>> {
                let triggered = shard.conditional.on_price(price)?;
                for (order, action) in &triggered {
                    debug!("trigger {:?} fired for order {} as {action:?}", order.kind, order.id);
                    if let Some(link) = order.oco_link {
                        // the non-fired OCO partner dies with the trigger
                        if let Some(book) = shard.book.as_mut() {
                            book.cancel_oco_partners(&link, now_ms);
                        }
                        Exchange::cancel_conditional_link(
                            shard,
                            &link,
                            self.exchange.events(),
                            self.exchange.store(),
                            now_ms,
                        );
                    }
                }
                Ok(triggered)
            })??;

        for (mut order, action) in triggered {
            match action {
                TriggerAction::Market => {
                    order.kind = OrderKind::Market;
                    order.price = None;
                }
                TriggerAction::Limit => {
                    order.kind = OrderKind::Limit;
                }
            }
            order.stop_price = None;
            let routed = self.exchange.with_shard(market, |shard| {
                self.exchange
                    .route_from_scheduler(shard, kind, order.clone(), now_ms)
            })?;
            if let Err(err) = routed {
                warn!("triggered order {} rejected: {err}", order.id);
                order.status = OrderStatus::Cancelled;
                order.updated_at_ms = now_ms;
                self.exchange
                    .events()
                    .emit(EngineEvent::OrderCancelled(order.clone()));
                self.exchange.store().upsert_order(OrderRow::from(&order));
            }
        }
        Ok(())
    }

    fn slice_shard(
        &self,
        shard: &mut PairShard,
        pair_id: &str,
        now_ms: u64,
    ) -> EngineResult<()> {
        let pair = self.exchange.registry().get_pair(pair_id)?;
        let interval_volume = shard
            .book
            .as_mut()
            .map(|book| book.take_interval_volume())
            .unwrap_or(Wei::zero());

        let mut finished = Vec::new();
        let mut idx = 0;
        while idx < shard.parents.len() {
            let parent = &mut shard.parents[idx];
            if now_ms < parent.next_slice_ms {
                idx += 1;
                continue;
            }
            let slice_params = parent.order.slice.expect("parents carry slice params");
            let interval = slice_params.interval_ms;

            let intervals_remaining = parent.end_ms.saturating_sub(now_ms) / interval + 1;
            let equal_split = parent
                .order
                .remaining
                .div_int(intervals_remaining.min(u32::MAX as u64) as u32)?;
            let mut slice = match parent.order.kind {
                OrderKind::Vwap => {
                    let cap = interval_volume.mul_wei(Wei::from_bps(
                        slice_params.max_participation_bps,
                    ))?;
                    parent.order.remaining.min(equal_split.max(cap))
                }
                _ => equal_split,
            };
            slice = slice.round_down_to(pair.size_increment);

            while parent.next_slice_ms <= now_ms {
                parent.next_slice_ms += interval;
            }

            if slice.is_zero() || slice < pair.min_size {
                // nothing sensible to send this tick; expire below if done
                if now_ms < parent.end_ms {
                    idx += 1;
                    continue;
                }
            } else {
                let mut child = parent.order.clone();
                child.id = uuid::Uuid::new_v4();
                child.kind = if parent.order.price.is_some() {
                    OrderKind::Limit
                } else {
                    OrderKind::Market
                };
                child.slice = None;
                child.quantity = slice;
                child.remaining = slice;
                child.filled = Wei::zero();
                child.average_price = None;
                child.fees = Wei::zero();
                child.status = OrderStatus::Pending;
                child.created_at_ms = now_ms;
                child.updated_at_ms = now_ms;

                match self
                    .exchange
                    .route_from_scheduler(shard, pair.kind, child, now_ms)
                {
                    Ok(outcome) => {
                        // Parents track dispatched quantity; children fill
                        // on their own. A resting child counts in full, a
                        // cancelled residual comes back to the parent.
                        let resting = matches!(
                            outcome.status,
                            OrderStatus::Open | OrderStatus::PartiallyFilled
                        );
                        let dispatched = if resting {
                            outcome.filled.checked_add(outcome.remaining)?
                        } else {
                            outcome.filled
                        };
                        let parent = &mut shard.parents[idx];
                        parent.order.filled = parent.order.filled.checked_add(dispatched)?;
                        parent.order.remaining =
                            parent.order.quantity.checked_sub(parent.order.filled)?;
                        parent.order.status = OrderStatus::PartiallyFilled;
                        parent.order.updated_at_ms = now_ms;
                    }
                    Err(err) => {
                        warn!("slice for parent order rejected: {err}");
                    }
                }
            }

            let parent = &mut shard.parents[idx];
            if parent.order.remaining.is_zero() || now_ms >= parent.end_ms {
                let mut done = shard.parents.remove(idx);
                done.order.status = if done.order.remaining.is_zero() {
                    OrderStatus::Filled
                } else {
                    // undispatched remainder at expiry
                    OrderStatus::Cancelled
                };
                done.order.updated_at_ms = now_ms;
                finished.push(done.order);
            } else {
                idx += 1;
            }
        }

        for order in finished {
            info!(
                "parent order {} finished as {:?} ({} dispatched)",
                order.id, order.status, order.filled
            );
            self.exchange
                .events()
                .emit(EngineEvent::OrderUpdated(order.clone()));
            self.exchange.store().upsert_order(OrderRow::from(&order));
        }
        Ok(())
    }
}

fn wall_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
