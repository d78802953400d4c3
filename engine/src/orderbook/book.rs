use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use uuid::Uuid;

use crate::collateral::CollateralLedger;
use crate::event_emitter::{EngineEvent, EventEmitter};
use crate::markets::PairConfig;
use crate::math::wei::Wei;
use crate::orderbook::levels::{BookSnapshot, LevelView};
use crate::store::{OrderRow, StoreHandle, TradeRow};
use crate::types::{
    EngineError, EngineResult, Order, OrderId, OrderKind, OrderStatus, PlaceOutcome,
    TimeInForce, Trade,
};

/// One price level: FIFO queue of resting order ids plus the displayed
/// size total (iceberg tails excluded).
#[derive(Default)]
struct Level {
    queue: VecDeque<OrderId>,
    display_total: Wei,
}

/// Book-side bookkeeping for a resting order.
struct RestingRef {
    price: Wei,
    /// Portion currently visible in the level queue.
    display: Wei,
}

/// Result of sweeping one price level.
enum LevelOutcome {
    /// Every resting order at the level filled; drop the price node.
    Emptied,
    /// The taker ran out of quantity (or aborted).
    TakerDone,
    /// Orders remain but all belong to the taker; the level is passed
    /// over, not drained.
    OnlySelfLeft,
}

/// Simulated walk of the opposing side, shared by the FOK pre-check, the
/// post-only check, and market-order admission/balance pricing. Never
/// mutates.
struct WalkResult {
    fillable: Wei,
    cost: Wei,
    /// Liquidity was present but every candidate belonged to the taker.
    only_self: bool,
}

/// Per-pair limit order book with price-time priority.
///
/// All mutating entry points run under the owning shard's writer lock;
/// matching is atomic by construction because every admission check (FOK,
/// post-only, balance, market liquidity) happens against a read-only walk
/// before the first mutation.
pub struct OrderBook {
    pair: PairConfig,
    bids: BTreeMap<Wei, Level>,
    asks: BTreeMap<Wei, Level>,
    orders: HashMap<OrderId, Order>,
    resting: HashMap<OrderId, RestingRef>,
    /// OCO link -> member order ids (both legs may rest here, or one may
    /// live in the conditional set; the caller cancels those).
    oco: HashMap<Uuid, Vec<OrderId>>,
    /// Base volume traded since the last scheduler drain (VWAP pacing).
    interval_volume: Wei,
    self_trade_prevent: bool,
    ledger: Arc<CollateralLedger>,
    events: Arc<EventEmitter>,
    store: StoreHandle,
}

impl OrderBook {
    pub fn new(
        pair: PairConfig,
        self_trade_prevent: bool,
        ledger: Arc<CollateralLedger>,
        events: Arc<EventEmitter>,
        store: StoreHandle,
    ) -> Self {
        OrderBook {
            pair,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            orders: HashMap::new(),
            resting: HashMap::new(),
            oco: HashMap::new(),
            interval_volume: Wei::zero(),
            self_trade_prevent,
            ledger,
            events,
            store,
        }
    }

    pub fn pair_id(&self) -> &str {
        &self.pair.id
    }

    pub fn get_order(&self, order_id: &OrderId) -> Option<Order> {
        self.orders.get(order_id).cloned()
    }

    pub fn open_orders(&self, owner: &str) -> Vec<Order> {
        self.orders
            .values()
            .filter(|o| o.owner == owner && !o.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn best_bid_ask(&self) -> (Option<Wei>, Option<Wei>) {
        (
            self.bids.keys().next_back().copied(),
            self.asks.keys().next().copied(),
        )
    }

    pub fn snapshot(&self, depth: usize, now_ms: u64) -> BookSnapshot {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(price, level)| LevelView {
                price: *price,
                size: level.display_total,
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(depth)
            .map(|(price, level)| LevelView {
                price: *price,
                size: level.display_total,
            })
            .collect();
        BookSnapshot {
            pair: self.pair.id.clone(),
            bids,
            asks,
            ts_ms: now_ms,
        }
    }

    /// Base volume traded since the previous call; resets the accumulator.
    pub fn take_interval_volume(&mut self) -> Wei {
        std::mem::replace(&mut self.interval_volume, Wei::zero())
    }

    /// Places a market/limit/iceberg order (OCO book legs arrive here with
    /// their link id set). The order must already have passed registry
    /// validation. Returns the outcome and any OCO links whose non-book
    /// partner must be cancelled by the caller.
    pub fn place(
        &mut self,
        order: Order,
        now_ms: u64,
        abort: Option<&AtomicBool>,
    ) -> EngineResult<(PlaceOutcome, Vec<Uuid>)> {
        debug_assert!(matches!(
            order.kind,
            OrderKind::Market | OrderKind::Limit | OrderKind::Iceberg | OrderKind::Oco
        ));
        self.execute(order, now_ms, abort)
    }

    pub fn cancel(
        &mut self,
        order_id: &OrderId,
        owner: &str,
        now_ms: u64,
    ) -> EngineResult<(Order, Vec<Uuid>)> {
        let order = self
            .orders
            .get(order_id)
            .ok_or(EngineError::OrderNotFound(*order_id))?;
        if order.owner != owner {
            return Err(EngineError::Unauthorized(*order_id));
        }
        if order.status.is_terminal() {
            return Err(EngineError::NotCancellable(*order_id));
        }
        let mut links = Vec::new();
        let order = self.terminate(order_id, OrderStatus::Cancelled, now_ms, &mut links)?;
        Ok((order, links))
    }

    /// Cancel-and-replace. A pure size reduction keeps queue priority;
    /// any price change or size increase re-enters the matching pipeline
    /// with a fresh timestamp.
    pub fn amend(
        &mut self,
        order_id: &OrderId,
        owner: &str,
        new_price: Option<Wei>,
        new_size: Option<Wei>,
        now_ms: u64,
    ) -> EngineResult<(PlaceOutcome, Vec<Uuid>)> {
        let order = self
            .orders
            .get(order_id)
            .ok_or(EngineError::OrderNotFound(*order_id))?;
        if order.owner != owner {
            return Err(EngineError::Unauthorized(*order_id));
        }
        if order.status.is_terminal() {
            return Err(EngineError::NotCancellable(*order_id));
        }
        let price_changed = match new_price {
            Some(p) => order.price != Some(p),
            None => false,
        };
        let size_up = match new_size {
            Some(s) => s > order.quantity,
            None => false,
        };

        if !price_changed && !size_up {
            let Some(target) = new_size else {
                // nothing to change
                let order = self.orders.get(order_id).cloned().expect("checked above");
                return Ok((PlaceOutcome::from_order(&order, Vec::new()), Vec::new()));
            };
            return self.shrink_in_place(order_id, target, now_ms);
        }

        // Lose priority: lift the resting entry and run as a fresh arrival.
        let mut order = self.orders.get(order_id).cloned().expect("checked above");
        self.unlink_resting(order_id);
        self.ledger.release_hold(order_id)?;
        if let Some(price) = new_price {
            order.price = Some(price);
        }
        if let Some(size) = new_size {
            if size <= order.filled {
                return Err(EngineError::InvalidParams(format!(
                    "amended size {size} not above filled {}",
                    order.filled
                )));
            }
            order.quantity = size;
            order.remaining = size.checked_sub(order.filled)?;
        }
        order.created_at_ms = now_ms;
        order.updated_at_ms = now_ms;
        self.orders.remove(order_id);
        self.execute(order, now_ms, None)
    }

    /// DAY-session rollover: expires every resting DAY order.
    pub fn expire_day_orders(&mut self, now_ms: u64) -> Vec<Order> {
        let expiring: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.tif == TimeInForce::Day && !o.status.is_terminal())
            .map(|o| o.id)
            .collect();
        let mut expired = Vec::new();
        for order_id in expiring {
            let mut links = Vec::new();
            if let Ok(order) = self.terminate(&order_id, OrderStatus::Expired, now_ms, &mut links)
            {
                expired.push(order);
            }
        }
        expired
    }

    /// Cancels the book-resting partner(s) of an OCO link, if any. Invoked
    /// by the shard when the conditional leg fires or is cancelled.
    pub fn cancel_oco_partners(&mut self, link: &Uuid, now_ms: u64) -> Vec<Order> {
        let Some(members) = self.oco.remove(link) else {
            return Vec::new();
        };
        let mut cancelled = Vec::new();
        for order_id in members {
            let terminal = self
                .orders
                .get(&order_id)
                .map(|o| o.status.is_terminal())
                .unwrap_or(true);
            if !terminal {
                let mut nested = Vec::new();
                if let Ok(order) =
                    self.terminate(&order_id, OrderStatus::Cancelled, now_ms, &mut nested)
                {
                    cancelled.push(order);
                }
            }
        }
        cancelled
    }

    // --- internals -------------------------------------------------------

    fn execute(
        &mut self,
        mut order: Order,
        now_ms: u64,
        abort: Option<&AtomicBool>,
    ) -> EngineResult<(PlaceOutcome, Vec<Uuid>)> {
        let is_market = order.kind == OrderKind::Market;
        let limit = order.price;

        let walk = self.walk_opposing(&order, order.remaining)?;

        if order.post_only && !walk.fillable.is_zero() {
            return Err(EngineError::PostOnlyWouldCross);
        }
        if is_market {
            if walk.fillable.is_zero() {
                return Err(if walk.only_self {
                    EngineError::SelfTradeBlocked
                } else {
                    EngineError::MarketNoLiquidity
                });
            }
            if order.tif == TimeInForce::Fok && walk.fillable < order.remaining {
                return Err(EngineError::MarketNoLiquidity);
            }
        } else if order.tif == TimeInForce::Fok && walk.fillable < order.remaining {
            return Err(EngineError::FokUnfillable);
        }
        if !is_market
            && matches!(order.tif, TimeInForce::Ioc | TimeInForce::Fok)
            && walk.fillable.is_zero()
            && walk.only_self
        {
            return Err(EngineError::SelfTradeBlocked);
        }

        self.reserve_funds(&order, &walk, limit)?;

        // Past this point nothing fails: the walk proved the fills and the
        // hold covers them.
        let mut trades = Vec::new();
        let mut fired_links = Vec::new();
        self.match_incoming(&mut order, now_ms, abort, &mut trades, &mut fired_links)?;

        let rests = !order.remaining.is_zero()
            && !is_market
            && matches!(order.tif, TimeInForce::Gtc | TimeInForce::Day);

        if rests {
            if order.status == OrderStatus::Pending {
                order.status = OrderStatus::Open;
            }
            self.insert_resting(&order)?;
        } else if !order.remaining.is_zero() {
            // IOC semantics for market orders and IOC limits
            order.status = OrderStatus::Cancelled;
            order.updated_at_ms = now_ms;
        }

        if let Some(link) = order.oco_link {
            self.oco.entry(link).or_default().push(order.id);
        }
        if order.status.is_terminal() {
            self.ledger.release_hold(&order.id)?;
            if let Some(link) = order.oco_link {
                fired_links.push(link);
            }
        }

        self.events.emit(EngineEvent::OrderPlaced(order.clone()));
        if order.status == OrderStatus::Filled {
            self.events.emit(EngineEvent::OrderFilled(order.clone()));
        }
        self.store.upsert_order(OrderRow::from(&order));

        let outcome = PlaceOutcome::from_order(&order, trades);
        self.orders.insert(order.id, order);

        for link in &fired_links {
            let cancelled = self.cancel_oco_partners(link, now_ms);
            debug!(
                "oco link {link}: cancelled {} book partner(s)",
                cancelled.len()
            );
        }

        Ok((outcome, fired_links))
    }

    /// Read-only walk of the opposing side in match order, honoring the
    /// taker's limit and self-trade prevention. Iceberg hidden quantity
    /// counts as fillable: it re-enters the level during the real sweep.
    fn walk_opposing(&self, taker: &Order, want: Wei) -> EngineResult<WalkResult> {
        let mut remaining = want;
        let mut cost = Wei::zero();
        let mut saw_liquidity = false;
        let mut saw_other = false;

        let levels: Box<dyn Iterator<Item = (&Wei, &Level)> + '_> = if taker.side.is_bid() {
            Box::new(self.asks.iter())
        } else {
            Box::new(self.bids.iter().rev())
        };

        for (&price, level) in levels {
            if remaining.is_zero() {
                break;
            }
            if let Some(limit) = taker.price {
                let violates = if taker.side.is_bid() {
                    price > limit
                } else {
                    price < limit
                };
                if violates {
                    break;
                }
            }
            for order_id in &level.queue {
                if remaining.is_zero() {
                    break;
                }
                let maker = &self.orders[order_id];
                saw_liquidity = true;
                if self.self_trade_prevent && maker.owner == taker.owner {
                    continue;
                }
                saw_other = true;
                let x = remaining.min(maker.remaining);
                remaining = remaining.checked_sub(x)?;
                cost = cost.checked_add(price.mul_wei(x)?)?;
            }
        }

        Ok(WalkResult {
            fillable: want.checked_sub(remaining)?,
            cost,
            only_self: saw_liquidity && !saw_other,
        })
    }

    /// Reserves the funds this order can spend, before any mutation.
    ///
    /// Buys hold quote for the worst-case notional plus taker fee, padded
    /// one wei per possible fill because per-fill fee ceilings can sum
    /// past the ceiling on the total. Sells hold the base quantity.
    fn reserve_funds(&self, order: &Order, walk: &WalkResult, limit: Option<Wei>) -> EngineResult<()> {
        let (asset, amount) = if order.side.is_bid() {
            let notional = match limit {
                Some(limit) => limit.mul_wei(order.remaining)?,
                None => walk.cost,
            };
            let fee = notional.fee_bps(self.pair.taker_fee_bps)?;
            let pad = Wei::from_raw(self.max_fill_count(order.remaining));
            (
                self.pair.quote.clone(),
                notional.checked_add(fee)?.checked_add(pad)?,
            )
        } else {
            (self.pair.base.clone(), order.remaining)
        };
        self.ledger
            .place_hold(order.id, &order.owner, &asset, amount)
    }

    fn max_fill_count(&self, qty: Wei) -> u128 {
        qty.unit_count(self.pair.size_increment).max(1)
    }

    fn match_incoming(
        &mut self,
        taker: &mut Order,
        now_ms: u64,
        abort: Option<&AtomicBool>,
        trades: &mut Vec<Trade>,
        fired_links: &mut Vec<Uuid>,
    ) -> EngineResult<()> {
        use std::ops::Bound;

        // Levels where only the taker's own orders remain are passed over,
        // not drained; this tracks the boundary already inspected.
        let mut blocked_past: Option<Wei> = None;

        loop {
            if taker.remaining.is_zero() {
                break;
            }
            // Cooperative cancellation, checked between price levels.
            if let Some(flag) = abort {
                if flag.load(Ordering::Relaxed) {
                    debug!("order {} aborted mid-match", taker.id);
                    break;
                }
            }

            let best = if taker.side.is_bid() {
                match blocked_past {
                    Some(past) => self
                        .asks
                        .range((Bound::Excluded(past), Bound::Unbounded))
                        .next()
                        .map(|(price, _)| *price),
                    None => self.asks.keys().next().copied(),
                }
            } else {
                match blocked_past {
                    Some(past) => self
                        .bids
                        .range((Bound::Unbounded, Bound::Excluded(past)))
                        .next_back()
                        .map(|(price, _)| *price),
                    None => self.bids.keys().next_back().copied(),
                }
            };
            let Some(price) = best else { break };
            if let Some(limit) = taker.price {
                let violates = if taker.side.is_bid() {
                    price > limit
                } else {
                    price < limit
                };
                if violates {
                    break;
                }
            }

            match self.match_level(taker, price, now_ms, trades, fired_links)? {
                LevelOutcome::Emptied => {
                    let side = if taker.side.is_bid() {
                        &mut self.asks
                    } else {
                        &mut self.bids
                    };
                    side.remove(&price);
                }
                LevelOutcome::OnlySelfLeft => {
                    blocked_past = Some(price);
                }
                LevelOutcome::TakerDone => break,
            }
        }
        Ok(())
    }

    /// Matches the taker against one level.
    fn match_level(
        &mut self,
        taker: &mut Order,
        price: Wei,
        now_ms: u64,
        trades: &mut Vec<Trade>,
        fired_links: &mut Vec<Uuid>,
    ) -> EngineResult<LevelOutcome> {
        let side_map = if taker.side.is_bid() {
            &mut self.asks
        } else {
            &mut self.bids
        };
        let level = side_map.get_mut(&price).expect("level exists");
        let mut idx = 0;

        while idx < level.queue.len() {
            if taker.remaining.is_zero() {
                return Ok(LevelOutcome::TakerDone);
            }
            let maker_id = level.queue[idx];
            let maker = self.orders.get_mut(&maker_id).expect("maker tracked");
            if self.self_trade_prevent && maker.owner == taker.owner {
                // skip silently; the resting order is untouched
                idx += 1;
                continue;
            }

            let resting = self.resting.get_mut(&maker_id).expect("resting ref");
            let x = taker.remaining.min(resting.display);
            if x.is_zero() {
                idx += 1;
                continue;
            }

            let notional = price.mul_wei(x)?;
            let taker_fee = notional.fee_bps(self.pair.taker_fee_bps)?;
            let maker_fee = notional.fee_bps(self.pair.maker_fee_bps)?;

            maker.record_fill(price, x, maker_fee, now_ms)?;
            taker.record_fill(price, x, taker_fee, now_ms)?;
            resting.display = resting.display.checked_sub(x)?;
            level.display_total = level.display_total.checked_sub(x)?;

            // Settlement: buyer spends quote (cost + fee) and receives
            // base; seller spends base and receives quote net of fee.
            let (buyer, buyer_fee, seller, seller_fee) = if taker.side.is_bid() {
                (&*taker, taker_fee, &*maker, maker_fee)
            } else {
                (&*maker, maker_fee, &*taker, taker_fee)
            };
            self.ledger
                .consume_hold(&buyer.id, notional.checked_add(buyer_fee)?)?;
            self.ledger.credit(&buyer.owner, &self.pair.base, x)?;
            self.ledger.consume_hold(&seller.id, x)?;
            self.ledger.credit(
                &seller.owner,
                &self.pair.quote,
                notional.checked_sub(seller_fee)?,
            )?;

            let trade = Trade {
                id: Uuid::new_v4(),
                taker_order: taker.id,
                maker_order: maker_id,
                pair: self.pair.id.clone(),
                price,
                quantity: x,
                quote_quantity: notional,
                taker_fee,
                maker_fee,
                ts_ms: now_ms,
                is_buyer_maker: !taker.side.is_bid(),
            };
            self.interval_volume = self.interval_volume.checked_add(x)?;
            self.events.emit(EngineEvent::TradeExecuted(trade.clone()));
            self.store.insert_trade(TradeRow {
                id: trade.id,
                taker_order: trade.taker_order,
                maker_order: trade.maker_order,
                pair: trade.pair.clone(),
                side: taker.side,
                qty: trade.quantity,
                price: trade.price,
                quote_qty: trade.quote_quantity,
                fee: trade.taker_fee,
                fee_asset: self.pair.quote.clone(),
                owner: taker.owner.clone(),
                ts_ms: trade.ts_ms,
                is_buyer_maker: trade.is_buyer_maker,
            });
            trades.push(trade);

            let maker = self.orders.get_mut(&maker_id).expect("maker tracked");
            if maker.remaining.is_zero() {
                // filled out: leave the queue, settle the hold remainder
                level.queue.remove(idx);
                self.resting.remove(&maker_id);
                self.ledger.release_hold(&maker_id)?;
                let maker = self.orders.get(&maker_id).expect("maker tracked").clone();
                self.events.emit(EngineEvent::OrderFilled(maker.clone()));
                self.store.upsert_order(OrderRow::from(&maker));
                if let Some(link) = maker.oco_link {
                    fired_links.push(link);
                }
            } else {
                let resting = self.resting.get_mut(&maker_id).expect("resting ref");
                if resting.display.is_zero() {
                    // iceberg tranche exhausted: refill at the tail with a
                    // fresh display slice, losing time priority
                    let refill = maker
                        .visible_qty
                        .unwrap_or(maker.remaining)
                        .min(maker.remaining);
                    resting.display = refill;
                    level.queue.remove(idx);
                    level.queue.push_back(maker_id);
                    level.display_total = level.display_total.checked_add(refill)?;
                } else {
                    idx += 1;
                }
                let maker = self.orders.get(&maker_id).expect("maker tracked").clone();
                self.events.emit(EngineEvent::OrderUpdated(maker.clone()));
                self.store.upsert_order(OrderRow::from(&maker));
            }
        }

        if level.queue.is_empty() {
            Ok(LevelOutcome::Emptied)
        } else if taker.remaining.is_zero() {
            Ok(LevelOutcome::TakerDone)
        } else {
            Ok(LevelOutcome::OnlySelfLeft)
        }
    }

    fn insert_resting(&mut self, order: &Order) -> EngineResult<()> {
        let price = order.price.expect("resting orders carry a price");
        let display = order
            .visible_qty
            .map(|v| v.min(order.remaining))
            .unwrap_or(order.remaining);
        let side_map = if order.side.is_bid() {
            &mut self.bids
        } else {
            &mut self.asks
        };
        let level = side_map.entry(price).or_default();

        // FIFO with the created_at tie broken toward the lower id within
        // the same millisecond.
        let mut idx = level.queue.len();
        while idx > 0 {
            let prev = &self.orders[&level.queue[idx - 1]];
            let loses = prev.created_at_ms > order.created_at_ms
                || (prev.created_at_ms == order.created_at_ms
                    && prev.id.as_u128() > order.id.as_u128());
            if loses {
                idx -= 1;
            } else {
                break;
            }
        }
        level.queue.insert(idx, order.id);
        level.display_total = level.display_total.checked_add(display)?;
        self.resting.insert(order.id, RestingRef { price, display });
        Ok(())
    }

    fn unlink_resting(&mut self, order_id: &OrderId) {
        let Some(resting) = self.resting.remove(order_id) else {
            return;
        };
        let side_is_bid = self.orders[order_id].side.is_bid();
        let side_map = if side_is_bid {
            &mut self.bids
        } else {
            &mut self.asks
        };
        if let Some(level) = side_map.get_mut(&resting.price) {
            level.queue.retain(|id| id != order_id);
            level.display_total = level
                .display_total
                .checked_sub(resting.display)
                .unwrap_or(Wei::zero());
            if level.queue.is_empty() {
                side_map.remove(&resting.price);
            }
        }
    }

    /// Size-down amend preserving queue position.
    fn shrink_in_place(
        &mut self,
        order_id: &OrderId,
        target: Wei,
        now_ms: u64,
    ) -> EngineResult<(PlaceOutcome, Vec<Uuid>)> {
        let order = self.orders.get(order_id).expect("checked by amend");
        if target <= order.filled {
            return Err(EngineError::InvalidParams(format!(
                "amended size {target} not above filled {}",
                order.filled
            )));
        }
        let delta = order.quantity.checked_sub(target)?;
        if delta.is_zero() {
            let order = order.clone();
            return Ok((PlaceOutcome::from_order(&order, Vec::new()), Vec::new()));
        }
        let is_bid = order.side.is_bid();
        let limit = order.price;

        let order = self.orders.get_mut(order_id).expect("checked by amend");
        order.quantity = target;
        order.remaining = order.remaining.checked_sub(delta)?;
        order.updated_at_ms = now_ms;
        let order = order.clone();

        if let Some(resting) = self.resting.get_mut(order_id) {
            let display_cut = resting.display.min(delta);
            resting.display = resting.display.checked_sub(display_cut)?;
            let side_map = if is_bid { &mut self.bids } else { &mut self.asks };
            if let Some(level) = side_map.get_mut(&resting.price) {
                level.display_total = level.display_total.checked_sub(display_cut)?;
            }
        }

        let refund = if is_bid {
            let notional = limit.expect("resting bid has price").mul_wei(delta)?;
            notional.checked_add(notional.fee_bps(self.pair.taker_fee_bps)?)?
        } else {
            delta
        };
        self.ledger.release_partial(order_id, refund)?;

        self.events.emit(EngineEvent::OrderUpdated(order.clone()));
        self.store.upsert_order(OrderRow::from(&order));
        Ok((PlaceOutcome::from_order(&order, Vec::new()), Vec::new()))
    }

    /// Shared terminal transition: unlink, release funds, set status, emit.
    fn terminate(
        &mut self,
        order_id: &OrderId,
        status: OrderStatus,
        now_ms: u64,
        fired_links: &mut Vec<Uuid>,
    ) -> EngineResult<Order> {
        debug_assert!(status.is_terminal());
        self.unlink_resting(order_id);
        self.ledger.release_hold(order_id)?;
        let order = self
            .orders
            .get_mut(order_id)
            .ok_or(EngineError::OrderNotFound(*order_id))?;
        order.status = status;
        order.updated_at_ms = now_ms;
        let order = order.clone();
        self.events.emit(EngineEvent::OrderCancelled(order.clone()));
        self.store.upsert_order(OrderRow::from(&order));

        if let Some(link) = order.oco_link {
            fired_links.push(link);
            let partners = self.cancel_oco_partners(&link, now_ms);
            debug!("oco link {link}: cancelled {} partner(s)", partners.len());
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{limit, market, order, spot_pair, w, Harness};
    use crate::types::{OrderSide, TimeInForce};

    fn book(harness: &Harness) -> OrderBook {
        OrderBook::new(
            spot_pair("XOM/USDC"),
            true,
            harness.ledger.clone(),
            harness.events.clone(),
            harness.store.clone(),
        )
    }

    fn fund(harness: &Harness, owner: &str, asset: &str, amount: &str) {
        harness.ledger.deposit(owner, asset, w(amount)).unwrap();
    }

    #[test]
    fn test_simple_match_partial_maker() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "XOM", "100");
        fund(&harness, "b", "USDC", "100");

        let (maker, _) = book
            .place(limit("a", "XOM/USDC", OrderSide::Sell, "100", "1.25"), 0, None)
            .unwrap();
        assert_eq!(maker.status, OrderStatus::Open);

        let (taker, _) = book
            .place(limit("b", "XOM/USDC", OrderSide::Buy, "40", "1.30"), 1, None)
            .unwrap();

        assert_eq!(taker.status, OrderStatus::Filled);
        assert_eq!(taker.trades.len(), 1);
        assert_eq!(taker.trades[0].price, w("1.25"));
        assert_eq!(taker.trades[0].quantity, w("40"));
        assert_eq!(taker.trades[0].quote_quantity, w("50"));
        assert_eq!(taker.average_price, Some(w("1.25")));
        // 20 bps taker / 10 bps maker on notional 50
        assert_eq!(taker.fees, w("0.1"));

        let maker = book.get_order(&maker.order_id).unwrap();
        assert_eq!(maker.status, OrderStatus::PartiallyFilled);
        assert_eq!(maker.remaining, w("60"));
        assert_eq!(maker.fees, w("0.05"));

        // settlement: buyer paid 50.10 quote, got 40 base; seller got
        // 49.95 quote and still has 60 base on hold
        assert_eq!(harness.ledger.balance("b", "XOM").available, w("40"));
        assert_eq!(harness.ledger.balance("b", "USDC").available, w("49.9"));
        assert_eq!(harness.ledger.balance("a", "USDC").available, w("49.95"));
        assert_eq!(harness.ledger.balance("a", "XOM").held, w("60"));
    }

    #[test]
    fn test_price_time_priority() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "c", "USDC", "100");
        fund(&harness, "d", "USDC", "100");
        fund(&harness, "s", "XOM", "10");

        let (first, _) = book
            .place(limit("c", "XOM/USDC", OrderSide::Buy, "10", "1.00"), 0, None)
            .unwrap();
        let mut later = limit("d", "XOM/USDC", OrderSide::Buy, "10", "1.00");
        later.created_at_ms = 1;
        let (second, _) = book.place(later, 1, None).unwrap();

        let (taker, _) = book
            .place(market("s", "XOM/USDC", OrderSide::Sell, "5"), 2, None)
            .unwrap();
        assert_eq!(taker.status, OrderStatus::Filled);

        assert_eq!(book.get_order(&first.order_id).unwrap().filled, w("5"));
        assert_eq!(book.get_order(&second.order_id).unwrap().filled, Wei::zero());
    }

    #[test]
    fn test_same_millisecond_lower_id_wins() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "c", "USDC", "100");
        fund(&harness, "d", "USDC", "100");
        fund(&harness, "s", "XOM", "10");

        let mut high = limit("c", "XOM/USDC", OrderSide::Buy, "10", "1.00");
        high.id = Uuid::from_u128(2);
        let mut low = limit("d", "XOM/USDC", OrderSide::Buy, "10", "1.00");
        low.id = Uuid::from_u128(1);

        book.place(high, 0, None).unwrap();
        book.place(low, 0, None).unwrap();

        book.place(market("s", "XOM/USDC", OrderSide::Sell, "5"), 1, None)
            .unwrap();
        assert_eq!(book.get_order(&Uuid::from_u128(1)).unwrap().filled, w("5"));
        assert_eq!(
            book.get_order(&Uuid::from_u128(2)).unwrap().filled,
            Wei::zero()
        );
    }

    #[test]
    fn test_post_only_would_cross() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "XOM", "10");
        fund(&harness, "b", "USDC", "10");

        book.place(limit("a", "XOM/USDC", OrderSide::Sell, "1", "1.10"), 0, None)
            .unwrap();

        let mut crossing = limit("b", "XOM/USDC", OrderSide::Buy, "1", "1.10");
        crossing.post_only = true;
        let err = book.place(crossing, 1, None).unwrap_err();
        assert!(matches!(err, EngineError::PostOnlyWouldCross));

        // book untouched, no funds reserved
        let snapshot = book.snapshot(10, 1);
        assert_eq!(snapshot.asks[0].size, w("1"));
        assert_eq!(harness.ledger.balance("b", "USDC").held, Wei::zero());
    }

    #[test]
    fn test_fok_leaves_book_untouched() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "XOM", "3");
        fund(&harness, "b", "USDC", "10");

        book.place(limit("a", "XOM/USDC", OrderSide::Sell, "3", "1.00"), 0, None)
            .unwrap();

        let mut fok = limit("b", "XOM/USDC", OrderSide::Buy, "5", "1.00");
        fok.tif = TimeInForce::Fok;
        let err = book.place(fok, 1, None).unwrap_err();
        assert!(matches!(err, EngineError::FokUnfillable));

        let snapshot = book.snapshot(10, 1);
        assert_eq!(snapshot.asks.len(), 1);
        assert_eq!(snapshot.asks[0].price, w("1.00"));
        assert_eq!(snapshot.asks[0].size, w("3"));
        assert_eq!(harness.ledger.balance("b", "USDC").available, w("10"));
    }

    #[test]
    fn test_market_order_without_liquidity() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "b", "USDC", "10");
        let err = book
            .place(market("b", "XOM/USDC", OrderSide::Buy, "1"), 0, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::MarketNoLiquidity));
    }

    #[test]
    fn test_ioc_residual_is_cancelled() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "XOM", "3");
        fund(&harness, "b", "USDC", "10");

        book.place(limit("a", "XOM/USDC", OrderSide::Sell, "3", "1.00"), 0, None)
            .unwrap();
        let mut ioc = limit("b", "XOM/USDC", OrderSide::Buy, "5", "1.00");
        ioc.tif = TimeInForce::Ioc;
        let (outcome, _) = book.place(ioc, 1, None).unwrap();

        assert_eq!(outcome.status, OrderStatus::Cancelled);
        assert_eq!(outcome.filled, w("3"));
        assert_eq!(outcome.remaining, w("2"));
        // nothing rests
        assert!(book.best_bid_ask().0.is_none());
        // leftover hold returned
        assert_eq!(harness.ledger.balance("b", "USDC").held, Wei::zero());
    }

    #[test]
    fn test_iceberg_refills_at_tail() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "XOM", "20");
        fund(&harness, "o", "XOM", "10");
        fund(&harness, "b", "USDC", "100");

        let mut iceberg = order(
            "a",
            "XOM/USDC",
            OrderSide::Sell,
            OrderKind::Iceberg,
            "20",
            Some("1.00"),
        );
        iceberg.visible_qty = Some(w("10"));
        book.place(iceberg, 0, None).unwrap();

        let mut other = limit("o", "XOM/USDC", OrderSide::Sell, "10", "1.00");
        other.created_at_ms = 1;
        let (other, _) = book.place(other, 1, None).unwrap();

        // taker eats the visible tranche, then the later order that was
        // ahead of the refreshed tail
        let (taker, _) = book
            .place(market("b", "XOM/USDC", OrderSide::Buy, "15"), 2, None)
            .unwrap();
        assert_eq!(taker.filled, w("15"));

        let other = book.get_order(&other.order_id).unwrap();
        assert_eq!(other.filled, w("5"));

        // iceberg shows a fresh tranche, hidden quantity intact
        let snapshot = book.snapshot(10, 2);
        assert_eq!(snapshot.asks[0].size, w("15")); // 10 refill + 5 left of other
    }

    #[test]
    fn test_self_trade_skipped_not_matched() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "XOM", "5");
        fund(&harness, "o", "XOM", "5");
        fund(&harness, "a", "USDC", "10");

        let (own, _) = book
            .place(limit("a", "XOM/USDC", OrderSide::Sell, "5", "1.00"), 0, None)
            .unwrap();
        let mut theirs = limit("o", "XOM/USDC", OrderSide::Sell, "5", "1.00");
        theirs.created_at_ms = 1;
        let (theirs, _) = book.place(theirs, 1, None).unwrap();

        let (taker, _) = book
            .place(market("a", "XOM/USDC", OrderSide::Buy, "5"), 2, None)
            .unwrap();
        assert_eq!(taker.status, OrderStatus::Filled);

        // own resting order untouched, the other owner's filled
        assert_eq!(book.get_order(&own.order_id).unwrap().filled, Wei::zero());
        assert_eq!(
            book.get_order(&theirs.order_id).unwrap().status,
            OrderStatus::Filled
        );
    }

    #[test]
    fn test_self_trade_blocked_when_only_own_liquidity() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "XOM", "5");
        fund(&harness, "a", "USDC", "10");

        book.place(limit("a", "XOM/USDC", OrderSide::Sell, "5", "1.00"), 0, None)
            .unwrap();
        let err = book
            .place(market("a", "XOM/USDC", OrderSide::Buy, "5"), 1, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::SelfTradeBlocked));
    }

    #[test]
    fn test_insufficient_balance_rejected_before_mutation() {
        let harness = Harness::new();
        let mut book = book(&harness);
        let err = book
            .place(limit("broke", "XOM/USDC", OrderSide::Buy, "10", "1.00"), 0, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        assert!(book.best_bid_ask().0.is_none());
    }

    #[test]
    fn test_cancel_releases_hold_and_is_terminal() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "USDC", "100");

        let (placed, _) = book
            .place(limit("a", "XOM/USDC", OrderSide::Buy, "10", "1.00"), 0, None)
            .unwrap();
        assert!(harness.ledger.balance("a", "USDC").held > Wei::zero());

        assert!(matches!(
            book.cancel(&placed.order_id, "mallory", 1),
            Err(EngineError::Unauthorized(_))
        ));

        let (cancelled, _) = book.cancel(&placed.order_id, "a", 1).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(harness.ledger.balance("a", "USDC").held, Wei::zero());
        assert_eq!(harness.ledger.balance("a", "USDC").available, w("100"));

        assert!(matches!(
            book.cancel(&placed.order_id, "a", 2),
            Err(EngineError::NotCancellable(_))
        ));
    }

    #[test]
    fn test_amend_size_down_keeps_priority() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "USDC", "100");
        fund(&harness, "b", "USDC", "100");
        fund(&harness, "s", "XOM", "10");

        let (first, _) = book
            .place(limit("a", "XOM/USDC", OrderSide::Buy, "10", "1.00"), 0, None)
            .unwrap();
        let mut second = limit("b", "XOM/USDC", OrderSide::Buy, "10", "1.00");
        second.created_at_ms = 1;
        book.place(second, 1, None).unwrap();

        book.amend(&first.order_id, "a", None, Some(w("6")), 2).unwrap();

        book.place(market("s", "XOM/USDC", OrderSide::Sell, "4"), 3, None)
            .unwrap();
        let first = book.get_order(&first.order_id).unwrap();
        assert_eq!(first.filled, w("4"));
        assert_eq!(first.quantity, w("6"));
    }

    #[test]
    fn test_amend_price_loses_priority_and_can_match() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "USDC", "100");
        fund(&harness, "o", "XOM", "10");

        let (bid, _) = book
            .place(limit("a", "XOM/USDC", OrderSide::Buy, "10", "1.00"), 0, None)
            .unwrap();
        book.place(limit("o", "XOM/USDC", OrderSide::Sell, "10", "1.05"), 1, None)
            .unwrap();

        let (amended, _) = book
            .amend(&bid.order_id, "a", Some(w("1.05")), None, 2)
            .unwrap();
        assert_eq!(amended.status, OrderStatus::Filled);
        assert_eq!(amended.trades.len(), 1);
        assert_eq!(amended.trades[0].price, w("1.05"));
    }

    #[test]
    fn test_oco_fill_cancels_partner() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "XOM", "20");
        fund(&harness, "b", "USDC", "100");

        let link = Uuid::new_v4();
        let mut leg1 = order(
            "a",
            "XOM/USDC",
            OrderSide::Sell,
            OrderKind::Oco,
            "10",
            Some("2.00"),
        );
        leg1.oco_link = Some(link);
        let mut leg2 = order(
            "a",
            "XOM/USDC",
            OrderSide::Sell,
            OrderKind::Oco,
            "10",
            Some("3.00"),
        );
        leg2.oco_link = Some(link);
        leg2.created_at_ms = 1;

        let (leg1, _) = book.place(leg1, 0, None).unwrap();
        let (leg2, _) = book.place(leg2, 1, None).unwrap();

        book.place(limit("b", "XOM/USDC", OrderSide::Buy, "10", "2.00"), 2, None)
            .unwrap();

        assert_eq!(
            book.get_order(&leg1.order_id).unwrap().status,
            OrderStatus::Filled
        );
        assert_eq!(
            book.get_order(&leg2.order_id).unwrap().status,
            OrderStatus::Cancelled
        );
        // both holds settled
        assert_eq!(harness.ledger.balance("a", "XOM").held, Wei::zero());
    }

    #[test]
    fn test_day_orders_expire() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "USDC", "100");
        fund(&harness, "b", "USDC", "100");

        let mut day = limit("a", "XOM/USDC", OrderSide::Buy, "10", "1.00");
        day.tif = TimeInForce::Day;
        let (day, _) = book.place(day, 0, None).unwrap();
        let (gtc, _) = book
            .place(limit("b", "XOM/USDC", OrderSide::Buy, "10", "0.99"), 1, None)
            .unwrap();

        let expired = book.expire_day_orders(100);
        assert_eq!(expired.len(), 1);
        assert_eq!(
            book.get_order(&day.order_id).unwrap().status,
            OrderStatus::Expired
        );
        assert_eq!(
            book.get_order(&gtc.order_id).unwrap().status,
            OrderStatus::Open
        );
        assert_eq!(harness.ledger.balance("a", "USDC").held, Wei::zero());
    }

    #[test]
    fn test_book_never_crosses() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "USDC", "1000");
        fund(&harness, "b", "XOM", "100");

        book.place(limit("a", "XOM/USDC", OrderSide::Buy, "10", "1.00"), 0, None)
            .unwrap();
        book.place(limit("b", "XOM/USDC", OrderSide::Sell, "10", "1.05"), 1, None)
            .unwrap();
        // crossing buy sweeps the ask rather than resting through it
        book.place(limit("a", "XOM/USDC", OrderSide::Buy, "20", "1.06"), 2, None)
            .unwrap();

        let (best_bid, best_ask) = book.best_bid_ask();
        if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
            assert!(bid < ask, "book crossed: {bid} >= {ask}");
        }
    }

    #[test]
    fn test_fills_conserve_quantity() {
        let harness = Harness::new();
        let mut book = book(&harness);
        fund(&harness, "a", "XOM", "100");
        fund(&harness, "b", "USDC", "1000");

        book.place(limit("a", "XOM/USDC", OrderSide::Sell, "7", "1.00"), 0, None)
            .unwrap();
        book.place(limit("a", "XOM/USDC", OrderSide::Sell, "13", "1.01"), 1, None)
            .unwrap();

        let (outcome, _) = book
            .place(limit("b", "XOM/USDC", OrderSide::Buy, "25", "1.05"), 2, None)
            .unwrap();
        let traded: Wei = outcome
            .trades
            .iter()
            .fold(Wei::zero(), |acc, t| acc.checked_add(t.quantity).unwrap());
        assert_eq!(traded, outcome.filled);
        assert_eq!(
            outcome.filled.checked_add(outcome.remaining).unwrap(),
            w("25")
        );
    }
}
