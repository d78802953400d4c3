use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};
use uuid::Uuid;

use crate::collateral::{Balance, CollateralLedger};
use crate::config::EngineConfig;
use crate::event_emitter::{EngineEvent, EventEmitter};
use crate::integration::IntegrationLayer;
use crate::markets::{MarketRegistry, PairConfig};
use crate::math::wei::{to_wei, Wei};
use crate::orderbook::{BookSnapshot, ConditionalSet, OrderBook};
use crate::perp::{PerpEngine, PositionView};
use crate::store::{spawn_store, OrderRow, StoreHandle, StoreSink};
use crate::types::{
    EngineError, EngineResult, MarketKind, MarketStatus, Order, OrderId, OrderKind,
    OrderRequest, OrderStatus, PairId, PlaceOutcome, PositionId, TimeInForce,
};

/// A TWAP/VWAP parent retained outside the book; the scheduler emits its
/// child slices.
pub(crate) struct ParentOrder {
    pub order: Order,
    pub next_slice_ms: u64,
    pub end_ms: u64,
}

/// Everything one pair owns besides registry config: the spot book (spot
/// pairs only), parked conditional orders, and pacing parents. One mutex
/// per shard gives the per-pair total ordering.
pub(crate) struct PairShard {
    pub book: Option<OrderBook>,
    pub conditional: ConditionalSet,
    pub parents: Vec<ParentOrder>,
}

/// The assembled engine: registry, books, perpetual engine, ledger, event
/// bus and write-through store behind one facade. The ingress talks to
/// this; the scheduler drives it out-of-band.
pub struct Exchange {
    config: EngineConfig,
    registry: Arc<MarketRegistry>,
    ledger: Arc<CollateralLedger>,
    events: Arc<EventEmitter>,
    store: StoreHandle,
    perp: Arc<PerpEngine>,
    integration: IntegrationLayer,
    shards: DashMap<PairId, Mutex<PairShard>>,
    order_index: DashMap<OrderId, PairId>,
    _store_worker: JoinHandle<()>,
}

impl Exchange {
    pub fn new(config: EngineConfig, sink: Arc<dyn StoreSink>) -> Self {
        let (store, store_worker) = spawn_store(config.store.queue_capacity, sink);
        let events = Arc::new(EventEmitter::new(Duration::from_millis(
            config.events.subscriber_timeout_ms,
        )));
        let ledger = Arc::new(CollateralLedger::new());
        let registry = Arc::new(MarketRegistry::new(&config));
        let perp = Arc::new(PerpEngine::new(
            config.fees.liquidation_bps,
            ledger.clone(),
            events.clone(),
            store.clone(),
        ));
        let integration = IntegrationLayer::new(
            &config,
            perp.clone(),
            registry.clone(),
            events.clone(),
            store.clone(),
        );
        Exchange {
            config,
            registry,
            ledger,
            events,
            store,
            perp,
            integration,
            shards: DashMap::new(),
            order_index: DashMap::new(),
            _store_worker: store_worker,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.events
    }

    pub fn ledger(&self) -> &Arc<CollateralLedger> {
        &self.ledger
    }

    pub fn perp(&self) -> &Arc<PerpEngine> {
        &self.perp
    }

    pub fn registry(&self) -> &Arc<MarketRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Registers a pair and builds its runtime state (book for spot,
    /// position state for perpetuals).
    pub fn register_pair(&self, params: PairConfig) -> EngineResult<()> {
        let id = params.id.clone();
        self.registry.register_pair(params)?;
        // re-read so defaulted fields (max leverage) are in effect
        let stored = self.registry.get_pair(&id)?;
        let book = match stored.kind {
            MarketKind::Spot => Some(OrderBook::new(
                stored,
                self.config.risk.self_trade_prevent,
                self.ledger.clone(),
                self.events.clone(),
                self.store.clone(),
            )),
            MarketKind::Perpetual => {
                self.perp.register_market(&stored)?;
                None
            }
        };
        self.shards.insert(
            id,
            Mutex::new(PairShard {
                book,
                conditional: ConditionalSet::new(),
                parents: Vec::new(),
            }),
        );
        Ok(())
    }

    pub fn update_status(&self, pair: &str, status: MarketStatus) -> EngineResult<()> {
        let previous = self.registry.update_status(pair, status)?;
        if previous != status {
            let event = match status {
                MarketStatus::Trading => EngineEvent::MarketResumed {
                    pair: pair.to_string(),
                },
                _ => EngineEvent::MarketHalted {
                    pair: pair.to_string(),
                },
            };
            self.events.emit(event);
        }
        Ok(())
    }

    pub fn deposit(&self, owner: &str, asset: &str, amount: &str) -> EngineResult<()> {
        self.ledger.deposit(owner, asset, to_wei(amount)?)
    }

    pub fn withdraw(&self, owner: &str, asset: &str, amount: &str) -> EngineResult<()> {
        self.ledger.withdraw(owner, asset, to_wei(amount)?)
    }

    pub fn balance(&self, owner: &str, asset: &str) -> Balance {
        self.ledger.balance(owner, asset)
    }

    /// Ingress entry point: converts the decimal-string submission, runs
    /// registry validation, and routes by kind. Arithmetic/capacity faults
    /// leave as opaque `Internal` per the propagation policy.
    pub fn submit(&self, request: OrderRequest, now_ms: u64) -> EngineResult<PlaceOutcome> {
        self.submit_inner(request, now_ms).map_err(|err| {
            let message = err.to_string();
            let redacted = err.redact();
            if matches!(redacted, EngineError::Internal) {
                warn!("order submission failed internally: {message}");
            }
            redacted
        })
    }

    fn submit_inner(&self, request: OrderRequest, now_ms: u64) -> EngineResult<PlaceOutcome> {
        let order = self.order_from_request(request, now_ms)?;
        self.registry.validate_order(&order)?;
        let pair = self.registry.get_pair(&order.pair)?;

        match order.kind {
            OrderKind::Market | OrderKind::Limit | OrderKind::Iceberg => {
                self.route_immediate(&pair, order, now_ms)
            }
            OrderKind::StopLoss | OrderKind::StopLimit | OrderKind::TrailingStop => {
                self.park_conditional(order, now_ms)
            }
            OrderKind::Oco => self.submit_oco(&pair, order, now_ms),
            OrderKind::Twap | OrderKind::Vwap => self.park_parent(order, now_ms),
        }
    }

    pub fn cancel(&self, order_id: &OrderId, owner: &str, now_ms: u64) -> EngineResult<Order> {
        let pair = self
            .order_index
            .get(order_id)
            .map(|entry| entry.clone())
            .ok_or(EngineError::OrderNotFound(*order_id))?;
        self.with_shard(&pair, |shard| {
            if let Some(book) = shard.book.as_mut() {
                if book.get_order(order_id).is_some() {
                    let (order, links) = book.cancel(order_id, owner, now_ms)?;
                    for link in links {
                        Self::cancel_conditional_link(shard, &link, &self.events, &self.store, now_ms);
                    }
                    return Ok(order);
                }
            }

            if let Some(parked) = shard.conditional.get(order_id) {
                if parked.owner != owner {
                    return Err(EngineError::Unauthorized(*order_id));
                }
                let mut order = shard.conditional.remove(order_id).expect("present");
                order.status = OrderStatus::Cancelled;
                order.updated_at_ms = now_ms;
                self.events.emit(EngineEvent::OrderCancelled(order.clone()));
                self.store.upsert_order(OrderRow::from(&order));
                if let Some(link) = order.oco_link {
                    if let Some(book) = shard.book.as_mut() {
                        book.cancel_oco_partners(&link, now_ms);
                    }
                    Self::cancel_conditional_link(shard, &link, &self.events, &self.store, now_ms);
                }
                return Ok(order);
            }

            if let Some(idx) = shard.parents.iter().position(|p| p.order.id == *order_id) {
                if shard.parents[idx].order.owner != owner {
                    return Err(EngineError::Unauthorized(*order_id));
                }
                let mut parent = shard.parents.remove(idx);
                parent.order.status = OrderStatus::Cancelled;
                parent.order.updated_at_ms = now_ms;
                self.events
                    .emit(EngineEvent::OrderCancelled(parent.order.clone()));
                self.store.upsert_order(OrderRow::from(&parent.order));
                return Ok(parent.order);
            }

            Err(EngineError::OrderNotFound(*order_id))
        })?
    }

    pub fn amend(
        &self,
        order_id: &OrderId,
        owner: &str,
        new_price: Option<&str>,
        new_size: Option<&str>,
        now_ms: u64,
    ) -> EngineResult<PlaceOutcome> {
        let pair_id = self
            .order_index
            .get(order_id)
            .map(|entry| entry.clone())
            .ok_or(EngineError::OrderNotFound(*order_id))?;
        let pair = self.registry.get_pair(&pair_id)?;
        let new_price = new_price.map(to_wei).transpose()?;
        let new_size = new_size.map(to_wei).transpose()?;
        if let Some(price) = new_price {
            if !price.is_multiple_of(pair.tick_size) {
                return Err(EngineError::TickSize {
                    tick: pair.tick_size,
                });
            }
        }
        if let Some(size) = new_size {
            if !size.is_multiple_of(pair.size_increment) {
                return Err(EngineError::SizeIncrement {
                    increment: pair.size_increment,
                });
            }
        }
        self.with_shard(&pair_id, |shard| {
            let book = shard
                .book
                .as_mut()
                .ok_or(EngineError::OrderNotFound(*order_id))?;
            let (outcome, links) = book.amend(order_id, owner, new_price, new_size, now_ms)?;
            for link in links {
                Self::cancel_conditional_link(shard, &link, &self.events, &self.store, now_ms);
            }
            Ok(outcome)
        })?
    }

    pub fn get_order(&self, order_id: &OrderId) -> EngineResult<Order> {
        let pair = self
            .order_index
            .get(order_id)
            .map(|entry| entry.clone())
            .ok_or(EngineError::OrderNotFound(*order_id))?;
        self.with_shard(&pair, |shard| {
            if let Some(book) = shard.book.as_ref() {
                if let Some(order) = book.get_order(order_id) {
                    return Ok(order);
                }
            }
            if let Some(order) = shard.conditional.get(order_id) {
                return Ok(order.clone());
            }
            shard
                .parents
                .iter()
                .find(|p| p.order.id == *order_id)
                .map(|p| p.order.clone())
                .ok_or(EngineError::OrderNotFound(*order_id))
        })?
    }

    pub fn best_bid_ask(&self, pair: &str) -> EngineResult<(Option<Wei>, Option<Wei>)> {
        self.with_shard(pair, |shard| {
            shard
                .book
                .as_ref()
                .map(|book| book.best_bid_ask())
                .ok_or_else(|| EngineError::UnknownPair(pair.to_string()))
        })?
    }

    pub fn snapshot(&self, pair: &str, depth: usize, now_ms: u64) -> EngineResult<BookSnapshot> {
        self.with_shard(pair, |shard| {
            shard
                .book
                .as_ref()
                .map(|book| book.snapshot(depth, now_ms))
                .ok_or_else(|| EngineError::UnknownPair(pair.to_string()))
        })?
    }

    /// Every non-terminal order an owner has on a pair: resting, parked
    /// conditional, and pacing parents.
    pub fn open_orders(&self, owner: &str, pair: &str) -> EngineResult<Vec<Order>> {
        self.with_shard(pair, |shard| {
            let mut orders = shard
                .book
                .as_ref()
                .map(|book| book.open_orders(owner))
                .unwrap_or_default();
            orders.extend(shard.conditional.owner_orders(owner));
            orders.extend(
                shard
                    .parents
                    .iter()
                    .filter(|p| p.order.owner == owner)
                    .map(|p| p.order.clone()),
            );
            orders
        })
    }

    pub fn portfolio(&self, owner: &str) -> Vec<PositionView> {
        self.integration.portfolio(owner)
    }

    pub fn position_for_order(&self, order_id: &OrderId) -> Option<PositionId> {
        self.integration.position_for_order(order_id)
    }

    pub fn insurance_fund(&self) -> Wei {
        self.perp.insurance_fund()
    }

    /// DAY-session rollover across every pair: resting, parked and parent
    /// DAY orders all expire.
    pub fn expire_session(&self, now_ms: u64) {
        for entry in self.shards.iter() {
            let mut shard = entry.value().lock().expect("shard lock");
            if let Some(book) = shard.book.as_mut() {
                book.expire_day_orders(now_ms);
            }
            let mut expired = Vec::new();
            for order in shard.conditional.all() {
                if order.tif == TimeInForce::Day {
                    if let Some(mut order) = shard.conditional.remove(&order.id) {
                        order.status = OrderStatus::Expired;
                        order.updated_at_ms = now_ms;
                        expired.push(order);
                    }
                }
            }
            let mut idx = 0;
            while idx < shard.parents.len() {
                if shard.parents[idx].order.tif == TimeInForce::Day {
                    let mut parent = shard.parents.remove(idx);
                    parent.order.status = OrderStatus::Expired;
                    parent.order.updated_at_ms = now_ms;
                    expired.push(parent.order);
                } else {
                    idx += 1;
                }
            }
            drop(shard);
            for order in expired {
                self.events.emit(EngineEvent::OrderCancelled(order.clone()));
                self.store.upsert_order(OrderRow::from(&order));
            }
        }
    }

    // --- routing ---------------------------------------------------------

    fn route_immediate(
        &self,
        pair: &PairConfig,
        order: Order,
        now_ms: u64,
    ) -> EngineResult<PlaceOutcome> {
        self.order_index.insert(order.id, order.pair.clone());
        match pair.kind {
            MarketKind::Spot => self.with_shard(&pair.id, |shard| {
                let book = shard.book.as_mut().expect("spot shard has book");
                let (outcome, links) = book.place(order, now_ms, None)?;
                for link in links {
                    Self::cancel_conditional_link(shard, &link, &self.events, &self.store, now_ms);
                }
                Ok(outcome)
            })?,
            MarketKind::Perpetual => self.integration.process_perpetual_order(order, now_ms),
        }
    }

    /// Used by the scheduler to route triggered conditionals and parent
    /// slices; identical to `route_immediate` but keeps the caller's shard
    /// lock out of the way for spot (the scheduler already holds it).
    pub(crate) fn route_from_scheduler(
        &self,
        shard: &mut PairShard,
        kind: MarketKind,
        order: Order,
        now_ms: u64,
    ) -> EngineResult<PlaceOutcome> {
        self.order_index.insert(order.id, order.pair.clone());
        match kind {
            MarketKind::Spot => {
                let book = shard.book.as_mut().expect("spot shard has book");
                let (outcome, links) = book.place(order, now_ms, None)?;
                for link in links {
                    Self::cancel_conditional_link(shard, &link, &self.events, &self.store, now_ms);
                }
                Ok(outcome)
            }
            MarketKind::Perpetual => self.integration.process_perpetual_order(order, now_ms),
        }
    }

    fn park_conditional(&self, order: Order, _now_ms: u64) -> EngineResult<PlaceOutcome> {
        if order.stop_price.is_none() && order.kind != OrderKind::TrailingStop {
            return Err(EngineError::InvalidParams(
                "stop orders require a stop price".to_string(),
            ));
        }
        if order.kind == OrderKind::TrailingStop && order.trail_offset.is_none() {
            return Err(EngineError::InvalidParams(
                "trailing stops require a trail offset".to_string(),
            ));
        }
        self.order_index.insert(order.id, order.pair.clone());
        let outcome = PlaceOutcome::from_order(&order, Vec::new());
        self.events.emit(EngineEvent::OrderPlaced(order.clone()));
        self.store.upsert_order(OrderRow::from(&order));
        self.with_shard(&order.pair.clone(), move |shard| {
            shard.conditional.park(order);
        })?;
        Ok(outcome)
    }

    /// OCO: a resting limit leg plus a stop leg that fires as a market
    /// order, sharing a link id. Spot only. The returned outcome is the
    /// limit leg's.
    fn submit_oco(
        &self,
        pair: &PairConfig,
        parent: Order,
        now_ms: u64,
    ) -> EngineResult<PlaceOutcome> {
        if pair.kind != MarketKind::Spot {
            return Err(EngineError::InvalidParams(
                "OCO orders are limited to spot pairs".to_string(),
            ));
        }
        let stop = parent.stop_price.ok_or_else(|| {
            EngineError::InvalidParams("OCO requires a stop price".to_string())
        })?;
        let link = Uuid::new_v4();

        let mut limit_leg = parent.clone();
        limit_leg.oco_link = Some(link);
        limit_leg.stop_price = None;

        let mut stop_leg = parent;
        stop_leg.id = Uuid::new_v4();
        stop_leg.oco_link = Some(link);
        stop_leg.price = None;
        stop_leg.stop_price = Some(stop);

        self.order_index.insert(limit_leg.id, limit_leg.pair.clone());
        self.order_index.insert(stop_leg.id, stop_leg.pair.clone());
        self.events.emit(EngineEvent::OrderPlaced(stop_leg.clone()));
        self.store.upsert_order(OrderRow::from(&stop_leg));

        self.with_shard(&pair.id, |shard| {
            shard.conditional.park(stop_leg);
            let book = shard.book.as_mut().expect("spot shard has book");
            let (outcome, links) = book.place(limit_leg, now_ms, None)?;
            for link in links {
                Self::cancel_conditional_link(shard, &link, &self.events, &self.store, now_ms);
            }
            Ok(outcome)
        })?
    }

    fn park_parent(&self, order: Order, now_ms: u64) -> EngineResult<PlaceOutcome> {
        let slice = order.slice.ok_or_else(|| {
            EngineError::InvalidParams("TWAP/VWAP orders require slice parameters".to_string())
        })?;
        if slice.interval_ms == 0 || slice.duration_ms < slice.interval_ms {
            return Err(EngineError::InvalidParams(
                "slice interval must be positive and within the duration".to_string(),
            ));
        }
        self.order_index.insert(order.id, order.pair.clone());
        let outcome = PlaceOutcome::from_order(&order, Vec::new());
        self.events.emit(EngineEvent::OrderPlaced(order.clone()));
        self.store.upsert_order(OrderRow::from(&order));
        self.with_shard(&order.pair.clone(), move |shard| {
            shard.parents.push(ParentOrder {
                next_slice_ms: now_ms + slice.interval_ms,
                end_ms: now_ms + slice.duration_ms,
                order,
            });
        })?;
        Ok(outcome)
    }

    fn order_from_request(&self, request: OrderRequest, now_ms: u64) -> EngineResult<Order> {
        let quantity = to_wei(&request.quantity)?;
        let order = Order {
            id: Uuid::new_v4(),
            owner: request.owner,
            pair: request.pair,
            side: request.side,
            kind: request.kind,
            quantity,
            price: request.price.as_deref().map(to_wei).transpose()?,
            stop_price: request.stop_price.as_deref().map(to_wei).transpose()?,
            trail_offset: request.trail_offset.as_deref().map(to_wei).transpose()?,
            oco_link: None,
            visible_qty: request.visible_qty.as_deref().map(to_wei).transpose()?,
            slice: request.slice,
            tif: request.tif,
            post_only: request.post_only,
            reduce_only: request.reduce_only,
            leverage: request.leverage,
            status: OrderStatus::Pending,
            filled: Wei::zero(),
            remaining: quantity,
            average_price: None,
            fees: Wei::zero(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };
        if order.kind == OrderKind::Iceberg && order.visible_qty.is_none() {
            return Err(EngineError::InvalidParams(
                "iceberg orders require a visible quantity".to_string(),
            ));
        }
        Ok(order)
    }

    pub(crate) fn with_shard<R>(
        &self,
        pair: &str,
        f: impl FnOnce(&mut PairShard) -> R,
    ) -> EngineResult<R> {
        let shard = self
            .shards
            .get(pair)
            .ok_or_else(|| EngineError::UnknownPair(pair.to_string()))?;
        let mut shard = shard.lock().expect("shard lock");
        Ok(f(&mut shard))
    }

    pub(crate) fn cancel_conditional_link(
        shard: &mut PairShard,
        link: &Uuid,
        events: &EventEmitter,
        store: &StoreHandle,
        now_ms: u64,
    ) {
        for order in shard.conditional.cancel_link(link, now_ms) {
            info!("oco link {link}: cancelled parked partner {}", order.id);
            events.emit(EngineEvent::OrderCancelled(order.clone()));
            store.upsert_order(OrderRow::from(&order));
        }
    }
}
