//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::collateral::CollateralLedger;
use crate::event_emitter::EventEmitter;
use crate::markets::{PairConfig, PerpParams};
use crate::math::wei::Wei;
use crate::store::{spawn_store, MemorySink, StoreHandle};
use crate::types::{
    MarketKind, MarketStatus, Order, OrderKind, OrderSide, OrderStatus, TimeInForce,
};

pub(crate) fn w(s: &str) -> Wei {
    s.parse().unwrap()
}

pub(crate) fn spot_pair(id: &str) -> PairConfig {
    let (base, quote) = id.split_once('/').unwrap_or(("XOM", "USDC"));
    PairConfig {
        id: id.to_string(),
        base: base.to_string(),
        quote: quote.to_string(),
        kind: MarketKind::Spot,
        min_size: w("0.01"),
        max_size: w("1000000"),
        tick_size: w("0.01"),
        size_increment: w("0.01"),
        maker_fee_bps: 10,
        taker_fee_bps: 20,
        status: MarketStatus::Trading,
        perp: None,
    }
}

pub(crate) fn perp_market(id: &str) -> PairConfig {
    PairConfig {
        id: id.to_string(),
        base: id.split('-').next().unwrap_or("BTC").to_string(),
        quote: "USD".to_string(),
        kind: MarketKind::Perpetual,
        min_size: w("0.001"),
        max_size: w("10000"),
        tick_size: w("0.01"),
        size_increment: w("0.001"),
        maker_fee_bps: 10,
        taker_fee_bps: 20,
        status: MarketStatus::Trading,
        perp: Some(PerpParams {
            max_leverage: 20,
            initial_margin_bps: 500,
            maintenance_margin_bps: 50,
            funding_interval_s: 60,
            funding_rate_cap: w("0.0075"),
        }),
    }
}

pub(crate) fn order(
    owner: &str,
    pair: &str,
    side: OrderSide,
    kind: OrderKind,
    qty: &str,
    price: Option<&str>,
) -> Order {
    Order {
        id: Uuid::new_v4(),
        owner: owner.to_string(),
        pair: pair.to_string(),
        side,
        kind,
        quantity: w(qty),
        price: price.map(w),
        stop_price: None,
        trail_offset: None,
        oco_link: None,
        visible_qty: None,
        slice: None,
        tif: TimeInForce::Gtc,
        post_only: false,
        reduce_only: false,
        leverage: 1,
        status: OrderStatus::Pending,
        filled: Wei::zero(),
        remaining: w(qty),
        average_price: None,
        fees: Wei::zero(),
        created_at_ms: 0,
        updated_at_ms: 0,
    }
}

pub(crate) fn limit(owner: &str, pair: &str, side: OrderSide, qty: &str, price: &str) -> Order {
    order(owner, pair, side, OrderKind::Limit, qty, Some(price))
}

pub(crate) fn market(owner: &str, pair: &str, side: OrderSide, qty: &str) -> Order {
    order(owner, pair, side, OrderKind::Market, qty, None)
}

pub(crate) fn parked_stop(
    owner: &str,
    side: OrderSide,
    qty: &str,
    stop: &str,
    kind: OrderKind,
) -> Order {
    let mut order = order(owner, "XOM/USDC", side, kind, qty, None);
    order.stop_price = Some(w(stop));
    order
}

/// Ledger + bus + store wired to an inspectable in-memory sink.
pub(crate) struct Harness {
    pub ledger: Arc<CollateralLedger>,
    pub events: Arc<EventEmitter>,
    pub store: StoreHandle,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    pub fn new() -> Self {
        let sink = Arc::new(MemorySink::default());
        let (store, _worker) = spawn_store(4096, sink.clone());
        Harness {
            ledger: Arc::new(CollateralLedger::new()),
            events: Arc::new(EventEmitter::new(Duration::from_millis(200))),
            store,
            sink,
        }
    }
}
