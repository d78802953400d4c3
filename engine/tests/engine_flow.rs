//! End-to-end flows through the public facade: ingress-style submissions,
//! scheduler-driven marks/funding, and write-through persistence.

use std::sync::Arc;
use std::time::Duration;

use engine::markets::{PairConfig, PerpParams};
use engine::store::MemorySink;
use engine::types::{
    MarketKind, MarketStatus, OrderKind, OrderRequest, OrderSide, OrderStatus, PositionStatus,
    TimeInForce,
};
use engine::{EngineConfig, EngineError, Exchange, Scheduler, Wei};

fn w(s: &str) -> Wei {
    s.parse().unwrap()
}

fn spot_pair(id: &str) -> PairConfig {
    let (base, quote) = id.split_once('/').unwrap();
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

fn perp_market(id: &str, funding_interval_s: u64) -> PairConfig {
    PairConfig {
        id: id.to_string(),
        base: id.split('-').next().unwrap().to_string(),
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
            funding_interval_s,
            funding_rate_cap: w("0.0075"),
        }),
    }
}

fn request(
    owner: &str,
    pair: &str,
    kind: OrderKind,
    side: OrderSide,
    qty: &str,
    price: Option<&str>,
) -> OrderRequest {
    OrderRequest {
        owner: owner.to_string(),
        pair: pair.to_string(),
        kind,
        side,
        quantity: qty.to_string(),
        price: price.map(str::to_string),
        stop_price: None,
        trail_offset: None,
        visible_qty: None,
        slice: None,
        tif: TimeInForce::Gtc,
        post_only: false,
        reduce_only: false,
        leverage: 1,
    }
}

/// Config with perpetual taker fees off, so margin math matches the
/// textbook numbers exactly.
fn no_perp_fee_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.fees.perp_taker_bps = 0;
    config
}

fn spot_exchange() -> (Exchange, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let exchange = Exchange::new(EngineConfig::default(), sink.clone());
    exchange.register_pair(spot_pair("XOM/USDC")).unwrap();
    (exchange, sink)
}

fn wait_until(what: &str, pred: impl Fn() -> bool) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn test_spot_match_persists_and_sequences_events() {
    let (exchange, sink) = spot_exchange();
    let events = exchange.events().subscribe("test", 1024);

    exchange.deposit("a", "XOM", "100").unwrap();
    exchange.deposit("b", "USDC", "100").unwrap();

    let maker = exchange
        .submit(
            request("a", "XOM/USDC", OrderKind::Limit, OrderSide::Sell, "100", Some("1.25")),
            0,
        )
        .unwrap();
    let taker = exchange
        .submit(
            request("b", "XOM/USDC", OrderKind::Limit, OrderSide::Buy, "40", Some("1.30")),
            1,
        )
        .unwrap();

    assert_eq!(taker.status, OrderStatus::Filled);
    assert_eq!(taker.average_price, Some(w("1.25")));
    assert_eq!(taker.trades.len(), 1);
    let maker_after = exchange.get_order(&maker.order_id).unwrap();
    assert_eq!(maker_after.status, OrderStatus::PartiallyFilled);
    assert_eq!(maker_after.remaining, w("60"));

    // write-through: both order rows and the trade land in the sink
    wait_until("store drain", || {
        sink.trades.len() == 1 && sink.orders.len() == 2
    });
    let trade_row = sink.trades.iter().next().unwrap();
    assert_eq!(trade_row.qty, w("40"));
    assert_eq!(trade_row.price, w("1.25"));
    assert_eq!(trade_row.fee_asset, "USDC");

    // per-pair sequence numbers are contiguous for gap detection
    let seqs: Vec<u64> = events
        .try_iter()
        .filter(|e| e.event.stream_key() == "XOM/USDC")
        .map(|e| e.seq)
        .collect();
    assert!(!seqs.is_empty());
    for (offset, seq) in seqs.iter().enumerate() {
        assert_eq!(*seq, offset as u64 + 1);
    }
}

#[test]
fn test_perp_open_and_liquidation_via_scheduler() {
    let sink = Arc::new(MemorySink::default());
    let exchange = Arc::new(Exchange::new(no_perp_fee_config(), sink));
    exchange.register_pair(perp_market("BTC-USD", 3600)).unwrap();
    let scheduler = Scheduler::new(exchange.clone());

    exchange.deposit("t", "USD", "2500").unwrap();
    assert!(scheduler.submit_mark_update("BTC-USD", "50000", 1).unwrap());
    scheduler.submit_index_update("BTC-USD", "50000", 1).unwrap();

    let mut open = request("t", "BTC-USD", OrderKind::Market, OrderSide::Long, "1", None);
    open.leverage = 20;
    let outcome = exchange.submit(open, 2).unwrap();
    assert_eq!(outcome.status, OrderStatus::Filled);
    assert_eq!(outcome.average_price, Some(w("50000")));

    let position_id = exchange.position_for_order(&outcome.order_id).unwrap();
    let view = exchange.perp().get_position("BTC-USD", &position_id).unwrap();
    assert_eq!(view.position.margin, w("2500"));
    assert_eq!(view.position.liquidation_price, w("47750"));

    // mark drop sweeps the position
    assert!(scheduler.submit_mark_update("BTC-USD", "47400", 3).unwrap());
    let view = exchange.perp().get_position("BTC-USD", &position_id).unwrap();
    assert_eq!(view.position.status, PositionStatus::Liquidated);
    // residual equity -100: fee 237 in, shortfall 337 out
    assert_eq!(exchange.insurance_fund(), w("-100"));
}

#[test]
fn test_funding_flow_with_catch_up() {
    let sink = Arc::new(MemorySink::default());
    let exchange = Arc::new(Exchange::new(no_perp_fee_config(), sink));
    exchange.register_pair(perp_market("ETH-USD", 60)).unwrap();
    let scheduler = Scheduler::new(exchange.clone());

    exchange.deposit("long", "USD", "30000").unwrap();
    exchange.deposit("short", "USD", "30000").unwrap();

    scheduler.submit_mark_update("ETH-USD", "3000", 1).unwrap();
    scheduler.submit_index_update("ETH-USD", "3000", 1).unwrap();

    let long = exchange
        .submit(
            request("long", "ETH-USD", OrderKind::Market, OrderSide::Long, "10", None),
            2,
        )
        .unwrap();
    let short = exchange
        .submit(
            request("short", "ETH-USD", OrderKind::Market, OrderSide::Short, "10", None),
            2,
        )
        .unwrap();

    scheduler.submit_mark_update("ETH-USD", "3050", 3).unwrap();
    scheduler.submit_index_update("ETH-USD", "3000", 3).unwrap();

    let t0 = 1_000_000;
    scheduler.run_funding_once(t0); // seeds the clock
    // a paused process catches up on every missed interval in order
    scheduler.run_funding_once(t0 + 180_000);

    let long_position = exchange.position_for_order(&long.order_id).unwrap();
    let short_position = exchange.position_for_order(&short.order_id).unwrap();
    let long_view = exchange.perp().get_position("ETH-USD", &long_position).unwrap();
    let short_view = exchange.perp().get_position("ETH-USD", &short_position).unwrap();

    // one interval moves 0.0075 * 10 * 3050 = 228.75; three were due
    assert_eq!(long_view.position.funding_payment, w("-686.25"));
    assert_eq!(short_view.position.funding_payment, w("686.25"));
    assert_eq!(
        long_view
            .position
            .funding_payment
            .checked_add(short_view.position.funding_payment)
            .unwrap(),
        Wei::zero()
    );
    assert_eq!(
        exchange.perp().last_funding_ms("ETH-USD").unwrap(),
        t0 + 180_000
    );
}

#[test]
fn test_stop_loss_triggers_through_book() {
    let (exchange, _sink) = spot_exchange();
    let exchange = Arc::new(exchange);
    let scheduler = Scheduler::new(exchange.clone());

    exchange.deposit("bidder", "USDC", "1000").unwrap();
    exchange.deposit("seller", "XOM", "10").unwrap();

    // resting bid that the triggered stop will hit
    exchange
        .submit(
            request("bidder", "XOM/USDC", OrderKind::Limit, OrderSide::Buy, "10", Some("0.94")),
            0,
        )
        .unwrap();

    let mut stop = request("seller", "XOM/USDC", OrderKind::StopLoss, OrderSide::Sell, "10", None);
    stop.stop_price = Some("0.95".to_string());
    let parked = exchange.submit(stop, 1).unwrap();
    assert_eq!(parked.status, OrderStatus::Pending);

    // above the trigger: nothing happens
    scheduler.submit_mark_update("XOM/USDC", "0.98", 2).unwrap();
    assert_eq!(
        exchange.get_order(&parked.order_id).unwrap().status,
        OrderStatus::Pending
    );

    // at the trigger the stop converts to a market sell and fills
    scheduler.submit_mark_update("XOM/USDC", "0.95", 3).unwrap();
    let fired = exchange.get_order(&parked.order_id).unwrap();
    assert_eq!(fired.status, OrderStatus::Filled);
    assert_eq!(fired.average_price, Some(w("0.94")));
}

#[test]
fn test_twap_parent_slices_over_time() {
    let (exchange, _sink) = spot_exchange();
    let exchange = Arc::new(exchange);
    let scheduler = Scheduler::new(exchange.clone());

    exchange.deposit("t", "USDC", "1000").unwrap();

    let mut parent = request("t", "XOM/USDC", OrderKind::Twap, OrderSide::Buy, "30", Some("1.00"));
    parent.slice = Some(engine::types::SliceParams {
        duration_ms: 3_000,
        interval_ms: 1_000,
        max_participation_bps: 0,
    });
    let parent = exchange.submit(parent, 0).unwrap();
    assert_eq!(parent.status, OrderStatus::Pending);

    scheduler.run_parent_slices(1_000);
    let (best_bid, _) = exchange.best_bid_ask("XOM/USDC").unwrap();
    assert_eq!(best_bid, Some(w("1.00")));
    let snapshot = exchange.snapshot("XOM/USDC", 5, 1_000).unwrap();
    assert_eq!(snapshot.bids[0].size, w("10"));

    scheduler.run_parent_slices(2_000);
    scheduler.run_parent_slices(3_000);
    let snapshot = exchange.snapshot("XOM/USDC", 5, 3_000).unwrap();
    // 3 equal slices of 10 dispatched
    assert_eq!(snapshot.bids[0].size, w("30"));
    let parent_after = exchange.get_order(&parent.order_id);
    // parent finished; its final row reports everything dispatched
    assert!(parent_after.is_err() || parent_after.unwrap().status == OrderStatus::Filled);
}

#[test]
fn test_vwap_slice_tracks_observed_volume() {
    let (exchange, _sink) = spot_exchange();
    let exchange = Arc::new(exchange);
    let scheduler = Scheduler::new(exchange.clone());

    exchange.deposit("c", "XOM", "40").unwrap();
    exchange.deposit("d", "USDC", "100").unwrap();
    exchange.deposit("t", "USDC", "1000").unwrap();

    // 40 of interval volume for the pacer to key off
    exchange
        .submit(
            request("c", "XOM/USDC", OrderKind::Limit, OrderSide::Sell, "40", Some("1.00")),
            0,
        )
        .unwrap();
    exchange
        .submit(
            request("d", "XOM/USDC", OrderKind::Market, OrderSide::Buy, "40", None),
            1,
        )
        .unwrap();

    let mut parent = request("t", "XOM/USDC", OrderKind::Vwap, OrderSide::Buy, "100", Some("0.99"));
    parent.slice = Some(engine::types::SliceParams {
        duration_ms: 10_000,
        interval_ms: 1_000,
        max_participation_bps: 5_000,
    });
    exchange.submit(parent, 2).unwrap();

    // equal split would be 10; half the observed 40 lifts the slice to 20
    scheduler.run_parent_slices(1_002);
    let snapshot = exchange.snapshot("XOM/USDC", 5, 1_002).unwrap();
    assert_eq!(snapshot.bids[0].size, w("20"));
}

#[test]
fn test_halted_pair_rejects_and_resumes() {
    let (exchange, _sink) = spot_exchange();
    exchange.deposit("b", "USDC", "100").unwrap();

    exchange.update_status("XOM/USDC", MarketStatus::Halt).unwrap();
    let err = exchange
        .submit(
            request("b", "XOM/USDC", OrderKind::Limit, OrderSide::Buy, "1", Some("1.00")),
            0,
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::Halted(_)));

    exchange
        .update_status("XOM/USDC", MarketStatus::Trading)
        .unwrap();
    assert!(exchange
        .submit(
            request("b", "XOM/USDC", OrderKind::Limit, OrderSide::Buy, "1", Some("1.00")),
            1,
        )
        .is_ok());
}

#[test]
fn test_day_orders_expire_at_session_end() {
    let (exchange, _sink) = spot_exchange();
    let exchange = Arc::new(exchange);
    let scheduler = Scheduler::new(exchange.clone());
    exchange.deposit("b", "USDC", "100").unwrap();

    let mut day = request("b", "XOM/USDC", OrderKind::Limit, OrderSide::Buy, "1", Some("1.00"));
    day.tif = TimeInForce::Day;
    let placed = exchange.submit(day, 0).unwrap();

    scheduler.expire_session(86_400_000);
    assert_eq!(
        exchange.get_order(&placed.order_id).unwrap().status,
        OrderStatus::Expired
    );
    assert_eq!(exchange.balance("b", "USDC").held, Wei::zero());
}

#[test]
fn test_stale_and_debounced_marks_ignored() {
    let sink = Arc::new(MemorySink::default());
    let exchange = Arc::new(Exchange::new(EngineConfig::default(), sink));
    exchange.register_pair(perp_market("BTC-USD", 3600)).unwrap();
    let scheduler = Scheduler::new(exchange.clone());

    assert!(scheduler.submit_mark_update("BTC-USD", "50000", 100).unwrap());
    // older than the last applied sample
    assert!(!scheduler.submit_mark_update("BTC-USD", "49000", 50).unwrap());
    assert_eq!(exchange.perp().mark_price("BTC-USD").unwrap(), w("50000"));
    // duplicate price inside the quiescent window coalesces
    assert!(!scheduler.submit_mark_update("BTC-USD", "50000", 120).unwrap());
    // a new price applies immediately
    assert!(scheduler.submit_mark_update("BTC-USD", "50100", 130).unwrap());
}
