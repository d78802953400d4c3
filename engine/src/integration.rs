use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::event_emitter::{EngineEvent, EventEmitter};
use crate::markets::MarketRegistry;
use crate::math::wei::Wei;
use crate::perp::{PerpEngine, PositionView};
use crate::store::{OrderRow, StoreHandle, TradeRow};
use crate::types::{
    EngineError, EngineResult, Order, OrderId, OrderStatus, OwnerId, PairId, PlaceOutcome,
    PositionId, PositionSide, Trade,
};

/// Bridges perpetual order flow into the position engine and keeps the
/// order/position cross-references the ingress needs for cancels, queries
/// and portfolio views.
pub struct IntegrationLayer {
    perp: Arc<PerpEngine>,
    registry: Arc<MarketRegistry>,
    order_to_position: DashMap<OrderId, PositionId>,
    owner_positions: DashMap<OwnerId, HashSet<(PairId, PositionId)>>,
    perp_taker_bps: u32,
    events: Arc<EventEmitter>,
    store: StoreHandle,
}

impl IntegrationLayer {
    pub fn new(
        config: &EngineConfig,
        perp: Arc<PerpEngine>,
        registry: Arc<MarketRegistry>,
        events: Arc<EventEmitter>,
        store: StoreHandle,
    ) -> Self {
        IntegrationLayer {
            perp,
            registry,
            order_to_position: DashMap::new(),
            owner_positions: DashMap::new(),
            perp_taker_bps: config.fees.perp_taker_bps,
            events,
            store,
        }
    }

    pub fn position_for_order(&self, order_id: &OrderId) -> Option<PositionId> {
        self.order_to_position.get(order_id).map(|entry| *entry)
    }

    pub fn portfolio(&self, owner: &str) -> Vec<PositionView> {
        let Some(entry) = self.owner_positions.get(owner) else {
            return Vec::new();
        };
        entry
            .iter()
            .filter_map(|(market, position_id)| self.perp.get_position(market, position_id).ok())
            .collect()
    }

    /// Executes one perpetual submission as a single fill at the chosen
    /// price (the limit price when given, the current mark otherwise).
    ///
    /// `reduce_only` orders shrink the opposing position, capped at its
    /// size; anything else opens or aggregates through the position
    /// engine.
    pub fn process_perpetual_order(
        &self,
        mut order: Order,
        now_ms: u64,
    ) -> EngineResult<PlaceOutcome> {
        let pair = self.registry.get_pair(&order.pair)?;
        if !pair.accepts_orders() {
            return Err(EngineError::Halted(pair.id));
        }
        let side = order.side.position_side().ok_or_else(|| {
            // The engine never coerces BUY/SELL into LONG/SHORT.
            EngineError::InvalidParams(format!(
                "perpetual market {} takes LONG/SHORT, got {:?}",
                order.pair, order.side
            ))
        })?;

        let fill_price = match order.price {
            Some(price) => price,
            None => {
                let mark = self.perp.mark_price(&order.pair)?;
                if mark.is_zero() {
                    return Err(EngineError::MarketNoLiquidity);
                }
                mark
            }
        };

        if order.reduce_only {
            return self.reduce(&mut order, side.opposite(), fill_price, now_ms);
        }

        // Taker fee is charged on open notional, up front so a failed open
        // never leaves a dangling fee.
        let notional = order.quantity.mul_wei(fill_price)?;
        let fee = notional.fee_bps(self.perp_taker_bps)?;
        self.ledger_debit_fee(&order.owner, &pair.quote, fee)?;

        let position = match self.perp.open_position(
            &order.owner,
            &order.pair,
            side,
            order.quantity,
            order.leverage,
            fill_price,
            now_ms,
        ) {
            Ok(position) => position,
            Err(err) => {
                // refund the prepaid fee
                self.perp
                    .ledger()
                    .credit(&order.owner, &pair.quote, fee)
                    .ok();
                return Err(err);
            }
        };

        self.order_to_position.insert(order.id, position.id);
        self.owner_positions
            .entry(order.owner.clone())
            .or_default()
            .insert((order.pair.clone(), position.id));

        order.record_fill(fill_price, order.quantity, fee, now_ms)?;
        debug_assert_eq!(order.status, OrderStatus::Filled);

        let trade = self.settlement_trade(&order, fill_price, notional, fee, now_ms);
        self.events.emit(EngineEvent::OrderPlaced(order.clone()));
        self.events.emit(EngineEvent::OrderFilled(order.clone()));
        self.events.emit(EngineEvent::TradeExecuted(trade.clone()));
        self.store.upsert_order(OrderRow::from(&order));
        self.store.insert_trade(TradeRow {
            id: trade.id,
            taker_order: trade.taker_order,
            maker_order: trade.maker_order,
            pair: trade.pair.clone(),
            side: order.side,
            qty: trade.quantity,
            price: trade.price,
            quote_qty: trade.quote_quantity,
            fee: trade.taker_fee,
            fee_asset: pair.quote.clone(),
            owner: order.owner.clone(),
            ts_ms: trade.ts_ms,
            is_buyer_maker: trade.is_buyer_maker,
        });

        Ok(PlaceOutcome::from_order(&order, vec![trade]))
    }

    fn reduce(
        &self,
        order: &mut Order,
        opposing: PositionSide,
        fill_price: Wei,
        now_ms: u64,
    ) -> EngineResult<PlaceOutcome> {
        let existing = self
            .perp
            .find_open(&order.pair, &order.owner, opposing)?
            .ok_or(EngineError::ReduceOnlyNoPosition)?;

        let close_size = order.quantity.min(existing.size);
        let closed = self.perp.close_position(
            &order.pair,
            &existing.id,
            Some(close_size),
            Some(fill_price),
            now_ms,
        )?;
        debug!(
            "reduce-only order {} closed {close_size} of position {}",
            order.id, closed.id
        );

        self.order_to_position.insert(order.id, closed.id);
        order.record_fill(fill_price, close_size, Wei::zero(), now_ms)?;
        if !order.remaining.is_zero() {
            // the excess beyond the opposing size would flip exposure
            order.status = OrderStatus::Cancelled;
        }

        let notional = close_size.mul_wei(fill_price)?;
        let trade = self.settlement_trade(order, fill_price, notional, Wei::zero(), now_ms);
        self.events.emit(EngineEvent::OrderPlaced(order.clone()));
        self.events.emit(EngineEvent::TradeExecuted(trade.clone()));
        self.store.upsert_order(OrderRow::from(&*order));

        Ok(PlaceOutcome::from_order(order, vec![trade]))
    }

    /// One settlement-facing trade per perpetual fill; both legs reference
    /// the submitting order since the engine, not a counterparty book,
    /// took the other side.
    fn settlement_trade(
        &self,
        order: &Order,
        price: Wei,
        notional: Wei,
        fee: Wei,
        now_ms: u64,
    ) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            taker_order: order.id,
            maker_order: order.id,
            pair: order.pair.clone(),
            price,
            quantity: order.filled,
            quote_quantity: notional,
            taker_fee: fee,
            maker_fee: Wei::zero(),
            ts_ms: now_ms,
            is_buyer_maker: false,
        }
    }

    fn ledger_debit_fee(&self, owner: &str, quote: &str, fee: Wei) -> EngineResult<()> {
        self.perp
            .ledger()
            .debit(owner, quote, fee)
            .map_err(|err| match err {
                EngineError::InsufficientBalance { required, available } => {
                    EngineError::InsufficientMargin { required, available }
                }
                other => other,
            })
    }
}
