use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::math::wei::Wei;

pub type EngineResult<T> = Result<T, EngineError>;

pub type OrderId = Uuid;
pub type PositionId = Uuid;
pub type TradeId = Uuid;

/// Spot pair or perpetual market identifier, e.g. `XOM/USDC` or `BTC-USD`.
pub type PairId = String;
/// Authenticated account identifier, opaque to the engine.
pub type OwnerId = String;
/// Asset symbol used by the collateral ledger.
pub type AssetId = String;

#[derive(Debug, Error)]
pub enum EngineError {
    // input
    #[error("unknown pair {0}")]
    UnknownPair(PairId),
    #[error("pair {0} already registered")]
    DuplicatePair(PairId),
    #[error("pair {0} is not accepting orders")]
    Halted(PairId),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("price is not a multiple of tick size {tick}")]
    TickSize { tick: Wei },
    #[error("size is not a multiple of increment {increment}")]
    SizeIncrement { increment: Wei },
    #[error("leverage {requested} outside [1, {max}]")]
    LeverageRange { requested: u32, max: u32 },
    #[error("limit order requires a price")]
    MissingPriceForLimit,

    // state
    #[error("order {0} not found")]
    OrderNotFound(OrderId),
    #[error("order {0} does not belong to caller")]
    Unauthorized(OrderId),
    #[error("order {0} is in a terminal state")]
    NotCancellable(OrderId),
    #[error("position {0} not found")]
    PositionNotFound(PositionId),

    // policy
    #[error("post-only order would cross the book")]
    PostOnlyWouldCross,
    #[error("fill-or-kill quantity cannot be met")]
    FokUnfillable,
    #[error("no liquidity to fill market order")]
    MarketNoLiquidity,
    #[error("reduce-only order has no opposing position")]
    ReduceOnlyNoPosition,
    #[error("order blocked by self-trade prevention")]
    SelfTradeBlocked,

    // capacity / resource
    #[error("insufficient margin: required {required}, free {available}")]
    InsufficientMargin { required: Wei, available: Wei },
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Wei, available: Wei },
    #[error("write-through store is saturated")]
    StoreBackpressure,

    // arithmetic
    #[error("arithmetic overflow")]
    Overflow,

    #[error("internal error")]
    Internal,
}

impl EngineError {
    /// Boundary policy: arithmetic and capacity faults are logged with
    /// context by the raising site and leave the engine as opaque
    /// `Internal`; every other kind passes through unchanged.
    pub fn redact(self) -> EngineError {
        match self {
            EngineError::Overflow | EngineError::StoreBackpressure => EngineError::Internal,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketKind {
    Spot,
    Perpetual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketStatus {
    Trading,
    Halt,
    Maintenance,
}

/// `Buy`/`Sell` for spot pairs, `Long`/`Short` for perpetuals. The engine
/// does not coerce between the two; a perpetual submission carrying a spot
/// side is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
    Long,
    Short,
}

impl OrderSide {
    /// Bids rest on (and takers of asks come from) the buy side.
    pub fn is_bid(&self) -> bool {
        matches!(self, OrderSide::Buy | OrderSide::Long)
    }

    pub fn is_perp(&self) -> bool {
        matches!(self, OrderSide::Long | OrderSide::Short)
    }

    pub fn position_side(&self) -> Option<PositionSide> {
        match self {
            OrderSide::Long => Some(PositionSide::Long),
            OrderSide::Short => Some(PositionSide::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    StopLoss,
    StopLimit,
    TrailingStop,
    Oco,
    Iceberg,
    Twap,
    Vwap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    #[default]
    Gtc,
    Day,
    Ioc,
    Fok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    /// Terminal states are absorbing; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }
}

/// Pacing parameters for TWAP/VWAP parent orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceParams {
    pub duration_ms: u64,
    pub interval_ms: u64,
    /// Cap on a VWAP slice as a share of volume traded in the previous
    /// interval; ignored for TWAP.
    pub max_participation_bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub owner: OwnerId,
    pub pair: PairId,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Total quantity in wei; `filled + remaining == quantity` always.
    pub quantity: Wei,
    pub price: Option<Wei>,
    /// Trigger price for stop/stop-limit orders.
    pub stop_price: Option<Wei>,
    /// Distance the trigger trails behind the best favorable price.
    pub trail_offset: Option<Wei>,
    /// Shared link id of an OCO pair; filling or cancelling either leg
    /// cancels the other.
    pub oco_link: Option<Uuid>,
    /// Displayed tranche size of an iceberg order.
    pub visible_qty: Option<Wei>,
    pub slice: Option<SliceParams>,
    pub tif: TimeInForce,
    pub post_only: bool,
    pub reduce_only: bool,
    /// 1 for spot.
    pub leverage: u32,
    pub status: OrderStatus,
    /// Monotonically non-decreasing.
    pub filled: Wei,
    pub remaining: Wei,
    /// Size-weighted mean execution price; `None` until the first fill.
    pub average_price: Option<Wei>,
    /// Fees accumulated across this order's fills.
    pub fees: Wei,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Order {
    /// Applies one fill, keeping the quantity, average-price and status
    /// invariants. `fee` is this fill's fee for the order's owner.
    pub fn record_fill(&mut self, price: Wei, qty: Wei, fee: Wei, now_ms: u64) -> EngineResult<()> {
        let prev_notional = match self.average_price {
            Some(avg) => avg.mul_wei(self.filled)?,
            None => Wei::zero(),
        };
        self.filled = self.filled.checked_add(qty)?;
        self.remaining = self.remaining.checked_sub(qty)?;
        let notional = prev_notional.checked_add(price.mul_wei(qty)?)?;
        self.average_price = Some(notional.div_wei(self.filled)?);
        self.fees = self.fees.checked_add(fee)?;
        self.status = if self.remaining.is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at_ms = now_ms;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub owner: OwnerId,
    pub market: PairId,
    pub side: PositionSide,
    /// Unsigned size in wei; direction lives in `side`.
    pub size: Wei,
    /// Size-weighted average entry price.
    pub entry_price: Wei,
    /// Collateral locked against this position.
    pub margin: Wei,
    pub leverage: u32,
    /// Realized on partial/full closes, signed.
    pub realized_pnl: Wei,
    /// Cumulative funding transferred; positive means received.
    pub funding_payment: Wei,
    pub last_funding_ms: u64,
    pub liquidation_price: Wei,
    pub status: PositionStatus,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Position {
    /// Mark-to-market profit, signed: `(mark - entry) * size` for longs,
    /// mirrored for shorts.
    pub fn unrealized_pnl(&self, mark: Wei) -> EngineResult<Wei> {
        let diff = match self.side {
            PositionSide::Long => mark.checked_sub(self.entry_price)?,
            PositionSide::Short => self.entry_price.checked_sub(mark)?,
        };
        diff.mul_wei(self.size)
    }

    pub fn notional(&self, mark: Wei) -> EngineResult<Wei> {
        self.size.mul_wei(mark)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub taker_order: OrderId,
    pub maker_order: OrderId,
    pub pair: PairId,
    pub price: Wei,
    pub quantity: Wei,
    /// `price * quantity / 1e18`.
    pub quote_quantity: Wei,
    pub taker_fee: Wei,
    pub maker_fee: Wei,
    pub ts_ms: u64,
    /// True when the resting side of this trade was the buyer.
    pub is_buyer_maker: bool,
}

/// Ingress submission record: quantities arrive as decimal strings and are
/// converted at this boundary only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub owner: OwnerId,
    pub pair: PairId,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub quantity: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub stop_price: Option<String>,
    #[serde(default)]
    pub trail_offset: Option<String>,
    #[serde(default)]
    pub visible_qty: Option<String>,
    #[serde(default)]
    pub slice: Option<SliceParams>,
    #[serde(default)]
    pub tif: TimeInForce,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

fn default_leverage() -> u32 {
    1
}

/// Successful placement summary returned to the ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOutcome {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub filled: Wei,
    pub remaining: Wei,
    pub average_price: Option<Wei>,
    pub fees: Wei,
    pub trades: Vec<Trade>,
}

impl PlaceOutcome {
    pub fn from_order(order: &Order, trades: Vec<Trade>) -> Self {
        PlaceOutcome {
            order_id: order.id,
            status: order.status,
            filled: order.filled,
            remaining: order.remaining,
            average_price: order.average_price,
            fees: order.fees,
            trades,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(s: &str) -> Wei {
        s.parse().unwrap()
    }

    fn base_order() -> Order {
        Order {
            id: Uuid::new_v4(),
            owner: "alice".to_string(),
            pair: "XOM/USDC".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Limit,
            quantity: w("100"),
            price: Some(w("1.25")),
            stop_price: None,
            trail_offset: None,
            oco_link: None,
            visible_qty: None,
            slice: None,
            tif: TimeInForce::Gtc,
            post_only: false,
            reduce_only: false,
            leverage: 1,
            status: OrderStatus::Open,
            filled: Wei::zero(),
            remaining: w("100"),
            average_price: None,
            fees: Wei::zero(),
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn test_record_fill_weighted_average() {
        let mut order = base_order();
        order
            .record_fill(w("1.00"), w("40"), Wei::zero(), 1)
            .unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.average_price, Some(w("1.00")));

        order
            .record_fill(w("1.50"), w("60"), Wei::zero(), 2)
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled, w("100"));
        assert_eq!(order.remaining, Wei::zero());
        // 40*1.0 + 60*1.5 = 130 over 100
        assert_eq!(order.average_price, Some(w("1.3")));
    }

    #[test]
    fn test_fill_conserves_quantity() {
        let mut order = base_order();
        order.record_fill(w("1.25"), w("33"), w("0.01"), 1).unwrap();
        assert_eq!(
            order.filled.checked_add(order.remaining).unwrap(),
            order.quantity
        );
        assert_eq!(order.fees, w("0.01"));
    }

    #[test]
    fn test_unrealized_pnl_signs() {
        let position = Position {
            id: Uuid::new_v4(),
            owner: "bob".to_string(),
            market: "BTC-USD".to_string(),
            side: PositionSide::Long,
            size: w("1"),
            entry_price: w("50000"),
            margin: w("2500"),
            leverage: 20,
            realized_pnl: Wei::zero(),
            funding_payment: Wei::zero(),
            last_funding_ms: 0,
            liquidation_price: w("47750"),
            status: PositionStatus::Open,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        assert_eq!(position.unrealized_pnl(w("51000")).unwrap(), w("1000"));
        assert_eq!(position.unrealized_pnl(w("47400")).unwrap(), w("-2600"));

        let mut short = position.clone();
        short.side = PositionSide::Short;
        assert_eq!(short.unrealized_pnl(w("47400")).unwrap(), w("2600"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
