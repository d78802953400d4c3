use uuid::Uuid;

use crate::math::wei::Wei;
use crate::types::{EngineResult, Order, OrderId, OrderKind, OrderStatus};

/// Stop, stop-limit and trailing-stop orders parked until their trigger
/// price is reached. The set never matches anything itself: the scheduler
/// evaluates it on each mark/last-price update and routes triggered orders
/// back through the normal placement path.
#[derive(Default)]
pub struct ConditionalSet {
    orders: Vec<Order>,
}

/// What a triggered conditional becomes when it re-enters placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Market,
    Limit,
}

impl ConditionalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn park(&mut self, order: Order) {
        debug_assert!(matches!(
            order.kind,
            OrderKind::StopLoss | OrderKind::StopLimit | OrderKind::TrailingStop | OrderKind::Oco
        ));
        self.orders.push(order);
    }

    pub fn get(&self, order_id: &OrderId) -> Option<&Order> {
        self.orders.iter().find(|o| o.id == *order_id)
    }

    pub fn remove(&mut self, order_id: &OrderId) -> Option<Order> {
        let idx = self.orders.iter().position(|o| o.id == *order_id)?;
        Some(self.orders.swap_remove(idx))
    }

    /// Cancels every parked member of an OCO link; returns them for event
    /// emission.
    pub fn cancel_link(&mut self, link: &Uuid, now_ms: u64) -> Vec<Order> {
        let mut cancelled = Vec::new();
        let mut idx = 0;
        while idx < self.orders.len() {
            if self.orders[idx].oco_link == Some(*link) {
                let mut order = self.orders.swap_remove(idx);
                order.status = OrderStatus::Cancelled;
                order.updated_at_ms = now_ms;
                cancelled.push(order);
            } else {
                idx += 1;
            }
        }
        cancelled
    }

    pub fn owner_orders(&self, owner: &str) -> Vec<Order> {
        self.orders
            .iter()
            .filter(|o| o.owner == owner)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Order> {
        self.orders.clone()
    }

    /// Evaluates every parked order against a fresh price. Trailing stops
    /// first ratchet their trigger with the favorable extreme, then any
    /// order whose trigger has been reached is removed and returned with
    /// the action it converts to.
    pub fn on_price(&mut self, price: Wei) -> EngineResult<Vec<(Order, TriggerAction)>> {
        for order in &mut self.orders {
            if order.kind != OrderKind::TrailingStop {
                continue;
            }
            let Some(offset) = order.trail_offset else {
                continue;
            };
            // A sell trail hangs below the running high, a buy trail above
            // the running low; the trigger only ever tightens.
            let candidate = if order.side.is_bid() {
                price.checked_add(offset)?
            } else {
                price.checked_sub(offset)?
            };
            order.stop_price = Some(match order.stop_price {
                None => candidate,
                Some(current) if order.side.is_bid() => current.min(candidate),
                Some(current) => current.max(candidate),
            });
        }

        let mut triggered = Vec::new();
        let mut idx = 0;
        while idx < self.orders.len() {
            let order = &self.orders[idx];
            let fire = match order.stop_price {
                // A buy stop arms above the market, a sell stop below.
                Some(stop) if order.side.is_bid() => price >= stop,
                Some(stop) => price <= stop,
                None => false,
            };
            if fire {
                let order = self.orders.swap_remove(idx);
                let action = match order.kind {
                    OrderKind::StopLimit => TriggerAction::Limit,
                    OrderKind::Oco if order.price.is_some() => TriggerAction::Limit,
                    _ => TriggerAction::Market,
                };
                triggered.push((order, action));
            } else {
                idx += 1;
            }
        }
        Ok(triggered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{parked_stop, w};
    use crate::types::OrderSide;

    #[test]
    fn test_sell_stop_fires_below_trigger() {
        let mut set = ConditionalSet::new();
        set.park(parked_stop("alice", OrderSide::Sell, "10", "95", OrderKind::StopLoss));

        assert!(set.on_price(w("96")).unwrap().is_empty());
        let fired = set.on_price(w("95")).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, TriggerAction::Market);
        assert!(set.is_empty());
    }

    #[test]
    fn test_buy_stop_fires_above_trigger() {
        let mut set = ConditionalSet::new();
        set.park(parked_stop("alice", OrderSide::Buy, "10", "105", OrderKind::StopLoss));

        assert!(set.on_price(w("104.99")).unwrap().is_empty());
        let fired = set.on_price(w("105")).unwrap();
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_stop_limit_converts_to_limit() {
        let mut set = ConditionalSet::new();
        let mut order = parked_stop("alice", OrderSide::Sell, "10", "95", OrderKind::StopLimit);
        order.price = Some(w("94.5"));
        set.park(order);

        let fired = set.on_price(w("94")).unwrap();
        assert_eq!(fired[0].1, TriggerAction::Limit);
        assert_eq!(fired[0].0.price, Some(w("94.5")));
    }

    #[test]
    fn test_trailing_stop_ratchets() {
        let mut set = ConditionalSet::new();
        let mut order = parked_stop("alice", OrderSide::Sell, "10", "0", OrderKind::TrailingStop);
        order.stop_price = None;
        order.trail_offset = Some(w("5"));
        set.park(order);

        // first sample arms the trigger at 100 - 5
        assert!(set.on_price(w("100")).unwrap().is_empty());
        // rally drags the trigger up to 105
        assert!(set.on_price(w("110")).unwrap().is_empty());
        // pullback that would have been safe against the old trigger fires
        let fired = set.on_price(w("105")).unwrap();
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_trailing_never_loosens() {
        let mut set = ConditionalSet::new();
        let mut order = parked_stop("alice", OrderSide::Sell, "10", "0", OrderKind::TrailingStop);
        order.stop_price = None;
        order.trail_offset = Some(w("5"));
        set.park(order);

        set.on_price(w("110")).unwrap(); // trigger 105
        set.on_price(w("106")).unwrap(); // lower high must not move it down
        let fired = set.on_price(w("105.5")).unwrap();
        assert!(fired.is_empty());
        let fired = set.on_price(w("105")).unwrap();
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_cancel_link_clears_all_members() {
        let mut set = ConditionalSet::new();
        let link = uuid::Uuid::new_v4();
        let mut a = parked_stop("alice", OrderSide::Sell, "10", "95", OrderKind::Oco);
        a.oco_link = Some(link);
        set.park(a);

        let cancelled = set.cancel_link(&link, 7);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].status, OrderStatus::Cancelled);
        assert!(set.is_empty());
    }
}
