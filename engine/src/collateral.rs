use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::math::wei::Wei;
use crate::types::{AssetId, EngineError, EngineResult, OrderId, OwnerId};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Balance {
    /// Spendable funds.
    pub available: Wei,
    /// Funds reserved against resting orders.
    pub held: Wei,
}

#[derive(Debug, Clone)]
struct Hold {
    owner: OwnerId,
    asset: AssetId,
    remaining: Wei,
}

/// Per-owner per-asset balance ledger.
///
/// Spot orders reserve funds at placement (quote notional plus worst-case
/// fee for buys, base quantity for sells) under a per-order hold; fills
/// consume from the hold and leftovers release when the order reaches a
/// terminal state. Perpetual margin debits spendable quote directly.
/// Each `(owner, asset)` entry mutates under its dashmap shard lock.
#[derive(Default)]
pub struct CollateralLedger {
    balances: DashMap<(OwnerId, AssetId), Balance>,
    holds: DashMap<OrderId, Hold>,
}

impl CollateralLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposit(&self, owner: &str, asset: &str, amount: Wei) -> EngineResult<()> {
        debug_assert!(!amount.is_negative());
        let mut entry = self
            .balances
            .entry((owner.to_string(), asset.to_string()))
            .or_default();
        entry.available = entry.available.checked_add(amount)?;
        debug!("deposit {amount} {asset} for {owner}");
        Ok(())
    }

    pub fn withdraw(&self, owner: &str, asset: &str, amount: Wei) -> EngineResult<()> {
        let mut entry = self
            .balances
            .entry((owner.to_string(), asset.to_string()))
            .or_default();
        if entry.available < amount {
            return Err(EngineError::InsufficientBalance {
                required: amount,
                available: entry.available,
            });
        }
        entry.available = entry.available.checked_sub(amount)?;
        Ok(())
    }

    pub fn balance(&self, owner: &str, asset: &str) -> Balance {
        self.balances
            .get(&(owner.to_string(), asset.to_string()))
            .map(|entry| *entry)
            .unwrap_or_default()
    }

    /// Moves `amount` from available to held, keyed by the order that
    /// reserves it.
    pub fn place_hold(
        &self,
        order_id: OrderId,
        owner: &str,
        asset: &str,
        amount: Wei,
    ) -> EngineResult<()> {
        let mut entry = self
            .balances
            .entry((owner.to_string(), asset.to_string()))
            .or_default();
        if entry.available < amount {
            return Err(EngineError::InsufficientBalance {
                required: amount,
                available: entry.available,
            });
        }
        entry.available = entry.available.checked_sub(amount)?;
        entry.held = entry.held.checked_add(amount)?;
        drop(entry);
        self.holds.insert(
            order_id,
            Hold {
                owner: owner.to_string(),
                asset: asset.to_string(),
                remaining: amount,
            },
        );
        Ok(())
    }

    /// Consumes `amount` out of an order's hold, e.g. the cost+fee of one
    /// fill. Consuming more than remains is a caller bug and surfaces as
    /// overflow.
    pub fn consume_hold(&self, order_id: &OrderId, amount: Wei) -> EngineResult<()> {
        let mut hold = self
            .holds
            .get_mut(order_id)
            .ok_or(EngineError::OrderNotFound(*order_id))?;
        hold.remaining = hold.remaining.checked_sub(amount)?;
        if hold.remaining.is_negative() {
            return Err(EngineError::Overflow);
        }
        let key = (hold.owner.clone(), hold.asset.clone());
        drop(hold);
        let mut entry = self.balances.entry(key).or_default();
        entry.held = entry.held.checked_sub(amount)?;
        Ok(())
    }

    /// Returns an order's unused hold to available funds and forgets the
    /// hold. Safe to call for orders that never held (no-op).
    pub fn release_hold(&self, order_id: &OrderId) -> EngineResult<()> {
        let Some((_, hold)) = self.holds.remove(order_id) else {
            return Ok(());
        };
        if hold.remaining.is_zero() {
            return Ok(());
        }
        let mut entry = self.balances.entry((hold.owner, hold.asset)).or_default();
        entry.held = entry.held.checked_sub(hold.remaining)?;
        entry.available = entry.available.checked_add(hold.remaining)?;
        Ok(())
    }

    /// Gives back part of a hold without consuming it (order size-down).
    pub fn release_partial(&self, order_id: &OrderId, amount: Wei) -> EngineResult<()> {
        let mut hold = self
            .holds
            .get_mut(order_id)
            .ok_or(EngineError::OrderNotFound(*order_id))?;
        let amount = amount.min(hold.remaining);
        hold.remaining = hold.remaining.checked_sub(amount)?;
        let key = (hold.owner.clone(), hold.asset.clone());
        drop(hold);
        let mut entry = self.balances.entry(key).or_default();
        entry.held = entry.held.checked_sub(amount)?;
        entry.available = entry.available.checked_add(amount)?;
        Ok(())
    }

    /// Credits trade proceeds.
    pub fn credit(&self, owner: &str, asset: &str, amount: Wei) -> EngineResult<()> {
        debug_assert!(!amount.is_negative());
        let mut entry = self
            .balances
            .entry((owner.to_string(), asset.to_string()))
            .or_default();
        entry.available = entry.available.checked_add(amount)?;
        Ok(())
    }

    /// Direct spend of available funds (perpetual margin lockup).
    pub fn debit(&self, owner: &str, asset: &str, amount: Wei) -> EngineResult<()> {
        let mut entry = self
            .balances
            .entry((owner.to_string(), asset.to_string()))
            .or_default();
        if entry.available < amount {
            return Err(EngineError::InsufficientBalance {
                required: amount,
                available: entry.available,
            });
        }
        entry.available = entry.available.checked_sub(amount)?;
        Ok(())
    }
}
