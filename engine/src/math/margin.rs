use crate::math::wei::Wei;
use crate::types::{EngineResult, PositionSide};

/// Collateral required to open `size` at `price` with `leverage`.
pub fn required_margin(size: Wei, price: Wei, leverage: u32) -> EngineResult<Wei> {
    size.mul_wei(price)?.div_int(leverage)
}

/// Price at which a position's equity hits the maintenance threshold.
///
/// LONG:  `entry * (1 - 1/leverage + maintenance)`
/// SHORT: `entry * (1 + 1/leverage - maintenance)`
pub fn liquidation_price(
    entry: Wei,
    leverage: u32,
    maintenance_bps: u32,
    side: PositionSide,
) -> EngineResult<Wei> {
    let inverse_leverage = Wei::one().div_int(leverage)?;
    let maintenance = Wei::from_bps(maintenance_bps);
    let factor = match side {
        PositionSide::Long => Wei::one()
            .checked_sub(inverse_leverage)?
            .checked_add(maintenance)?,
        PositionSide::Short => Wei::one()
            .checked_add(inverse_leverage)?
            .checked_sub(maintenance)?,
    };
    entry.mul_wei(factor)
}

/// Per-interval funding rate: `(mark - index) / index` clamped into
/// `[-cap, cap]`. Positive means longs pay shorts.
pub fn funding_rate(mark: Wei, index: Wei, cap: Wei) -> EngineResult<Wei> {
    let raw = mark.checked_sub(index)?.div_wei(index)?;
    Ok(raw.clamp_symmetric(cap))
}

/// Funding transferred on one position for one interval:
/// `rate * size * mark`, signed like the rate.
pub fn funding_payment(rate: Wei, size: Wei, mark: Wei) -> EngineResult<Wei> {
    rate.mul_wei(size.mul_wei(mark)?)
}

/// A position is liquidatable once `margin + unrealized_pnl` no longer
/// exceeds the maintenance requirement on current notional.
pub fn is_liquidatable(
    margin: Wei,
    unrealized_pnl: Wei,
    size: Wei,
    mark: Wei,
    maintenance_bps: u32,
) -> EngineResult<bool> {
    let equity = margin.checked_add(unrealized_pnl)?;
    let maintenance = size.mul_wei(mark)?.mul_wei(Wei::from_bps(maintenance_bps))?;
    Ok(equity <= maintenance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(s: &str) -> Wei {
        s.parse().unwrap()
    }

    #[test]
    fn test_required_margin() {
        assert_eq!(required_margin(w("1"), w("50000"), 20).unwrap(), w("2500"));
        assert_eq!(required_margin(w("10"), w("3000"), 1).unwrap(), w("30000"));
    }

    #[test]
    fn test_liquidation_price_long_short() {
        // 20x long at 50000, maintenance 50 bps: 50000 * 0.955
        assert_eq!(
            liquidation_price(w("50000"), 20, 50, PositionSide::Long).unwrap(),
            w("47750")
        );
        assert_eq!(
            liquidation_price(w("50000"), 20, 50, PositionSide::Short).unwrap(),
            w("52250")
        );
    }

    #[test]
    fn test_liquidation_price_tracks_leverage() {
        // More leverage leaves less cushion: the long trigger climbs toward
        // entry, the short trigger falls toward it.
        let mut last_long = Wei::zero();
        let mut last_short = w("1000000");
        for leverage in [2u32, 5, 10, 20, 50] {
            let long = liquidation_price(w("50000"), leverage, 50, PositionSide::Long).unwrap();
            let short = liquidation_price(w("50000"), leverage, 50, PositionSide::Short).unwrap();
            assert!(long > last_long);
            assert!(short < last_short);
            last_long = long;
            last_short = short;
        }
    }

    #[test]
    fn test_funding_rate_clamped() {
        // mark 3050 / index 3000 -> 1.666..% raw, clamped to 0.75%
        let rate = funding_rate(w("3050"), w("3000"), w("0.0075")).unwrap();
        assert_eq!(rate, w("0.0075"));

        let rate = funding_rate(w("2950"), w("3000"), w("0.0075")).unwrap();
        assert_eq!(rate, w("-0.0075"));

        let rate = funding_rate(w("3003"), w("3000"), w("0.0075")).unwrap();
        assert_eq!(rate, w("0.001"));
    }

    #[test]
    fn test_funding_payment() {
        let rate = w("0.0075");
        assert_eq!(
            funding_payment(rate, w("10"), w("3050")).unwrap(),
            w("228.75")
        );
    }

    #[test]
    fn test_is_liquidatable_boundary() {
        // margin 2500, pnl -2600, size 1, mark 47400, maintenance 50 bps:
        // equity -100 <= 237 maintenance
        assert!(is_liquidatable(w("2500"), w("-2600"), w("1"), w("47400"), 50).unwrap());
        // healthy position
        assert!(!is_liquidatable(w("2500"), w("0"), w("1"), w("50000"), 50).unwrap());
    }
}
