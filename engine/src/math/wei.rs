use std::cmp::Ordering;
use std::fmt;
use std::ops::Neg;
use std::panic::Location;
use std::str::FromStr;

use uint::construct_uint;

use crate::types::{EngineError, EngineResult};

construct_uint! {
    /// 256-bit unsigned integer.
    pub struct U256(4);
}

/// Number of fractional decimal digits carried by a [Wei] value.
pub const WEI_DECIMALS: u32 = 18;

/// Basis-point denominator.
pub const BPS_DENOM: u64 = 10_000;

fn wei_one() -> U256 {
    U256::from(10u64).pow(U256::from(WEI_DECIMALS))
}

/// Signed fixed-point quantity scaled by 10^18, stored as sign + magnitude.
///
/// All engine-internal prices, sizes, margins and fees are `Wei`. External
/// I/O uses the decimal-string form (`Display`/`FromStr`); floating point
/// never enters the math. Arithmetic is checked: overflow surfaces as
/// [EngineError::Overflow], never wraps.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Wei {
    negative: bool,
    abs: U256,
}

impl Wei {
    pub fn zero() -> Self {
        Wei {
            negative: false,
            abs: U256::zero(),
        }
    }

    /// 1.0 in wei scale.
    pub fn one() -> Self {
        Wei {
            negative: false,
            abs: wei_one(),
        }
    }

    /// Smart constructor: normalizes negative zero.
    fn new(negative: bool, abs: U256) -> Self {
        Wei {
            negative: negative && !abs.is_zero(),
            abs,
        }
    }

    /// Whole units, e.g. `Wei::from_int(3)` is 3.0.
    pub fn from_int(n: i64) -> Self {
        let abs = U256::from(n.unsigned_abs()) * wei_one();
        Wei::new(n < 0, abs)
    }

    /// Raw wei units, unscaled.
    pub fn from_raw(n: u128) -> Self {
        Wei::new(false, U256::from(n))
    }

    /// A basis-point rate as a wei-scaled fraction (`50 bps` -> `0.005`).
    pub fn from_bps(bps: u32) -> Self {
        Wei::new(
            false,
            U256::from(bps) * wei_one() / U256::from(BPS_DENOM),
        )
    }

    pub fn is_zero(&self) -> bool {
        self.abs.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn abs(&self) -> Wei {
        Wei::new(false, self.abs)
    }

    #[track_caller]
    fn overflow(op: &'static str) -> EngineError {
        let caller = Location::caller();
        log::error!("wei {op} overflow at {}:{}", caller.file(), caller.line());
        EngineError::Overflow
    }

    #[track_caller]
    pub fn checked_add(self, rhs: Wei) -> EngineResult<Wei> {
        if self.negative == rhs.negative {
            let abs = self
                .abs
                .checked_add(rhs.abs)
                .ok_or_else(|| Self::overflow("add"))?;
            Ok(Wei::new(self.negative, abs))
        } else {
            // Differing signs never overflow.
            match self.abs.cmp(&rhs.abs) {
                Ordering::Greater => Ok(Wei::new(self.negative, self.abs - rhs.abs)),
                Ordering::Less => Ok(Wei::new(rhs.negative, rhs.abs - self.abs)),
                Ordering::Equal => Ok(Wei::zero()),
            }
        }
    }

    #[track_caller]
    pub fn checked_sub(self, rhs: Wei) -> EngineResult<Wei> {
        self.checked_add(-rhs)
    }

    /// Integer product of two raw wei values; callers almost always want
    /// [Wei::mul_wei] instead.
    #[track_caller]
    pub fn checked_mul(self, rhs: Wei) -> EngineResult<Wei> {
        let abs = self
            .abs
            .checked_mul(rhs.abs)
            .ok_or_else(|| Self::overflow("mul"))?;
        Ok(Wei::new(self.negative != rhs.negative, abs))
    }

    #[track_caller]
    pub fn checked_div(self, rhs: Wei) -> EngineResult<Wei> {
        if rhs.abs.is_zero() {
            return Err(Self::overflow("div by zero"));
        }
        Ok(Wei::new(self.negative != rhs.negative, self.abs / rhs.abs))
    }

    /// Fixed-point multiply: `a * b / 1e18`, truncated toward zero.
    #[track_caller]
    pub fn mul_wei(self, rhs: Wei) -> EngineResult<Wei> {
        let abs = self
            .abs
            .checked_mul(rhs.abs)
            .ok_or_else(|| Self::overflow("mul_wei"))?
            / wei_one();
        Ok(Wei::new(self.negative != rhs.negative, abs))
    }

    /// Fixed-point divide: `a * 1e18 / b`, truncated toward zero.
    #[track_caller]
    pub fn div_wei(self, rhs: Wei) -> EngineResult<Wei> {
        if rhs.abs.is_zero() {
            return Err(Self::overflow("div_wei by zero"));
        }
        let abs = self
            .abs
            .checked_mul(wei_one())
            .ok_or_else(|| Self::overflow("div_wei"))?
            / rhs.abs;
        Ok(Wei::new(self.negative != rhs.negative, abs))
    }

    /// Divide a wei value by a plain integer, truncated toward zero.
    #[track_caller]
    pub fn div_int(self, rhs: u32) -> EngineResult<Wei> {
        if rhs == 0 {
            return Err(Self::overflow("div_int by zero"));
        }
        Ok(Wei::new(self.negative, self.abs / U256::from(rhs)))
    }

    /// Fee on a notional amount in basis points. The magnitude rounds up,
    /// so fees always round against the payer.
    #[track_caller]
    pub fn fee_bps(self, bps: u32) -> EngineResult<Wei> {
        let numer = self
            .abs
            .checked_mul(U256::from(bps))
            .ok_or_else(|| Self::overflow("fee_bps"))?;
        let denom = U256::from(BPS_DENOM);
        let mut abs = numer / denom;
        if !(numer % denom).is_zero() {
            abs += U256::one();
        }
        Ok(Wei::new(self.negative, abs))
    }

    /// Integer count of `step` units contained in the magnitude,
    /// truncating, saturating at `u128::MAX`.
    pub fn unit_count(&self, step: Wei) -> u128 {
        if step.abs.is_zero() {
            return 0;
        }
        let count = self.abs / step.abs;
        if count > U256::from(u128::MAX) {
            u128::MAX
        } else {
            count.low_u128()
        }
    }

    /// True when the magnitude is an exact multiple of `step`.
    pub fn is_multiple_of(&self, step: Wei) -> bool {
        !step.abs.is_zero() && (self.abs % step.abs).is_zero()
    }

    /// Largest multiple of `step` not exceeding the magnitude.
    pub fn round_down_to(&self, step: Wei) -> Wei {
        if step.abs.is_zero() {
            return *self;
        }
        Wei::new(self.negative, self.abs - self.abs % step.abs)
    }

    /// Clamp into `[-cap, cap]`; `cap` must be non-negative.
    pub fn clamp_symmetric(self, cap: Wei) -> Wei {
        debug_assert!(!cap.negative);
        if self.abs > cap.abs {
            Wei::new(self.negative, cap.abs)
        } else {
            self
        }
    }

    pub fn min(self, rhs: Wei) -> Wei {
        if self <= rhs {
            self
        } else {
            rhs
        }
    }

    pub fn max(self, rhs: Wei) -> Wei {
        if self >= rhs {
            self
        } else {
            rhs
        }
    }
}

impl Neg for Wei {
    type Output = Wei;

    fn neg(self) -> Wei {
        Wei::new(!self.negative, self.abs)
    }
}

impl PartialOrd for Wei {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Wei {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => self.abs.cmp(&other.abs),
            (true, true) => other.abs.cmp(&self.abs),
        }
    }
}

impl fmt::Display for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let one = wei_one();
        let int = self.abs / one;
        let frac = self.abs % one;
        let sign = if self.negative { "-" } else { "" };
        if frac.is_zero() {
            write!(f, "{sign}{int}")
        } else {
            let mut digits = frac.to_string();
            while digits.len() < WEI_DECIMALS as usize {
                digits.insert(0, '0');
            }
            write!(f, "{sign}{int}.{}", digits.trim_end_matches('0'))
        }
    }
}

impl fmt::Debug for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wei({self})")
    }
}

impl FromStr for Wei {
    type Err = EngineError;

    /// Parses a decimal literal such as `-1.25` or `50000`. Fractional
    /// digits beyond the 18th are truncated toward zero.
    fn from_str(s: &str) -> EngineResult<Wei> {
        let bad = || EngineError::InvalidParams(format!("invalid decimal literal: {s:?}"));
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        if body.is_empty() {
            return Err(bad());
        }
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(bad());
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(bad());
        }

        let int = if int_part.is_empty() {
            U256::zero()
        } else {
            U256::from_dec_str(int_part).map_err(|_| bad())?
        };
        let mut frac_digits: String = frac_part.chars().take(WEI_DECIMALS as usize).collect();
        while frac_digits.len() < WEI_DECIMALS as usize {
            frac_digits.push('0');
        }
        let frac = U256::from_dec_str(&frac_digits).map_err(|_| bad())?;

        let abs = int
            .checked_mul(wei_one())
            .and_then(|v| v.checked_add(frac))
            .ok_or(EngineError::Overflow)?;
        Ok(Wei::new(negative, abs))
    }
}

/// External boundary: decimal string -> wei.
pub fn to_wei(s: &str) -> EngineResult<Wei> {
    s.parse()
}

/// External boundary: wei -> decimal string.
pub fn from_wei(w: Wei) -> String {
    w.to_string()
}

impl serde::Serialize for Wei {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Wei {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(s: &str) -> Wei {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display_round_trip() {
        for s in ["0", "1", "-1", "1.25", "-0.005", "50000", "0.000000000000000001"] {
            assert_eq!(w(s).to_string(), s);
        }
    }

    #[test]
    fn test_parse_truncates_excess_fraction() {
        assert_eq!(w("1.0000000000000000019"), w("1.000000000000000001"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for s in ["", "-", ".", "1.2.3", "abc", "1e18", " 1"] {
            assert!(to_wei(s).is_err(), "accepted {s:?}");
        }
    }

    #[test]
    fn test_add_sub_signs() {
        assert_eq!(w("1.5").checked_add(w("-2")).unwrap(), w("-0.5"));
        assert_eq!(w("-1").checked_sub(w("-1")).unwrap(), Wei::zero());
        assert_eq!(w("2").checked_sub(w("3")).unwrap(), w("-1"));
        assert!(!w("1").checked_sub(w("1")).unwrap().is_negative());
    }

    #[test]
    fn test_mul_wei() {
        assert_eq!(w("1.25").mul_wei(w("40")).unwrap(), w("50"));
        assert_eq!(w("-2").mul_wei(w("3")).unwrap(), w("-6"));
        // truncation toward zero
        assert_eq!(
            w("-0.000000000000000001").mul_wei(w("0.5")).unwrap(),
            Wei::zero()
        );
    }

    #[test]
    fn test_div_wei() {
        assert_eq!(w("50").div_wei(w("1.25")).unwrap(), w("40"));
        assert_eq!(w("1").div_wei(w("3")).unwrap(), w("0.333333333333333333"));
        assert!(w("1").div_wei(Wei::zero()).is_err());
    }

    #[test]
    fn test_fee_rounds_up() {
        // 20 bps on 50 = 0.1 exactly
        assert_eq!(w("50").fee_bps(20).unwrap(), w("0.1"));
        // 1 bp on 1 wei rounds up to 1 wei, never to zero
        assert_eq!(
            w("0.000000000000000001").fee_bps(1).unwrap(),
            w("0.000000000000000001")
        );
    }

    #[test]
    fn test_clamp_symmetric() {
        let cap = w("0.0075");
        assert_eq!(w("0.016666666666666666").clamp_symmetric(cap), cap);
        assert_eq!(w("-0.02").clamp_symmetric(cap), -cap);
        assert_eq!(w("0.001").clamp_symmetric(cap), w("0.001"));
    }

    #[test]
    fn test_ordering() {
        assert!(w("-2") < w("-1"));
        assert!(w("-1") < w("0"));
        assert!(w("0.5") < w("1"));
        assert_eq!(Wei::zero(), -Wei::zero());
    }

    #[test]
    fn test_from_bps() {
        assert_eq!(Wei::from_bps(50), w("0.005"));
        assert_eq!(Wei::from_bps(10_000), Wei::one());
    }

    #[test]
    fn test_mul_overflow_errors() {
        let huge = w("100000000000000000000000000000000000000000000000000000000000");
        assert!(matches!(
            huge.mul_wei(huge),
            Err(EngineError::Overflow)
        ));
    }
}
