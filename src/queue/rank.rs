//! Job ranking.
//!
//! Networked queues order jobs by a [`Fraction`] so that peers can insert and
//! reorder concurrently without agreeing on a sequence counter: a new rank is
//! always found strictly between two existing ones by walking the
//! Stern–Brocot tree. Local queues use base-36 strings compared
//! lexicographically, see [`lex_between`].

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BedloopError, Result};

/// Hard bound on mediant iterations.
pub const MAX_DEPTH: usize = 1000;

/// A non-negative rational `num/den`. `den == 0` encodes +infinity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fraction {
    pub num: u64,
    pub den: u64,
}

impl Fraction {
    pub const ZERO: Fraction = Fraction { num: 0, den: 1 };
    pub const INFINITY: Fraction = Fraction { num: 1, den: 0 };

    pub fn new(num: u64, den: u64) -> Self {
        Self { num, den }
    }

    pub fn is_infinite(&self) -> bool {
        self.den == 0
    }

    /// Floating approximation for display and tie-breaking only.
    pub fn approx(&self) -> f64 {
        if self.den == 0 {
            f64::INFINITY
        } else {
            self.num as f64 / self.den as f64
        }
    }

    fn mediant(&self, other: &Fraction) -> Option<Fraction> {
        Some(Fraction {
            num: self.num.checked_add(other.num)?,
            den: self.den.checked_add(other.den)?,
        })
    }
}

impl PartialEq for Fraction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Fraction {}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fraction {
    // a/b < c/d <=> a*d < c*b
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.num as u128 * other.den as u128;
        let rhs = other.num as u128 * self.den as u128;
        lhs.cmp(&rhs)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Returns a fraction strictly between `x` and `y` using the default
/// bounds `0/1` and `1/0`.
pub fn rational_intermediate(x: Fraction, y: Fraction) -> Result<Fraction> {
    rational_intermediate_within(x, y, Fraction::ZERO, Fraction::INFINITY)
}

/// Stern–Brocot mediant search for a fraction strictly between `x` and `y`.
///
/// Requires `lo <= x < y`. Fails with [`BedloopError::RankDepthExceeded`]
/// after [`MAX_DEPTH`] iterations or if the mediant would overflow.
pub fn rational_intermediate_within(
    x: Fraction,
    y: Fraction,
    mut lo: Fraction,
    mut hi: Fraction,
) -> Result<Fraction> {
    if x >= y {
        return Err(BedloopError::InvalidRank(format!("{x} is not below {y}")));
    }
    if x < lo || y < lo {
        return Err(BedloopError::InvalidRank(format!(
            "{x} and {y} must not be below {lo}"
        )));
    }

    for _ in 0..MAX_DEPTH {
        let mediant = lo.mediant(&hi).ok_or(BedloopError::RankDepthExceeded)?;
        if mediant <= x {
            lo = mediant;
        } else if mediant >= y {
            hi = mediant;
        } else {
            return Ok(mediant);
        }
    }
    Err(BedloopError::RankDepthExceeded)
}

const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn digit_value(c: u8) -> Result<usize> {
    DIGITS.iter().position(|&d| d == c).ok_or_else(|| {
        BedloopError::InvalidRank(format!("{:?} is not a base-36 digit", c as char))
    })
}

/// Returns a base-36 string ordered strictly between `prev` and `next`.
/// `None` leaves that side unbounded.
///
/// Fails with [`BedloopError::InvalidRank`] if either bound holds a
/// non-digit or if no string fits, as between `"a"` and `"a0"`.
pub fn lex_between(prev: Option<&str>, next: Option<&str>) -> Result<String> {
    let a = prev.unwrap_or("");
    for c in a.bytes().chain(next.unwrap_or("").bytes()) {
        digit_value(c)?;
    }
    if let Some(b) = next {
        if a >= b {
            return Err(BedloopError::InvalidRank(format!(
                "{a:?} is not below {b:?}"
            )));
        }
    }
    let out = midpoint(a.as_bytes(), next.map(str::as_bytes))?;
    // DIGITS is ASCII so this cannot fail
    let out = String::from_utf8(out).map_err(|e| BedloopError::Internal(e.to_string()))?;
    if out.as_str() <= a || next.is_some_and(|b| out.as_str() >= b) {
        return Err(BedloopError::InvalidRank(format!(
            "no rank between {a:?} and {:?}",
            next.unwrap_or("")
        )));
    }
    Ok(out)
}

fn midpoint(a: &[u8], b: Option<&[u8]>) -> Result<Vec<u8>> {
    if let Some(b) = b {
        let mut n = 0;
        while n < b.len() && a.get(n).copied().unwrap_or(b'0') == b[n] {
            n += 1;
        }
        if n > 0 {
            let mut out = b[..n].to_vec();
            out.extend(midpoint(a.get(n..).unwrap_or(&[]), Some(&b[n..]))?);
            return Ok(out);
        }
    }

    let digit_a = a.first().map(|&c| digit_value(c)).transpose()?.unwrap_or(0);
    let digit_b = b
        .and_then(|b| b.first())
        .map(|&c| digit_value(c))
        .transpose()?
        .unwrap_or(DIGITS.len());

    if digit_b.saturating_sub(digit_a) > 1 {
        Ok(vec![DIGITS[(digit_a + digit_b + 1) / 2]])
    } else if let Some(b) = b.filter(|b| b.len() > 1) {
        Ok(b[..1].to_vec())
    } else {
        let mut out = vec![DIGITS[digit_a]];
        out.extend(midpoint(a.get(1..).unwrap_or(&[]), None)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(num: u64, den: u64) -> Fraction {
        Fraction::new(num, den)
    }

    #[test]
    fn test_fraction_ordering_uses_cross_multiplication() {
        assert!(f(1, 3) < f(1, 2));
        assert_eq!(f(2, 4), f(1, 2));
        assert!(f(u64::MAX, u64::MAX - 1) > f(1, 1));
        assert!(f(5, 1) < Fraction::INFINITY);
        assert!(Fraction::ZERO < f(1, u64::MAX));
    }

    #[test]
    fn test_intermediate_is_strictly_between() {
        let cases = [
            (f(0, 1), f(1, 1)),
            (f(1, 3), f(1, 2)),
            (f(2, 1), Fraction::INFINITY),
            (f(0, 1), f(1, 7)),
            (f(355, 113), f(22, 7)),
        ];
        for (x, y) in cases {
            let r = rational_intermediate(x, y).unwrap();
            assert!(x < r && r < y, "{x} < {r} < {y}");
        }
    }

    #[test]
    fn test_intermediate_head_and_tail() {
        // Head insertion above 1/1
        assert_eq!(rational_intermediate(f(1, 1), Fraction::INFINITY).unwrap(), f(2, 1));
        // Tail insertion below 1/1
        assert_eq!(rational_intermediate(Fraction::ZERO, f(1, 1)).unwrap(), f(1, 2));
    }

    #[test]
    fn test_intermediate_rejects_bad_interval() {
        assert!(matches!(
            rational_intermediate(f(1, 2), f(1, 2)),
            Err(BedloopError::InvalidRank(_))
        ));
        assert!(matches!(
            rational_intermediate(f(2, 3), f(1, 3)),
            Err(BedloopError::InvalidRank(_))
        ));
    }

    #[test]
    fn test_depth_limit_is_deterministic() {
        // Reaching 1/n from the root takes n steps down the left spine.
        assert_eq!(rational_intermediate(Fraction::ZERO, f(1, 999)).unwrap(), f(1, 1000));
        for _ in 0..3 {
            assert!(matches!(
                rational_intermediate(Fraction::ZERO, f(1, 1000)),
                Err(BedloopError::RankDepthExceeded)
            ));
        }
    }

    #[test]
    fn test_repeated_tail_insertion_stays_ordered() {
        let mut last = f(1, 1);
        for _ in 0..50 {
            let next = rational_intermediate(Fraction::ZERO, last).unwrap();
            assert!(next < last);
            last = next;
        }
    }

    #[test]
    fn test_lex_between_unbounded() {
        let first = lex_between(None, None).unwrap();
        assert_eq!(first, "i");
        let after = lex_between(Some(&first), None).unwrap();
        assert!(after > first);
        let before = lex_between(None, Some(&first)).unwrap();
        assert!(before < first);
    }

    #[test]
    fn test_lex_between_adjacent_digits() {
        let mid = lex_between(Some("a"), Some("b")).unwrap();
        assert!(mid.as_str() > "a" && mid.as_str() < "b", "{mid}");
        let mid = lex_between(Some("z"), None).unwrap();
        assert!(mid.as_str() > "z", "{mid}");
    }

    #[test]
    fn test_lex_between_repeated_head_insertion() {
        let mut head = lex_between(None, None).unwrap();
        for _ in 0..100 {
            let next = lex_between(None, Some(&head)).unwrap();
            assert!(next < head, "{next} < {head}");
            assert!(!next.ends_with('0'));
            head = next;
        }
    }

    #[test]
    fn test_lex_between_without_room() {
        assert!(matches!(
            lex_between(Some("a"), Some("a0")),
            Err(BedloopError::InvalidRank(_))
        ));
        assert!(matches!(
            lex_between(Some("a"), Some("a00")),
            Err(BedloopError::InvalidRank(_))
        ));
    }

    #[test]
    fn test_lex_between_rejects_non_digits() {
        assert!(matches!(
            lex_between(Some("A"), None),
            Err(BedloopError::InvalidRank(_))
        ));
        assert!(matches!(
            lex_between(None, Some("a-b")),
            Err(BedloopError::InvalidRank(_))
        ));
    }

    #[test]
    fn test_lex_between_rejects_inverted() {
        assert!(lex_between(Some("b"), Some("a")).is_err());
    }
}
