//! 256-bit target/difficulty arithmetic.
//!
//! Grounded on the `uint` crate's `construct_uint!`, the same dependency
//! `examples/xertSuns1-braiins/open/protocols/stratum` pulls in for exactly
//! this purpose. We use it instead of `num_bigint::BigUint` (as the
//! teacher's blockchain core does) because a `Target` must be `Copy` — it
//! is handed around by value through job registries, channel state, and
//! vardiff closures.

use uint::construct_uint;

construct_uint! {
    pub struct U256(4);
}

/// A 256-bit value target paired with the network's difficulty-1 target.
///
/// Both fields are plain 256-bit integers; `Target` is `Copy` and may be
/// passed around freely, matching the "targets are value objects" rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    target: U256,
    diff_1_target: U256,
}

/// Fixed-point scale used when applying a fractional vardiff factor to a
/// 256-bit integer. Six digits of precision comfortably covers the
/// [0.25, 4] clamp range used by the vardiff loop.
const FACTOR_SCALE: u64 = 1_000_000;

impl Target {
    pub fn new(target: U256, diff_1_target: U256) -> Self {
        Self {
            target,
            diff_1_target,
        }
    }

    pub fn value(&self) -> U256 {
        self.target
    }

    pub fn diff_1_target(&self) -> U256 {
        self.diff_1_target
    }

    /// Difficulty = diff_1_target / target, floor division.
    pub fn to_difficulty(&self) -> U256 {
        self.diff_1_target / self.target
    }

    /// Converts a difficulty to a target at the given network's diff-1 target.
    pub fn from_difficulty(diff: u64, diff_1_target: U256) -> Self {
        Self {
            target: diff_1_target / U256::from(diff),
            diff_1_target,
        }
    }

    /// Floors `target` by `factor`, preserving full 256-bit precision via a
    /// scaled-rational multiply rather than Python's `int // float`
    /// (which the original implementation uses and which silently loses
    /// precision on targets wider than an f64 mantissa).
    pub fn div_by_factor(&self, factor: f64) -> Self {
        debug_assert!(factor > 0.0, "vardiff factor must be positive");
        let numerator = (factor * FACTOR_SCALE as f64).round().max(1.0) as u64;
        let new_target = self.target * U256::from(FACTOR_SCALE) / U256::from(numerator);
        Self {
            target: new_target,
            diff_1_target: self.diff_1_target,
        }
    }

    /// Difficulty as `f64`, for feeding into the (already float-based)
    /// hashrate meter buffers. Lossy for difficulties beyond 2^53 but the
    /// meter itself only needs an estimate.
    pub fn diff_as_f64(&self) -> f64 {
        u256_to_f64(self.to_difficulty())
    }
}

/// Lossy 256-bit-to-`f64` conversion, most-significant byte first.
pub fn u256_to_f64(v: U256) -> f64 {
    let mut bytes = [0u8; 32];
    v.to_little_endian(&mut bytes);
    let mut result = 0f64;
    for byte in bytes.iter().rev() {
        result = result * 256.0 + (*byte as f64);
    }
    result
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target(diff={})", self.to_difficulty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff_1() -> U256 {
        U256::from(0xFFFFu64) << 208
    }

    #[test]
    fn from_difficulty_round_trips_on_exact_divisors() {
        let d1 = diff_1();
        let t = Target::from_difficulty(100_000, d1);
        assert_eq!(t.to_difficulty(), U256::from(100_000u64));
    }

    #[test]
    fn div_by_factor_quarters_and_quadruples() {
        let d1 = diff_1();
        let t = Target::from_difficulty(100_000, d1);
        let quartered = t.div_by_factor(4.0);
        // dividing the target by 4 quadruples the difficulty
        assert_eq!(quartered.to_difficulty(), U256::from(400_000u64));

        let quadrupled = t.div_by_factor(0.25);
        assert_eq!(quadrupled.to_difficulty(), U256::from(25_000u64));
    }

    #[test]
    fn copy_semantics_hold() {
        let d1 = diff_1();
        let t = Target::from_difficulty(100_000, d1);
        let t2 = t; // Copy, not move
        assert_eq!(t, t2);
    }
}
