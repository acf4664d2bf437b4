//! Difficulty ratio and kQuai controller delta.
//!
//! The node exposes two normalized difficulties per Prime block: the miner
//! difficulty `d` and the best difficulty `d*`. The controller compares them
//! and nudges kQuai by `α · (d*/d − 1)` with α = 0.001.
//!
//! The node does this in integer arithmetic at a 2^64 scale, truncating after
//! every division, and the values shown here have to agree with it bit for
//! bit:
//!
//! ```text
//! ratio_scaled   = floor(best · 2^64 / miner)
//! delta_scaled   = ratio_scaled − 2^64
//! delta_k_scaled = delta_scaled / one_over_alpha    (toward zero)
//! ```

use ruint::aliases::U256;
use serde::Serialize;

use crate::fixed::{widen, Fixed, SCALE, SCALE_BITS};
use crate::units::parse_hex_quantity;

/// Reciprocal of the controller gain α = 0.001.
pub const ONE_OVER_ALPHA: u64 = 1000;

/// A normalized difficulty as reported by the node.
pub type Difficulty = U256;

/// Parse a node difficulty.
///
/// Accepts hex with or without a `0x` prefix. Empty, zero, non-hex and
/// wider-than-256-bit values all count as "no difficulty".
pub fn parse_difficulty(hex: &str) -> Option<Difficulty> {
    parse_hex_quantity(hex).filter(|value| !value.is_zero())
}

/// Controller inputs derived from one difficulty pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Controller {
    /// `d*/d`
    pub ratio: Fixed,
    /// ΔkQuai/kQuai
    pub delta_k: Fixed,
}

impl Controller {
    /// Value used whenever either difficulty is missing.
    pub const NEUTRAL: Controller = Controller {
        ratio: Fixed::ONE,
        delta_k: Fixed::ZERO,
    };
}

/// Ratio engine with a configurable controller gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatioEngine {
    one_over_alpha: u64,
}

impl Default for RatioEngine {
    fn default() -> Self {
        Self {
            one_over_alpha: ONE_OVER_ALPHA,
        }
    }
}

impl RatioEngine {
    /// Engine with gain `1 / one_over_alpha`.
    ///
    /// # Panics
    /// Panics if `one_over_alpha` is zero.
    pub fn new(one_over_alpha: u64) -> Self {
        assert!(one_over_alpha != 0, "controller gain must be finite");
        Self { one_over_alpha }
    }

    pub fn one_over_alpha(&self) -> u64 {
        self.one_over_alpha
    }

    /// Compute from raw hex strings as they come off the wire.
    pub fn compute_hex(&self, best_hex: Option<&str>, miner_hex: Option<&str>) -> Controller {
        self.compute(
            best_hex.and_then(parse_difficulty),
            miner_hex.and_then(parse_difficulty),
        )
    }

    /// Compute from parsed difficulties. Missing or zero inputs give
    /// [`Controller::NEUTRAL`].
    pub fn compute(&self, best: Option<Difficulty>, miner: Option<Difficulty>) -> Controller {
        let (best, miner) = match (best, miner) {
            (Some(best), Some(miner)) if !best.is_zero() && !miner.is_zero() => {
                (widen(best), widen(miner))
            }
            _ => return Controller::NEUTRAL,
        };

        let ratio_scaled = (best << SCALE_BITS) / miner;
        let delta = if ratio_scaled >= SCALE {
            Fixed::from_scaled(ratio_scaled - SCALE)
        } else {
            Fixed::from_signed_scaled(true, SCALE - ratio_scaled)
        };

        Controller {
            ratio: Fixed::from_scaled(ratio_scaled),
            delta_k: delta.div_trunc(self.one_over_alpha),
        }
    }
}

/// [`RatioEngine::compute_hex`] with the default gain.
pub fn compute_ratio_and_delta(best_hex: Option<&str>, miner_hex: Option<&str>) -> Controller {
    RatioEngine::default().compute_hex(best_hex, miner_hex)
}
