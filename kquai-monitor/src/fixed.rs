//! Signed fixed-point numbers with a 2^64 denominator.
//!
//! Every derived quantity in the series (ratios, controller deltas, chunk
//! means) is carried as a [`Fixed`]. Values are stored sign-magnitude over a
//! 512-bit integer, which leaves room for 256-bit difficulties shifted by the
//! 64 fractional bits plus sums over any realistic window. Nothing here ever
//! touches floating point.

use std::cmp::Ordering;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Neg, Sub};

use ruint::aliases::{U256, U512};
use serde::{Serialize, Serializer};

/// Number of fractional bits.
pub const SCALE_BITS: usize = 64;

/// 2^64, the fixed-point unit.
pub const SCALE: U512 = U512::from_limbs([0, 1, 0, 0, 0, 0, 0, 0]);

const FRACTION_MASK: U512 = U512::from_limbs([u64::MAX, 0, 0, 0, 0, 0, 0, 0]);

/// Fractional digits shown when no precision is requested.
const DEFAULT_DIGITS: usize = 20;

/// Widen a 256-bit value into the 512-bit working width.
pub fn widen(value: U256) -> U512 {
    let mut limbs = [0u64; 8];
    limbs[..4].copy_from_slice(value.as_limbs());
    U512::from_limbs(limbs)
}

/// A signed value `±magnitude / 2^64`.
///
/// Zero is always non-negative, so derived equality and hashing agree with
/// numeric equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fixed {
    negative: bool,
    magnitude: U512,
}

impl Fixed {
    pub const ZERO: Fixed = Fixed {
        negative: false,
        magnitude: U512::ZERO,
    };

    pub const ONE: Fixed = Fixed {
        negative: false,
        magnitude: SCALE,
    };

    fn new(negative: bool, magnitude: U512) -> Self {
        Self {
            negative: negative && !magnitude.is_zero(),
            magnitude,
        }
    }

    /// Wrap an already-scaled non-negative value (`raw / 2^64`).
    pub fn from_scaled(raw: U512) -> Self {
        Self::new(false, raw)
    }

    /// Wrap a signed scaled value given as sign and magnitude.
    pub fn from_signed_scaled(negative: bool, raw: U512) -> Self {
        Self::new(negative, raw)
    }

    /// Exact integer value.
    pub fn from_integer(value: U256) -> Self {
        Self::new(false, widen(value) << SCALE_BITS)
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Magnitude in units of 2^-64.
    pub fn scaled_magnitude(&self) -> U512 {
        self.magnitude
    }

    /// Divide by a positive integer, truncating toward zero.
    ///
    /// # Panics
    /// Panics if `divisor` is zero.
    pub fn div_trunc(self, divisor: u64) -> Self {
        assert!(divisor != 0, "fixed-point division by zero");
        Self::new(self.negative, self.magnitude / U512::from(divisor))
    }

    /// Multiply by an integer (exact).
    pub fn mul_int(self, factor: u64) -> Self {
        Self::new(self.negative, self.magnitude * U512::from(factor))
    }

    /// Arithmetic mean, truncated toward zero at 2^-64 resolution. The mean
    /// of nothing is zero.
    pub fn mean<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Fixed>,
    {
        let mut count = 0u64;
        let mut total = Fixed::ZERO;
        for value in values {
            total = total + value;
            count += 1;
        }
        if count == 0 {
            Fixed::ZERO
        } else {
            total.div_trunc(count)
        }
    }

    // Decimal digits of the magnitude: integer part and `digits` truncated
    // fractional digits.
    fn decimal_parts(&self, digits: usize) -> (String, String) {
        let integer = (self.magnitude >> SCALE_BITS).to_string();
        let ten = U512::from(10u64);
        let mut fraction = self.magnitude & FRACTION_MASK;
        let mut out = String::with_capacity(digits);
        for _ in 0..digits {
            fraction = fraction * ten;
            let digit = (fraction >> SCALE_BITS).as_limbs()[0] as u8;
            out.push(char::from(b'0' + digit));
            fraction = fraction & FRACTION_MASK;
        }
        (integer, out)
    }
}

impl Neg for Fixed {
    type Output = Fixed;

    fn neg(self) -> Fixed {
        Fixed::new(!self.negative, self.magnitude)
    }
}

impl Add for Fixed {
    type Output = Fixed;

    fn add(self, rhs: Fixed) -> Fixed {
        if self.negative == rhs.negative {
            return Fixed::new(self.negative, self.magnitude + rhs.magnitude);
        }
        if self.magnitude >= rhs.magnitude {
            Fixed::new(self.negative, self.magnitude - rhs.magnitude)
        } else {
            Fixed::new(rhs.negative, rhs.magnitude - self.magnitude)
        }
    }
}

impl Sub for Fixed {
    type Output = Fixed;

    fn sub(self, rhs: Fixed) -> Fixed {
        self + (-rhs)
    }
}

impl Sum for Fixed {
    fn sum<I: Iterator<Item = Fixed>>(iter: I) -> Fixed {
        iter.fold(Fixed::ZERO, Add::add)
    }
}

impl Ord for Fixed {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => self.magnitude.cmp(&other.magnitude),
            (true, true) => other.magnitude.cmp(&self.magnitude),
        }
    }
}

impl PartialOrd for Fixed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Decimal rendering, truncated toward zero.
///
/// With an explicit precision (`{:.4}`) exactly that many fractional digits
/// are printed. Without one, 20 digits are computed and trailing zeros
/// trimmed, so `1` prints as `1` and one half as `0.5`.
impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let explicit = f.precision();
        let (integer, mut fraction) = self.decimal_parts(explicit.unwrap_or(DEFAULT_DIGITS));
        if explicit.is_none() {
            let trimmed = fraction.trim_end_matches('0').len();
            fraction.truncate(trimmed);
        }

        let shown_nonzero = integer != "0" || fraction.bytes().any(|b| b != b'0');
        let sign = if self.negative && shown_nonzero { "-" } else { "" };

        if fraction.is_empty() {
            write!(f, "{sign}{integer}")
        } else {
            write!(f, "{sign}{integer}.{fraction}")
        }
    }
}

impl fmt::Debug for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fixed({self})")
    }
}

impl Serialize for Fixed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
