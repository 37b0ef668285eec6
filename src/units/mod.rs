#[cfg(test)]
mod units_test;

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

const PLUS_INFINITY_VALUE: i64 = i64::MAX;
const MINUS_INFINITY_VALUE: i64 = i64::MIN + 1;
const NOT_INITIALIZED_VALUE: i64 = i64::MIN;

/// Integer division rounding half away from zero.
fn divide_and_round(numerator: i64, denominator: i64) -> i64 {
    if numerator >= 0 {
        (numerator + denominator / 2) / denominator
    } else {
        (numerator - denominator / 2) / denominator
    }
}

/// Scales a finite raw value by a float, rounding half away from zero and
/// saturating at the infinity sentinels.
fn scale_and_saturate(value: i64, scalar: f64) -> i64 {
    let scaled = (value as f64 * scalar).round();
    if scaled >= PLUS_INFINITY_VALUE as f64 {
        PLUS_INFINITY_VALUE
    } else if scaled <= MINUS_INFINITY_VALUE as f64 {
        MINUS_INFINITY_VALUE
    } else {
        scaled as i64
    }
}

const fn add_and_saturate(a: i64, b: i64) -> i64 {
    match a.checked_add(b) {
        Some(sum) => sum,
        None if a > 0 => PLUS_INFINITY_VALUE,
        None => MINUS_INFINITY_VALUE,
    }
}

const fn mul_and_saturate(value: i64, scalar: i64) -> i64 {
    match value.checked_mul(scalar) {
        Some(product) => product,
        None if (value > 0) == (scalar > 0) => PLUS_INFINITY_VALUE,
        None => MINUS_INFINITY_VALUE,
    }
}

/// TimeDelta represents the difference between two timestamps, typically a
/// duration. Since two timestamps are not guaranteed to share an epoch, a
/// TimeDelta may be negative. Internal resolution is microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeDelta(i64);

impl Default for TimeDelta {
    fn default() -> Self {
        TimeDelta::not_initialized()
    }
}

impl TimeDelta {
    pub const fn zero() -> Self {
        TimeDelta(0)
    }

    pub const fn plus_infinity() -> Self {
        TimeDelta(PLUS_INFINITY_VALUE)
    }

    pub const fn minus_infinity() -> Self {
        TimeDelta(MINUS_INFINITY_VALUE)
    }

    pub const fn not_initialized() -> Self {
        TimeDelta(NOT_INITIALIZED_VALUE)
    }

    pub const fn from_secs(seconds: i64) -> Self {
        TimeDelta::from_micros(mul_and_saturate(seconds, 1_000_000))
    }

    pub const fn from_millis(millis: i64) -> Self {
        TimeDelta::from_micros(mul_and_saturate(millis, 1000))
    }

    pub const fn from_micros(micros: i64) -> Self {
        // Infinities are only reachable through the explicit constants.
        debug_assert!(micros > NOT_INITIALIZED_VALUE + 1);
        debug_assert!(micros < PLUS_INFINITY_VALUE);
        TimeDelta(micros)
    }

    pub fn secs(&self) -> i64 {
        divide_and_round(self.us(), 1_000_000)
    }

    pub fn ms(&self) -> i64 {
        divide_and_round(self.us(), 1000)
    }

    pub fn us(&self) -> i64 {
        assert!(self.is_finite(), "us() called on non-finite TimeDelta");
        self.0
    }

    pub fn ms_f64(&self) -> f64 {
        self.us() as f64 / 1000.0
    }

    pub fn abs(&self) -> Self {
        TimeDelta::from_micros(self.us().abs())
    }

    pub fn clamped(self, min: TimeDelta, max: TimeDelta) -> Self {
        self.max(min).min(max)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_infinite(&self) -> bool {
        self.0 == PLUS_INFINITY_VALUE || self.0 == MINUS_INFINITY_VALUE
    }

    pub fn is_initialized(&self) -> bool {
        self.0 != NOT_INITIALIZED_VALUE
    }

    pub fn is_finite(&self) -> bool {
        self.is_initialized() && !self.is_infinite()
    }
}

impl Add for TimeDelta {
    type Output = TimeDelta;
    fn add(self, other: TimeDelta) -> TimeDelta {
        TimeDelta(add_and_saturate(self.us(), other.us()))
    }
}

impl Sub for TimeDelta {
    type Output = TimeDelta;
    fn sub(self, other: TimeDelta) -> TimeDelta {
        TimeDelta(add_and_saturate(self.us(), -other.us()))
    }
}

impl Mul<i64> for TimeDelta {
    type Output = TimeDelta;
    fn mul(self, scalar: i64) -> TimeDelta {
        TimeDelta(mul_and_saturate(self.us(), scalar))
    }
}

impl Mul<f64> for TimeDelta {
    type Output = TimeDelta;
    fn mul(self, scalar: f64) -> TimeDelta {
        TimeDelta(scale_and_saturate(self.us(), scalar))
    }
}

/// Ratio of two finite durations as a float, used for accumulating
/// normalized time spans.
impl Div<TimeDelta> for TimeDelta {
    type Output = f64;
    fn div(self, other: TimeDelta) -> f64 {
        self.us() as f64 / other.us() as f64
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_initialized() {
            write!(f, "?? ms")
        } else if self.0 == PLUS_INFINITY_VALUE {
            write!(f, "+inf ms")
        } else if self.0 == MINUS_INFINITY_VALUE {
            write!(f, "-inf ms")
        } else {
            write!(f, "{} ms", self.ms())
        }
    }
}

/// Timestamp represents the time that has passed since some unspecified
/// epoch. The epoch is assumed to precede all represented values, so
/// negative timestamps are not valid. The difference of two Timestamps is
/// a TimeDelta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::not_initialized()
    }
}

impl Timestamp {
    pub const fn plus_infinity() -> Self {
        Timestamp(PLUS_INFINITY_VALUE)
    }

    pub const fn not_initialized() -> Self {
        Timestamp(NOT_INITIALIZED_VALUE)
    }

    pub const fn from_secs(seconds: i64) -> Self {
        Timestamp::from_micros(mul_and_saturate(seconds, 1_000_000))
    }

    pub const fn from_millis(millis: i64) -> Self {
        Timestamp::from_micros(mul_and_saturate(millis, 1000))
    }

    pub const fn from_micros(micros: i64) -> Self {
        debug_assert!(micros >= 0);
        Timestamp(micros)
    }

    pub fn secs(&self) -> i64 {
        divide_and_round(self.us(), 1_000_000)
    }

    pub fn ms(&self) -> i64 {
        divide_and_round(self.us(), 1000)
    }

    pub fn us(&self) -> i64 {
        assert!(self.is_finite(), "us() called on non-finite Timestamp");
        self.0
    }

    pub fn is_infinite(&self) -> bool {
        self.0 == PLUS_INFINITY_VALUE
    }

    pub fn is_initialized(&self) -> bool {
        self.0 != NOT_INITIALIZED_VALUE
    }

    pub fn is_finite(&self) -> bool {
        self.is_initialized() && !self.is_infinite()
    }
}

impl Sub for Timestamp {
    type Output = TimeDelta;
    fn sub(self, other: Timestamp) -> TimeDelta {
        TimeDelta(add_and_saturate(self.us(), -other.us()))
    }
}

impl Sub<TimeDelta> for Timestamp {
    type Output = Timestamp;
    fn sub(self, delta: TimeDelta) -> Timestamp {
        Timestamp(add_and_saturate(self.us(), -delta.us()))
    }
}

impl Add<TimeDelta> for Timestamp {
    type Output = Timestamp;
    fn add(self, delta: TimeDelta) -> Timestamp {
        Timestamp(add_and_saturate(self.us(), delta.us()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_initialized() {
            write!(f, "?? ms")
        } else if self.0 == PLUS_INFINITY_VALUE {
            write!(f, "+inf ms")
        } else {
            write!(f, "{} ms", self.ms())
        }
    }
}

/// DataSize is a count of bytes. It can be constructed from a number of
/// bits, but the internal storage is bytes and bits are truncated to fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataSize(i64);

impl Default for DataSize {
    fn default() -> Self {
        DataSize::not_initialized()
    }
}

impl DataSize {
    pub const fn zero() -> Self {
        DataSize(0)
    }

    pub const fn plus_infinity() -> Self {
        DataSize(PLUS_INFINITY_VALUE)
    }

    pub const fn not_initialized() -> Self {
        DataSize(NOT_INITIALIZED_VALUE)
    }

    pub const fn from_bytes(bytes: i64) -> Self {
        debug_assert!(bytes >= 0);
        debug_assert!(bytes < PLUS_INFINITY_VALUE);
        DataSize(bytes)
    }

    pub const fn from_bits(bits: i64) -> Self {
        DataSize::from_bytes(bits / 8)
    }

    pub fn bytes(&self) -> i64 {
        assert!(self.is_finite(), "bytes() called on non-finite DataSize");
        self.0
    }

    pub fn bits(&self) -> i64 {
        mul_and_saturate(self.bytes(), 8)
    }

    pub fn kilobytes(&self) -> i64 {
        divide_and_round(self.bytes(), 1000)
    }

    pub fn kilobits(&self) -> i64 {
        divide_and_round(self.bits(), 1000)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_infinite(&self) -> bool {
        self.0 == PLUS_INFINITY_VALUE
    }

    pub fn is_initialized(&self) -> bool {
        self.0 != NOT_INITIALIZED_VALUE
    }

    pub fn is_finite(&self) -> bool {
        self.is_initialized() && !self.is_infinite()
    }
}

impl Add for DataSize {
    type Output = DataSize;
    fn add(self, other: DataSize) -> DataSize {
        DataSize(add_and_saturate(self.bytes(), other.bytes()))
    }
}

impl Sub for DataSize {
    type Output = DataSize;
    fn sub(self, other: DataSize) -> DataSize {
        DataSize(add_and_saturate(self.bytes(), -other.bytes()))
    }
}

impl AddAssign for DataSize {
    fn add_assign(&mut self, other: DataSize) {
        *self = *self + other;
    }
}

impl SubAssign for DataSize {
    fn sub_assign(&mut self, other: DataSize) {
        *self = *self - other;
    }
}

impl Mul<i64> for DataSize {
    type Output = DataSize;
    fn mul(self, scalar: i64) -> DataSize {
        DataSize(mul_and_saturate(self.bytes(), scalar))
    }
}

impl Mul<f64> for DataSize {
    type Output = DataSize;
    fn mul(self, scalar: f64) -> DataSize {
        DataSize(scale_and_saturate(self.bytes(), scalar))
    }
}

impl Div<i64> for DataSize {
    type Output = DataSize;
    fn div(self, scalar: i64) -> DataSize {
        DataSize::from_bytes(self.bytes() / scalar)
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_initialized() {
            write!(f, "?? bytes")
        } else if self.0 == PLUS_INFINITY_VALUE {
            write!(f, "+inf bytes")
        } else {
            write!(f, "{} bytes", self.bytes())
        }
    }
}

/// DataRate is a bit rate. The internal storage is bits per second, but
/// the promised precision is bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataRate(i64);

impl Default for DataRate {
    fn default() -> Self {
        DataRate::not_initialized()
    }
}

impl DataRate {
    pub const fn zero() -> Self {
        DataRate(0)
    }

    pub const fn plus_infinity() -> Self {
        DataRate(PLUS_INFINITY_VALUE)
    }

    pub const fn not_initialized() -> Self {
        DataRate(NOT_INITIALIZED_VALUE)
    }

    pub const fn from_bps(bits_per_sec: i64) -> Self {
        debug_assert!(bits_per_sec >= 0);
        debug_assert!(bits_per_sec < PLUS_INFINITY_VALUE);
        DataRate(bits_per_sec)
    }

    pub const fn from_kbps(kilobits_per_sec: i64) -> Self {
        DataRate::from_bps(mul_and_saturate(kilobits_per_sec, 1000))
    }

    pub const fn from_bytes_per_sec(bytes_per_sec: i64) -> Self {
        DataRate::from_bps(mul_and_saturate(bytes_per_sec, 8))
    }

    pub fn bps(&self) -> i64 {
        assert!(self.is_finite(), "bps() called on non-finite DataRate");
        self.0
    }

    pub fn kbps(&self) -> i64 {
        divide_and_round(self.bps(), 1000)
    }

    pub fn bytes_per_sec(&self) -> i64 {
        self.bps() / 8
    }

    pub fn clamped(self, min: DataRate, max: DataRate) -> Self {
        self.max(min).min(max)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_infinite(&self) -> bool {
        self.0 == PLUS_INFINITY_VALUE
    }

    pub fn is_initialized(&self) -> bool {
        self.0 != NOT_INITIALIZED_VALUE
    }

    pub fn is_finite(&self) -> bool {
        self.is_initialized() && !self.is_infinite()
    }
}

impl Add for DataRate {
    type Output = DataRate;
    fn add(self, other: DataRate) -> DataRate {
        DataRate(add_and_saturate(self.bps(), other.bps()))
    }
}

impl Sub for DataRate {
    type Output = DataRate;
    fn sub(self, other: DataRate) -> DataRate {
        DataRate(add_and_saturate(self.bps(), -other.bps()))
    }
}

impl Mul<i64> for DataRate {
    type Output = DataRate;
    fn mul(self, scalar: i64) -> DataRate {
        DataRate(mul_and_saturate(self.bps(), scalar))
    }
}

impl Mul<f64> for DataRate {
    type Output = DataRate;
    fn mul(self, scalar: f64) -> DataRate {
        DataRate(scale_and_saturate(self.bps(), scalar))
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_initialized() {
            write!(f, "?? kbps")
        } else if self.0 == PLUS_INFINITY_VALUE {
            write!(f, "+inf kbps")
        } else {
            write!(f, "{} kbps", self.kbps())
        }
    }
}

// A naive bytes-to-bits-per-second conversion multiplies by 8 million and
// overflows an i64 around 1 terabyte, so the cross-type operators go
// through 128-bit intermediates and saturate at infinity.

impl Div<TimeDelta> for DataSize {
    type Output = DataRate;
    fn div(self, duration: TimeDelta) -> DataRate {
        assert!(!duration.is_zero(), "division by zero duration");
        let micro_bits = self.bytes() as i128 * 8 * 1_000_000;
        saturated_rate(divide_and_round_i128(micro_bits, duration.us() as i128))
    }
}

impl Div<DataRate> for DataSize {
    type Output = TimeDelta;
    fn div(self, rate: DataRate) -> TimeDelta {
        assert!(!rate.is_zero(), "division by zero rate");
        let micro_bits = self.bytes() as i128 * 8 * 1_000_000;
        let micros = divide_and_round_i128(micro_bits, rate.bps() as i128);
        if micros >= PLUS_INFINITY_VALUE as i128 {
            TimeDelta::plus_infinity()
        } else {
            TimeDelta::from_micros(micros as i64)
        }
    }
}

impl Mul<TimeDelta> for DataRate {
    type Output = DataSize;
    fn mul(self, duration: TimeDelta) -> DataSize {
        let micro_bits = self.bps() as i128 * duration.us() as i128;
        let bytes = divide_and_round_i128(micro_bits, 8 * 1_000_000);
        if bytes >= PLUS_INFINITY_VALUE as i128 {
            DataSize::plus_infinity()
        } else {
            DataSize::from_bytes(bytes as i64)
        }
    }
}

impl Mul<DataRate> for TimeDelta {
    type Output = DataSize;
    fn mul(self, rate: DataRate) -> DataSize {
        rate * self
    }
}

fn divide_and_round_i128(numerator: i128, denominator: i128) -> i128 {
    if numerator >= 0 {
        (numerator + denominator / 2) / denominator
    } else {
        (numerator - denominator / 2) / denominator
    }
}

fn saturated_rate(bits_per_sec: i128) -> DataRate {
    if bits_per_sec >= PLUS_INFINITY_VALUE as i128 {
        DataRate::plus_infinity()
    } else {
        DataRate::from_bps(bits_per_sec as i64)
    }
}
