use super::*;

#[test]
fn time_delta_get_back_same_values() {
    const VALUE: i64 = 499;
    for sign in [-1i64, 0, 1] {
        let value = VALUE * sign;
        assert_eq!(TimeDelta::from_millis(value).ms(), value);
        assert_eq!(TimeDelta::from_micros(value).us(), value);
        assert_eq!(TimeDelta::from_secs(value).secs(), value);
    }
    assert_eq!(TimeDelta::zero().us(), 0);
}

#[test]
fn time_delta_get_different_prefix() {
    const VALUE: i64 = 3000000;
    assert_eq!(TimeDelta::from_micros(VALUE).secs(), VALUE / 1000000);
    assert_eq!(TimeDelta::from_millis(VALUE).secs(), VALUE / 1000);
    assert_eq!(TimeDelta::from_micros(VALUE).ms(), VALUE / 1000);

    assert_eq!(TimeDelta::from_millis(VALUE).us(), VALUE * 1000);
    assert_eq!(TimeDelta::from_secs(VALUE).ms(), VALUE * 1000);
    assert_eq!(TimeDelta::from_secs(VALUE).us(), VALUE * 1000000);
}

#[test]
fn time_delta_identity_checks() {
    const VALUE: i64 = 3000;
    assert!(TimeDelta::zero().is_zero());
    assert!(!TimeDelta::from_millis(VALUE).is_zero());

    assert!(TimeDelta::plus_infinity().is_infinite());
    assert!(TimeDelta::minus_infinity().is_infinite());
    assert!(!TimeDelta::zero().is_infinite());
    assert!(!TimeDelta::from_millis(-VALUE).is_infinite());
    assert!(!TimeDelta::from_millis(VALUE).is_infinite());

    assert!(!TimeDelta::plus_infinity().is_finite());
    assert!(!TimeDelta::minus_infinity().is_finite());
    assert!(!TimeDelta::not_initialized().is_finite());
    assert!(TimeDelta::from_millis(-VALUE).is_finite());
    assert!(TimeDelta::from_millis(VALUE).is_finite());
    assert!(TimeDelta::zero().is_finite());

    assert!(!TimeDelta::not_initialized().is_initialized());
    assert!(TimeDelta::plus_infinity().is_initialized());
    assert!(TimeDelta::zero().is_initialized());
}

#[test]
fn time_delta_comparison_operators() {
    const SMALL: i64 = 450;
    const LARGE: i64 = 451;
    let small = TimeDelta::from_millis(SMALL);
    let large = TimeDelta::from_millis(LARGE);

    assert_eq!(TimeDelta::zero(), TimeDelta::from_millis(0));
    assert_eq!(TimeDelta::plus_infinity(), TimeDelta::plus_infinity());
    assert_eq!(small, TimeDelta::from_millis(SMALL));
    assert!(small <= TimeDelta::from_millis(SMALL));
    assert!(small >= TimeDelta::from_millis(SMALL));
    assert!(small != TimeDelta::from_millis(LARGE));
    assert!(small < large);
    assert!(large > small);
    assert!(TimeDelta::zero() < small);
    assert!(TimeDelta::zero() > TimeDelta::from_millis(-SMALL));

    assert!(TimeDelta::plus_infinity() > large);
    assert!(TimeDelta::minus_infinity() < TimeDelta::zero());
}

#[test]
fn time_delta_math_operations() {
    const VALUE_A: i64 = 267;
    const VALUE_B: i64 = 450;
    let delta_a = TimeDelta::from_millis(VALUE_A);
    let delta_b = TimeDelta::from_millis(VALUE_B);
    assert_eq!((delta_a + delta_b).ms(), VALUE_A + VALUE_B);
    assert_eq!((delta_a - delta_b).ms(), VALUE_A - VALUE_B);

    assert_eq!(
        (TimeDelta::from_micros(VALUE_A) * VALUE_B).us(),
        VALUE_A * VALUE_B
    );
    assert_eq!((TimeDelta::from_micros(VALUE_A) * 123.0).us(), VALUE_A * 123);

    assert_eq!(TimeDelta::from_micros(-VALUE_A).abs().us(), VALUE_A);
    assert_eq!(TimeDelta::from_micros(VALUE_A).abs().us(), VALUE_A);
}

#[test]
fn time_delta_float_multiply_rounds_half_away_from_zero() {
    assert_eq!((TimeDelta::from_micros(5) * 0.5).us(), 3);
    assert_eq!((TimeDelta::from_micros(-5) * 0.5).us(), -3);
    assert_eq!((TimeDelta::from_micros(5) * 0.3).us(), 2);
}

#[test]
fn timestamp_get_back_same_values() {
    const VALUE: i64 = 499;
    assert_eq!(Timestamp::from_millis(VALUE).ms(), VALUE);
    assert_eq!(Timestamp::from_micros(VALUE).us(), VALUE);
    assert_eq!(Timestamp::from_secs(VALUE).secs(), VALUE);
}

#[test]
fn timestamp_identity_checks() {
    const VALUE: i64 = 3000;
    assert!(Timestamp::plus_infinity().is_infinite());
    assert!(!Timestamp::from_millis(VALUE).is_infinite());

    assert!(!Timestamp::not_initialized().is_finite());
    assert!(!Timestamp::plus_infinity().is_finite());
    assert!(Timestamp::from_millis(VALUE).is_finite());
}

#[test]
fn timestamp_and_time_delta_math() {
    const VALUE_A: i64 = 267;
    const VALUE_B: i64 = 450;
    let time_a = Timestamp::from_millis(VALUE_A);
    let time_b = Timestamp::from_millis(VALUE_B);
    let delta_a = TimeDelta::from_millis(VALUE_A);

    assert_eq!(time_a - time_b, TimeDelta::from_millis(VALUE_A - VALUE_B));
    assert_eq!(time_b - delta_a, Timestamp::from_millis(VALUE_B - VALUE_A));
    assert_eq!(time_b + delta_a, Timestamp::from_millis(VALUE_B + VALUE_A));

    // (a - b) + b == a for finite values.
    assert_eq!((time_a - time_b) + TimeDelta::from_millis(time_b.ms()), delta_a);
}

#[test]
fn data_size_get_back_same_values() {
    const VALUE: i64 = 123 * 8;
    assert_eq!(DataSize::from_bytes(VALUE).bytes(), VALUE);
    assert_eq!(DataSize::from_bits(VALUE).bits(), VALUE);
}

#[test]
fn data_size_get_different_prefix() {
    const VALUE: i64 = 123 * 8000;
    assert_eq!(DataSize::from_bytes(VALUE).bits(), VALUE * 8);
    assert_eq!(DataSize::from_bits(VALUE).bytes(), VALUE / 8);
    assert_eq!(DataSize::from_bits(VALUE).kilobits(), VALUE / 1000);
    assert_eq!(DataSize::from_bytes(VALUE).kilobytes(), VALUE / 1000);
}

#[test]
fn data_size_identity_checks() {
    const VALUE: i64 = 3000;
    assert!(DataSize::zero().is_zero());
    assert!(!DataSize::from_bytes(VALUE).is_zero());

    assert!(DataSize::plus_infinity().is_infinite());
    assert!(!DataSize::from_bytes(VALUE).is_infinite());

    assert!(!DataSize::plus_infinity().is_finite());
    assert!(!DataSize::not_initialized().is_finite());
    assert!(DataSize::from_bytes(VALUE).is_finite());
    assert!(DataSize::zero().is_finite());
}

#[test]
fn data_size_math_operations() {
    const VALUE_A: i64 = 450;
    const VALUE_B: i64 = 267;
    let size_a = DataSize::from_bytes(VALUE_A);
    let size_b = DataSize::from_bytes(VALUE_B);
    assert_eq!((size_a + size_b).bytes(), VALUE_A + VALUE_B);
    assert_eq!((size_a - size_b).bytes(), VALUE_A - VALUE_B);

    assert_eq!((size_a * VALUE_B).bytes(), VALUE_A * VALUE_B);
    assert_eq!((size_a * 123.0).bytes(), VALUE_A * 123);
    assert_eq!((size_a / 10).bytes(), VALUE_A / 10);

    let mut mutable_size = DataSize::from_bytes(VALUE_A);
    mutable_size += size_b;
    assert_eq!(mutable_size.bytes(), VALUE_A + VALUE_B);
    mutable_size -= size_a;
    assert_eq!(mutable_size.bytes(), VALUE_B);
}

#[test]
fn data_rate_get_back_same_values() {
    const VALUE: i64 = 123 * 8;
    assert_eq!(DataRate::from_bps(VALUE).bps(), VALUE);
    assert_eq!(DataRate::from_kbps(VALUE).kbps(), VALUE);
    assert_eq!(DataRate::from_bytes_per_sec(VALUE).bytes_per_sec(), VALUE);
}

#[test]
fn data_rate_identity_checks() {
    const VALUE: i64 = 3000;
    assert!(DataRate::zero().is_zero());
    assert!(!DataRate::from_bps(VALUE).is_zero());

    assert!(DataRate::plus_infinity().is_infinite());
    assert!(!DataRate::from_bps(VALUE).is_infinite());

    assert!(!DataRate::plus_infinity().is_finite());
    assert!(!DataRate::not_initialized().is_finite());
    assert!(DataRate::from_bps(VALUE).is_finite());
}

#[test]
fn data_rate_comparison_operators() {
    const SMALL: i64 = 450;
    const LARGE: i64 = 451;
    let small = DataRate::from_bps(SMALL);
    let large = DataRate::from_bps(LARGE);

    assert_eq!(small, DataRate::from_bps(SMALL));
    assert!(small < large);
    assert!(large > small);
    assert!(DataRate::zero() < small);
    assert!(DataRate::plus_infinity() > large);
}

#[test]
fn unit_conversions() {
    const SECONDS: i64 = 5;
    const BYTES_PER_SEC: i64 = 450;
    const BYTES: i64 = 45000;
    let delta = TimeDelta::from_secs(SECONDS);
    let rate = DataRate::from_bytes_per_sec(BYTES_PER_SEC);
    let size = DataSize::from_bytes(BYTES);

    assert_eq!((delta * rate).bytes(), SECONDS * BYTES_PER_SEC);
    assert_eq!((rate * delta).bytes(), SECONDS * BYTES_PER_SEC);
    assert_eq!((size / delta).bytes_per_sec(), BYTES / SECONDS);
    assert_eq!((size / rate).secs(), BYTES / BYTES_PER_SEC);
}

#[test]
fn rate_round_trips_through_size() {
    // (rate * d) / d == rate up to rounding.
    let rate = DataRate::from_kbps(500);
    let window = TimeDelta::from_secs(1);
    let recovered = (rate * window) / window;
    assert!((recovered.bps() - rate.bps()).abs() <= 1);
}

#[test]
fn large_size_does_not_overflow_rate_conversion() {
    // Bytes scaled to microbits overflow 64 bits around a terabyte.
    let size = DataSize::from_bytes(9_000_000_000_000);
    let rate = size / TimeDelta::from_secs(1);
    assert_eq!(rate.bytes_per_sec(), 9_000_000_000_000);
}

#[test]
#[should_panic]
fn accessing_infinite_value_panics() {
    let _ = TimeDelta::plus_infinity().us();
}

#[test]
#[should_panic]
fn accessing_uninitialized_value_panics() {
    let _ = DataRate::not_initialized().bps();
}
