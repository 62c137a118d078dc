//! Conversions between chain base units and human-readable token amounts.
//!
//! One display token is `10^9` base units. Ratios stored on chain as `u16`
//! (incentive, dividends, weights) are normalised by `u16::MAX`.

use serde::{Deserialize, Serialize};

pub const TOKEN_DECIMALS: u32 = 9;
pub const BASE_UNITS_PER_TOKEN: u64 = 1_000_000_000;
pub const U16_MAX: u64 = u16::MAX as u64;

/// Unit an amount should be reported in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountFormat {
    /// Raw chain integer.
    #[default]
    Base,
    /// Divided by `10^9`.
    Display,
}

impl AmountFormat {
    /// Parses the short aliases accepted on the command line and in config
    /// (`j`, `token`, `unit` mean display units).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "j" | "token" | "unit" | "display" => Some(AmountFormat::Display),
            "nano" | "nanos" | "base" => Some(AmountFormat::Base),
            _ => None,
        }
    }
}

/// Converts a display amount into base units, rounding to the nearest unit.
/// Negative or non-finite input yields `None`.
pub fn try_to_base_units(display: f64) -> Option<u64> {
    if !display.is_finite() || display < 0.0 {
        return None;
    }
    let scaled = (display * BASE_UNITS_PER_TOKEN as f64).round();
    // `u64::MAX as f64` is 2^64, one past the largest u64.
    if scaled >= u64::MAX as f64 {
        return None;
    }
    Some(scaled as u64)
}

/// Lossy variant of [`try_to_base_units`] that clamps invalid input to zero.
pub fn to_base_units(display: f64) -> u64 {
    try_to_base_units(display).unwrap_or(0)
}

pub fn from_base_units(base: u64) -> f64 {
    base as f64 / BASE_UNITS_PER_TOKEN as f64
}

pub fn format_amount(base: u64, format: AmountFormat) -> f64 {
    match format {
        AmountFormat::Base => base as f64,
        AmountFormat::Display => from_base_units(base),
    }
}

/// Rounds to `decimals` fractional digits. Idempotent.
pub fn round_display(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Maps a raw `u16` ratio onto `[0, 1]`.
pub fn normalize_u16(raw: u64) -> f64 {
    raw.min(U16_MAX) as f64 / U16_MAX as f64
}

/// A token amount as a user types it. Call arguments carry amounts only in
/// this form, so conversion to base units happens exactly once.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayAmount(f64);

impl DisplayAmount {
    pub fn new(tokens: f64) -> Self {
        DisplayAmount(tokens)
    }

    pub fn from_base_units(base: u64) -> Self {
        DisplayAmount(from_base_units(base))
    }

    pub fn tokens(self) -> f64 {
        self.0
    }

    pub fn to_base_units(self) -> Option<u64> {
        try_to_base_units(self.0)
    }
}

impl From<f64> for DisplayAmount {
    fn from(tokens: f64) -> Self {
        DisplayAmount(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_units_round_trip_within_unit_scale() {
        let mut samples = vec![0, 1, 999, 1_000_000_000, 123_456_789_012, 1_000_000_000_000_000];
        let mut x: u64 = 7;
        for _ in 0..1000 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            samples.push(x % 1_000_000_000_000_000);
        }
        for base in samples {
            assert_eq!(to_base_units(from_base_units(base)), base, "base={base}");
        }
    }

    #[test]
    fn base_units_stay_close_up_to_u64_bound() {
        let top = u64::MAX - (1 << 24);
        let mut samples = vec![1 << 53, (1 << 53) + 1, u64::MAX / 2, top];
        let mut x: u64 = 11;
        for _ in 0..1000 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            samples.push((1 << 53) + x % (top - (1 << 53)));
        }
        for base in samples {
            let back = try_to_base_units(from_base_units(base)).unwrap_or_else(|| panic!("base={base}"));
            assert!(back.abs_diff(base) <= base >> 50, "base={base} back={back}");
        }
    }

    #[test]
    fn amounts_past_u64_are_rejected() {
        let limit = u64::MAX as f64 / BASE_UNITS_PER_TOKEN as f64;
        assert_eq!(try_to_base_units(limit * 1.01), None);
        assert_eq!(try_to_base_units(2.0e10), None);
        assert_eq!(to_base_units(f64::INFINITY), 0);
        assert_eq!(try_to_base_units(1.8e10), Some(18_000_000_000_000_000_000));
    }

    #[test]
    fn round_is_idempotent() {
        for v in [0.0, 1.23456789, 42.5, 1e6 + 0.333_333, 7.000_000_5] {
            for d in [0, 2, 4, 9] {
                let once = round_display(v, d);
                assert_eq!(round_display(once, d), once);
            }
        }
    }

    #[test]
    fn display_amount_converts_once() {
        assert_eq!(DisplayAmount::new(5.0).to_base_units(), Some(5_000_000_000));
        assert_eq!(DisplayAmount::new(-1.0).to_base_units(), None);
        assert_eq!(DisplayAmount::new(f64::NAN).to_base_units(), None);
    }

    #[test]
    fn u16_ratios_are_normalised() {
        assert_eq!(normalize_u16(0), 0.0);
        assert_eq!(normalize_u16(U16_MAX), 1.0);
        assert_eq!(normalize_u16(u64::from(u16::MAX)), 1.0);
        assert!(normalize_u16(U16_MAX - 1) < 1.0);
        assert_eq!(normalize_u16(70_000), 1.0);
        assert_eq!(normalize_u16(u64::MAX), 1.0);
    }

    #[test]
    fn format_aliases() {
        assert_eq!(AmountFormat::parse("j"), Some(AmountFormat::Display));
        assert_eq!(AmountFormat::parse("nano"), Some(AmountFormat::Base));
        assert_eq!(AmountFormat::parse("eth"), None);
        assert_eq!(format_amount(2_500_000_000, AmountFormat::Display), 2.5);
    }
}
