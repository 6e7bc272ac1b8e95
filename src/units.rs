//! Exact conversion between display units and the integer Hz grid.
//!
//! Callers may write `'145.5MHz'` where the engine expects `145500000`.
//! Conversions never go through floating point: a literal that cannot be
//! represented as a whole number of Hz is rejected instead of rounded.

use crate::model::Hz;

pub const HZ_PER_KHZ: Hz = 1_000;
pub const HZ_PER_MHZ: Hz = 1_000_000;
pub const HZ_PER_GHZ: Hz = 1_000_000_000;

/// (suffix, scale, max fractional digits). Longer suffixes first.
const UNITS: [(&str, Hz, usize); 4] = [
    ("ghz", HZ_PER_GHZ, 9),
    ("mhz", HZ_PER_MHZ, 6),
    ("khz", HZ_PER_KHZ, 3),
    ("hz", 1, 0),
];

#[derive(Debug, PartialEq, Eq)]
pub enum UnitError {
    Empty,
    Malformed(String),
    /// More fractional digits than the unit can express in whole Hz.
    Inexact(String),
    Overflow(String),
}

impl std::fmt::Display for UnitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitError::Empty => write!(f, "empty frequency"),
            UnitError::Malformed(s) => write!(f, "malformed frequency: {s}"),
            UnitError::Inexact(s) => write!(f, "frequency {s} is not a whole number of Hz"),
            UnitError::Overflow(s) => write!(f, "frequency {s} out of range"),
        }
    }
}

impl std::error::Error for UnitError {}

/// Parse `"145.5MHz"`, `"12.5 kHz"`, `"100"` (plain Hz) into Hz.
pub fn parse_frequency(input: &str) -> Result<Hz, UnitError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UnitError::Empty);
    }
    let lower = trimmed.to_ascii_lowercase();
    let (number, scale, max_decimals) = UNITS
        .iter()
        .find_map(|(suffix, scale, decimals)| {
            lower
                .strip_suffix(suffix)
                .map(|n| (n.trim_end(), *scale, *decimals))
        })
        .unwrap_or((lower.as_str(), 1, 0));

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(UnitError::Malformed(trimmed.to_string()));
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) {
        return Err(UnitError::Malformed(trimmed.to_string()));
    }

    let frac_digits = frac_part.trim_end_matches('0');
    if frac_digits.len() > max_decimals {
        return Err(UnitError::Inexact(trimmed.to_string()));
    }

    let overflow = || UnitError::Overflow(trimmed.to_string());
    let whole: Hz = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| overflow())?
    };
    let mut frac: Hz = 0;
    if !frac_digits.is_empty() {
        frac = frac_digits.parse().map_err(|_| overflow())?;
        frac *= 10_i64.pow((max_decimals - frac_digits.len()) as u32);
    }

    whole
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac))
        .ok_or_else(overflow)
}

/// Render Hz as MHz with no rounding: `1500000` → `"1.5"`, `25000` → `"0.025"`.
pub fn format_mhz(hz: Hz) -> String {
    let sign = if hz < 0 { "-" } else { "" };
    let abs = hz.unsigned_abs();
    let scale = HZ_PER_MHZ as u64;
    let whole = abs / scale;
    let frac = abs % scale;
    if frac == 0 {
        return format!("{sign}{whole}");
    }
    let digits = format!("{frac:06}");
    format!("{sign}{whole}.{}", digits.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_integers_are_hz() {
        assert_eq!(parse_frequency("100").unwrap(), 100);
        assert_eq!(parse_frequency(" 145500000 ").unwrap(), 145_500_000);
        assert_eq!(parse_frequency("25hz").unwrap(), 25);
    }

    #[test]
    fn scaled_units() {
        assert_eq!(parse_frequency("145.5MHz").unwrap(), 145_500_000);
        assert_eq!(parse_frequency("145.5 MHz").unwrap(), 145_500_000);
        assert_eq!(parse_frequency("12.5kHz").unwrap(), 12_500);
        assert_eq!(parse_frequency("1.2GHz").unwrap(), 1_200_000_000);
        assert_eq!(parse_frequency(".025MHz").unwrap(), 25_000);
        assert_eq!(parse_frequency("30.000000MHz").unwrap(), 30_000_000);
    }

    #[test]
    fn sub_hz_precision_is_rejected() {
        assert!(matches!(parse_frequency("1.0000001MHz"), Err(UnitError::Inexact(_))));
        assert!(matches!(parse_frequency("0.5kHz"), Ok(500)));
        assert!(matches!(parse_frequency("0.5Hz"), Err(UnitError::Inexact(_))));
        assert!(matches!(parse_frequency("100.5"), Err(UnitError::Inexact(_))));
    }

    #[test]
    fn malformed_input() {
        assert_eq!(parse_frequency(""), Err(UnitError::Empty));
        assert!(matches!(parse_frequency("MHz"), Err(UnitError::Malformed(_))));
        assert!(matches!(parse_frequency("1.2.3MHz"), Err(UnitError::Malformed(_))));
        assert!(matches!(parse_frequency("-5MHz"), Err(UnitError::Malformed(_))));
        assert!(matches!(parse_frequency("abc"), Err(UnitError::Malformed(_))));
    }

    #[test]
    fn overflow_is_reported() {
        assert!(matches!(
            parse_frequency("99999999999999999999"),
            Err(UnitError::Overflow(_))
        ));
        assert!(matches!(
            parse_frequency("9999999999999GHz"),
            Err(UnitError::Overflow(_))
        ));
    }

    #[test]
    fn format_is_exact() {
        assert_eq!(format_mhz(1_000_000), "1");
        assert_eq!(format_mhz(1_500_000), "1.5");
        assert_eq!(format_mhz(500_000), "0.5");
        assert_eq!(format_mhz(25_000), "0.025");
        assert_eq!(format_mhz(145_512_500), "145.5125");
        assert_eq!(format_mhz(1), "0.000001");
        assert_eq!(format_mhz(-2_000_000), "-2");
    }

    #[test]
    fn format_then_parse_is_identity() {
        for hz in [1, 999, 1_000_000, 12_345_678, 156_800_000] {
            let shown = format!("{}MHz", format_mhz(hz));
            assert_eq!(parse_frequency(&shown).unwrap(), hz);
        }
    }
}
