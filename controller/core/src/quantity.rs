//! Integer arithmetic on Kubernetes quantities.
//!
//! Quantities are handled as milli-units in an `i64`: millicores for CPU and
//! millibytes for memory. That covers a few petabytes, which is plenty for a
//! container request.

use crate::{Error, Result};
use tortoise_k8s_api::{Quantity, ResourceName};

const KI: i128 = 1 << 10;
const MI: i128 = 1 << 20;
const GI: i128 = 1 << 30;
const TI: i128 = 1 << 40;
const PI: i128 = 1 << 50;
const EI: i128 = 1 << 60;

/// Parses a quantity into milli-units, rounding fractions of a milli-unit up.
pub fn parse_milli(q: &Quantity) -> Result<i64> {
    let s = q.0.trim();
    let invalid = || Error::InvalidQuantity(s.to_string());
    if s.is_empty() {
        return Err(invalid());
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, frac) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if (whole.is_empty() && frac.is_empty())
        || !whole.chars().all(|c| c.is_ascii_digit())
        || !frac.chars().all(|c| c.is_ascii_digit())
        || frac.len() > 18
    {
        return Err(invalid());
    }

    // The value is `digits / 10^scale`, held exactly.
    let digits: i128 = format!("{whole}{frac}").parse().map_err(|_| invalid())?;
    let scale = frac.len() as u32;

    // Multiplier to milli-units as `num / den`.
    let (num, den): (i128, i128) = match suffix {
        "" => (1000, 1),
        "n" => (1, 1_000_000),
        "u" => (1, 1000),
        "m" => (1, 1),
        "k" => (1000 * 1000, 1),
        "M" => (1000 * 1_000_000, 1),
        "G" => (1000 * 1_000_000_000, 1),
        "T" => (1000 * 1_000_000_000_000, 1),
        "P" => (1000 * 1_000_000_000_000_000, 1),
        "E" => (1000 * 1_000_000_000_000_000_000, 1),
        "Ki" => (1000 * KI, 1),
        "Mi" => (1000 * MI, 1),
        "Gi" => (1000 * GI, 1),
        "Ti" => (1000 * TI, 1),
        "Pi" => (1000 * PI, 1),
        "Ei" => (1000 * EI, 1),
        _ => return parse_exponent(suffix, number).ok_or_else(invalid),
    };

    let den = den * 10i128.pow(scale);
    let milli = digits
        .checked_mul(num)
        .map(|n| (n + den - 1) / den)
        .ok_or_else(invalid)?;
    let milli = i64::try_from(milli).map_err(|_| invalid())?;
    Ok(if negative { -milli } else { milli })
}

// Decimal exponent notation such as `1e3` or `5E-1`.
fn parse_exponent(suffix: &str, number: &str) -> Option<i64> {
    let exp = suffix.strip_prefix(['e', 'E'])?;
    let exp: i32 = exp.parse().ok()?;
    let base: f64 = number.parse().ok()?;
    let milli = (base * 10f64.powi(exp) * 1000.0).ceil();
    if !milli.is_finite() || milli.abs() > i64::MAX as f64 {
        return None;
    }
    Some(milli as i64)
}

/// Parses a quantity, logging and dropping it when malformed.
pub fn parse_or_warn(q: &Quantity) -> Option<i64> {
    match parse_milli(q) {
        Ok(v) => Some(v),
        Err(error) => {
            tracing::warn!(%error, "Ignoring malformed quantity");
            None
        }
    }
}

/// Formats milli-units back into the canonical form for `resource`.
///
/// CPU is written as whole cores when exact and millicores otherwise.
/// Memory is rounded up to a whole byte and written with the largest exact
/// binary suffix.
pub fn format(resource: ResourceName, milli: i64) -> Quantity {
    match resource {
        ResourceName::Cpu => {
            if milli % 1000 == 0 {
                Quantity(format!("{}", milli / 1000))
            } else {
                Quantity(format!("{milli}m"))
            }
        }
        ResourceName::Memory => {
            let bytes = (milli as i128 + 999).div_euclid(1000);
            for (unit, suffix) in [(GI, "Gi"), (MI, "Mi"), (KI, "Ki")] {
                if bytes != 0 && bytes % unit == 0 {
                    return Quantity(format!("{}{suffix}", bytes / unit));
                }
            }
            Quantity(format!("{bytes}"))
        }
    }
}

/// Multiplies milli-units by `num / den`, rounding up.
pub fn scale_ceil(milli: i64, num: i64, den: i64) -> i64 {
    debug_assert!(den > 0);
    let n = milli as i128 * num as i128;
    let d = den as i128;
    let v = if n >= 0 { (n + d - 1) / d } else { n / d };
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
