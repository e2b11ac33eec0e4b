//! Kubernetes resource quantities ("10Gi", "500M", "1.5e3")
//!
//! Values are kept in their original string form inside the API types; this
//! module parses them for validation and value comparison.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

const NANO_SCALE: u32 = 9;

/// Error parsing a quantity
#[derive(Debug, Error, PartialEq, Eq)]
#[error("quantity {input:?} is invalid: {reason}")]
pub struct ParseQuantityError {
    input: String,
    reason: &'static str,
}

/// Parse a quantity into nano-units (1 = 10^-9 of the base unit).
///
/// Precision finer than one nano-unit is truncated.
pub fn parse_quantity(input: &str) -> Result<i128, ParseQuantityError> {
    let err = |reason| ParseQuantityError {
        input: input.to_string(),
        reason,
    };

    let (negative, body) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };

    let number_len = body
        .bytes()
        .take_while(|b| b.is_ascii_digit() || *b == b'.')
        .count();
    let (number, suffix) = body.split_at(number_len);
    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return Err(err("expected a number"));
    }

    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    let digits = format!("{}{}", int_part, frac_part);
    let mantissa: i128 = digits
        .trim_start_matches('0')
        .parse()
        .or_else(|e: std::num::ParseIntError| {
            if digits.bytes().all(|b| b == b'0') {
                Ok(0)
            } else {
                Err(e)
            }
        })
        .map_err(|_| err("number out of range"))?;
    let frac_digits = frac_part.len() as i32;

    // value = mantissa * 10^-frac_digits * multiplier, expressed in nano-units
    let (binary_shift, decimal_exp) = match suffix {
        "" => (0, 0),
        "Ki" => (10, 0),
        "Mi" => (20, 0),
        "Gi" => (30, 0),
        "Ti" => (40, 0),
        "Pi" => (50, 0),
        "Ei" => (60, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        s if s.starts_with('e') || s.starts_with('E') => {
            let exp: i32 = s[1..].parse().map_err(|_| err("invalid exponent"))?;
            if !(-30..=30).contains(&exp) {
                return Err(err("exponent out of range"));
            }
            (0, exp)
        }
        _ => return Err(err("unknown suffix")),
    };

    let mut value = mantissa
        .checked_mul(1i128 << binary_shift)
        .ok_or_else(|| err("number out of range"))?;

    if value == 0 {
        return Ok(0);
    }

    let exp = decimal_exp + NANO_SCALE as i32 - frac_digits;
    if exp >= 0 {
        value = 10i128
            .checked_pow(exp as u32)
            .and_then(|scale| value.checked_mul(scale))
            .ok_or_else(|| err("number out of range"))?;
    } else {
        value /= 10i128.checked_pow((-exp) as u32).ok_or_else(|| err("too many digits"))?;
    }

    Ok(if negative { -value } else { value })
}

/// Compare two quantities by value; unparsable quantities compare by string
pub fn quantity_eq(a: &Quantity, b: &Quantity) -> bool {
    match (parse_quantity(&a.0), parse_quantity(&b.0)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.0 == b.0,
    }
}

/// Compare optional quantities by value
pub fn optional_quantity_eq(a: Option<&Quantity>, b: Option<&Quantity>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => quantity_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GI: i128 = 1 << 30;
    const NANO: i128 = 1_000_000_000;

    #[test]
    fn parses_binary_and_decimal_suffixes() {
        assert_eq!(parse_quantity("10Gi").unwrap(), 10 * GI * NANO);
        assert_eq!(parse_quantity("1Ki").unwrap(), 1024 * NANO);
        assert_eq!(parse_quantity("500M").unwrap(), 500_000_000 * NANO);
        assert_eq!(parse_quantity("100m").unwrap(), NANO / 10);
        assert_eq!(parse_quantity("1.5Gi").unwrap(), 3 * GI / 2 * NANO);
        assert_eq!(parse_quantity("1e3").unwrap(), 1000 * NANO);
        assert_eq!(parse_quantity("0").unwrap(), 0);
        assert_eq!(parse_quantity("-1").unwrap(), -NANO);
    }

    #[test]
    fn rejects_garbage() {
        for input in ["", "Gi", "1.2.3Gi", "10GB", "abc", "1e"] {
            assert!(parse_quantity(input).is_err(), "{input:?} should fail");
        }
    }

    #[test]
    fn huge_values_are_errors_not_panics() {
        for input in [
            "1e30",
            "-1e30",
            "200000000000E",
            "170141183460469231731687303715884105728",
            "99999999999999999999999999999Gi",
            "123456789012345678901234567890e1",
        ] {
            let err = parse_quantity(input).unwrap_err();
            assert!(
                err.to_string().contains("out of range"),
                "{input:?}: {err}"
            );
        }
        assert_eq!(parse_quantity("0e30").unwrap(), 0);
        assert_eq!(parse_quantity("1e20").unwrap(), 100_000_000_000_000_000_000 * NANO);
    }

    #[test]
    fn compares_by_value() {
        assert!(quantity_eq(
            &Quantity("20Gi".into()),
            &Quantity("21474836480".into())
        ));
        assert!(!quantity_eq(&Quantity("20Gi".into()), &Quantity("42Gi".into())));
        assert!(optional_quantity_eq(None, None));
        assert!(!optional_quantity_eq(Some(&Quantity("1Gi".into())), None));
    }
}
