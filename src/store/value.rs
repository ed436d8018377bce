//! Policy arithmetic over the dynamic store value types.
//!
//! Values live in the store as raw bytes; numeric policies parse them by
//! the module's declared value type and re-serialize canonically (decimal
//! text for every numeric type, raw bytes otherwise).

use std::cmp::Ordering;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use num_bigint::BigInt;

use crate::error::ValueError;
use crate::manifest::ValueType;

/// `old + value` under the declared type. A missing old value counts as
/// zero. int64 wraps on overflow, float64 follows IEEE, the big types are
/// unbounded.
pub fn add(value_type: &ValueType, old: Option<&[u8]>, value: &[u8]) -> Result<Vec<u8>, ValueError> {
    match value_type {
        ValueType::Int64 => {
            let previous = old.map(parse_int64).transpose()?.unwrap_or(0);
            let increment = parse_int64(value)?;
            Ok(previous.wrapping_add(increment).to_string().into_bytes())
        }
        ValueType::Float64 => {
            let previous = old.map(parse_float64).transpose()?.unwrap_or(0.0);
            let increment = parse_float64(value)?;
            Ok(format_float64(previous + increment).into_bytes())
        }
        ValueType::BigInt => {
            let previous = old
                .map(parse_bigint)
                .transpose()?
                .unwrap_or_else(|| BigInt::from(0));
            let increment = parse_bigint(value)?;
            Ok((previous + increment).to_string().into_bytes())
        }
        ValueType::BigFloat => {
            let previous = old
                .map(parse_bigfloat)
                .transpose()?
                .unwrap_or_else(|| BigDecimal::from(0));
            let increment = parse_bigfloat(value)?;
            Ok((previous + increment).normalized().to_string().into_bytes())
        }
        other => Err(ValueError::UnsupportedOperation {
            op: "add",
            value_type: other.as_str(),
        }),
    }
}

/// Compares two serialized values in the declared type's ordering. Used by
/// the `min`/`max` policies, which replace only on a strict improvement.
pub fn compare(value_type: &ValueType, a: &[u8], b: &[u8]) -> Result<Ordering, ValueError> {
    match value_type {
        ValueType::Int64 => Ok(parse_int64(a)?.cmp(&parse_int64(b)?)),
        ValueType::Float64 => {
            let (a, b) = (parse_float64(a)?, parse_float64(b)?);
            Ok(a.partial_cmp(&b).unwrap_or(Ordering::Equal))
        }
        ValueType::BigInt => Ok(parse_bigint(a)?.cmp(&parse_bigint(b)?)),
        ValueType::BigFloat => Ok(parse_bigfloat(a)?.cmp(&parse_bigfloat(b)?)),
        other => Err(ValueError::UnsupportedOperation {
            op: "compare",
            value_type: other.as_str(),
        }),
    }
}

fn parse_int64(raw: &[u8]) -> Result<i64, ValueError> {
    as_text(raw, "int64")?
        .parse()
        .map_err(|_| parse_error(raw, "int64"))
}

fn parse_float64(raw: &[u8]) -> Result<f64, ValueError> {
    as_text(raw, "float64")?
        .parse()
        .map_err(|_| parse_error(raw, "float64"))
}

fn parse_bigint(raw: &[u8]) -> Result<BigInt, ValueError> {
    BigInt::parse_bytes(raw, 10).ok_or_else(|| parse_error(raw, "bigint"))
}

fn parse_bigfloat(raw: &[u8]) -> Result<BigDecimal, ValueError> {
    BigDecimal::from_str(as_text(raw, "bigfloat")?).map_err(|_| parse_error(raw, "bigfloat"))
}

fn format_float64(value: f64) -> String {
    // `{}` already yields the shortest round-trippable decimal form.
    format!("{value}")
}

fn as_text<'a>(raw: &'a [u8], value_type: &'static str) -> Result<&'a str, ValueError> {
    std::str::from_utf8(raw).map_err(|_| parse_error(raw, value_type))
}

fn parse_error(raw: &[u8], value_type: &'static str) -> ValueError {
    ValueError::Parse {
        value_type,
        got: String::from_utf8_lossy(raw).into_owned(),
    }
}
