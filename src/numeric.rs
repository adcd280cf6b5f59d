//! Numeric tower: Int32 → Int64 → Double, with Decimal contagious.

use bigdecimal::{BigDecimal, Zero};

use crate::error::{Error, Result};
use crate::value::{NumType, Value, f64_to_decimal, to_decimal};

fn widest(a: &Value, b: &Value) -> Option<NumType> {
    Some(a.num_type()?.max(b.num_type()?))
}

fn as_i64(v: &Value) -> i64 {
    match v {
        Value::Int32(i) => *i as i64,
        Value::Int64(i) => *i,
        _ => 0,
    }
}

fn decimal_pair(a: &Value, b: &Value) -> Option<(BigDecimal, BigDecimal)> {
    Some((to_decimal(a)?, to_decimal(b)?))
}

fn narrow(result: i64, ty: NumType) -> Value {
    match (ty, i32::try_from(result)) {
        (NumType::Int32, Ok(small)) => Value::Int32(small),
        _ => Value::Int64(result),
    }
}

/// Integer operation with overflow promotion: Int32 to Int64, Int64 to Double.
fn integer_op(
    a: &Value,
    b: &Value,
    ty: NumType,
    op: fn(i64, i64) -> Option<i64>,
    fop: fn(f64, f64) -> f64,
) -> Value {
    match op(as_i64(a), as_i64(b)) {
        Some(r) => narrow(r, ty),
        None => Value::Double(fop(
            a.as_f64().unwrap_or_default(),
            b.as_f64().unwrap_or_default(),
        )),
    }
}

fn decimal_result(d: Option<BigDecimal>, fallback: f64) -> Value {
    match d {
        Some(d) => Value::Decimal(d),
        None => Value::Double(fallback),
    }
}

/// Sum of two numeric values. Returns `None` when either side is not numeric.
pub fn add(a: &Value, b: &Value) -> Option<Value> {
    let ty = widest(a, b)?;
    Some(match ty {
        NumType::Int32 | NumType::Int64 => {
            integer_op(a, b, ty, i64::checked_add, |x, y| x + y)
        }
        NumType::Double => Value::Double(a.as_f64()? + b.as_f64()?),
        NumType::Decimal => decimal_result(
            decimal_pair(a, b).map(|(x, y)| x + y),
            a.as_f64()? + b.as_f64()?,
        ),
    })
}

pub fn subtract(a: &Value, b: &Value) -> Option<Value> {
    let ty = widest(a, b)?;
    Some(match ty {
        NumType::Int32 | NumType::Int64 => {
            integer_op(a, b, ty, i64::checked_sub, |x, y| x - y)
        }
        NumType::Double => Value::Double(a.as_f64()? - b.as_f64()?),
        NumType::Decimal => decimal_result(
            decimal_pair(a, b).map(|(x, y)| x - y),
            a.as_f64()? - b.as_f64()?,
        ),
    })
}

pub fn multiply(a: &Value, b: &Value) -> Option<Value> {
    let ty = widest(a, b)?;
    Some(match ty {
        NumType::Int32 | NumType::Int64 => {
            integer_op(a, b, ty, i64::checked_mul, |x, y| x * y)
        }
        NumType::Double => Value::Double(a.as_f64()? * b.as_f64()?),
        NumType::Decimal => decimal_result(
            decimal_pair(a, b).map(|(x, y)| x * y),
            a.as_f64()? * b.as_f64()?,
        ),
    })
}

/// Division always yields a Double, or a Decimal when either side is one.
/// The caller rejects a zero divisor.
pub fn divide(a: &Value, b: &Value) -> Option<Value> {
    let ty = widest(a, b)?;
    let fallback = a.as_f64()? / b.as_f64()?;
    Some(match ty {
        NumType::Decimal => decimal_result(
            decimal_pair(a, b).and_then(|(x, y)| (!y.is_zero()).then(|| x / y)),
            fallback,
        ),
        _ => Value::Double(fallback),
    })
}

/// Remainder with the sign of the dividend. The caller rejects a zero divisor.
pub fn modulo(a: &Value, b: &Value) -> Option<Value> {
    let ty = widest(a, b)?;
    Some(match ty {
        NumType::Int32 | NumType::Int64 => {
            integer_op(a, b, ty, |x, y| x.checked_rem(y).or(Some(0)), |x, y| x % y)
        }
        NumType::Double => Value::Double(a.as_f64()? % b.as_f64()?),
        NumType::Decimal => decimal_result(
            decimal_pair(a, b).and_then(|(x, y)| (!y.is_zero()).then(|| x % y)),
            a.as_f64()? % b.as_f64()?,
        ),
    })
}

pub fn is_zero(v: &Value) -> bool {
    match v {
        Value::Int32(i) => *i == 0,
        Value::Int64(i) => *i == 0,
        Value::Double(f) => *f == 0.0,
        Value::Decimal(d) => d.is_zero(),
        _ => false,
    }
}

/// Counter increment. Int32 overflow widens to Int64; Int64 overflow is an
/// error rather than a silent wrap or promotion.
pub fn checked_inc(current: &Value, delta: &Value) -> Result<Value> {
    let ty = widest(current, delta).ok_or_else(|| {
        Error::TypeMismatch(format!(
            "cannot increment {} by {}",
            current.type_name(),
            delta.type_name()
        ))
    })?;
    match ty {
        NumType::Int32 | NumType::Int64 => {
            let (x, y) = (as_i64(current), as_i64(delta));
            x.checked_add(y).map(|r| narrow(r, ty)).ok_or_else(|| {
                Error::Overflow(format!("{x} + {y} overflows a 64-bit integer"))
            })
        }
        _ => add(current, delta).ok_or_else(|| Error::TypeMismatch("non-numeric increment".into())),
    }
}

pub fn negate(v: &Value) -> Option<Value> {
    subtract(&Value::Int32(0), v)
}

/// Absolute value. Int32::MIN widens to Int64, Int64::MIN to Double.
pub fn abs(v: &Value) -> Option<Value> {
    Some(match v {
        Value::Int32(i) => match i.checked_abs() {
            Some(r) => Value::Int32(r),
            None => Value::Int64((*i as i64).abs()),
        },
        Value::Int64(i) => match i.checked_abs() {
            Some(r) => Value::Int64(r),
            None => Value::Double((*i as f64).abs()),
        },
        Value::Double(f) => Value::Double(f.abs()),
        Value::Decimal(d) => Value::Decimal(d.abs()),
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Ceil,
    Floor,
    Trunc,
    /// Half to even.
    Round,
}

fn round_f64(f: f64, mode: Rounding) -> f64 {
    match mode {
        Rounding::Ceil => f.ceil(),
        Rounding::Floor => f.floor(),
        Rounding::Trunc => f.trunc(),
        Rounding::Round => {
            let r = f.round();
            if (f - f.trunc()).abs() == 0.5 {
                2.0 * (f / 2.0).round()
            } else {
                r
            }
        }
    }
}

/// Round to `places` decimal digits. Integers are returned unchanged for
/// non-negative `places`.
pub fn round(v: &Value, places: i64, mode: Rounding) -> Option<Value> {
    match v {
        Value::Int32(_) | Value::Int64(_) if places >= 0 => Some(v.clone()),
        Value::Int32(_) | Value::Int64(_) => {
            let scale = 10f64.powi((-places) as i32);
            let r = round_f64(v.as_f64()? / scale, mode) * scale;
            Some(narrow(r as i64, v.num_type()?))
        }
        Value::Double(f) => {
            if !f.is_finite() {
                return Some(v.clone());
            }
            let scale = 10f64.powi(places as i32);
            Some(Value::Double(round_f64(f * scale, mode) / scale))
        }
        Value::Decimal(d) => {
            let rounding = match mode {
                Rounding::Ceil => bigdecimal::RoundingMode::Ceiling,
                Rounding::Floor => bigdecimal::RoundingMode::Floor,
                Rounding::Trunc => bigdecimal::RoundingMode::Down,
                Rounding::Round => bigdecimal::RoundingMode::HalfEven,
            };
            Some(Value::Decimal(d.with_scale_round(places, rounding)))
        }
        _ => None,
    }
}

/// Convert a numeric value to Decimal, widening exactly.
pub fn to_decimal_value(v: &Value) -> Option<Value> {
    match v {
        Value::Double(f) => f64_to_decimal(*f).map(Value::Decimal),
        _ => to_decimal(v).map(Value::Decimal),
    }
}
