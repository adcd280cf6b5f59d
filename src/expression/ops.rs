use std::cmp::Ordering;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Datelike, SecondsFormat, Timelike};

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::numeric::{self, Rounding};
use crate::value::{Value, compare_values};

/// Operators whose arguments are plain expressions.
///
/// `$and`, `$or`, `$cond` and `$ifNull` are evaluated lazily by the evaluator;
/// `apply` still handles them so constant folding can use one code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Abs,
    Ceil,
    Floor,
    Trunc,
    Round,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Cmp,
    And,
    Or,
    Not,
    Cond,
    IfNull,
    Concat,
    SubstrCP,
    SubstrBytes,
    StrLenCP,
    StrLenBytes,
    ToUpper,
    ToLower,
    Split,
    IndexOfCP,
    Strcasecmp,
    Size,
    ArrayElemAt,
    ConcatArrays,
    In,
    IsArray,
    Slice,
    ReverseArray,
    Range,
    First,
    Last,
    MergeObjects,
    ObjectToArray,
    Type,
    ToString,
    ToInt,
    ToLong,
    ToDouble,
    ToDecimal,
    ToBool,
    Year,
    Month,
    DayOfMonth,
    Hour,
    Minute,
    Second,
}

const OPERATORS: &[(&str, Operator)] = &[
    ("$add", Operator::Add),
    ("$subtract", Operator::Subtract),
    ("$multiply", Operator::Multiply),
    ("$divide", Operator::Divide),
    ("$mod", Operator::Mod),
    ("$abs", Operator::Abs),
    ("$ceil", Operator::Ceil),
    ("$floor", Operator::Floor),
    ("$trunc", Operator::Trunc),
    ("$round", Operator::Round),
    ("$eq", Operator::Eq),
    ("$ne", Operator::Ne),
    ("$gt", Operator::Gt),
    ("$gte", Operator::Gte),
    ("$lt", Operator::Lt),
    ("$lte", Operator::Lte),
    ("$cmp", Operator::Cmp),
    ("$and", Operator::And),
    ("$or", Operator::Or),
    ("$not", Operator::Not),
    ("$cond", Operator::Cond),
    ("$ifNull", Operator::IfNull),
    ("$concat", Operator::Concat),
    ("$substrCP", Operator::SubstrCP),
    ("$substrBytes", Operator::SubstrBytes),
    ("$strLenCP", Operator::StrLenCP),
    ("$strLenBytes", Operator::StrLenBytes),
    ("$toUpper", Operator::ToUpper),
    ("$toLower", Operator::ToLower),
    ("$split", Operator::Split),
    ("$indexOfCP", Operator::IndexOfCP),
    ("$strcasecmp", Operator::Strcasecmp),
    ("$size", Operator::Size),
    ("$arrayElemAt", Operator::ArrayElemAt),
    ("$concatArrays", Operator::ConcatArrays),
    ("$in", Operator::In),
    ("$isArray", Operator::IsArray),
    ("$slice", Operator::Slice),
    ("$reverseArray", Operator::ReverseArray),
    ("$range", Operator::Range),
    ("$first", Operator::First),
    ("$last", Operator::Last),
    ("$mergeObjects", Operator::MergeObjects),
    ("$objectToArray", Operator::ObjectToArray),
    ("$type", Operator::Type),
    ("$toString", Operator::ToString),
    ("$toInt", Operator::ToInt),
    ("$toLong", Operator::ToLong),
    ("$toDouble", Operator::ToDouble),
    ("$toDecimal", Operator::ToDecimal),
    ("$toBool", Operator::ToBool),
    ("$year", Operator::Year),
    ("$month", Operator::Month),
    ("$dayOfMonth", Operator::DayOfMonth),
    ("$hour", Operator::Hour),
    ("$minute", Operator::Minute),
    ("$second", Operator::Second),
];

fn fail(code: i32, message: impl Into<String>) -> Error {
    Error::location(code, message)
}

impl Operator {
    pub fn from_name(name: &str) -> Option<Self> {
        OPERATORS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, op)| *op)
    }

    pub fn name(self) -> &'static str {
        OPERATORS
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(n, _)| *n)
            .unwrap_or("$unknown")
    }

    /// Minimum and optional maximum argument count.
    pub fn arity(self) -> (usize, Option<usize>) {
        use Operator::*;
        match self {
            Add | Multiply | And | Or | Concat | ConcatArrays | MergeObjects => (0, None),
            IfNull => (2, None),
            Subtract | Divide | Mod | Eq | Ne | Gt | Gte | Lt | Lte | Cmp | Split | Strcasecmp
            | ArrayElemAt | In => (2, Some(2)),
            Cond | SubstrCP | SubstrBytes => (3, Some(3)),
            Trunc | Round | Year | Month | DayOfMonth | Hour | Minute | Second => (1, Some(2)),
            IndexOfCP => (2, Some(4)),
            Slice | Range => (2, Some(3)),
            Abs | Ceil | Floor | Not | StrLenCP | StrLenBytes | ToUpper | ToLower | Size
            | IsArray | ReverseArray | First | Last | ObjectToArray | Type | ToString | ToInt
            | ToLong | ToDouble | ToDecimal | ToBool => (1, Some(1)),
        }
    }

    /// Operators that must not evaluate every argument up front.
    pub fn is_lazy(self) -> bool {
        matches!(
            self,
            Operator::And | Operator::Or | Operator::Cond | Operator::IfNull
        )
    }

    pub fn apply(self, args: Vec<Value>, collation: Option<&Collation>) -> Result<Value> {
        use Operator::*;
        match self {
            Add => add(&args),
            Subtract => subtract(&args[0], &args[1]),
            Multiply => multiply(&args),
            Divide => divide(&args[0], &args[1]),
            Mod => modulo(&args[0], &args[1]),
            Abs | Ceil | Floor => math(self, &args[0]),
            Trunc => round(self, &args, Rounding::Trunc),
            Round => round(self, &args, Rounding::Round),
            Eq | Ne | Gt | Gte | Lt | Lte => {
                let ord = compare_values(&args[0], &args[1], collation);
                Ok(Value::Bool(match self {
                    Eq => ord == Ordering::Equal,
                    Ne => ord != Ordering::Equal,
                    Gt => ord == Ordering::Greater,
                    Gte => ord != Ordering::Less,
                    Lt => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                }))
            }
            Cmp => Ok(ordering_value(compare_values(&args[0], &args[1], collation))),
            And => Ok(Value::Bool(args.iter().all(Value::coerce_to_bool))),
            Or => Ok(Value::Bool(args.iter().any(Value::coerce_to_bool))),
            Not => Ok(Value::Bool(!args[0].coerce_to_bool())),
            Cond => {
                let mut args = args;
                let otherwise = args.pop().unwrap_or(Value::Null);
                let then = args.pop().unwrap_or(Value::Null);
                if args.first().is_some_and(Value::coerce_to_bool) {
                    Ok(then)
                } else {
                    Ok(otherwise)
                }
            }
            IfNull => {
                let mut args = args;
                let fallback = args.pop().unwrap_or(Value::Null);
                Ok(args
                    .into_iter()
                    .find(|v| !v.is_nullish())
                    .unwrap_or(fallback))
            }
            Concat => concat(&args),
            SubstrCP => substr_cp(&args),
            SubstrBytes => substr_bytes(&args),
            StrLenCP => match &args[0] {
                Value::String(s) => Ok(Value::Int32(s.chars().count() as i32)),
                other => Err(fail(
                    codes::STRLEN_CP_NOT_STRING,
                    format!("$strLenCP requires a string argument, found: {}", other.type_name()),
                )),
            },
            StrLenBytes => match &args[0] {
                Value::String(s) => Ok(Value::Int32(s.len() as i32)),
                other => Err(fail(
                    codes::STRLEN_BYTES_NOT_STRING,
                    format!(
                        "$strLenBytes requires a string argument, found: {}",
                        other.type_name()
                    ),
                )),
            },
            ToUpper => Ok(Value::String(
                coerce_to_string(&args[0], "$toUpper")?.to_ascii_uppercase(),
            )),
            ToLower => Ok(Value::String(
                coerce_to_string(&args[0], "$toLower")?.to_ascii_lowercase(),
            )),
            Split => split(&args[0], &args[1]),
            IndexOfCP => index_of_cp(&args),
            Strcasecmp => {
                let a = coerce_to_string(&args[0], "$strcasecmp")?.to_ascii_lowercase();
                let b = coerce_to_string(&args[1], "$strcasecmp")?.to_ascii_lowercase();
                Ok(ordering_value(a.cmp(&b)))
            }
            Size => match &args[0] {
                Value::Array(items) => Ok(Value::Int32(items.len() as i32)),
                other => Err(fail(
                    codes::SIZE_NOT_ARRAY,
                    format!(
                        "The argument to $size must be an array. Type of the argument was {}",
                        other.type_name()
                    ),
                )),
            },
            ArrayElemAt => array_elem_at(&args[0], &args[1]),
            ConcatArrays => concat_arrays(args),
            In => match &args[1] {
                Value::Array(items) => Ok(Value::Bool(items.iter().any(|item| {
                    compare_values(&args[0], item, collation) == Ordering::Equal
                }))),
                other => Err(fail(
                    codes::IN_NOT_ARRAY,
                    format!(
                        "$in requires an array as a second argument, found: {}",
                        other.type_name()
                    ),
                )),
            },
            IsArray => Ok(Value::Bool(matches!(args[0], Value::Array(_)))),
            Slice => slice(&args),
            ReverseArray => match &args[0] {
                v if v.is_nullish() => Ok(Value::Null),
                Value::Array(items) => Ok(Value::Array(items.iter().rev().cloned().collect())),
                other => Err(fail(
                    codes::REVERSE_NOT_ARRAY,
                    format!("The argument to $reverseArray must be an array, but was of type: {}", other.type_name()),
                )),
            },
            Range => range(&args),
            First | Last => first_last(self, &args[0]),
            MergeObjects => merge_objects(&args),
            ObjectToArray => object_to_array(&args[0]),
            Type => Ok(Value::from(args[0].type_name())),
            ToString | ToInt | ToLong | ToDouble | ToDecimal | ToBool => convert(self, &args[0]),
            Year | Month | DayOfMonth | Hour | Minute | Second => date_part(self, &args),
        }
    }
}

fn ordering_value(ord: Ordering) -> Value {
    Value::Int32(match ord {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

fn add(args: &[Value]) -> Result<Value> {
    let mut total = Value::Int32(0);
    let mut date: Option<i64> = None;
    for v in args {
        match v {
            v if v.is_nullish() => return Ok(Value::Null),
            Value::Date(ms) => {
                if date.is_some() {
                    return Err(fail(
                        codes::ADD_MULTIPLE_DATES,
                        "only one date allowed in an $add expression",
                    ));
                }
                date = Some(*ms);
            }
            v => {
                total = numeric::add(&total, v).ok_or_else(|| {
                    fail(
                        codes::ADD_NOT_NUMERIC,
                        format!("$add only supports numeric or date types, not {}", v.type_name()),
                    )
                })?;
            }
        }
    }
    match date {
        Some(ms) => {
            let delta = total.as_f64().unwrap_or_default().round() as i64;
            Ok(Value::Date(ms.saturating_add(delta)))
        }
        None => Ok(total),
    }
}

fn subtract(a: &Value, b: &Value) -> Result<Value> {
    if a.is_nullish() || b.is_nullish() {
        return Ok(Value::Null);
    }
    match (a, b) {
        (Value::Date(x), Value::Date(y)) => Ok(Value::Int64(x.saturating_sub(*y))),
        (Value::Date(x), n) if n.is_numeric() => {
            let delta = n.as_f64().unwrap_or_default().round() as i64;
            Ok(Value::Date(x.saturating_sub(delta)))
        }
        _ => numeric::subtract(a, b).ok_or_else(|| {
            fail(
                codes::SUBTRACT_NOT_NUMERIC,
                format!(
                    "$subtract only supports numeric or date types, not {} and {}",
                    a.type_name(),
                    b.type_name()
                ),
            )
        }),
    }
}

fn multiply(args: &[Value]) -> Result<Value> {
    let mut product = Value::Int32(1);
    for v in args {
        if v.is_nullish() {
            return Ok(Value::Null);
        }
        product = numeric::multiply(&product, v).ok_or_else(|| {
            fail(
                codes::MULTIPLY_NOT_NUMERIC,
                format!("$multiply only supports numeric types, not {}", v.type_name()),
            )
        })?;
    }
    Ok(product)
}

fn divide(a: &Value, b: &Value) -> Result<Value> {
    if a.is_nullish() || b.is_nullish() {
        return Ok(Value::Null);
    }
    if !a.is_numeric() || !b.is_numeric() {
        return Err(fail(
            codes::DIVIDE_NOT_NUMERIC,
            format!(
                "$divide only supports numeric types, not {} and {}",
                a.type_name(),
                b.type_name()
            ),
        ));
    }
    if numeric::is_zero(b) {
        return Err(fail(codes::DIVIDE_BY_ZERO, "can't $divide by zero"));
    }
    numeric::divide(a, b).ok_or_else(|| fail(codes::DIVIDE_NOT_NUMERIC, "$divide failed"))
}

fn modulo(a: &Value, b: &Value) -> Result<Value> {
    if a.is_nullish() || b.is_nullish() {
        return Ok(Value::Null);
    }
    if !a.is_numeric() || !b.is_numeric() {
        return Err(fail(
            codes::MOD_NOT_NUMERIC,
            format!(
                "$mod only supports numeric types, not {} and {}",
                a.type_name(),
                b.type_name()
            ),
        ));
    }
    if numeric::is_zero(b) {
        return Err(fail(codes::MOD_BY_ZERO, "can't $mod by zero"));
    }
    numeric::modulo(a, b).ok_or_else(|| fail(codes::MOD_NOT_NUMERIC, "$mod failed"))
}

fn math(op: Operator, v: &Value) -> Result<Value> {
    if v.is_nullish() {
        return Ok(Value::Null);
    }
    let result = match op {
        Operator::Abs => numeric::abs(v),
        Operator::Ceil => numeric::round(v, 0, Rounding::Ceil),
        _ => numeric::round(v, 0, Rounding::Floor),
    };
    result.ok_or_else(|| {
        fail(
            codes::MATH_NOT_NUMERIC,
            format!("{} only supports numeric types, not {}", op.name(), v.type_name()),
        )
    })
}

fn round(op: Operator, args: &[Value], mode: Rounding) -> Result<Value> {
    let v = &args[0];
    let place = match args.get(1) {
        None => 0,
        Some(p) if p.is_nullish() => return Ok(Value::Null),
        Some(p) => match p.integral_i64() {
            Some(n) if (-20..=100).contains(&n) => n,
            _ => {
                return Err(fail(
                    codes::ROUND_BAD_PLACE,
                    format!("cannot apply {} with precision value {p}, value must be in [-20, 100]", op.name()),
                ));
            }
        },
    };
    if v.is_nullish() {
        return Ok(Value::Null);
    }
    numeric::round(v, place, mode).ok_or_else(|| {
        fail(
            codes::MATH_NOT_NUMERIC,
            format!("{} only supports numeric types, not {}", op.name(), v.type_name()),
        )
    })
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

fn format_date(ms: i64) -> Option<String> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Scalar to string the way string operators accept their inputs.
pub(crate) fn coerce_to_string(v: &Value, op: &str) -> Result<String> {
    match v {
        Value::Missing | Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s.clone()),
        Value::Int32(i) => Ok(i.to_string()),
        Value::Int64(i) => Ok(i.to_string()),
        Value::Double(f) => Ok(f.to_string()),
        Value::Decimal(d) => Ok(d.to_string()),
        Value::Date(ms) => format_date(*ms).ok_or_else(|| {
            fail(codes::STRING_ARG_NOT_STRING, format!("{op}: date out of range"))
        }),
        other => Err(fail(
            codes::STRING_ARG_NOT_STRING,
            format!("{op}: can't convert from BSON type {} to String", other.type_name()),
        )),
    }
}

fn concat(args: &[Value]) -> Result<Value> {
    let mut out = String::new();
    for v in args {
        match v {
            v if v.is_nullish() => return Ok(Value::Null),
            Value::String(s) => out.push_str(s),
            other => {
                return Err(fail(
                    codes::CONCAT_NOT_STRING,
                    format!("$concat only supports strings, not {}", other.type_name()),
                ));
            }
        }
    }
    Ok(Value::String(out))
}

fn substr_cp(args: &[Value]) -> Result<Value> {
    let s = coerce_to_string(&args[0], "$substrCP")?;
    let (start, len) = (&args[1], &args[2]);
    if !start.is_numeric() {
        return Err(fail(
            codes::SUBSTR_START_NOT_NUMERIC,
            format!("$substrCP: starting index must be a numeric type (is BSON type {})", start.type_name()),
        ));
    }
    if !len.is_numeric() {
        return Err(fail(
            codes::SUBSTR_LENGTH_NOT_NUMERIC,
            format!("$substrCP: length must be a numeric type (is BSON type {})", len.type_name()),
        ));
    }
    let start = start.integral_i32().ok_or_else(|| {
        fail(
            codes::SUBSTR_START_NOT_INT32,
            "$substrCP: starting index cannot be represented as a 32-bit integral value",
        )
    })?;
    let len = len.integral_i32().ok_or_else(|| {
        fail(
            codes::SUBSTR_LENGTH_NOT_INT32,
            "$substrCP: length cannot be represented as a 32-bit integral value",
        )
    })?;
    if len < 0 {
        return Err(fail(
            codes::SUBSTR_LENGTH_NEGATIVE,
            "$substrCP: length must be a nonnegative integer.",
        ));
    }
    if start < 0 {
        return Err(fail(
            codes::SUBSTR_START_NEGATIVE,
            "$substrCP: the starting index must be nonnegative integer.",
        ));
    }
    Ok(Value::String(
        s.chars().skip(start as usize).take(len as usize).collect(),
    ))
}

fn substr_bytes(args: &[Value]) -> Result<Value> {
    let s = coerce_to_string(&args[0], "$substrBytes")?;
    let start = args[1].integral_i64().ok_or_else(|| {
        fail(
            codes::SUBSTR_BYTES_START_NOT_NUMERIC,
            format!("$substrBytes: starting index must be a numeric type (is BSON type {})", args[1].type_name()),
        )
    })?;
    let len = args[2].integral_i64().ok_or_else(|| {
        fail(
            codes::SUBSTR_BYTES_LENGTH_NOT_NUMERIC,
            format!("$substrBytes: length must be a numeric type (is BSON type {})", args[2].type_name()),
        )
    })?;
    if start < 0 {
        return Err(fail(
            codes::SUBSTR_BYTES_START_NEGATIVE,
            "$substrBytes: starting index must be non-negative",
        ));
    }
    let start = (start as usize).min(s.len());
    if !s.is_char_boundary(start) {
        return Err(fail(
            codes::SUBSTR_BYTES_NOT_UTF8,
            "$substrBytes: Invalid range, starting index is a UTF-8 continuation byte.",
        ));
    }
    let end = if len < 0 {
        s.len()
    } else {
        start.saturating_add(len as usize).min(s.len())
    };
    if !s.is_char_boundary(end) {
        return Err(fail(
            codes::SUBSTR_BYTES_END_NOT_UTF8,
            "$substrBytes: Invalid range, ending index is in the middle of a UTF-8 character.",
        ));
    }
    Ok(Value::String(s[start..end].to_string()))
}

fn split(input: &Value, sep: &Value) -> Result<Value> {
    if input.is_nullish() {
        return Ok(Value::Null);
    }
    let Value::String(s) = input else {
        return Err(fail(
            codes::SPLIT_NOT_STRING,
            format!(
                "$split requires an expression that evaluates to a string as a first argument, found: {}",
                input.type_name()
            ),
        ));
    };
    let Value::String(sep) = sep else {
        return Err(fail(
            codes::SPLIT_SEPARATOR_NOT_STRING,
            format!(
                "$split requires an expression that evaluates to a string as a second argument, found: {}",
                sep.type_name()
            ),
        ));
    };
    if sep.is_empty() {
        return Err(fail(
            codes::SPLIT_EMPTY_SEPARATOR,
            "$split requires a non-empty separator",
        ));
    }
    Ok(Value::Array(s.split(sep.as_str()).map(Value::from).collect()))
}

fn index_bound(v: Option<&Value>, default: usize) -> Result<usize> {
    match v {
        None => Ok(default),
        Some(v) => match v.integral_i64() {
            Some(n) if n >= 0 => Ok(n as usize),
            Some(_) => Err(fail(
                codes::INDEX_OF_NEGATIVE_INDEX,
                "$indexOfCP requires a nonnegative index",
            )),
            None => Err(fail(
                codes::INDEX_OF_BAD_INDEX,
                format!("$indexOfCP requires an integral index, found a value of type: {}", v.type_name()),
            )),
        },
    }
}

fn index_of_cp(args: &[Value]) -> Result<Value> {
    if args[0].is_nullish() {
        return Ok(Value::Null);
    }
    let Value::String(haystack) = &args[0] else {
        return Err(fail(
            codes::INDEX_OF_NOT_STRING,
            format!("$indexOfCP requires a string as the first argument, found: {}", args[0].type_name()),
        ));
    };
    let Value::String(needle) = &args[1] else {
        return Err(fail(
            codes::INDEX_OF_SUBSTRING_NOT_STRING,
            format!("$indexOfCP requires a string as the second argument, found: {}", args[1].type_name()),
        ));
    };
    let hay: Vec<char> = haystack.chars().collect();
    let token: Vec<char> = needle.chars().collect();
    let start = index_bound(args.get(2), 0)?;
    let end = index_bound(args.get(3), hay.len())?.min(hay.len());
    if token.is_empty() {
        return Ok(Value::Int32(if start <= end { start as i32 } else { -1 }));
    }
    for i in start..end {
        if i + token.len() <= hay.len() && hay[i..i + token.len()] == token[..] {
            return Ok(Value::Int32(i as i32));
        }
    }
    Ok(Value::Int32(-1))
}

// ---------------------------------------------------------------------------
// Arrays and objects
// ---------------------------------------------------------------------------

fn array_elem_at(array: &Value, index: &Value) -> Result<Value> {
    if array.is_nullish() || index.is_nullish() {
        return Ok(Value::Null);
    }
    let Value::Array(items) = array else {
        return Err(fail(
            codes::ARRAY_ELEM_AT_NOT_ARRAY,
            format!("$arrayElemAt's first argument must be an array, but is {}", array.type_name()),
        ));
    };
    if !index.is_numeric() {
        return Err(fail(
            codes::ARRAY_ELEM_AT_NOT_NUMERIC,
            format!("$arrayElemAt's second argument must be a numeric value, but is {}", index.type_name()),
        ));
    }
    let idx = index.integral_i32().ok_or_else(|| {
        fail(
            codes::ARRAY_ELEM_AT_NOT_INT32,
            format!("$arrayElemAt's second argument must be representable as a 32-bit integer: {index}"),
        )
    })? as i64;
    let len = items.len() as i64;
    let pos = if idx < 0 { len + idx } else { idx };
    if pos < 0 || pos >= len {
        return Ok(Value::Missing);
    }
    Ok(items[pos as usize].clone())
}

fn concat_arrays(args: Vec<Value>) -> Result<Value> {
    let mut out = Vec::new();
    for v in args {
        match v {
            v if v.is_nullish() => return Ok(Value::Null),
            Value::Array(items) => out.extend(items),
            other => {
                return Err(fail(
                    codes::CONCAT_ARRAYS_NOT_ARRAY,
                    format!("$concatArrays only supports arrays, not {}", other.type_name()),
                ));
            }
        }
    }
    Ok(Value::Array(out))
}

fn slice_arg(v: &Value) -> Result<i64> {
    v.integral_i32().map(i64::from).ok_or_else(|| {
        fail(
            codes::SLICE_BAD_ARG,
            format!("$slice arguments must be representable as a 32-bit integer: {v}"),
        )
    })
}

fn slice(args: &[Value]) -> Result<Value> {
    if args.iter().any(Value::is_nullish) {
        return Ok(Value::Null);
    }
    let Value::Array(items) = &args[0] else {
        return Err(fail(
            codes::SLICE_NOT_ARRAY,
            format!("First argument to $slice must be an array, but is of type: {}", args[0].type_name()),
        ));
    };
    let len = items.len() as i64;
    let (start, count) = if args.len() == 2 {
        let n = slice_arg(&args[1])?;
        if n >= 0 { (0, n) } else { ((len + n).max(0), -n) }
    } else {
        let pos = slice_arg(&args[1])?;
        let n = slice_arg(&args[2])?;
        if n <= 0 {
            return Err(fail(
                codes::SLICE_NON_POSITIVE_COUNT,
                format!("Third argument to $slice must be positive: {n}"),
            ));
        }
        let start = if pos < 0 { (len + pos).max(0) } else { pos.min(len) };
        (start, n)
    };
    Ok(Value::Array(
        items
            .iter()
            .skip(start as usize)
            .take(count as usize)
            .cloned()
            .collect(),
    ))
}

fn range(args: &[Value]) -> Result<Value> {
    let start = args[0].integral_i32().ok_or_else(|| {
        fail(
            codes::RANGE_BAD_ARG,
            format!("$range requires a starting value that can be represented as a 32-bit integer, found value: {}", args[0]),
        )
    })? as i64;
    let end = args[1].integral_i32().ok_or_else(|| {
        fail(
            codes::RANGE_END_BAD,
            format!("$range requires an ending value that can be represented as a 32-bit integer, found value: {}", args[1]),
        )
    })? as i64;
    let step = match args.get(2) {
        None => 1,
        Some(v) => v.integral_i32().ok_or_else(|| {
            fail(
                codes::RANGE_STEP_BAD,
                format!("$range requires a step value that can be represented as a 32-bit integer, found value: {v}"),
            )
        })? as i64,
    };
    if step == 0 {
        return Err(fail(codes::RANGE_ZERO_STEP, "$range requires a non-zero step value"));
    }
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < end) || (step < 0 && i > end) {
        out.push(Value::Int32(i as i32));
        i += step;
    }
    Ok(Value::Array(out))
}

fn first_last(op: Operator, v: &Value) -> Result<Value> {
    match v {
        Value::Missing | Value::Null => Ok(v.clone()),
        Value::Array(items) => {
            let item = if op == Operator::First {
                items.first()
            } else {
                items.last()
            };
            Ok(item.cloned().unwrap_or(Value::Missing))
        }
        other => Err(fail(
            codes::FIRST_LAST_NOT_ARRAY,
            format!("{}'s argument must be an array, but is {}", op.name(), other.type_name()),
        )),
    }
}

pub(crate) fn merge_objects(args: &[Value]) -> Result<Value> {
    let mut out = Document::new();
    for v in args {
        match v {
            v if v.is_nullish() => {}
            Value::Document(doc) => {
                for (k, v) in doc {
                    out.insert(k.clone(), v.clone());
                }
            }
            other => {
                return Err(fail(
                    codes::MERGE_OBJECTS_NOT_OBJECT,
                    format!(
                        "$mergeObjects requires object inputs, but input {other} is of type {}",
                        other.type_name()
                    ),
                ));
            }
        }
    }
    Ok(Value::Document(out))
}

fn object_to_array(v: &Value) -> Result<Value> {
    match v {
        v if v.is_nullish() => Ok(Value::Null),
        Value::Document(doc) => Ok(Value::Array(
            doc.iter()
                .map(|(k, v)| {
                    let mut pair = Document::with_capacity(2);
                    pair.insert("k", Value::from(k.as_str()));
                    pair.insert("v", v.clone());
                    Value::Document(pair)
                })
                .collect(),
        )),
        other => Err(fail(
            codes::OBJECT_TO_ARRAY_NOT_OBJECT,
            format!("$objectToArray requires a document input, found: {}", other.type_name()),
        )),
    }
}

// ---------------------------------------------------------------------------
// Type conversion
// ---------------------------------------------------------------------------

fn conversion_error(v: &Value, target: &str) -> Error {
    fail(
        codes::CONVERSION_FAILURE,
        format!(
            "Unsupported conversion from {} to {target} in $convert with no onError value",
            v.type_name()
        ),
    )
}

fn parse_error(s: &str) -> Error {
    fail(
        codes::CONVERSION_FAILURE,
        format!("Failed to parse number '{s}' in $convert with no onError value"),
    )
}

fn convert(op: Operator, v: &Value) -> Result<Value> {
    if v.is_nullish() {
        return Ok(Value::Null);
    }
    match op {
        Operator::ToString => match v {
            Value::Bool(b) => Ok(Value::from(b.to_string())),
            Value::ObjectId(oid) => Ok(Value::from(oid.to_hex())),
            Value::String(_)
            | Value::Int32(_)
            | Value::Int64(_)
            | Value::Double(_)
            | Value::Decimal(_)
            | Value::Date(_) => Ok(Value::from(coerce_to_string(v, "$toString")?)),
            _ => Err(conversion_error(v, "string")),
        },
        Operator::ToInt => {
            let n = to_long(v, "int")?;
            i32::try_from(n).map(Value::Int32).map_err(|_| {
                fail(
                    codes::CONVERSION_FAILURE,
                    format!("Conversion would overflow target type in $convert with no onError value: {v}"),
                )
            })
        }
        Operator::ToLong => to_long(v, "long").map(Value::Int64),
        Operator::ToDouble => match v {
            Value::Bool(b) => Ok(Value::Double(if *b { 1.0 } else { 0.0 })),
            Value::Date(ms) => Ok(Value::Double(*ms as f64)),
            Value::String(s) => s.parse::<f64>().map(Value::Double).map_err(|_| parse_error(s)),
            v if v.is_numeric() => Ok(Value::Double(v.as_f64().unwrap_or(f64::NAN))),
            _ => Err(conversion_error(v, "double")),
        },
        Operator::ToDecimal => match v {
            Value::Bool(b) => Ok(Value::Decimal(BigDecimal::from(*b as i32))),
            Value::Date(ms) => Ok(Value::Decimal(BigDecimal::from(*ms))),
            Value::String(s) => BigDecimal::from_str(s)
                .map(Value::Decimal)
                .map_err(|_| parse_error(s)),
            v if v.is_numeric() => {
                numeric::to_decimal_value(v).ok_or_else(|| conversion_error(v, "decimal"))
            }
            _ => Err(conversion_error(v, "decimal")),
        },
        Operator::ToBool => Ok(Value::Bool(v.coerce_to_bool())),
        _ => Err(conversion_error(v, op.name())),
    }
}

fn to_long(v: &Value, target: &str) -> Result<i64> {
    let overflow = || {
        fail(
            codes::CONVERSION_FAILURE,
            format!("Conversion would overflow target type in $convert with no onError value: {v}"),
        )
    };
    match v {
        Value::Bool(b) => Ok(*b as i64),
        Value::Int32(i) => Ok(*i as i64),
        Value::Int64(i) => Ok(*i),
        Value::Double(f) => {
            if !f.is_finite() {
                return Err(fail(
                    codes::CONVERSION_FAILURE,
                    format!("Attempt to convert NaN or infinity value to {target} in $convert with no onError value"),
                ));
            }
            Value::Double(f.trunc()).integral_i64().ok_or_else(overflow)
        }
        Value::Decimal(d) => {
            let truncated = d.with_scale_round(0, bigdecimal::RoundingMode::Down);
            Value::Decimal(truncated).integral_i64().ok_or_else(overflow)
        }
        Value::Date(ms) if target == "long" => Ok(*ms),
        Value::String(s) => s.parse::<i64>().map_err(|_| parse_error(s)),
        _ => Err(conversion_error(v, target)),
    }
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Offset in milliseconds for a timezone argument: "UTC", "GMT", "Z" or
/// a fixed "+HH:MM" / "-HHMM" / "+HH" offset.
fn timezone_offset_ms(tz: &str) -> Option<i64> {
    if matches!(tz, "UTC" | "GMT" | "Z" | "Etc/UTC") {
        return Some(0);
    }
    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hh, mm) = match digits.len() {
        2 => (digits.parse::<i64>().ok()?, 0),
        4 => (digits[..2].parse::<i64>().ok()?, digits[2..].parse::<i64>().ok()?),
        _ => return None,
    };
    if hh > 23 || mm > 59 {
        return None;
    }
    Some(sign * (hh * 3_600_000 + mm * 60_000))
}

fn date_part(op: Operator, args: &[Value]) -> Result<Value> {
    let ms = match &args[0] {
        v if v.is_nullish() => return Ok(Value::Null),
        Value::Date(ms) => *ms,
        Value::ObjectId(oid) => {
            let b = oid.bytes();
            u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64 * 1000
        }
        other => {
            return Err(fail(
                codes::DATE_NOT_DATE,
                format!("can't convert from BSON type {} to Date", other.type_name()),
            ));
        }
    };
    let offset = match args.get(1) {
        None => 0,
        Some(v) if v.is_nullish() => return Ok(Value::Null),
        Some(Value::String(tz)) => timezone_offset_ms(tz).ok_or_else(|| {
            fail(
                codes::DATE_BAD_TIMEZONE,
                format!("unrecognized time zone identifier: \"{tz}\""),
            )
        })?,
        Some(other) => {
            return Err(fail(
                codes::DATE_BAD_TIMEZONE,
                format!("timezone must evaluate to a string, found {}", other.type_name()),
            ));
        }
    };
    let dt = ms
        .checked_add(offset)
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| fail(codes::DATE_NOT_DATE, format!("date out of range: {ms}")))?;
    let part = match op {
        Operator::Year => dt.year(),
        Operator::Month => dt.month() as i32,
        Operator::DayOfMonth => dt.day() as i32,
        Operator::Hour => dt.hour() as i32,
        Operator::Minute => dt.minute() as i32,
        _ => dt.second() as i32,
    };
    Ok(Value::Int32(part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        Value::from_json(&j)
    }

    fn apply(op: Operator, args: serde_json::Value) -> Result<Value> {
        let Value::Array(items) = v(args) else {
            panic!("args must be an array")
        };
        op.apply(items, None)
    }

    #[test]
    fn substr_cp_precondition_codes() {
        let cases = [
            (json!(["abc", "x", 1]), 34450),
            (json!(["abc", 1.5, 1]), 34451),
            (json!(["abc", 0, "x"]), 34452),
            (json!(["abc", 0, 2.5]), 34453),
            (json!(["abc", 0, -1]), 34454),
            (json!(["abc", -1, 1]), 34455),
        ];
        for (args, code) in cases {
            let err = apply(Operator::SubstrCP, args.clone()).unwrap_err();
            assert_eq!(err.code(), code, "{args}");
        }
        assert_eq!(
            apply(Operator::SubstrCP, json!(["héllo", 1, 3])).unwrap(),
            Value::from("éll")
        );
    }

    #[test]
    fn substr_bytes_rejects_split_characters() {
        assert_eq!(
            apply(Operator::SubstrBytes, json!(["héllo", 1, 1])).unwrap_err().code(),
            28657
        );
        assert_eq!(
            apply(Operator::SubstrBytes, json!(["héllo", 2, 1])).unwrap_err().code(),
            28656
        );
        assert_eq!(
            apply(Operator::SubstrBytes, json!(["hello", 1, -1])).unwrap(),
            Value::from("ello")
        );
    }

    #[test]
    fn arithmetic_with_nulls_and_dates() {
        assert_eq!(apply(Operator::Add, json!([1, null])).unwrap(), Value::Null);
        assert_eq!(
            apply(Operator::Add, json!([{"$date": 1000}, 500])).unwrap(),
            Value::Date(1500)
        );
        assert_eq!(
            apply(Operator::Subtract, json!([{"$date": 1000}, {"$date": 400}])).unwrap(),
            Value::Int64(600)
        );
        assert_eq!(
            apply(Operator::Add, json!([1, "a"])).unwrap_err().code(),
            codes::ADD_NOT_NUMERIC
        );
        assert_eq!(
            apply(Operator::Divide, json!([1, 0])).unwrap_err().code(),
            codes::DIVIDE_BY_ZERO
        );
        assert_eq!(
            apply(Operator::Mod, json!([5, 0])).unwrap_err().code(),
            codes::MOD_BY_ZERO
        );
    }

    #[test]
    fn array_operators() {
        assert_eq!(apply(Operator::ArrayElemAt, json!([[1, 2, 3], -1])).unwrap(), Value::Int32(3));
        assert_eq!(apply(Operator::ArrayElemAt, json!([[1], 5])).unwrap(), Value::Missing);
        assert_eq!(
            apply(Operator::Slice, json!([[1, 2, 3, 4], 1, 2])).unwrap(),
            v(json!([2, 3]))
        );
        assert_eq!(apply(Operator::Slice, json!([[1, 2, 3], -2])).unwrap(), v(json!([2, 3])));
        assert_eq!(apply(Operator::Range, json!([0, 10, 3])).unwrap(), v(json!([0, 3, 6, 9])));
        assert_eq!(apply(Operator::Range, json!([0, 1, 0])).unwrap_err().code(), 34449);
        assert_eq!(apply(Operator::Size, json!(["x"])).unwrap_err().code(), 17124);
        assert_eq!(apply(Operator::First, json!([[]])).unwrap(), Value::Missing);
    }

    #[test]
    fn string_operators() {
        assert_eq!(
            apply(Operator::Split, json!(["a,b,,c", ","])).unwrap(),
            v(json!(["a", "b", "", "c"]))
        );
        assert_eq!(apply(Operator::Split, json!(["a", ""])).unwrap_err().code(), 40087);
        assert_eq!(apply(Operator::IndexOfCP, json!(["cafétéria", "té"])).unwrap(), Value::Int32(4));
        assert_eq!(apply(Operator::IndexOfCP, json!(["abc", "z"])).unwrap(), Value::Int32(-1));
        assert_eq!(apply(Operator::Strcasecmp, json!(["ABC", "abc"])).unwrap(), Value::Int32(0));
        assert_eq!(apply(Operator::Concat, json!(["a", null])).unwrap(), Value::Null);
    }

    #[test]
    fn conversions() {
        assert_eq!(apply(Operator::ToInt, json!(["42"])).unwrap(), Value::Int32(42));
        assert_eq!(apply(Operator::ToInt, json!([2.9])).unwrap(), Value::Int32(2));
        assert_eq!(apply(Operator::ToInt, json!(["x"])).unwrap_err().code(), 241);
        assert_eq!(apply(Operator::ToString, json!([true])).unwrap(), Value::from("true"));
        assert_eq!(apply(Operator::ToLong, json!([{"$date": 5}])).unwrap(), Value::Int64(5));
        assert_eq!(apply(Operator::ToBool, json!([0])).unwrap(), Value::Bool(false));
    }

    #[test]
    fn date_parts_with_timezone() {
        let date = json!({"$date": "2024-03-10T23:30:00Z"});
        assert_eq!(apply(Operator::Year, json!([date])).unwrap(), Value::Int32(2024));
        assert_eq!(apply(Operator::Hour, json!([date])).unwrap(), Value::Int32(23));
        assert_eq!(
            apply(Operator::DayOfMonth, json!([date, "+02:00"])).unwrap(),
            Value::Int32(11)
        );
        assert_eq!(
            apply(Operator::Month, json!(["nope"])).unwrap_err().code(),
            codes::DATE_NOT_DATE
        );
    }

    #[test]
    fn names_round_trip() {
        for (name, op) in OPERATORS {
            assert_eq!(Operator::from_name(name), Some(*op));
            assert_eq!(op.name(), *name);
        }
    }
}
