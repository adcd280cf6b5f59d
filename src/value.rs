use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rand::Rng;
use serde_json::{Map, Value as JsonValue, json};

use crate::collation::Collation;
use crate::document::Document;

// ---------------------------------------------------------------------------
// ObjectId
// ---------------------------------------------------------------------------

static OID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// 12-byte identifier: 4-byte big-endian seconds, 5 random bytes, 3-byte counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let mut bytes = [0u8; 12];
        let secs = Utc::now().timestamp() as u32;
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        rand::rng().fill(&mut bytes[4..9]);
        let count = OID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.len() != 24 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A semi-structured value.
///
/// `Missing` marks an absent field. It is produced by evaluation but never
/// stored inside a document or serialized.
#[derive(Debug, Clone)]
pub enum Value {
    Missing,
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Decimal(BigDecimal),
    String(String),
    Array(Vec<Value>),
    Document(Document),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    ObjectId(ObjectId),
    Regex { pattern: String, options: String },
    MinKey,
    MaxKey,
}

/// Numeric width, ordered by promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NumType {
    Int32,
    Int64,
    Double,
    Decimal,
}

impl Value {
    /// Position in the fixed cross-type sort order.
    pub fn canonical_type(&self) -> u8 {
        match self {
            Value::MinKey => 0,
            Value::Missing => 2,
            Value::Null => 5,
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) | Value::Decimal(_) => 10,
            Value::String(_) => 15,
            Value::Document(_) => 20,
            Value::Array(_) => 25,
            Value::ObjectId(_) => 35,
            Value::Bool(_) => 40,
            Value::Date(_) => 45,
            Value::Regex { .. } => 50,
            Value::MaxKey => 127,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing => "missing",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int32(_) => "int",
            Value::Int64(_) => "long",
            Value::Double(_) => "double",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Document(_) => "object",
            Value::Date(_) => "date",
            Value::ObjectId(_) => "objectId",
            Value::Regex { .. } => "regex",
            Value::MinKey => "minKey",
            Value::MaxKey => "maxKey",
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// Null or Missing.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Null | Value::Missing)
    }

    pub fn is_numeric(&self) -> bool {
        self.num_type().is_some()
    }

    pub fn num_type(&self) -> Option<NumType> {
        match self {
            Value::Int32(_) => Some(NumType::Int32),
            Value::Int64(_) => Some(NumType::Int64),
            Value::Double(_) => Some(NumType::Double),
            Value::Decimal(_) => Some(NumType::Decimal),
            _ => None,
        }
    }

    /// Truthiness used by `$cond`, `$and`, `$filter` and friends.
    pub fn coerce_to_bool(&self) -> bool {
        match self {
            Value::Missing | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int32(i) => *i != 0,
            Value::Int64(i) => *i != 0,
            Value::Double(f) => *f != 0.0,
            Value::Decimal(d) => *d != BigDecimal::from(0),
            _ => true,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(i) => Some(*i as f64),
            Value::Int64(i) => Some(*i as f64),
            Value::Double(f) => Some(*f),
            Value::Decimal(d) => decimal_to_f64(d),
            _ => None,
        }
    }

    /// The value as an i64 when it is numeric, integral and in range.
    pub fn integral_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(i) => Some(*i as i64),
            Value::Int64(i) => Some(*i),
            Value::Double(f) => {
                if f.fract() == 0.0 && *f >= -9_223_372_036_854_775_808.0 && *f < 9_223_372_036_854_775_808.0 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            Value::Decimal(d) => decimal_to_i64(d),
            _ => None,
        }
    }

    pub fn integral_i32(&self) -> Option<i32> {
        self.integral_i64().and_then(|n| i32::try_from(n).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    /// Group keys and sort keys treat an absent value as null.
    pub fn missing_to_null(self) -> Value {
        match self {
            Value::Missing => Value::Null,
            other => other,
        }
    }

    /// Approximate heap footprint used for memory budgeting.
    pub fn approx_size(&self) -> usize {
        const BASE: usize = std::mem::size_of::<Value>();
        match self {
            Value::String(s) => BASE + s.len(),
            Value::Regex { pattern, options } => BASE + pattern.len() + options.len(),
            Value::Decimal(_) => BASE + 32,
            Value::Array(items) => BASE + items.iter().map(Value::approx_size).sum::<usize>(),
            Value::Document(doc) => BASE + doc.approx_size(),
            _ => BASE,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int32(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int64(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Double(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Document(doc)
    }
}

// ---------------------------------------------------------------------------
// Decimal helpers
// ---------------------------------------------------------------------------

pub(crate) fn decimal_to_f64(d: &BigDecimal) -> Option<f64> {
    d.to_string().parse::<f64>().ok()
}

pub(crate) fn decimal_to_i64(d: &BigDecimal) -> Option<i64> {
    let truncated = d.with_scale(0);
    if &truncated != d {
        return None;
    }
    truncated.to_string().parse::<i64>().ok()
}

/// Exact decimal for a finite double; `None` for NaN and infinities.
pub(crate) fn f64_to_decimal(f: f64) -> Option<BigDecimal> {
    if !f.is_finite() {
        return None;
    }
    BigDecimal::from_str(&f.to_string()).ok()
}

pub(crate) fn to_decimal(v: &Value) -> Option<BigDecimal> {
    match v {
        Value::Int32(i) => Some(BigDecimal::from(*i)),
        Value::Int64(i) => Some(BigDecimal::from(*i)),
        Value::Double(f) => f64_to_decimal(*f),
        Value::Decimal(d) => Some(d.clone()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

fn compare_i64_f64(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return Ordering::Greater;
    }
    if f >= 9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    if f < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => {
            let frac = f - whole;
            if frac > 0.0 {
                Ordering::Less
            } else if frac < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

fn compare_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    use Value::*;
    match (a, b) {
        (Int32(x), Int32(y)) => x.cmp(y),
        (Int32(x), Int64(y)) => (*x as i64).cmp(y),
        (Int64(x), Int32(y)) => x.cmp(&(*y as i64)),
        (Int64(x), Int64(y)) => x.cmp(y),
        (Int32(x), Double(y)) => compare_i64_f64(*x as i64, *y),
        (Int64(x), Double(y)) => compare_i64_f64(*x, *y),
        (Double(x), Int32(y)) => compare_i64_f64(*y as i64, *x).reverse(),
        (Double(x), Int64(y)) => compare_i64_f64(*y, *x).reverse(),
        (Double(x), Double(y)) => compare_f64(*x, *y),
        (Double(x), Decimal(_)) if !x.is_finite() => compare_f64(*x, 0.0),
        (Decimal(_), Double(y)) if !y.is_finite() => compare_f64(0.0, *y),
        _ => match (to_decimal(a), to_decimal(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => Ordering::Equal,
        },
    }
}

fn sorted_fields(doc: &Document) -> Vec<(&String, &Value)> {
    let mut fields: Vec<_> = doc.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));
    fields
}

/// Total order over values. String comparisons honour `collation` when given,
/// everything else is collation-independent.
pub fn compare_values(a: &Value, b: &Value, collation: Option<&Collation>) -> Ordering {
    let (ta, tb) = (a.canonical_type(), b.canonical_type());
    if ta != tb {
        return ta.cmp(&tb);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => match collation {
            Some(c) => c.compare_str(x, y),
            None => x.cmp(y),
        },
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        (Value::ObjectId(x), Value::ObjectId(y)) => x.cmp(y),
        (
            Value::Regex {
                pattern: pa,
                options: oa,
            },
            Value::Regex {
                pattern: pb,
                options: ob,
            },
        ) => pa.cmp(pb).then_with(|| oa.cmp(ob)),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r, collation);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Document(x), Value::Document(y)) => {
            let (fx, fy) = (sorted_fields(x), sorted_fields(y));
            for ((ka, va), (kb, vb)) in fx.iter().zip(fy.iter()) {
                let ord = ka
                    .cmp(kb)
                    .then_with(|| compare_values(va, vb, collation));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            fx.len().cmp(&fy.len())
        }
        _ if ta == 10 => compare_numbers(a, b),
        // Same canonical type with no payload: Missing, Null, MinKey, MaxKey.
        _ => Ordering::Equal,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        compare_values(self, other, None) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(self, other, None)
    }
}

fn hash_number<H: Hasher>(v: &Value, state: &mut H) {
    if let Some(i) = v.integral_i64() {
        0u8.hash(state);
        i.hash(state);
        return;
    }
    let f = v.as_f64().unwrap_or(f64::NAN);
    1u8.hash(state);
    if f.is_nan() {
        u64::MAX.hash(state);
    } else {
        f.to_bits().hash(state);
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_type().hash(state);
        match self {
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) | Value::Decimal(_) => {
                hash_number(self, state)
            }
            Value::String(s) => s.hash(state),
            Value::Bool(b) => b.hash(state),
            Value::Date(ms) => ms.hash(state),
            Value::ObjectId(oid) => oid.hash(state),
            Value::Regex { pattern, options } => {
                pattern.hash(state);
                options.hash(state);
            }
            Value::Array(items) => {
                items.len().hash(state);
                for item in items {
                    item.hash(state);
                }
            }
            Value::Document(doc) => {
                let fields = sorted_fields(doc);
                fields.len().hash(state);
                for (name, value) in fields {
                    name.hash(state);
                    value.hash(state);
                }
            }
            Value::Missing | Value::Null | Value::MinKey | Value::MaxKey => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

// ---------------------------------------------------------------------------
// Extended JSON
// ---------------------------------------------------------------------------

fn parse_date_json(v: &JsonValue) -> Option<i64> {
    match v {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            let d = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
            Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
        }
        JsonValue::Object(m) => m
            .get("$numberLong")
            .and_then(|s| s.as_str())
            .and_then(|s| s.parse().ok()),
        _ => None,
    }
}

fn parse_extended(map: &Map<String, JsonValue>) -> Option<Value> {
    match map.len() {
        1 => {
            let (key, arg) = map.iter().next()?;
            match key.as_str() {
                "$date" => parse_date_json(arg).map(Value::Date),
                "$oid" => arg.as_str().and_then(ObjectId::parse_hex).map(Value::ObjectId),
                "$numberLong" => arg.as_str()?.parse().ok().map(Value::Int64),
                "$numberInt" => arg.as_str()?.parse().ok().map(Value::Int32),
                "$numberDecimal" => BigDecimal::from_str(arg.as_str()?).ok().map(Value::Decimal),
                "$numberDouble" => match arg.as_str()? {
                    "NaN" => Some(Value::Double(f64::NAN)),
                    "Infinity" => Some(Value::Double(f64::INFINITY)),
                    "-Infinity" => Some(Value::Double(f64::NEG_INFINITY)),
                    s => s.parse().ok().map(Value::Double),
                },
                "$minKey" => Some(Value::MinKey),
                "$maxKey" => Some(Value::MaxKey),
                "$regularExpression" => {
                    let pattern = arg.get("pattern")?.as_str()?.to_string();
                    let options = arg
                        .get("options")
                        .and_then(|o| o.as_str())
                        .unwrap_or("")
                        .to_string();
                    Some(Value::Regex { pattern, options })
                }
                _ => None,
            }
        }
        _ => None,
    }
}

impl Value {
    /// Convert a JSON value, recognising extended-JSON type wrappers.
    pub fn from_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    match i32::try_from(i) {
                        Ok(small) => Value::Int32(small),
                        Err(_) => Value::Int64(i),
                    }
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => match parse_extended(map) {
                Some(v) => v,
                None => Value::Document(Document::from_json_map(map)),
            },
        }
    }

    /// Relaxed extended JSON.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Missing | Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int32(i) => json!(i),
            Value::Int64(i) => json!(i),
            Value::Double(f) => {
                if f.is_finite() {
                    serde_json::Number::from_f64(*f)
                        .map(JsonValue::Number)
                        .unwrap_or(JsonValue::Null)
                } else if f.is_nan() {
                    json!({"$numberDouble": "NaN"})
                } else if *f > 0.0 {
                    json!({"$numberDouble": "Infinity"})
                } else {
                    json!({"$numberDouble": "-Infinity"})
                }
            }
            Value::Decimal(d) => json!({"$numberDecimal": d.normalized().to_string()}),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Document(doc) => doc.to_json(),
            Value::Date(ms) => match DateTime::from_timestamp_millis(*ms) {
                Some(dt) => json!({"$date": dt.to_rfc3339_opts(SecondsFormat::Millis, true)}),
                None => json!({"$date": {"$numberLong": ms.to_string()}}),
            },
            Value::ObjectId(oid) => json!({"$oid": oid.to_hex()}),
            Value::Regex { pattern, options } => {
                json!({"$regularExpression": {"pattern": pattern, "options": options}})
            }
            Value::MinKey => json!({"$minKey": 1}),
            Value::MaxKey => json!({"$maxKey": 1}),
        }
    }
}

// ---------------------------------------------------------------------------
// Binary serialization (spill format)
// ---------------------------------------------------------------------------

pub(crate) fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)
}

pub(crate) fn read_str<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub(crate) fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

impl Value {
    const TAG_MINKEY: u8 = 0;
    const TAG_MISSING: u8 = 1;
    const TAG_NULL: u8 = 2;
    const TAG_BOOL: u8 = 3;
    const TAG_INT32: u8 = 4;
    const TAG_INT64: u8 = 5;
    const TAG_DOUBLE: u8 = 6;
    const TAG_DECIMAL: u8 = 7;
    const TAG_STRING: u8 = 8;
    const TAG_ARRAY: u8 = 9;
    const TAG_DOCUMENT: u8 = 10;
    const TAG_DATE: u8 = 11;
    const TAG_OID: u8 = 12;
    const TAG_REGEX: u8 = 13;
    const TAG_MAXKEY: u8 = 14;

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Value::MinKey => w.write_all(&[Self::TAG_MINKEY]),
            Value::Missing => w.write_all(&[Self::TAG_MISSING]),
            Value::Null => w.write_all(&[Self::TAG_NULL]),
            Value::MaxKey => w.write_all(&[Self::TAG_MAXKEY]),
            Value::Bool(b) => w.write_all(&[Self::TAG_BOOL, *b as u8]),
            Value::Int32(i) => {
                w.write_all(&[Self::TAG_INT32])?;
                w.write_all(&i.to_le_bytes())
            }
            Value::Int64(i) => {
                w.write_all(&[Self::TAG_INT64])?;
                w.write_all(&i.to_le_bytes())
            }
            Value::Double(f) => {
                w.write_all(&[Self::TAG_DOUBLE])?;
                w.write_all(&f.to_le_bytes())
            }
            Value::Decimal(d) => {
                w.write_all(&[Self::TAG_DECIMAL])?;
                write_str(w, &d.to_string())
            }
            Value::String(s) => {
                w.write_all(&[Self::TAG_STRING])?;
                write_str(w, s)
            }
            Value::Array(items) => {
                w.write_all(&[Self::TAG_ARRAY])?;
                w.write_all(&(items.len() as u32).to_le_bytes())?;
                for item in items {
                    item.write_to(w)?;
                }
                Ok(())
            }
            Value::Document(doc) => {
                w.write_all(&[Self::TAG_DOCUMENT])?;
                doc.write_to(w)
            }
            Value::Date(ms) => {
                w.write_all(&[Self::TAG_DATE])?;
                w.write_all(&ms.to_le_bytes())
            }
            Value::ObjectId(oid) => {
                w.write_all(&[Self::TAG_OID])?;
                w.write_all(oid.bytes())
            }
            Value::Regex { pattern, options } => {
                w.write_all(&[Self::TAG_REGEX])?;
                write_str(w, pattern)?;
                write_str(w, options)
            }
        }
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let tag = read_u8(r)?;
        match tag {
            Self::TAG_MINKEY => Ok(Value::MinKey),
            Self::TAG_MISSING => Ok(Value::Missing),
            Self::TAG_NULL => Ok(Value::Null),
            Self::TAG_MAXKEY => Ok(Value::MaxKey),
            Self::TAG_BOOL => Ok(Value::Bool(read_u8(r)? != 0)),
            Self::TAG_INT32 => {
                let mut buf = [0u8; 4];
                r.read_exact(&mut buf)?;
                Ok(Value::Int32(i32::from_le_bytes(buf)))
            }
            Self::TAG_INT64 => Ok(Value::Int64(read_i64(r)?)),
            Self::TAG_DOUBLE => {
                let mut buf = [0u8; 8];
                r.read_exact(&mut buf)?;
                Ok(Value::Double(f64::from_le_bytes(buf)))
            }
            Self::TAG_DECIMAL => {
                let s = read_str(r)?;
                BigDecimal::from_str(&s)
                    .map(Value::Decimal)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            }
            Self::TAG_STRING => Ok(Value::String(read_str(r)?)),
            Self::TAG_ARRAY => {
                let len = read_u32(r)? as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(Value::read_from(r)?);
                }
                Ok(Value::Array(items))
            }
            Self::TAG_DOCUMENT => Ok(Value::Document(Document::read_from(r)?)),
            Self::TAG_DATE => Ok(Value::Date(read_i64(r)?)),
            Self::TAG_OID => {
                let mut buf = [0u8; 12];
                r.read_exact(&mut buf)?;
                Ok(Value::ObjectId(ObjectId::from_bytes(buf)))
            }
            Self::TAG_REGEX => {
                let pattern = read_str(r)?;
                let options = read_str(r)?;
                Ok(Value::Regex { pattern, options })
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown value tag: {tag}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn type_ordering() {
        let ordered = vec![
            Value::MinKey,
            Value::Missing,
            Value::Null,
            Value::Int32(5),
            Value::from("a"),
            Value::Document(Document::new()),
            Value::Array(vec![]),
            Value::ObjectId(ObjectId::from_bytes([0; 12])),
            Value::Bool(false),
            Value::Date(0),
            Value::Regex {
                pattern: "a".into(),
                options: String::new(),
            },
            Value::MaxKey,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{:?} < {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn numbers_compare_across_widths() {
        assert_eq!(Value::Int32(42), Value::Double(42.0));
        assert_eq!(Value::Int64(42), Value::Decimal(BigDecimal::from(42)));
        assert!(Value::Int64(i64::MAX) < Value::Double(9.3e18));
        assert!(Value::Int32(5) < Value::Double(5.5));
        assert!(Value::Double(-2.5) < Value::Int32(-2));
        assert!(Value::Double(f64::NAN) < Value::Int32(i32::MIN));
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
    }

    #[test]
    fn equal_numbers_hash_equal() {
        let mut set = HashSet::new();
        set.insert(Value::Int32(1));
        assert!(set.contains(&Value::Int64(1)));
        assert!(set.contains(&Value::Double(1.0)));
        assert!(set.contains(&Value::Decimal(BigDecimal::from(1))));
        assert!(!set.contains(&Value::from("1")));
    }

    #[test]
    fn document_equality_ignores_field_order() {
        let a = Value::from_json(&json!({"x": 1, "y": 2}));
        let b = Value::from_json(&json!({"y": 2, "x": 1}));
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn missing_and_null_are_distinct() {
        assert_ne!(Value::Missing, Value::Null);
        assert!(Value::Missing < Value::Null);
        assert_eq!(Value::Missing.missing_to_null(), Value::Null);
    }

    #[test]
    fn extended_json_wrappers() {
        let v = Value::from_json(&json!({"$numberLong": "9000000000"}));
        assert!(matches!(v, Value::Int64(9_000_000_000)));
        let v = Value::from_json(&json!({"$date": "2024-01-15T10:30:00Z"}));
        assert!(matches!(v, Value::Date(_)));
        let v = Value::from_json(&json!({"$oid": "507f1f77bcf86cd799439011"}));
        assert_eq!(v.type_name(), "objectId");
        let v = Value::from_json(&json!({"$numberDecimal": "1.10"}));
        assert_eq!(v.type_name(), "decimal");
        assert!(matches!(Value::from_json(&json!(7)), Value::Int32(7)));
        assert!(matches!(Value::from_json(&json!(3_000_000_000i64)), Value::Int64(_)));
    }

    #[test]
    fn operator_documents_stay_documents() {
        let v = Value::from_json(&json!({"$add": [1, 2]}));
        assert_eq!(v.type_name(), "object");
        let v = Value::from_json(&json!({"$regex": "^a"}));
        assert_eq!(v.type_name(), "object");
    }

    #[test]
    fn date_serializes_as_extended_json() {
        let v = Value::from_json(&json!({"$date": "2024-01-15T10:30:00Z"}));
        assert_eq!(v.to_json(), json!({"$date": "2024-01-15T10:30:00.000Z"}));
    }

    #[test]
    fn binary_roundtrip_nested() {
        let v = Value::from_json(&json!({
            "a": [1, {"$numberLong": "5"}, 2.5, "s", null, true],
            "b": {"c": {"$date": 1000}, "d": {"$numberDecimal": "0.1"}},
            "e": {"$minKey": 1}
        }));
        let mut buf = Vec::new();
        v.write_to(&mut buf).unwrap();
        let decoded = Value::read_from(&mut &buf[..]).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Missing.coerce_to_bool());
        assert!(!Value::Int64(0).coerce_to_bool());
        assert!(Value::from("").coerce_to_bool());
        assert!(Value::Array(vec![]).coerce_to_bool());
    }

    #[test]
    fn object_id_hex_roundtrip() {
        let oid = ObjectId::new();
        assert_eq!(ObjectId::parse_hex(&oid.to_hex()), Some(oid));
        assert_ne!(ObjectId::new(), ObjectId::new());
    }
}
