use std::cmp::Ordering;
use std::collections::VecDeque;
use std::io::{self, Read, Write};

use bigdecimal::BigDecimal;
use indexmap::IndexSet;

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::expression::{Expression, Variables, VariablesParseState};
use crate::numeric;
use crate::scripting::ScriptingHost;
use crate::value::{Value, compare_values, read_i64, read_str, read_u8, write_str};

// ---------------------------------------------------------------------------
// Accumulators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    FirstN,
    LastN,
    MinN,
    MaxN,
    Push,
    AddToSet,
    ConcatArrays,
    MergeObjects,
    Count,
    StdDevPop,
    StdDevSamp,
    JsReduce,
}

impl AccumulatorOp {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => Self::Sum,
            "$avg" => Self::Avg,
            "$min" => Self::Min,
            "$max" => Self::Max,
            "$first" => Self::First,
            "$last" => Self::Last,
            "$firstN" => Self::FirstN,
            "$lastN" => Self::LastN,
            "$minN" => Self::MinN,
            "$maxN" => Self::MaxN,
            "$push" => Self::Push,
            "$addToSet" => Self::AddToSet,
            "$concatArrays" => Self::ConcatArrays,
            "$mergeObjects" => Self::MergeObjects,
            "$count" => Self::Count,
            "$stdDevPop" => Self::StdDevPop,
            "$stdDevSamp" => Self::StdDevSamp,
            "$_internalJsReduce" => Self::JsReduce,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "$sum",
            Self::Avg => "$avg",
            Self::Min => "$min",
            Self::Max => "$max",
            Self::First => "$first",
            Self::Last => "$last",
            Self::FirstN => "$firstN",
            Self::LastN => "$lastN",
            Self::MinN => "$minN",
            Self::MaxN => "$maxN",
            Self::Push => "$push",
            Self::AddToSet => "$addToSet",
            Self::ConcatArrays => "$concatArrays",
            Self::MergeObjects => "$mergeObjects",
            Self::Count => "$count",
            Self::StdDevPop => "$stdDevPop",
            Self::StdDevSamp => "$stdDevSamp",
            Self::JsReduce => "$_internalJsReduce",
        }
    }

    /// Whether partial states may be written to a spill run and merged back.
    /// Accumulators that must keep their whole value materialized are not.
    pub fn is_spillable(self) -> bool {
        !matches!(self, Self::Push | Self::ConcatArrays | Self::JsReduce)
    }

    fn takes_n(self) -> bool {
        matches!(self, Self::FirstN | Self::LastN | Self::MinN | Self::MaxN)
    }
}

/// `field: {$op: argument}` inside a `$group`.
#[derive(Debug, Clone)]
pub struct AccumulationStatement {
    pub field: String,
    pub op: AccumulatorOp,
    pub argument: Expression,
    /// Bound size for the N-family, evaluated once per group.
    pub n: Option<Expression>,
    /// Reduce function source for `$_internalJsReduce`.
    pub script: Option<String>,
}

fn bad(msg: impl Into<String>) -> Error {
    Error::InvalidPipeline(msg.into())
}

impl AccumulationStatement {
    pub fn parse(field: &str, spec: &Value, vps: &mut VariablesParseState) -> Result<Self> {
        let Value::Document(doc) = spec else {
            return Err(bad(format!(
                "The field '{field}' must be an accumulator object"
            )));
        };
        if doc.len() != 1 {
            return Err(bad(format!(
                "The field '{field}' must specify one accumulator"
            )));
        }
        let (name, arg) = doc
            .iter()
            .next()
            .ok_or_else(|| bad(format!("The field '{field}' must specify one accumulator")))?;
        let op = AccumulatorOp::from_name(name).ok_or_else(|| {
            Error::location(
                codes::UNKNOWN_ACCUMULATOR,
                format!("unknown group operator '{name}'"),
            )
        })?;
        if matches!(arg, Value::Array(_)) && !op.takes_n() && op != AccumulatorOp::JsReduce {
            return Err(bad(format!(
                "The {name} accumulator is a unary operator"
            )));
        }
        let mut stmt = Self {
            field: field.to_string(),
            op,
            argument: Expression::Constant(Value::Null),
            n: None,
            script: None,
        };
        match op {
            AccumulatorOp::Count => {
                if !matches!(arg, Value::Document(d) if d.is_empty()) {
                    return Err(bad("$count takes no arguments, i.e. $count:{}"));
                }
                stmt.argument = Expression::Constant(Value::Int32(1));
            }
            AccumulatorOp::FirstN | AccumulatorOp::LastN | AccumulatorOp::MinN | AccumulatorOp::MaxN => {
                let Value::Document(params) = arg else {
                    return Err(bad(format!("specification of {name} must be an object")));
                };
                if let Some(k) = params.keys().find(|k| *k != "input" && *k != "n") {
                    return Err(bad(format!("{name} found an unknown argument: {k}")));
                }
                let input = params
                    .get("input")
                    .ok_or_else(|| bad(format!("{name} requires an 'input' field")))?;
                let n = params
                    .get("n")
                    .ok_or_else(|| bad(format!("{name} requires an 'n' field")))?;
                stmt.argument = Expression::parse(input, vps)?.optimize();
                stmt.n = Some(Expression::parse(n, vps)?.optimize());
            }
            AccumulatorOp::JsReduce => {
                let Value::Document(params) = arg else {
                    return Err(bad("$_internalJsReduce requires a document argument"));
                };
                let data = params
                    .get("data")
                    .ok_or_else(|| bad("$_internalJsReduce requires 'data' argument"))?;
                let Some(Value::String(source)) = params.get("eval") else {
                    return Err(bad("$_internalJsReduce requires 'eval' argument of type string"));
                };
                stmt.argument = Expression::parse(data, vps)?.optimize();
                stmt.script = Some(source.clone());
            }
            _ => stmt.argument = Expression::parse(arg, vps)?.optimize(),
        }
        Ok(stmt)
    }

    /// Fresh state for a new group; `n` is evaluated against the group's
    /// first document.
    pub fn init(&self, first_doc: &Document, vars: &mut Variables) -> Result<AccumulatorState> {
        let n = match &self.n {
            None => 0,
            Some(expr) => {
                let v = expr.evaluate(first_doc, vars)?;
                match v.integral_i64() {
                    Some(n) if n > 0 => n as usize,
                    _ => {
                        return Err(Error::location(
                            codes::ACCUMULATOR_N_INVALID,
                            format!("'n' must be a positive integer for {}, found {v}", self.op.name()),
                        ));
                    }
                }
            }
        };
        let mut state = AccumulatorState::new(self.op, n);
        if let (AccumulatorState::JsReduce { source, .. }, Some(script)) = (&mut state, &self.script) {
            source.clone_from(script);
        }
        Ok(state)
    }
}

/// Everything an accumulator needs beyond its own state.
pub struct AccumulatorEnv<'a> {
    pub collation: Option<&'a Collation>,
    /// Cap for accumulators whose state grows with their input.
    pub max_bytes: usize,
    pub scripting: &'a dyn ScriptingHost,
    /// Read-only constants injected into scripted reducers.
    pub scope: &'a Document,
}

#[derive(Debug, Clone)]
pub enum AccumulatorState {
    Sum(Value),
    Avg { sum: Value, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    FirstN { n: usize, items: Vec<Value> },
    LastN { n: usize, items: VecDeque<Value> },
    MinN { n: usize, items: Vec<Value> },
    MaxN { n: usize, items: Vec<Value> },
    Push { items: Vec<Value>, bytes: usize },
    AddToSet { items: IndexSet<Value>, bytes: usize },
    ConcatArrays { items: Vec<Value>, bytes: usize },
    MergeObjects(Document),
    Count(Value),
    StdDev { sample: bool, count: u64, mean: f64, m2: f64 },
    JsReduce {
        source: String,
        values: Vec<Value>,
        bytes: usize,
    },
}

fn keep_extreme(
    current: &mut Option<Value>,
    value: Value,
    want: Ordering,
    collation: Option<&Collation>,
) {
    if value.is_nullish() {
        return;
    }
    let replace = current
        .as_ref()
        .is_none_or(|c| compare_values(&value, c, collation) == want);
    if replace {
        *current = Some(value);
    }
}

fn over_cap(op: &str, bytes: usize, env: &AccumulatorEnv<'_>) -> Result<()> {
    if bytes > env.max_bytes {
        return Err(Error::ExceededMemoryLimit(format!(
            "{op} used too much memory and cannot spill to disk. Memory limit: {} bytes",
            env.max_bytes
        )));
    }
    Ok(())
}

/// Trim a bounded min/max buffer to `n`, evicting the worst element; among
/// equal candidates the latest arrival goes so ties keep input order.
fn evict_worst(items: &mut Vec<Value>, n: usize, keep_small: bool, collation: Option<&Collation>) {
    while items.len() > n {
        let mut worst = 0;
        for i in 1..items.len() {
            let ord = compare_values(&items[i], &items[worst], collation);
            let worse = if keep_small {
                ord != Ordering::Less
            } else {
                ord != Ordering::Greater
            };
            if worse {
                worst = i;
            }
        }
        items.remove(worst);
    }
}

impl AccumulatorState {
    pub fn new(op: AccumulatorOp, n: usize) -> Self {
        match op {
            AccumulatorOp::Sum => Self::Sum(Value::Int32(0)),
            AccumulatorOp::Avg => Self::Avg {
                sum: Value::Int32(0),
                count: 0,
            },
            AccumulatorOp::Min => Self::Min(None),
            AccumulatorOp::Max => Self::Max(None),
            AccumulatorOp::First => Self::First(None),
            AccumulatorOp::Last => Self::Last(None),
            AccumulatorOp::FirstN => Self::FirstN { n, items: Vec::new() },
            AccumulatorOp::LastN => Self::LastN {
                n,
                items: VecDeque::new(),
            },
            AccumulatorOp::MinN => Self::MinN { n, items: Vec::new() },
            AccumulatorOp::MaxN => Self::MaxN { n, items: Vec::new() },
            AccumulatorOp::Push => Self::Push {
                items: Vec::new(),
                bytes: 0,
            },
            AccumulatorOp::AddToSet => Self::AddToSet {
                items: IndexSet::new(),
                bytes: 0,
            },
            AccumulatorOp::ConcatArrays => Self::ConcatArrays {
                items: Vec::new(),
                bytes: 0,
            },
            AccumulatorOp::MergeObjects => Self::MergeObjects(Document::new()),
            AccumulatorOp::Count => Self::Count(Value::Int32(0)),
            AccumulatorOp::StdDevPop | AccumulatorOp::StdDevSamp => Self::StdDev {
                sample: op == AccumulatorOp::StdDevSamp,
                count: 0,
                mean: 0.0,
                m2: 0.0,
            },
            AccumulatorOp::JsReduce => Self::JsReduce {
                source: String::new(),
                values: Vec::new(),
                bytes: 0,
            },
        }
    }

    pub fn accumulate(&mut self, value: Value, env: &AccumulatorEnv<'_>) -> Result<()> {
        match self {
            Self::Sum(total) => {
                if let Some(next) = numeric::add(total, &value) {
                    *total = next;
                }
            }
            Self::Avg { sum, count } => {
                if let Some(next) = numeric::add(sum, &value) {
                    *sum = next;
                    *count += 1;
                }
            }
            Self::Min(current) => keep_extreme(current, value, Ordering::Less, env.collation),
            Self::Max(current) => keep_extreme(current, value, Ordering::Greater, env.collation),
            Self::First(slot) => {
                if slot.is_none() {
                    *slot = Some(value.missing_to_null());
                }
            }
            Self::Last(slot) => *slot = Some(value.missing_to_null()),
            Self::FirstN { n, items } => {
                if items.len() < *n {
                    items.push(value.missing_to_null());
                }
            }
            Self::LastN { n, items } => {
                items.push_back(value.missing_to_null());
                while items.len() > *n {
                    items.pop_front();
                }
            }
            Self::MinN { n, items } => {
                if !value.is_nullish() {
                    items.push(value);
                    evict_worst(items, *n, true, env.collation);
                }
            }
            Self::MaxN { n, items } => {
                if !value.is_nullish() {
                    items.push(value);
                    evict_worst(items, *n, false, env.collation);
                }
            }
            Self::Push { items, bytes } => {
                if value.is_missing() {
                    return Ok(());
                }
                *bytes += value.approx_size();
                over_cap("$push", *bytes, env)?;
                items.push(value);
            }
            Self::AddToSet { items, bytes } => {
                if value.is_missing() {
                    return Ok(());
                }
                let size = value.approx_size();
                if items.insert(value) {
                    *bytes += size;
                    over_cap("$addToSet", *bytes, env)?;
                }
            }
            Self::ConcatArrays { items, bytes } => match value {
                v if v.is_nullish() => {}
                Value::Array(values) => {
                    *bytes += values.iter().map(Value::approx_size).sum::<usize>();
                    over_cap("$concatArrays", *bytes, env)?;
                    items.extend(values);
                }
                other => {
                    return Err(Error::location(
                        codes::CONCAT_ARRAYS_ACC_NOT_ARRAY,
                        format!("$concatArrays requires array inputs, found {}", other.type_name()),
                    ));
                }
            },
            Self::MergeObjects(out) => match value {
                v if v.is_nullish() => {}
                Value::Document(doc) => {
                    for (k, v) in doc {
                        out.insert(k, v);
                    }
                    over_cap("$mergeObjects", out.approx_size(), env)?;
                }
                other => {
                    return Err(Error::location(
                        codes::MERGE_OBJECTS_ACC_NOT_OBJECT,
                        format!(
                            "$mergeObjects requires object inputs, but input {other} is of type {}",
                            other.type_name()
                        ),
                    ));
                }
            },
            Self::Count(total) => *total = numeric::checked_inc(total, &Value::Int32(1))?,
            Self::StdDev {
                count, mean, m2, ..
            } => {
                if let Some(x) = value.num_type().and(value.as_f64()) {
                    *count += 1;
                    let delta = x - *mean;
                    *mean += delta / *count as f64;
                    *m2 += delta * (x - *mean);
                }
            }
            Self::JsReduce { values, bytes, .. } => {
                if value.is_missing() {
                    return Ok(());
                }
                *bytes += value.approx_size();
                over_cap("$_internalJsReduce", *bytes, env)?;
                values.push(value);
            }
        }
        Ok(())
    }

    /// Combine `later` (built from input that arrived after this state's
    /// input) into `self`.
    pub fn merge(&mut self, later: AccumulatorState, env: &AccumulatorEnv<'_>) -> Result<()> {
        match (self, later) {
            (Self::Sum(total), Self::Sum(other)) => {
                if let Some(next) = numeric::add(total, &other) {
                    *total = next;
                }
            }
            (Self::Avg { sum, count }, Self::Avg { sum: s2, count: c2 }) => {
                if let Some(next) = numeric::add(sum, &s2) {
                    *sum = next;
                }
                *count += c2;
            }
            (Self::Min(current), Self::Min(Some(v))) => {
                keep_extreme(current, v, Ordering::Less, env.collation)
            }
            (Self::Max(current), Self::Max(Some(v))) => {
                keep_extreme(current, v, Ordering::Greater, env.collation)
            }
            (Self::Min(_), Self::Min(None)) | (Self::Max(_), Self::Max(None)) => {}
            (Self::First(slot), Self::First(other)) => {
                if slot.is_none() {
                    *slot = other;
                }
            }
            (Self::Last(slot), Self::Last(other)) => {
                if other.is_some() {
                    *slot = other;
                }
            }
            (Self::FirstN { n, items }, Self::FirstN { items: other, .. }) => {
                let room = n.saturating_sub(items.len());
                items.extend(other.into_iter().take(room));
            }
            (Self::LastN { n, items }, Self::LastN { items: other, .. }) => {
                items.extend(other);
                while items.len() > *n {
                    items.pop_front();
                }
            }
            (Self::MinN { n, items }, Self::MinN { items: other, .. }) => {
                items.extend(other);
                evict_worst(items, *n, true, env.collation);
            }
            (Self::MaxN { n, items }, Self::MaxN { items: other, .. }) => {
                items.extend(other);
                evict_worst(items, *n, false, env.collation);
            }
            (Self::Push { items, bytes }, Self::Push { items: other, bytes: b2 })
            | (
                Self::ConcatArrays { items, bytes },
                Self::ConcatArrays {
                    items: other,
                    bytes: b2,
                },
            )
            | (
                Self::JsReduce {
                    values: items,
                    bytes,
                    ..
                },
                Self::JsReduce {
                    values: other,
                    bytes: b2,
                    ..
                },
            ) => {
                *bytes += b2;
                over_cap("accumulator", *bytes, env)?;
                items.extend(other);
            }
            (Self::AddToSet { items, bytes }, Self::AddToSet { items: other, .. }) => {
                for v in other {
                    let size = v.approx_size();
                    if items.insert(v) {
                        *bytes += size;
                    }
                }
                over_cap("$addToSet", *bytes, env)?;
            }
            (Self::MergeObjects(out), Self::MergeObjects(other)) => {
                for (k, v) in other {
                    out.insert(k, v);
                }
            }
            (Self::Count(total), Self::Count(other)) => {
                *total = numeric::checked_inc(total, &other)?;
            }
            (
                Self::StdDev {
                    count, mean, m2, ..
                },
                Self::StdDev {
                    count: c2,
                    mean: mean2,
                    m2: m2b,
                    ..
                },
            ) => {
                if c2 > 0 {
                    let total = *count + c2;
                    let delta = mean2 - *mean;
                    *m2 += m2b + delta * delta * (*count as f64) * (c2 as f64) / total as f64;
                    *mean += delta * c2 as f64 / total as f64;
                    *count = total;
                }
            }
            (this, other) => {
                return Err(Error::SpillCorrupted(format!(
                    "cannot merge accumulator states {} and {}",
                    this.kind(),
                    other.kind()
                )));
            }
        }
        Ok(())
    }

    /// Final value for the group. Does not consume the state, so calling it
    /// twice yields the same value.
    pub fn finalize(&self, key: &Value, env: &AccumulatorEnv<'_>) -> Result<Value> {
        Ok(match self {
            Self::Sum(total) => total.clone(),
            Self::Avg { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else if let Value::Decimal(d) = sum {
                    Value::Decimal(d / BigDecimal::from(*count))
                } else {
                    Value::Double(sum.as_f64().unwrap_or(f64::NAN) / *count as f64)
                }
            }
            Self::Min(v) | Self::Max(v) | Self::First(v) | Self::Last(v) => {
                v.clone().unwrap_or(Value::Null)
            }
            Self::FirstN { items, .. } => Value::Array(items.clone()),
            Self::LastN { items, .. } => Value::Array(items.iter().cloned().collect()),
            Self::MinN { items, .. } | Self::MaxN { items, .. } => {
                let mut sorted = items.clone();
                let descending = matches!(self, Self::MaxN { .. });
                sorted.sort_by(|a, b| {
                    let ord = compare_values(a, b, env.collation);
                    if descending { ord.reverse() } else { ord }
                });
                Value::Array(sorted)
            }
            Self::Push { items, .. } | Self::ConcatArrays { items, .. } => {
                Value::Array(items.clone())
            }
            Self::AddToSet { items, .. } => Value::Array(items.iter().cloned().collect()),
            Self::MergeObjects(doc) => Value::Document(doc.clone()),
            Self::Count(total) => total.clone(),
            Self::StdDev {
                sample, count, m2, ..
            } => {
                let denom = if *sample { count.saturating_sub(1) } else { *count };
                if denom == 0 {
                    Value::Null
                } else {
                    Value::Double((m2 / denom as f64).sqrt())
                }
            }
            Self::JsReduce { source, values, .. } => match values.as_slice() {
                [] => Value::Null,
                [only] => only.clone(),
                _ => env
                    .scripting
                    .invoke(source, &[key.clone(), Value::Array(values.clone())], env.scope)
                    .map_err(|e| e.context(format!("$_internalJsReduce for key {key}")))?,
            },
        })
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Sum(_) => "sum",
            Self::Avg { .. } => "avg",
            Self::Min(_) => "min",
            Self::Max(_) => "max",
            Self::First(_) => "first",
            Self::Last(_) => "last",
            Self::FirstN { .. } => "firstN",
            Self::LastN { .. } => "lastN",
            Self::MinN { .. } => "minN",
            Self::MaxN { .. } => "maxN",
            Self::Push { .. } => "push",
            Self::AddToSet { .. } => "addToSet",
            Self::ConcatArrays { .. } => "concatArrays",
            Self::MergeObjects(_) => "mergeObjects",
            Self::Count(_) => "count",
            Self::StdDev { .. } => "stdDev",
            Self::JsReduce { .. } => "jsReduce",
        }
    }

    /// Approximate heap footprint for the group table budget.
    pub fn mem_size(&self) -> usize {
        const BASE: usize = std::mem::size_of::<AccumulatorState>();
        let values = |items: &mut dyn Iterator<Item = &Value>| -> usize {
            items.map(Value::approx_size).sum()
        };
        BASE + match self {
            Self::Sum(v) | Self::Count(v) | Self::Avg { sum: v, .. } => v.approx_size(),
            Self::Min(v) | Self::Max(v) | Self::First(v) | Self::Last(v) => {
                v.as_ref().map_or(0, Value::approx_size)
            }
            Self::FirstN { items, .. } | Self::MinN { items, .. } | Self::MaxN { items, .. } => {
                values(&mut items.iter())
            }
            Self::LastN { items, .. } => values(&mut items.iter()),
            Self::Push { bytes, .. }
            | Self::AddToSet { bytes, .. }
            | Self::ConcatArrays { bytes, .. }
            | Self::JsReduce { bytes, .. } => *bytes,
            Self::MergeObjects(doc) => doc.approx_size(),
            Self::StdDev { .. } => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Spill codec
// ---------------------------------------------------------------------------

fn write_u64<W: Write>(w: &mut W, n: u64) -> io::Result<()> {
    w.write_all(&n.to_le_bytes())
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(read_i64(r)? as u64)
}

fn write_f64<W: Write>(w: &mut W, f: f64) -> io::Result<()> {
    w.write_all(&f.to_le_bytes())
}

fn read_f64<R: Read>(r: &mut R) -> io::Result<f64> {
    Ok(f64::from_bits(read_u64(r)?))
}

fn write_opt<W: Write>(w: &mut W, v: &Option<Value>) -> io::Result<()> {
    match v {
        None => w.write_all(&[0]),
        Some(v) => {
            w.write_all(&[1])?;
            v.write_to(w)
        }
    }
}

fn read_opt<R: Read>(r: &mut R) -> io::Result<Option<Value>> {
    match read_u8(r)? {
        0 => Ok(None),
        _ => Ok(Some(Value::read_from(r)?)),
    }
}

fn write_values<'a, W: Write>(
    w: &mut W,
    len: usize,
    items: impl Iterator<Item = &'a Value>,
) -> io::Result<()> {
    write_u64(w, len as u64)?;
    for v in items {
        v.write_to(w)?;
    }
    Ok(())
}

fn read_values<R: Read>(r: &mut R) -> io::Result<Vec<Value>> {
    let len = read_u64(r)? as usize;
    let mut out = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        out.push(Value::read_from(r)?);
    }
    Ok(out)
}

impl AccumulatorState {
    const TAG_SUM: u8 = 0;
    const TAG_AVG: u8 = 1;
    const TAG_MIN: u8 = 2;
    const TAG_MAX: u8 = 3;
    const TAG_FIRST: u8 = 4;
    const TAG_LAST: u8 = 5;
    const TAG_FIRST_N: u8 = 6;
    const TAG_LAST_N: u8 = 7;
    const TAG_MIN_N: u8 = 8;
    const TAG_MAX_N: u8 = 9;
    const TAG_PUSH: u8 = 10;
    const TAG_ADD_TO_SET: u8 = 11;
    const TAG_CONCAT_ARRAYS: u8 = 12;
    const TAG_MERGE_OBJECTS: u8 = 13;
    const TAG_COUNT: u8 = 14;
    const TAG_STD_DEV: u8 = 15;
    const TAG_JS_REDUCE: u8 = 16;

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Self::Sum(v) => {
                w.write_all(&[Self::TAG_SUM])?;
                v.write_to(w)
            }
            Self::Avg { sum, count } => {
                w.write_all(&[Self::TAG_AVG])?;
                sum.write_to(w)?;
                write_u64(w, *count)
            }
            Self::Min(v) => {
                w.write_all(&[Self::TAG_MIN])?;
                write_opt(w, v)
            }
            Self::Max(v) => {
                w.write_all(&[Self::TAG_MAX])?;
                write_opt(w, v)
            }
            Self::First(v) => {
                w.write_all(&[Self::TAG_FIRST])?;
                write_opt(w, v)
            }
            Self::Last(v) => {
                w.write_all(&[Self::TAG_LAST])?;
                write_opt(w, v)
            }
            Self::FirstN { n, items } => {
                w.write_all(&[Self::TAG_FIRST_N])?;
                write_u64(w, *n as u64)?;
                write_values(w, items.len(), items.iter())
            }
            Self::LastN { n, items } => {
                w.write_all(&[Self::TAG_LAST_N])?;
                write_u64(w, *n as u64)?;
                write_values(w, items.len(), items.iter())
            }
            Self::MinN { n, items } => {
                w.write_all(&[Self::TAG_MIN_N])?;
                write_u64(w, *n as u64)?;
                write_values(w, items.len(), items.iter())
            }
            Self::MaxN { n, items } => {
                w.write_all(&[Self::TAG_MAX_N])?;
                write_u64(w, *n as u64)?;
                write_values(w, items.len(), items.iter())
            }
            Self::Push { items, .. } => {
                w.write_all(&[Self::TAG_PUSH])?;
                write_values(w, items.len(), items.iter())
            }
            Self::AddToSet { items, .. } => {
                w.write_all(&[Self::TAG_ADD_TO_SET])?;
                write_values(w, items.len(), items.iter())
            }
            Self::ConcatArrays { items, .. } => {
                w.write_all(&[Self::TAG_CONCAT_ARRAYS])?;
                write_values(w, items.len(), items.iter())
            }
            Self::MergeObjects(doc) => {
                w.write_all(&[Self::TAG_MERGE_OBJECTS])?;
                doc.write_to(w)
            }
            Self::Count(v) => {
                w.write_all(&[Self::TAG_COUNT])?;
                v.write_to(w)
            }
            Self::StdDev {
                sample,
                count,
                mean,
                m2,
            } => {
                w.write_all(&[Self::TAG_STD_DEV, *sample as u8])?;
                write_u64(w, *count)?;
                write_f64(w, *mean)?;
                write_f64(w, *m2)
            }
            Self::JsReduce { source, values, .. } => {
                w.write_all(&[Self::TAG_JS_REDUCE])?;
                write_str(w, source)?;
                write_values(w, values.len(), values.iter())
            }
        }
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let bytes_of = |items: &[Value]| items.iter().map(Value::approx_size).sum::<usize>();
        let tag = read_u8(r)?;
        Ok(match tag {
            Self::TAG_SUM => Self::Sum(Value::read_from(r)?),
            Self::TAG_AVG => Self::Avg {
                sum: Value::read_from(r)?,
                count: read_u64(r)?,
            },
            Self::TAG_MIN => Self::Min(read_opt(r)?),
            Self::TAG_MAX => Self::Max(read_opt(r)?),
            Self::TAG_FIRST => Self::First(read_opt(r)?),
            Self::TAG_LAST => Self::Last(read_opt(r)?),
            Self::TAG_FIRST_N => Self::FirstN {
                n: read_u64(r)? as usize,
                items: read_values(r)?,
            },
            Self::TAG_LAST_N => Self::LastN {
                n: read_u64(r)? as usize,
                items: read_values(r)?.into(),
            },
            Self::TAG_MIN_N => Self::MinN {
                n: read_u64(r)? as usize,
                items: read_values(r)?,
            },
            Self::TAG_MAX_N => Self::MaxN {
                n: read_u64(r)? as usize,
                items: read_values(r)?,
            },
            Self::TAG_PUSH => {
                let items = read_values(r)?;
                let bytes = bytes_of(&items);
                Self::Push { items, bytes }
            }
            Self::TAG_ADD_TO_SET => {
                let items = read_values(r)?;
                let bytes = bytes_of(&items);
                Self::AddToSet {
                    items: items.into_iter().collect(),
                    bytes,
                }
            }
            Self::TAG_CONCAT_ARRAYS => {
                let items = read_values(r)?;
                let bytes = bytes_of(&items);
                Self::ConcatArrays { items, bytes }
            }
            Self::TAG_MERGE_OBJECTS => Self::MergeObjects(Document::read_from(r)?),
            Self::TAG_COUNT => Self::Count(Value::read_from(r)?),
            Self::TAG_STD_DEV => Self::StdDev {
                sample: read_u8(r)? != 0,
                count: read_u64(r)?,
                mean: read_f64(r)?,
                m2: read_f64(r)?,
            },
            Self::TAG_JS_REDUCE => {
                let source = read_str(r)?;
                let values = read_values(r)?;
                let bytes = bytes_of(&values);
                Self::JsReduce {
                    source,
                    values,
                    bytes,
                }
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown accumulator tag: {tag}"),
                ));
            }
        })
    }
}
