//! `$match` query language.
//!
//! Field predicates follow array semantics: a scalar operand matches when
//! any value at the path (or any element of an array found there) matches,
//! an array operand compares whole arrays, and `$size`, `$elemMatch` and
//! `$type: "array"` bind to the array itself.

use std::cmp::Ordering;
use std::ops::Bound;

use regex::Regex;

use crate::collation::Collation;
use crate::context::ExecContext;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::expression::{DepsTracker, Expression, Variables, VariablesParseState, compile_regex};
use crate::value::{Value, compare_values};

// ---------------------------------------------------------------------------
// Query AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum QueryOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In { values: Vec<Value>, regexes: Vec<Regex> },
    Nin { values: Vec<Value>, regexes: Vec<Regex> },
    Exists(bool),
    Type(Vec<&'static str>),
    Size(usize),
    All(Vec<Value>),
    ElemMatch(Box<ElemMatch>),
    Regex(Regex),
    Mod { divisor: i64, remainder: i64 },
    Not(Vec<QueryOp>),
}

#[derive(Debug, Clone)]
pub enum ElemMatch {
    /// `{$elemMatch: {field: ...}}`: elements are documents matched by a query.
    Object(Query),
    /// `{$elemMatch: {$gt: 1, $lt: 5}}`: every operator applies to one element.
    Value(Vec<QueryOp>),
}

#[derive(Debug, Clone)]
pub enum Query {
    All,
    Field { path: String, op: QueryOp },
    And(Vec<Query>),
    Or(Vec<Query>),
    Nor(Vec<Query>),
    Expr(Expression),
    Where(String),
}

/// A parsed `$match` filter together with its source form.
#[derive(Debug, Clone)]
pub struct Matcher {
    query: Query,
    source: Value,
}

fn bad(msg: impl Into<String>) -> Error {
    Error::InvalidQuery(msg.into())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl Matcher {
    pub fn parse(filter: &Value, vps: &mut VariablesParseState) -> Result<Self> {
        Ok(Self {
            query: parse_query(filter, vps)?,
            source: filter.clone(),
        })
    }

    pub fn match_all() -> Self {
        Self {
            query: Query::All,
            source: Value::Document(Document::new()),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn source(&self) -> &Value {
        &self.source
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self.query, Query::All)
    }

    /// Conjunction of two filters.
    pub fn and(self, other: Matcher) -> Matcher {
        if self.is_match_all() {
            return other;
        }
        if other.is_match_all() {
            return self;
        }
        let mut source = Document::new();
        source.insert("$and", Value::Array(vec![self.source, other.source]));
        Matcher {
            query: Query::And(vec![self.query, other.query]),
            source: Value::Document(source),
        }
    }

    pub fn matches(&self, doc: &Document, ctx: &ExecContext, vars: &mut Variables) -> Result<bool> {
        query_matches(&self.query, doc, ctx, vars)
    }

    pub fn add_dependencies(&self, deps: &mut DepsTracker) {
        self.query.add_dependencies(deps);
    }
}

pub fn parse_query(filter: &Value, vps: &mut VariablesParseState) -> Result<Query> {
    let Value::Document(obj) = filter else {
        return Err(bad("query must be an object"));
    };
    let mut conditions = Vec::new();
    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let subs = match value {
                    Value::Array(items) if !items.is_empty() => items
                        .iter()
                        .map(|q| parse_query(q, vps))
                        .collect::<Result<Vec<_>>>()?,
                    _ => return Err(bad(format!("{key} must be a nonempty array"))),
                };
                conditions.push(match key.as_str() {
                    "$and" => Query::And(subs),
                    "$or" => Query::Or(subs),
                    _ => Query::Nor(subs),
                });
            }
            "$expr" => conditions.push(Query::Expr(Expression::parse(value, vps)?.optimize())),
            "$where" => match value {
                Value::String(source) => conditions.push(Query::Where(source.clone())),
                _ => return Err(bad("$where must be a string containing a function")),
            },
            "$comment" => {}
            other if other.starts_with('$') => {
                return Err(bad(format!("unknown top level operator: {other}")));
            }
            path => parse_field(path, value, vps, &mut conditions)?,
        }
    }
    Ok(match conditions.len() {
        0 => Query::All,
        1 => conditions.pop().unwrap_or(Query::All),
        _ => Query::And(conditions),
    })
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Document(d) => d.keys().next().is_some_and(|k| k.starts_with('$')),
        _ => false,
    }
}

fn parse_field(
    path: &str,
    value: &Value,
    vps: &mut VariablesParseState,
    out: &mut Vec<Query>,
) -> Result<()> {
    let field = |op| Query::Field {
        path: path.to_string(),
        op,
    };
    if let Value::Regex { .. } = value {
        out.push(field(QueryOp::Regex(regex_operand(value, &Value::Null)?)));
        return Ok(());
    }
    let Value::Document(ops) = value else {
        out.push(field(QueryOp::Eq(value.clone())));
        return Ok(());
    };
    if !is_operator_object(value) {
        out.push(field(QueryOp::Eq(value.clone())));
        return Ok(());
    }
    for op in parse_ops(ops, vps)? {
        out.push(field(op));
    }
    Ok(())
}

fn regex_operand(pattern: &Value, options: &Value) -> Result<Regex> {
    compile_regex(pattern, options)
        .map_err(|e| bad(format!("invalid $regex: {e}")))?
        .ok_or_else(|| bad("$regex has to be a string"))
}

fn parse_ops(ops: &Document, vps: &mut VariablesParseState) -> Result<Vec<QueryOp>> {
    let mut out = Vec::new();
    for (name, arg) in ops {
        if !name.starts_with('$') {
            return Err(bad(format!(
                "unknown operator {name}: cannot mix operators and field names"
            )));
        }
        let op = match name.as_str() {
            "$eq" => QueryOp::Eq(arg.clone()),
            "$ne" => QueryOp::Ne(arg.clone()),
            "$gt" => QueryOp::Gt(arg.clone()),
            "$gte" => QueryOp::Gte(arg.clone()),
            "$lt" => QueryOp::Lt(arg.clone()),
            "$lte" => QueryOp::Lte(arg.clone()),
            "$in" | "$nin" => {
                let items = arg
                    .as_array()
                    .ok_or_else(|| bad(format!("{name} needs an array")))?;
                let mut values = Vec::new();
                let mut regexes = Vec::new();
                for item in items {
                    match item {
                        Value::Regex { .. } => regexes.push(regex_operand(item, &Value::Null)?),
                        other => values.push(other.clone()),
                    }
                }
                if name == "$in" {
                    QueryOp::In { values, regexes }
                } else {
                    QueryOp::Nin { values, regexes }
                }
            }
            "$exists" => QueryOp::Exists(arg.coerce_to_bool()),
            "$type" => {
                let aliases = match arg {
                    Value::Array(items) => items.iter().map(type_alias).collect::<Result<Vec<_>>>()?,
                    single => vec![type_alias(single)?],
                };
                QueryOp::Type(aliases)
            }
            "$size" => match arg.integral_i64() {
                Some(n) if n >= 0 => QueryOp::Size(n as usize),
                _ => return Err(bad("$size needs a non-negative integer")),
            },
            "$all" => QueryOp::All(
                arg.as_array()
                    .ok_or_else(|| bad("$all needs an array"))?
                    .clone(),
            ),
            "$elemMatch" => {
                let Value::Document(inner) = arg else {
                    return Err(bad("$elemMatch needs an Object"));
                };
                let value_form = inner.keys().next().is_some_and(|k| {
                    k.starts_with('$') && !matches!(k.as_str(), "$and" | "$or" | "$nor" | "$expr" | "$where")
                });
                let elem = if value_form {
                    ElemMatch::Value(parse_ops(inner, vps)?)
                } else {
                    ElemMatch::Object(parse_query(arg, vps)?)
                };
                QueryOp::ElemMatch(Box::new(elem))
            }
            "$regex" => {
                let options = ops.get("$options").cloned().unwrap_or(Value::Null);
                QueryOp::Regex(regex_operand(arg, &options)?)
            }
            "$options" => {
                if !ops.contains_key("$regex") {
                    return Err(bad("$options needs a $regex"));
                }
                continue;
            }
            "$mod" => {
                let parts = arg.as_array().ok_or_else(|| bad("malformed mod, needs to be an array"))?;
                let [divisor, remainder] = parts.as_slice() else {
                    return Err(bad("malformed mod, not enough elements"));
                };
                let (Some(divisor), Some(remainder)) = (
                    divisor.as_f64().map(|f| f.trunc() as i64),
                    remainder.as_f64().map(|f| f.trunc() as i64),
                ) else {
                    return Err(bad("malformed mod, divisor and remainder must be numbers"));
                };
                if divisor == 0 {
                    return Err(bad("divisor cannot be 0"));
                }
                QueryOp::Mod { divisor, remainder }
            }
            "$not" => match arg {
                Value::Regex { .. } => QueryOp::Not(vec![QueryOp::Regex(regex_operand(arg, &Value::Null)?)]),
                Value::Document(inner) if is_operator_object(arg) => QueryOp::Not(parse_ops(inner, vps)?),
                _ => return Err(bad("$not needs a regex or a document")),
            },
            other => return Err(bad(format!("unknown operator: {other}"))),
        };
        out.push(op);
    }
    Ok(out)
}

const TYPE_ALIASES: &[(&str, i64)] = &[
    ("double", 1),
    ("string", 2),
    ("object", 3),
    ("array", 4),
    ("objectId", 7),
    ("bool", 8),
    ("date", 9),
    ("null", 10),
    ("regex", 11),
    ("int", 16),
    ("long", 18),
    ("decimal", 19),
    ("minKey", -1),
    ("maxKey", 127),
];

fn type_alias(value: &Value) -> Result<&'static str> {
    match value {
        Value::String(s) if s == "number" => Ok("number"),
        Value::String(s) => TYPE_ALIASES
            .iter()
            .find(|(name, _)| name == s)
            .map(|(name, _)| *name)
            .ok_or_else(|| bad(format!("unknown type name alias: {s}"))),
        v => {
            let code = v
                .integral_i64()
                .ok_or_else(|| bad("type must be represented as a number or a string"))?;
            TYPE_ALIASES
                .iter()
                .find(|(_, c)| *c == code)
                .map(|(name, _)| *name)
                .ok_or_else(|| bad(format!("invalid numerical type code: {code}")))
        }
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Values reachable at `path`. Arrays met mid-path are traversed; a value
/// found at the end is returned as is, arrays included. Absent paths yield
/// nothing.
pub(crate) fn path_values<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = segments.split_first() {
        if let Some(v) = doc.get(head) {
            collect_path(v, rest, &mut out);
        }
    }
    out
}

fn collect_path<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Document(d) => {
            if let Some(v) = d.get(head) {
                collect_path(v, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(i) = head.parse::<usize>() {
                if let Some(v) = items.get(i) {
                    collect_path(v, rest, out);
                }
            }
            for item in items {
                if let Value::Document(_) = item {
                    collect_path(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

/// Leaves plus the elements of leaves that are arrays.
fn expanded<'a>(leaves: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        out.push(*leaf);
        if let Value::Array(items) = leaf {
            out.extend(items.iter());
        }
    }
    out
}

fn equal(a: &Value, b: &Value, collation: Option<&Collation>) -> bool {
    compare_values(a, b, collation) == Ordering::Equal
}

fn eq_matches(operand: &Value, leaves: &[&Value], collation: Option<&Collation>) -> bool {
    if leaves.is_empty() {
        return operand.is_nullish();
    }
    expanded(leaves).iter().any(|c| equal(c, operand, collation))
}

fn in_matches(values: &[Value], regexes: &[Regex], leaves: &[&Value], collation: Option<&Collation>) -> bool {
    values.iter().any(|v| eq_matches(v, leaves, collation))
        || expanded(leaves)
            .iter()
            .any(|c| c.as_str().is_some_and(|s| regexes.iter().any(|re| re.is_match(s))))
}

fn range_matches(
    operand: &Value,
    leaves: &[&Value],
    collation: Option<&Collation>,
    accept: fn(Ordering) -> bool,
) -> bool {
    // `$gte: null` and `$lte: null` behave like equality with null.
    if operand.is_nullish() && accept(Ordering::Equal) {
        return eq_matches(operand, leaves, collation);
    }
    expanded(leaves).iter().any(|c| {
        c.canonical_type() == operand.canonical_type() && accept(compare_values(c, operand, collation))
    })
}

fn type_matches(alias: &str, value: &Value) -> bool {
    match alias {
        "number" => value.is_numeric(),
        name => value.type_name() == name,
    }
}

fn op_matches(op: &QueryOp, leaves: &[&Value], ctx: &ExecContext, vars: &mut Variables) -> Result<bool> {
    let collation = ctx.collation.as_ref();
    Ok(match op {
        QueryOp::Eq(v) => eq_matches(v, leaves, collation),
        QueryOp::Ne(v) => !eq_matches(v, leaves, collation),
        QueryOp::Gt(v) => range_matches(v, leaves, collation, |o| o == Ordering::Greater),
        QueryOp::Gte(v) => range_matches(v, leaves, collation, |o| o != Ordering::Less),
        QueryOp::Lt(v) => range_matches(v, leaves, collation, |o| o == Ordering::Less),
        QueryOp::Lte(v) => range_matches(v, leaves, collation, |o| o != Ordering::Greater),
        QueryOp::In { values, regexes } => in_matches(values, regexes, leaves, collation),
        QueryOp::Nin { values, regexes } => !in_matches(values, regexes, leaves, collation),
        QueryOp::Exists(expected) => !leaves.is_empty() == *expected,
        QueryOp::Type(aliases) => expanded(leaves)
            .iter()
            .any(|c| aliases.iter().any(|a| type_matches(a, c))),
        QueryOp::Size(n) => leaves
            .iter()
            .any(|l| matches!(l, Value::Array(items) if items.len() == *n)),
        QueryOp::All(values) => {
            !values.is_empty() && values.iter().all(|v| eq_matches(v, leaves, collation))
        }
        QueryOp::ElemMatch(elem) => {
            for leaf in leaves {
                let Value::Array(items) = leaf else {
                    continue;
                };
                for item in items {
                    let hit = match elem.as_ref() {
                        ElemMatch::Object(q) => match item {
                            Value::Document(d) => query_matches(q, d, ctx, vars)?,
                            _ => false,
                        },
                        ElemMatch::Value(ops) => {
                            let mut all = true;
                            for op in ops {
                                if !op_matches(op, &[item], ctx, vars)? {
                                    all = false;
                                    break;
                                }
                            }
                            all
                        }
                    };
                    if hit {
                        return Ok(true);
                    }
                }
            }
            false
        }
        QueryOp::Regex(re) => expanded(leaves)
            .iter()
            .any(|c| c.as_str().is_some_and(|s| re.is_match(s))),
        QueryOp::Mod { divisor, remainder } => expanded(leaves).iter().any(|c| {
            c.as_f64()
                .filter(|f| f.is_finite())
                .is_some_and(|f| (f.trunc() as i64).wrapping_rem(*divisor) == *remainder)
        }),
        QueryOp::Not(ops) => {
            for op in ops {
                if !op_matches(op, leaves, ctx, vars)? {
                    return Ok(true);
                }
            }
            false
        }
    })
}

fn query_matches(query: &Query, doc: &Document, ctx: &ExecContext, vars: &mut Variables) -> Result<bool> {
    match query {
        Query::All => Ok(true),
        Query::Field { path, op } => op_matches(op, &path_values(doc, path), ctx, vars),
        Query::And(subs) => {
            for sub in subs {
                if !query_matches(sub, doc, ctx, vars)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Query::Or(subs) => {
            for sub in subs {
                if query_matches(sub, doc, ctx, vars)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Query::Nor(subs) => {
            for sub in subs {
                if query_matches(sub, doc, ctx, vars)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Query::Expr(expr) => Ok(expr.evaluate(doc, vars)?.coerce_to_bool()),
        Query::Where(source) => {
            let result = ctx
                .scripting
                .invoke(source, &[Value::Document(doc.clone())], &ctx.let_scope)
                .map_err(|e| e.context("$where"))?;
            Ok(result.coerce_to_bool())
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// A predicate a single-field index can answer with a superset of matches.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexPredicate<'a> {
    Eq(&'a Value),
    In(&'a [Value]),
    Range {
        lower: Bound<&'a Value>,
        upper: Bound<&'a Value>,
    },
}

fn indexable(v: &Value, collation: Option<&Collation>) -> bool {
    match v {
        Value::Missing
        | Value::Null
        | Value::Array(_)
        | Value::Regex { .. }
        | Value::MinKey
        | Value::MaxKey => false,
        Value::String(_) => collation.is_none_or(Collation::is_simple),
        Value::Document(_) => false,
        _ => true,
    }
}

impl Query {
    pub fn add_dependencies(&self, deps: &mut DepsTracker) {
        match self {
            Query::All => {}
            Query::Field { path, .. } => {
                let parts: Vec<String> = path.split('.').map(str::to_string).collect();
                deps.add_path(&parts);
            }
            Query::And(subs) | Query::Or(subs) | Query::Nor(subs) => {
                for sub in subs {
                    sub.add_dependencies(deps);
                }
            }
            Query::Expr(expr) => expr.add_dependencies(deps),
            Query::Where(_) => deps.needs_whole_document = true,
        }
    }

    /// Top-level conjuncts usable by an index on their path.
    pub fn index_predicates(&self, collation: Option<&Collation>) -> Vec<(&str, IndexPredicate<'_>)> {
        let conjuncts: Vec<&Query> = match self {
            Query::And(subs) => subs.iter().collect(),
            other => vec![other],
        };
        let mut out = Vec::new();
        for q in conjuncts {
            let Query::Field { path, op } = q else {
                continue;
            };
            let pred = match op {
                QueryOp::Eq(v) if indexable(v, collation) => IndexPredicate::Eq(v),
                QueryOp::In { values, regexes }
                    if regexes.is_empty() && values.iter().all(|v| indexable(v, collation)) =>
                {
                    IndexPredicate::In(values)
                }
                QueryOp::Gt(v) if indexable(v, collation) => IndexPredicate::Range {
                    lower: Bound::Excluded(v),
                    upper: Bound::Unbounded,
                },
                QueryOp::Gte(v) if indexable(v, collation) => IndexPredicate::Range {
                    lower: Bound::Included(v),
                    upper: Bound::Unbounded,
                },
                QueryOp::Lt(v) if indexable(v, collation) => IndexPredicate::Range {
                    lower: Bound::Unbounded,
                    upper: Bound::Excluded(v),
                },
                QueryOp::Lte(v) if indexable(v, collation) => IndexPredicate::Range {
                    lower: Bound::Unbounded,
                    upper: Bound::Included(v),
                },
                _ => continue,
            };
            out.push((path.as_str(), pred));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::NativeScriptHost;
    use serde_json::json;
    use std::sync::Arc;

    fn check(filter: serde_json::Value, doc: serde_json::Value) -> bool {
        check_with(&ExecContext::default(), filter, doc)
    }

    fn check_with(ctx: &ExecContext, filter: serde_json::Value, doc: serde_json::Value) -> bool {
        let mut vps = ctx.parse_state();
        let m = Matcher::parse(&Value::from_json(&filter), &mut vps).unwrap();
        let doc = Document::from_json(&doc).unwrap();
        m.matches(&doc, ctx, &mut ctx.variables()).unwrap()
    }

    #[test]
    fn simple_eq_and_range() {
        assert!(check(json!({"name": "Alice"}), json!({"name": "Alice"})));
        let q = json!({"age": {"$gte": 18, "$lt": 65}});
        assert!(check(q.clone(), json!({"age": 30})));
        assert!(!check(q.clone(), json!({"age": 10})));
        assert!(!check(q, json!({"age": "thirty"})));
    }

    #[test]
    fn array_existential_semantics() {
        assert!(check(json!({"tags": "red"}), json!({"tags": ["blue", "red"]})));
        assert!(check(json!({"n": {"$gt": 5}}), json!({"n": [1, 9]})));
        assert!(check(json!({"a.b": 2}), json!({"a": [{"b": 1}, {"b": 2}]})));
        // Array operands compare whole arrays.
        assert!(check(json!({"tags": ["blue", "red"]}), json!({"tags": ["blue", "red"]})));
        assert!(!check(json!({"tags": ["red"]}), json!({"tags": ["blue", "red"]})));
    }

    #[test]
    fn array_level_operators_bind_to_whole_array() {
        assert!(check(json!({"xs": {"$size": 2}}), json!({"xs": [1, 2]})));
        assert!(!check(json!({"xs": {"$size": 1}}), json!({"xs": [[1], 2]})));
        assert!(check(json!({"xs": {"$type": "array"}}), json!({"xs": []})));
        assert!(!check(json!({"xs": {"$type": "array"}}), json!({"xs": 3})));
        let q = json!({"xs": {"$elemMatch": {"$gt": 1, "$lt": 3}}});
        assert!(check(q.clone(), json!({"xs": [0, 2, 5]})));
        assert!(!check(q, json!({"xs": [0, 5]})));
        let q = json!({"items": {"$elemMatch": {"sku": "a", "qty": {"$gte": 2}}}});
        assert!(check(q.clone(), json!({"items": [{"sku": "b", "qty": 5}, {"sku": "a", "qty": 2}]})));
        assert!(!check(q, json!({"items": [{"sku": "b", "qty": 5}, {"sku": "a", "qty": 1}]})));
    }

    #[test]
    fn null_and_exists() {
        assert!(check(json!({"x": null}), json!({"y": 1})));
        assert!(check(json!({"x": null}), json!({"x": null})));
        assert!(!check(json!({"x": {"$exists": true}}), json!({"y": 1})));
        assert!(check(json!({"x": {"$exists": true}}), json!({"x": null})));
        assert!(check(json!({"x": {"$ne": null}}), json!({"x": 0})));
    }

    #[test]
    fn logical_and_misc_operators() {
        let doc = json!({"a": 5, "s": "Hello", "t": ["x", "y"]});
        assert!(check(json!({"$or": [{"a": 1}, {"a": 5}]}), doc.clone()));
        assert!(check(json!({"$nor": [{"a": 1}]}), doc.clone()));
        assert!(check(json!({"a": {"$in": [1, 5]}}), doc.clone()));
        assert!(check(json!({"a": {"$nin": [1, 2]}}), doc.clone()));
        assert!(check(json!({"a": {"$mod": [2, 1]}}), doc.clone()));
        assert!(check(json!({"a": {"$not": {"$gt": 7}}}), doc.clone()));
        assert!(check(json!({"s": {"$regex": "^hel", "$options": "i"}}), doc.clone()));
        assert!(check(json!({"t": {"$all": ["y", "x"]}}), doc.clone()));
        assert!(check(json!({"a": {"$type": "number"}}), doc.clone()));
        assert!(check(json!({"$expr": {"$gt": ["$a", 4]}}), doc));
    }

    #[test]
    fn type_bracketing() {
        assert!(!check(json!({"v": {"$gt": 1}}), json!({"v": "2"})));
        assert!(check(json!({"v": {"$lt": "b"}}), json!({"v": "a"})));
    }

    #[test]
    fn collation_applies_to_strings() {
        let opts = crate::config::AggregateOptions::from_json(&json!({
            "collation": {"locale": "en", "strength": 2}
        }))
        .unwrap();
        let ctx = ExecContext::from_options(&Default::default(), &opts).unwrap();
        assert!(check_with(&ctx, json!({"s": "HELLO"}), json!({"s": "hello"})));
        assert!(!check(json!({"s": "HELLO"}), json!({"s": "hello"})));
    }

    #[test]
    fn where_goes_through_scripting_host() {
        let host = NativeScriptHost::new().with("function() { return this.a > 1; }", |args, _| {
            let doc = args[0].as_document().map(|d| d.field("a")).unwrap_or(Value::Null);
            Ok(Value::Bool(doc.as_f64().unwrap_or(0.0) > 1.0))
        });
        let ctx = ExecContext::default().with_scripting(Arc::new(host));
        let q = json!({"$where": "function() { return this.a > 1; }"});
        assert!(check_with(&ctx, q.clone(), json!({"a": 2})));
        assert!(!check_with(&ctx, q, json!({"a": 0})));
    }

    #[test]
    fn parse_errors() {
        let mut vps = VariablesParseState::new();
        for bad in [
            json!({"$and": []}),
            json!({"a": {"$size": -1}}),
            json!({"a": {"$mod": [0, 1]}}),
            json!({"a": {"$bogus": 1}}),
            json!({"$bogus": 1}),
            json!({"a": {"$type": "nope"}}),
        ] {
            assert!(Matcher::parse(&Value::from_json(&bad), &mut vps).is_err(), "{bad}");
        }
    }

    #[test]
    fn dependencies_and_index_predicates() {
        let mut vps = VariablesParseState::new();
        let m = Matcher::parse(
            &Value::from_json(&json!({"a.b": 1, "c": {"$gt": 2}, "d": {"$regex": "x"}})),
            &mut vps,
        )
        .unwrap();
        let mut deps = DepsTracker::default();
        m.add_dependencies(&mut deps);
        assert!(deps.fields.contains("a.b") && deps.fields.contains("c"));
        let preds = m.query().index_predicates(None);
        assert_eq!(preds.len(), 2);
        assert_eq!(preds[0].0, "a.b");
    }
}
