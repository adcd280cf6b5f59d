//! Aggregation expression language: parse once, evaluate per document.

mod eval;
mod ops;
mod parse;

use std::collections::BTreeSet;

use regex::Regex;

use crate::collation::Collation;
use crate::document::Document;
use crate::value::Value;

pub use ops::Operator;
pub(crate) use eval::{compile_regex, walk_document};
pub(crate) use ops::{coerce_to_string, merge_objects};
pub use parse::{VariablesParseState, validate_user_variable_name};

pub type VariableId = usize;

pub const ROOT_ID: VariableId = 0;
pub const CURRENT_ID: VariableId = 1;
pub const REMOVE_ID: VariableId = 2;
pub const KEEP_ID: VariableId = 3;
pub const PRUNE_ID: VariableId = 4;
pub const DESCEND_ID: VariableId = 5;
pub(crate) const FIRST_USER_ID: VariableId = 6;

/// Values of the `$redact` control variables.
pub const KEEP: &str = "keep";
pub const PRUNE: &str = "prune";
pub const DESCEND: &str = "descend";

#[derive(Debug, Clone)]
pub enum Expression {
    Constant(Value),
    /// `$a.b.c`, resolved against `$$CURRENT`.
    FieldPath(Vec<String>),
    Variable {
        id: VariableId,
        name: String,
        path: Vec<String>,
    },
    Object(Vec<(String, Expression)>),
    Array(Vec<Expression>),
    Op {
        op: Operator,
        args: Vec<Expression>,
    },
    Switch {
        branches: Vec<(Expression, Expression)>,
        default: Option<Box<Expression>>,
    },
    Map {
        input: Box<Expression>,
        var: VariableId,
        body: Box<Expression>,
    },
    Filter {
        input: Box<Expression>,
        var: VariableId,
        cond: Box<Expression>,
        limit: Option<Box<Expression>>,
    },
    Reduce {
        input: Box<Expression>,
        initial: Box<Expression>,
        this: VariableId,
        value: VariableId,
        body: Box<Expression>,
    },
    Let {
        bindings: Vec<(VariableId, Expression)>,
        body: Box<Expression>,
    },
    RegexMatch {
        input: Box<Expression>,
        regex: Box<Expression>,
        options: Option<Box<Expression>>,
        /// Compiled at parse time when pattern and options are constant.
        compiled: Option<Regex>,
    },
}

/// Runtime variable bindings plus the collation expressions compare under.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: Vec<Option<Value>>,
    collation: Option<Collation>,
}

impl Variables {
    pub fn new(collation: Option<Collation>) -> Self {
        Self {
            values: Vec::new(),
            collation: collation.filter(|c| !c.is_simple()),
        }
    }

    pub fn collation(&self) -> Option<&Collation> {
        self.collation.as_ref()
    }

    pub fn get(&self, id: VariableId) -> Option<&Value> {
        self.values.get(id).and_then(Option::as_ref)
    }

    /// Bind `id`, returning the previous binding so callers can restore it.
    pub fn set(&mut self, id: VariableId, value: Value) -> Option<Value> {
        if self.values.len() <= id {
            self.values.resize(id + 1, None);
        }
        self.values[id].replace(value)
    }

    pub fn restore(&mut self, id: VariableId, previous: Option<Value>) {
        if let Some(slot) = self.values.get_mut(id) {
            *slot = previous;
        }
    }
}

/// Fields an expression or stage reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepsTracker {
    pub fields: BTreeSet<String>,
    pub needs_whole_document: bool,
}

impl DepsTracker {
    pub fn add_path(&mut self, path: &[String]) {
        if path.is_empty() {
            self.needs_whole_document = true;
        } else {
            self.fields.insert(path.join("."));
        }
    }

    /// True when none of `paths` overlaps a tracked field (one being a
    /// prefix of the other counts as overlap).
    pub fn independent_of<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> bool {
        if self.needs_whole_document {
            return false;
        }
        paths.into_iter().all(|p| {
            self.fields
                .iter()
                .all(|f| !paths_overlap(f, p))
        })
    }
}

pub(crate) fn paths_overlap(a: &str, b: &str) -> bool {
    let prefix = |short: &str, long: &str| {
        long.starts_with(short) && (long.len() == short.len() || long.as_bytes()[short.len()] == b'.')
    };
    prefix(a, b) || prefix(b, a)
}

impl Expression {
    pub fn parse(value: &Value, vps: &mut VariablesParseState) -> crate::error::Result<Self> {
        parse::parse_expression(value, vps)
    }

    pub fn evaluate(
        &self,
        doc: &Document,
        vars: &mut Variables,
    ) -> crate::error::Result<Value> {
        eval::evaluate(self, doc, vars)
    }

    pub fn constant(value: Value) -> Self {
        Expression::Constant(value)
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match self {
            Expression::Constant(v) => Some(v),
            _ => None,
        }
    }

    /// The dotted path when this is a plain `$field` reference.
    pub fn as_field_path(&self) -> Option<String> {
        match self {
            Expression::FieldPath(parts) => Some(parts.join(".")),
            _ => None,
        }
    }

    pub fn add_dependencies(&self, deps: &mut DepsTracker) {
        match self {
            Expression::Constant(_) => {}
            Expression::FieldPath(path) => deps.add_path(path),
            Expression::Variable { id, path, .. } => {
                if *id == ROOT_ID || *id == CURRENT_ID {
                    deps.add_path(path);
                }
            }
            Expression::Object(fields) => {
                for (_, e) in fields {
                    e.add_dependencies(deps);
                }
            }
            Expression::Array(items) | Expression::Op { args: items, .. } => {
                for e in items {
                    e.add_dependencies(deps);
                }
            }
            Expression::Switch { branches, default } => {
                for (case, then) in branches {
                    case.add_dependencies(deps);
                    then.add_dependencies(deps);
                }
                if let Some(d) = default {
                    d.add_dependencies(deps);
                }
            }
            Expression::Map { input, body, .. } => {
                input.add_dependencies(deps);
                body.add_dependencies(deps);
            }
            Expression::Filter {
                input, cond, limit, ..
            } => {
                input.add_dependencies(deps);
                cond.add_dependencies(deps);
                if let Some(l) = limit {
                    l.add_dependencies(deps);
                }
            }
            Expression::Reduce {
                input,
                initial,
                body,
                ..
            } => {
                input.add_dependencies(deps);
                initial.add_dependencies(deps);
                body.add_dependencies(deps);
            }
            Expression::Let { bindings, body } => {
                for (id, e) in bindings {
                    if *id == CURRENT_ID {
                        deps.needs_whole_document = true;
                    }
                    e.add_dependencies(deps);
                }
                body.add_dependencies(deps);
            }
            Expression::RegexMatch {
                input,
                regex,
                options,
                ..
            } => {
                input.add_dependencies(deps);
                regex.add_dependencies(deps);
                if let Some(o) = options {
                    o.add_dependencies(deps);
                }
            }
        }
    }

    /// Fold operator calls whose arguments are all constants.
    ///
    /// A call that would fail is left in place so the error surfaces at
    /// evaluation time, exactly as without folding.
    pub fn optimize(self) -> Self {
        match self {
            Expression::Object(fields) => {
                let fields: Vec<_> = fields
                    .into_iter()
                    .map(|(k, e)| (k, e.optimize()))
                    .collect();
                if fields.iter().all(|(_, e)| e.as_constant().is_some()) {
                    let doc = fields
                        .into_iter()
                        .filter_map(|(k, e)| match e {
                            Expression::Constant(v) => Some((k, v)),
                            _ => None,
                        })
                        .collect();
                    Expression::Constant(Value::Document(doc))
                } else {
                    Expression::Object(fields)
                }
            }
            Expression::Array(items) => {
                let items: Vec<_> = items.into_iter().map(Expression::optimize).collect();
                if items.iter().all(|e| e.as_constant().is_some()) {
                    Expression::Constant(Value::Array(
                        items
                            .into_iter()
                            .filter_map(|e| match e {
                                Expression::Constant(v) => Some(v.missing_to_null()),
                                _ => None,
                            })
                            .collect(),
                    ))
                } else {
                    Expression::Array(items)
                }
            }
            Expression::Op { op, args } => {
                let args: Vec<_> = args.into_iter().map(Expression::optimize).collect();
                let constants: Option<Vec<Value>> =
                    args.iter().map(|e| e.as_constant().cloned()).collect();
                match constants.map(|values| op.apply(values, None)) {
                    Some(Ok(v)) if !depends_on_collation(op) => Expression::Constant(v),
                    _ => Expression::Op { op, args },
                }
            }
            Expression::Switch { branches, default } => Expression::Switch {
                branches: branches
                    .into_iter()
                    .map(|(c, t)| (c.optimize(), t.optimize()))
                    .collect(),
                default: default.map(|d| Box::new(d.optimize())),
            },
            Expression::Map { input, var, body } => Expression::Map {
                input: Box::new(input.optimize()),
                var,
                body: Box::new(body.optimize()),
            },
            Expression::Filter {
                input,
                var,
                cond,
                limit,
            } => Expression::Filter {
                input: Box::new(input.optimize()),
                var,
                cond: Box::new(cond.optimize()),
                limit: limit.map(|l| Box::new(l.optimize())),
            },
            Expression::Reduce {
                input,
                initial,
                this,
                value,
                body,
            } => Expression::Reduce {
                input: Box::new(input.optimize()),
                initial: Box::new(initial.optimize()),
                this,
                value,
                body: Box::new(body.optimize()),
            },
            Expression::Let { bindings, body } => Expression::Let {
                bindings: bindings
                    .into_iter()
                    .map(|(id, e)| (id, e.optimize()))
                    .collect(),
                body: Box::new(body.optimize()),
            },
            other => other,
        }
    }
}

/// Comparisons between strings depend on the collation active at run time.
fn depends_on_collation(op: Operator) -> bool {
    matches!(
        op,
        Operator::Eq
            | Operator::Ne
            | Operator::Gt
            | Operator::Gte
            | Operator::Lt
            | Operator::Lte
            | Operator::Cmp
            | Operator::In
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(j: serde_json::Value) -> Expression {
        let mut vps = VariablesParseState::new();
        Expression::parse(&Value::from_json(&j), &mut vps).unwrap()
    }

    fn deps(j: serde_json::Value) -> DepsTracker {
        let mut d = DepsTracker::default();
        parse(j).add_dependencies(&mut d);
        d
    }

    #[test]
    fn dependencies_of_field_paths() {
        let d = deps(json!({"$add": ["$a.b", "$c", {"$size": "$$ROOT.items"}]}));
        assert_eq!(
            d.fields.iter().cloned().collect::<Vec<_>>(),
            vec!["a.b", "c", "items"]
        );
        assert!(!d.needs_whole_document);
        assert!(deps(json!("$$ROOT")).needs_whole_document);
    }

    #[test]
    fn map_variables_are_not_dependencies() {
        let d = deps(json!({"$map": {"input": "$xs", "as": "x", "in": {"$add": ["$$x", "$k"]}}}));
        assert_eq!(d.fields.len(), 2);
        assert!(d.fields.contains("xs"));
        assert!(d.fields.contains("k"));
    }

    #[test]
    fn overlap_is_prefix_on_path_boundaries() {
        assert!(paths_overlap("a", "a.b"));
        assert!(paths_overlap("a.b", "a"));
        assert!(!paths_overlap("a", "ab"));
        let d = deps(json!("$x.y"));
        assert!(d.independent_of(["z", "xy"]));
        assert!(!d.independent_of(["x"]));
    }

    #[test]
    fn folds_constant_calls() {
        let e = parse(json!({"$add": [1, {"$multiply": [2, 3]}]})).optimize();
        assert_eq!(e.as_constant(), Some(&Value::Int32(7)));
        let e = parse(json!({"$add": [1, "$x"]})).optimize();
        assert!(e.as_constant().is_none());
        // Errors stay deferred to evaluation.
        let e = parse(json!({"$divide": [1, 0]})).optimize();
        assert!(e.as_constant().is_none());
    }

    #[test]
    fn string_comparisons_are_not_folded() {
        let e = parse(json!({"$eq": ["a", "A"]})).optimize();
        assert!(e.as_constant().is_none());
    }
}
