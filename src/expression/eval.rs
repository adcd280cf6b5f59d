use regex::{Regex, RegexBuilder};

use super::{
    CURRENT_ID, DESCEND, DESCEND_ID, Expression, KEEP, KEEP_ID, Operator, PRUNE, PRUNE_ID,
    REMOVE_ID, ROOT_ID, Variables,
};
use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::value::Value;

/// Walk `path` from `value`. Arrays met on the way are mapped element-wise:
/// documents inside contribute their result, nested arrays recurse, and
/// scalars and Missing results are dropped.
pub(crate) fn walk_path(value: &Value, path: &[String]) -> Value {
    let Some((head, rest)) = path.split_first() else {
        return value.clone();
    };
    match value {
        Value::Document(doc) => match doc.get(head) {
            Some(v) => walk_path(v, rest),
            None => Value::Missing,
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|item| matches!(item, Value::Document(_) | Value::Array(_)))
                .map(|item| walk_path(item, path))
                .filter(|r| !r.is_missing())
                .collect(),
        ),
        _ => Value::Missing,
    }
}

pub(crate) fn walk_document(doc: &Document, path: &[String]) -> Value {
    let Some((head, rest)) = path.split_first() else {
        return Value::Document(doc.clone());
    };
    match doc.get(head) {
        Some(v) => walk_path(v, rest),
        None => Value::Missing,
    }
}

pub(crate) fn compile_regex(pattern: &Value, options: &Value) -> Result<Option<Regex>> {
    let (source, mut flags) = match pattern {
        v if v.is_nullish() => return Ok(None),
        Value::String(s) => (s.clone(), String::new()),
        Value::Regex { pattern, options } => (pattern.clone(), options.clone()),
        other => {
            return Err(Error::location(
                codes::REGEX_BAD_PATTERN,
                format!("$regexMatch needs 'regex' to be of type string or regex, found {}", other.type_name()),
            ));
        }
    };
    match options {
        v if v.is_nullish() => {}
        Value::String(s) => {
            if !flags.is_empty() && !s.is_empty() {
                return Err(Error::location(
                    codes::REGEX_BAD_OPTIONS,
                    "$regexMatch: found regex options specified in both 'regex' and 'options' fields",
                ));
            }
            flags.push_str(s);
        }
        other => {
            return Err(Error::location(
                codes::REGEX_BAD_OPTIONS,
                format!("$regexMatch needs 'options' to be of type string, found {}", other.type_name()),
            ));
        }
    }
    let mut builder = RegexBuilder::new(&source);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(Error::location(
                    codes::REGEX_BAD_OPTIONS,
                    format!("$regexMatch invalid flag in regex options: {other}"),
                ));
            }
        };
    }
    builder.build().map(Some).map_err(|e| {
        Error::location(
            codes::REGEX_BAD_PATTERN,
            format!("$regexMatch: invalid regular expression: {e}"),
        )
    })
}

fn input_array(value: Value, op: &str, code: i32) -> Result<Option<Vec<Value>>> {
    match value {
        v if v.is_nullish() => Ok(None),
        Value::Array(items) => Ok(Some(items)),
        other => Err(Error::location(
            code,
            format!("input to {op} must be an array not {}", other.type_name()),
        )),
    }
}

pub(super) fn evaluate(expr: &Expression, doc: &Document, vars: &mut Variables) -> Result<Value> {
    match expr {
        Expression::Constant(v) => Ok(v.clone()),
        Expression::FieldPath(path) => Ok(match vars.get(CURRENT_ID) {
            Some(current) => walk_path(current, path),
            None => walk_document(doc, path),
        }),
        Expression::Variable { id, name, path } => {
            let base = match *id {
                ROOT_ID => return Ok(walk_document(doc, path)),
                CURRENT_ID if vars.get(CURRENT_ID).is_none() => {
                    return Ok(walk_document(doc, path));
                }
                REMOVE_ID => return Ok(Value::Missing),
                KEEP_ID => Value::from(KEEP),
                PRUNE_ID => Value::from(PRUNE),
                DESCEND_ID => Value::from(DESCEND),
                id => vars.get(id).cloned().ok_or_else(|| {
                    Error::location(
                        codes::UNDEFINED_VARIABLE,
                        format!("Use of undefined variable: {name}"),
                    )
                })?,
            };
            Ok(walk_path(&base, path))
        }
        Expression::Object(fields) => {
            let mut out = Document::with_capacity(fields.len());
            for (name, e) in fields {
                out.insert(name.clone(), evaluate(e, doc, vars)?);
            }
            Ok(Value::Document(out))
        }
        Expression::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for e in items {
                out.push(evaluate(e, doc, vars)?.missing_to_null());
            }
            Ok(Value::Array(out))
        }
        Expression::Op { op, args } if op.is_lazy() => evaluate_lazy(*op, args, doc, vars),
        Expression::Op { op, args } => {
            let mut values = Vec::with_capacity(args.len());
            for e in args {
                values.push(evaluate(e, doc, vars)?);
            }
            op.apply(values, vars.collation())
        }
        Expression::Switch { branches, default } => {
            for (case, then) in branches {
                if evaluate(case, doc, vars)?.coerce_to_bool() {
                    return evaluate(then, doc, vars);
                }
            }
            match default {
                Some(d) => evaluate(d, doc, vars),
                None => Err(Error::location(
                    codes::SWITCH_NO_MATCH,
                    "$switch could not find a matching branch for an input, and no default was \
                     specified.",
                )),
            }
        }
        Expression::Map { input, var, body } => {
            let Some(items) = input_array(evaluate(input, doc, vars)?, "$map", codes::MAP_INPUT_NOT_ARRAY)?
            else {
                return Ok(Value::Null);
            };
            let mut out = Vec::with_capacity(items.len());
            let saved = vars.get(*var).cloned();
            for item in items {
                vars.set(*var, item);
                let r = evaluate(body, doc, vars);
                match r {
                    Ok(v) => out.push(v.missing_to_null()),
                    Err(e) => {
                        vars.restore(*var, saved);
                        return Err(e);
                    }
                }
            }
            vars.restore(*var, saved);
            Ok(Value::Array(out))
        }
        Expression::Filter {
            input,
            var,
            cond,
            limit,
        } => {
            let Some(items) = input_array(evaluate(input, doc, vars)?, "$filter", codes::FILTER_INPUT_NOT_ARRAY)?
            else {
                return Ok(Value::Null);
            };
            let limit = match limit {
                None => None,
                Some(l) => match evaluate(l, doc, vars)? {
                    v if v.is_nullish() => None,
                    v => match v.integral_i64() {
                        Some(n) if n > 0 => Some(n as usize),
                        _ => {
                            return Err(Error::location(
                                codes::FILTER_LIMIT_BAD,
                                format!("$filter: limit must be a positive integer, found {v}"),
                            ));
                        }
                    },
                },
            };
            let saved = vars.get(*var).cloned();
            let mut out = Vec::new();
            for item in items {
                if limit.is_some_and(|l| out.len() >= l) {
                    break;
                }
                vars.set(*var, item.clone());
                match evaluate(cond, doc, vars) {
                    Ok(keep) => {
                        if keep.coerce_to_bool() {
                            out.push(item);
                        }
                    }
                    Err(e) => {
                        vars.restore(*var, saved);
                        return Err(e);
                    }
                }
            }
            vars.restore(*var, saved);
            Ok(Value::Array(out))
        }
        Expression::Reduce {
            input,
            initial,
            this,
            value,
            body,
        } => {
            let Some(items) = input_array(evaluate(input, doc, vars)?, "$reduce", codes::REDUCE_INPUT_NOT_ARRAY)?
            else {
                return Ok(Value::Null);
            };
            let mut acc = evaluate(initial, doc, vars)?;
            let saved_this = vars.get(*this).cloned();
            let saved_value = vars.get(*value).cloned();
            let mut result = Ok(());
            for item in items {
                vars.set(*this, item);
                vars.set(*value, acc.clone());
                match evaluate(body, doc, vars) {
                    Ok(v) => acc = v,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            vars.restore(*this, saved_this);
            vars.restore(*value, saved_value);
            result.map(|_| acc)
        }
        Expression::Let { bindings, body } => {
            let mut values = Vec::with_capacity(bindings.len());
            for (id, e) in bindings {
                values.push((*id, evaluate(e, doc, vars)?));
            }
            let mut saved = Vec::with_capacity(values.len());
            for (id, v) in values {
                saved.push((id, vars.set(id, v)));
            }
            let result = evaluate(body, doc, vars);
            for (id, prev) in saved.into_iter().rev() {
                vars.restore(id, prev);
            }
            result
        }
        Expression::RegexMatch {
            input,
            regex,
            options,
            compiled,
        } => {
            let subject = evaluate(input, doc, vars)?;
            let owned;
            let re = match compiled {
                Some(re) => re,
                None => {
                    let pattern = evaluate(regex, doc, vars)?;
                    let opts = match options {
                        Some(o) => evaluate(o, doc, vars)?,
                        None => Value::Missing,
                    };
                    match compile_regex(&pattern, &opts)? {
                        Some(re) => {
                            owned = re;
                            &owned
                        }
                        None => return Ok(Value::Bool(false)),
                    }
                }
            };
            match subject {
                v if v.is_nullish() => Ok(Value::Bool(false)),
                Value::String(s) => Ok(Value::Bool(re.is_match(&s))),
                other => Err(Error::location(
                    codes::REGEX_INPUT_NOT_STRING,
                    format!("$regexMatch needs 'input' to be of type string, found {}", other.type_name()),
                )),
            }
        }
    }
}

fn evaluate_lazy(op: Operator, args: &[Expression], doc: &Document, vars: &mut Variables) -> Result<Value> {
    match op {
        Operator::And => {
            for e in args {
                if !evaluate(e, doc, vars)?.coerce_to_bool() {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        Operator::Or => {
            for e in args {
                if evaluate(e, doc, vars)?.coerce_to_bool() {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Operator::Cond => {
            let branch = if evaluate(&args[0], doc, vars)?.coerce_to_bool() {
                &args[1]
            } else {
                &args[2]
            };
            evaluate(branch, doc, vars)
        }
        Operator::IfNull => {
            let (last, rest) = args
                .split_last()
                .ok_or_else(|| Error::InvalidPipeline("$ifNull needs arguments".into()))?;
            for e in rest {
                let v = evaluate(e, doc, vars)?;
                if !v.is_nullish() {
                    return Ok(v);
                }
            }
            evaluate(last, doc, vars)
        }
        _ => {
            let mut values = Vec::with_capacity(args.len());
            for e in args {
                values.push(evaluate(e, doc, vars)?);
            }
            op.apply(values, vars.collation())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::VariablesParseState;
    use super::*;
    use crate::collation::Collation;
    use serde_json::json;

    fn eval_with(expr: serde_json::Value, doc: serde_json::Value, vars: &mut Variables) -> Result<Value> {
        let mut vps = VariablesParseState::new();
        let e = Expression::parse(&Value::from_json(&expr), &mut vps)?;
        let d = Document::from_json(&doc)?;
        e.evaluate(&d, vars)
    }

    fn eval(expr: serde_json::Value, doc: serde_json::Value) -> Result<Value> {
        eval_with(expr, doc, &mut Variables::default())
    }

    fn v(j: serde_json::Value) -> Value {
        Value::from_json(&j)
    }

    #[test]
    fn field_paths_map_over_arrays() {
        let doc = json!({"a": [{"b": 1}, {"b": [2, 3]}, {"c": 4}, 5, [{"b": 6}]]});
        assert_eq!(eval(json!("$a.b"), doc).unwrap(), v(json!([1, [2, 3], [6]])));
        assert_eq!(eval(json!("$x.y"), json!({"x": 1})).unwrap(), Value::Missing);
        assert_eq!(eval(json!("$x.y"), json!({})).unwrap(), Value::Missing);
    }

    #[test]
    fn missing_vs_null() {
        assert_eq!(eval(json!("$a"), json!({"a": null})).unwrap(), Value::Null);
        assert_eq!(eval(json!("$a"), json!({})).unwrap(), Value::Missing);
        assert_eq!(eval(json!(["$a"]), json!({})).unwrap(), v(json!([null])));
        assert_eq!(
            eval(json!({"x": "$a", "y": "$$REMOVE"}), json!({})).unwrap(),
            v(json!({}))
        );
    }

    #[test]
    fn cond_is_lazy() {
        let r = eval(
            json!({"$cond": {"if": {"$eq": ["$d", 0]}, "then": 0, "else": {"$divide": [1, "$d"]}}}),
            json!({"d": 0}),
        )
        .unwrap();
        assert_eq!(r, Value::Int32(0));
        let r = eval(json!({"$ifNull": ["$a", "$b", "fallback"]}), json!({"b": 2})).unwrap();
        assert_eq!(r, Value::Int32(2));
    }

    #[test]
    fn map_filter_reduce() {
        let doc = json!({"xs": [1, 2, 3, 4]});
        assert_eq!(
            eval(json!({"$map": {"input": "$xs", "as": "x", "in": {"$multiply": ["$$x", 10]}}}), doc.clone())
                .unwrap(),
            v(json!([10, 20, 30, 40]))
        );
        assert_eq!(
            eval(json!({"$filter": {"input": "$xs", "cond": {"$gt": ["$$this", 2]}, "limit": 1}}), doc.clone())
                .unwrap(),
            v(json!([3]))
        );
        assert_eq!(
            eval(
                json!({"$reduce": {"input": "$xs", "initialValue": 0, "in": {"$add": ["$$value", "$$this"]}}}),
                doc.clone()
            )
            .unwrap(),
            Value::Int32(10)
        );
        assert_eq!(
            eval(json!({"$map": {"input": "$nope", "in": 1}}), doc.clone()).unwrap(),
            Value::Null
        );
        assert_eq!(
            eval(json!({"$map": {"input": 5, "in": 1}}), doc).unwrap_err().code(),
            codes::MAP_INPUT_NOT_ARRAY
        );
    }

    #[test]
    fn let_binds_and_rebinds_current() {
        let r = eval(
            json!({"$let": {"vars": {"t": {"$add": ["$a", 1]}}, "in": {"$multiply": ["$$t", 2]}}}),
            json!({"a": 4}),
        )
        .unwrap();
        assert_eq!(r, Value::Int32(10));
        let r = eval(
            json!({"$let": {"vars": {"CURRENT": "$inner"}, "in": "$x"}}),
            json!({"x": 1, "inner": {"x": 2}}),
        )
        .unwrap();
        assert_eq!(r, Value::Int32(2));
    }

    #[test]
    fn switch_without_default_fails() {
        let err = eval(
            json!({"$switch": {"branches": [{"case": false, "then": 1}]}}),
            json!({}),
        )
        .unwrap_err();
        assert_eq!(err.code(), codes::SWITCH_NO_MATCH);
    }

    #[test]
    fn regex_match() {
        let r = eval(
            json!({"$regexMatch": {"input": "$s", "regex": "^ab", "options": "i"}}),
            json!({"s": "ABC"}),
        )
        .unwrap();
        assert_eq!(r, Value::Bool(true));
        let err = eval(json!({"$regexMatch": {"input": 5, "regex": "a"}}), json!({})).unwrap_err();
        assert_eq!(err.code(), codes::REGEX_INPUT_NOT_STRING);
        let err = eval(json!({"$regexMatch": {"input": "a", "regex": "("}}), json!({})).unwrap_err();
        assert_eq!(err.code(), codes::REGEX_BAD_PATTERN);
    }

    #[test]
    fn comparisons_honour_collation() {
        let collation = Collation {
            locale: "en".into(),
            strength: 2,
        };
        let mut vars = Variables::new(Some(collation));
        let r = eval_with(json!({"$eq": ["$s", "HELLO"]}), json!({"s": "hello"}), &mut vars).unwrap();
        assert_eq!(r, Value::Bool(true));
        let r = eval(json!({"$eq": ["$s", "HELLO"]}), json!({"s": "hello"})).unwrap();
        assert_eq!(r, Value::Bool(false));
    }

    #[test]
    fn redact_variables_evaluate_to_markers() {
        assert_eq!(eval(json!("$$KEEP"), json!({})).unwrap(), Value::from(KEEP));
        assert_eq!(eval(json!("$$PRUNE"), json!({})).unwrap(), Value::from(PRUNE));
    }
}
