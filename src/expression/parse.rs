use regex::Regex;

use super::{
    CURRENT_ID, DESCEND_ID, Expression, FIRST_USER_ID, KEEP_ID, Operator, PRUNE_ID, REMOVE_ID,
    ROOT_ID, VariableId, eval,
};
use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::value::Value;

const BUILTIN_VARIABLES: &[(&str, VariableId)] = &[
    ("ROOT", ROOT_ID),
    ("CURRENT", CURRENT_ID),
    ("REMOVE", REMOVE_ID),
    ("KEEP", KEEP_ID),
    ("PRUNE", PRUNE_ID),
    ("DESCEND", DESCEND_ID),
];

/// Scoped name → id table used while parsing one pipeline.
#[derive(Debug, Clone)]
pub struct VariablesParseState {
    scopes: Vec<Vec<(String, VariableId)>>,
    next_id: VariableId,
}

impl Default for VariablesParseState {
    fn default() -> Self {
        Self::new()
    }
}

/// User variable names start with a lower-case letter or a non-ASCII
/// character and continue with letters, digits, `_` or non-ASCII characters.
pub fn validate_user_variable_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(Error::location(
            codes::INVALID_USER_VARIABLE,
            "empty variable names are not allowed",
        ));
    };
    if !(first.is_ascii_lowercase() || !first.is_ascii()) {
        return Err(Error::location(
            codes::INVALID_USER_VARIABLE,
            format!("'{name}' starts with an invalid character for a user variable name"),
        ));
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || !c.is_ascii())) {
        return Err(Error::location(
            codes::INVALID_USER_VARIABLE,
            format!("'{name}' contains an invalid character for a variable name: '{bad}'"),
        ));
    }
    Ok(())
}

impl VariablesParseState {
    pub fn new() -> Self {
        Self {
            scopes: vec![Vec::new()],
            next_id: FIRST_USER_ID,
        }
    }

    /// Define a user variable in the innermost scope.
    pub fn define(&mut self, name: &str) -> Result<VariableId> {
        validate_user_variable_name(name)?;
        let id = self.next_id;
        self.next_id += 1;
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((name.to_string(), id));
        }
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Result<VariableId> {
        for scope in self.scopes.iter().rev() {
            if let Some((_, id)) = scope.iter().rev().find(|(n, _)| n == name) {
                return Ok(*id);
            }
        }
        BUILTIN_VARIABLES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, id)| *id)
            .ok_or_else(|| {
                Error::location(
                    codes::UNDEFINED_VARIABLE,
                    format!("Use of undefined variable: {name}"),
                )
            })
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Ids handed out so far; runtime `Variables` never need more slots.
    pub fn variable_count(&self) -> usize {
        self.next_id
    }
}

fn bad(msg: impl Into<String>) -> Error {
    Error::InvalidPipeline(msg.into())
}

fn split_path(path: &str, context: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Err(bad(format!("{context}: field path cannot be empty")));
    }
    let parts: Vec<String> = path.split('.').map(str::to_string).collect();
    if parts.iter().any(String::is_empty) {
        return Err(bad(format!(
            "{context}: field path '{path}' contains an empty component"
        )));
    }
    if parts.iter().any(|p| p.starts_with('$')) {
        return Err(bad(format!(
            "{context}: field path component may not start with '$': '{path}'"
        )));
    }
    Ok(parts)
}

pub(super) fn parse_expression(value: &Value, vps: &mut VariablesParseState) -> Result<Expression> {
    match value {
        Value::String(s) if s.starts_with("$$") => {
            let body = &s[2..];
            let (name, rest) = match body.split_once('.') {
                Some((n, r)) => (n, Some(r)),
                None => (body, None),
            };
            let id = vps.lookup(name)?;
            let path = match rest {
                Some(r) => split_path(r, s)?,
                None => Vec::new(),
            };
            Ok(Expression::Variable {
                id,
                name: name.to_string(),
                path,
            })
        }
        Value::String(s) if s.starts_with('$') => Ok(Expression::FieldPath(split_path(&s[1..], s)?)),
        Value::Document(doc) => parse_document(doc, vps),
        Value::Array(items) => Ok(Expression::Array(
            items
                .iter()
                .map(|item| parse_expression(item, vps))
                .collect::<Result<_>>()?,
        )),
        other => Ok(Expression::Constant(other.clone())),
    }
}

fn parse_document(doc: &Document, vps: &mut VariablesParseState) -> Result<Expression> {
    let first_is_op = doc.keys().next().is_some_and(|k| k.starts_with('$'));
    if first_is_op {
        if doc.len() != 1 {
            return Err(Error::location(
                codes::FIELD_NAME_DOLLAR,
                "an expression specification must contain exactly one field, the name of the \
                 expression",
            ));
        }
        let (name, arg) = doc
            .iter()
            .next()
            .ok_or_else(|| bad("empty operator document"))?;
        return parse_operator(name, arg, vps);
    }
    let mut fields = Vec::with_capacity(doc.len());
    for (name, spec) in doc {
        if name.starts_with('$') {
            return Err(Error::location(
                codes::FIELD_NAME_DOLLAR,
                format!("field names may not start with '$': '{name}'"),
            ));
        }
        if name.contains('.') {
            return Err(Error::location(
                codes::FIELD_PATH_DOTTED,
                format!("field names may not contain '.': '{name}'"),
            ));
        }
        fields.push((name.clone(), parse_expression(spec, vps)?));
    }
    Ok(Expression::Object(fields))
}

fn named_args<'a>(op: &str, arg: &'a Value, allowed: &[&str]) -> Result<&'a Document> {
    let Value::Document(doc) = arg else {
        return Err(bad(format!("{op} only supports an object as its argument")));
    };
    if let Some(unknown) = doc.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(bad(format!("{op}: unrecognized parameter '{unknown}'")));
    }
    Ok(doc)
}

fn required<'a>(op: &str, doc: &'a Document, name: &str) -> Result<&'a Value> {
    doc.get(name)
        .ok_or_else(|| bad(format!("{op} requires '{name}' to be specified")))
}

fn variable_name<'a>(op: &str, doc: &'a Document, name: &str) -> Result<&'a str> {
    match doc.get(name) {
        None => Ok("this"),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(bad(format!(
            "{op}: '{name}' must be a string, found {}",
            other.type_name()
        ))),
    }
}

fn boxed(value: &Value, vps: &mut VariablesParseState) -> Result<Box<Expression>> {
    Ok(Box::new(parse_expression(value, vps)?))
}

fn parse_operator(name: &str, arg: &Value, vps: &mut VariablesParseState) -> Result<Expression> {
    match name {
        "$literal" => Ok(Expression::Constant(arg.clone())),
        "$let" => {
            let doc = named_args(name, arg, &["vars", "in"])?;
            let Value::Document(vars) = required(name, doc, "vars")? else {
                return Err(bad("$let: 'vars' must be an object"));
            };
            let body_spec = required(name, doc, "in")?;
            // Bindings are parsed in the enclosing scope.
            let mut parsed = Vec::with_capacity(vars.len());
            for (var, spec) in vars {
                parsed.push((var.clone(), parse_expression(spec, vps)?));
            }
            vps.push_scope();
            let mut bindings = Vec::with_capacity(parsed.len());
            for (var, expr) in parsed {
                let id = if var == "CURRENT" {
                    CURRENT_ID
                } else {
                    match vps.define(&var) {
                        Ok(id) => id,
                        Err(e) => {
                            vps.pop_scope();
                            return Err(e);
                        }
                    }
                };
                bindings.push((id, expr));
            }
            let body = parse_expression(body_spec, vps);
            vps.pop_scope();
            Ok(Expression::Let {
                bindings,
                body: Box::new(body?),
            })
        }
        "$map" => {
            let doc = named_args(name, arg, &["input", "as", "in"])?;
            let input = boxed(required(name, doc, "input")?, vps)?;
            let var_name = variable_name(name, doc, "as")?;
            let body_spec = required(name, doc, "in")?;
            vps.push_scope();
            let parsed = vps
                .define(var_name)
                .and_then(|var| Ok((var, boxed(body_spec, vps)?)));
            vps.pop_scope();
            let (var, body) = parsed?;
            Ok(Expression::Map { input, var, body })
        }
        "$filter" => {
            let doc = named_args(name, arg, &["input", "as", "cond", "limit"])?;
            let input = boxed(required(name, doc, "input")?, vps)?;
            let limit = doc.get("limit").map(|l| boxed(l, vps)).transpose()?;
            let var_name = variable_name(name, doc, "as")?;
            let cond_spec = required(name, doc, "cond")?;
            vps.push_scope();
            let parsed = vps
                .define(var_name)
                .and_then(|var| Ok((var, boxed(cond_spec, vps)?)));
            vps.pop_scope();
            let (var, cond) = parsed?;
            Ok(Expression::Filter {
                input,
                var,
                cond,
                limit,
            })
        }
        "$reduce" => {
            let doc = named_args(name, arg, &["input", "initialValue", "in"])?;
            let input = boxed(required(name, doc, "input")?, vps)?;
            let initial = boxed(required(name, doc, "initialValue")?, vps)?;
            let body_spec = required(name, doc, "in")?;
            vps.push_scope();
            let parsed = vps.define("this").and_then(|this| {
                let value = vps.define("value")?;
                Ok((this, value, boxed(body_spec, vps)?))
            });
            vps.pop_scope();
            let (this, value, body) = parsed?;
            Ok(Expression::Reduce {
                input,
                initial,
                this,
                value,
                body,
            })
        }
        "$cond" => {
            let args = match arg {
                Value::Document(_) => {
                    let doc = named_args(name, arg, &["if", "then", "else"])?;
                    vec![
                        parse_expression(required(name, doc, "if")?, vps)?,
                        parse_expression(required(name, doc, "then")?, vps)?,
                        parse_expression(required(name, doc, "else")?, vps)?,
                    ]
                }
                _ => parse_args(Operator::Cond, arg, vps)?,
            };
            Ok(Expression::Op {
                op: Operator::Cond,
                args,
            })
        }
        "$switch" => {
            let doc = named_args(name, arg, &["branches", "default"])?;
            let Value::Array(specs) = required(name, doc, "branches")? else {
                return Err(bad("$switch expected an array for 'branches'"));
            };
            let mut branches = Vec::with_capacity(specs.len());
            for spec in specs {
                let branch = named_args("$switch branch", spec, &["case", "then"])?;
                branches.push((
                    parse_expression(required("$switch", branch, "case")?, vps)?,
                    parse_expression(required("$switch", branch, "then")?, vps)?,
                ));
            }
            if branches.is_empty() {
                return Err(bad("$switch requires at least one branch"));
            }
            let default = doc.get("default").map(|d| boxed(d, vps)).transpose()?;
            Ok(Expression::Switch { branches, default })
        }
        "$regexMatch" => {
            let doc = named_args(name, arg, &["input", "regex", "options"])?;
            let input = boxed(required(name, doc, "input")?, vps)?;
            let regex = boxed(required(name, doc, "regex")?, vps)?;
            let options = doc.get("options").map(|o| boxed(o, vps)).transpose()?;
            let compiled = match (regex.as_constant(), options.as_deref()) {
                (Some(pattern), None) => Some(eval::compile_regex(pattern, &Value::Missing)?),
                (Some(pattern), Some(Expression::Constant(opts))) => {
                    Some(eval::compile_regex(pattern, opts)?)
                }
                _ => None,
            }
            .flatten();
            Ok(Expression::RegexMatch {
                input,
                regex,
                options,
                compiled,
            })
        }
        _ => {
            let op =
                Operator::from_name(name).ok_or_else(|| Error::UnknownExpression(name.to_string()))?;
            let args = parse_args(op, arg, vps)?;
            Ok(Expression::Op { op, args })
        }
    }
}

fn is_date_operator(op: Operator) -> bool {
    matches!(
        op,
        Operator::Year
            | Operator::Month
            | Operator::DayOfMonth
            | Operator::Hour
            | Operator::Minute
            | Operator::Second
    )
}

fn parse_args(op: Operator, arg: &Value, vps: &mut VariablesParseState) -> Result<Vec<Expression>> {
    let args = match arg {
        Value::Document(doc) if is_date_operator(op) && doc.contains_key("date") => {
            let doc = named_args(op.name(), arg, &["date", "timezone"])?;
            let mut args = vec![parse_expression(required(op.name(), doc, "date")?, vps)?];
            if let Some(tz) = doc.get("timezone") {
                args.push(parse_expression(tz, vps)?);
            }
            args
        }
        Value::Array(items) => items
            .iter()
            .map(|item| parse_expression(item, vps))
            .collect::<Result<Vec<_>>>()?,
        single => vec![parse_expression(single, vps)?],
    };
    let (min, max) = op.arity();
    let ok = args.len() >= min && max.is_none_or(|m| args.len() <= m);
    if !ok {
        let expected = match max {
            Some(m) if m == min => format!("exactly {min}"),
            Some(m) => format!("between {min} and {m}"),
            None => format!("at least {min}"),
        };
        return Err(Error::location(
            codes::WRONG_ARITY,
            format!(
                "Expression {} takes {expected} arguments. {} were passed in.",
                op.name(),
                args.len()
            ),
        ));
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(j: serde_json::Value) -> Result<Expression> {
        let mut vps = VariablesParseState::new();
        parse_expression(&Value::from_json(&j), &mut vps)
    }

    #[test]
    fn rejects_reserved_variable_definitions() {
        let err = parse(json!({"$let": {"vars": {"ROOT": 1}, "in": "$$ROOT"}})).unwrap_err();
        assert_eq!(err.code(), codes::INVALID_USER_VARIABLE);
        let err = parse(json!({"$map": {"input": [], "as": "Item", "in": 1}})).unwrap_err();
        assert_eq!(err.code(), codes::INVALID_USER_VARIABLE);
        assert!(parse(json!({"$let": {"vars": {"CURRENT": "$a"}, "in": "$b"}})).is_ok());
    }

    #[test]
    fn undefined_variable() {
        let err = parse(json!("$$nope")).unwrap_err();
        assert_eq!(err.code(), codes::UNDEFINED_VARIABLE);
        // Scope ends with the defining expression.
        let err = parse(json!([
            {"$map": {"input": [], "as": "x", "in": "$$x"}},
            "$$x"
        ]))
        .unwrap_err();
        assert_eq!(err.code(), codes::UNDEFINED_VARIABLE);
    }

    #[test]
    fn arity_is_checked_at_parse_time() {
        let err = parse(json!({"$subtract": [1]})).unwrap_err();
        assert_eq!(err.code(), codes::WRONG_ARITY);
        assert!(parse(json!({"$abs": -1})).is_ok());
        assert!(parse(json!({"$year": {"date": "$d", "timezone": "+01:00"}})).is_ok());
    }

    #[test]
    fn unknown_operator() {
        let err = parse(json!({"$frobnicate": 1})).unwrap_err();
        assert_eq!(err.code(), 168);
    }

    #[test]
    fn bad_field_paths() {
        assert!(parse(json!("$")).is_err());
        assert!(parse(json!("$a..b")).is_err());
        assert_eq!(parse(json!({"a.b": 1})).unwrap_err().code(), codes::FIELD_PATH_DOTTED);
        assert!(parse(json!({"$add": [1], "x": 2})).is_err());
    }
}
