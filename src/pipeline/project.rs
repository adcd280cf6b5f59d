//! `$project`, `$addFields`/`$set` and `$unset`.

use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::expression::{DepsTracker, Expression, Variables, VariablesParseState};
use crate::value::Value;

#[derive(Debug, Clone)]
enum FieldSpec {
    Include,
    Exclude,
    Computed(Expression),
    Nested(Vec<(String, FieldSpec)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionMode {
    Inclusion,
    Exclusion,
}

/// A parsed `$project` (or the exclusion produced by `$unset`).
#[derive(Debug, Clone)]
pub struct Projection {
    mode: ProjectionMode,
    fields: Vec<(String, FieldSpec)>,
    exclude_id: bool,
    source: Document,
}

fn is_operator_object(v: &Value) -> bool {
    matches!(v, Value::Document(d) if d.len() == 1 && d.keys().all(|k| k.starts_with('$')))
}

fn as_flag(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        v if v.is_numeric() => v.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

/// Insert `spec` under a dotted path, creating nested nodes as needed.
fn insert_path(fields: &mut Vec<(String, FieldSpec)>, path: &str, spec: FieldSpec) -> Result<()> {
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, Some(r)),
        None => (path, None),
    };
    if head.is_empty() || head.starts_with('$') {
        return Err(Error::location(
            codes::FIELD_NAME_DOLLAR,
            format!("invalid projection field name '{path}'"),
        ));
    }
    let pos = fields.iter().position(|(k, _)| k == head);
    match rest {
        None => {
            if pos.is_some() {
                return Err(Error::InvalidPipeline(format!("path collision at '{path}'")));
            }
            fields.push((head.to_string(), spec));
        }
        Some(rest) => {
            let idx = match pos {
                Some(i) => i,
                None => {
                    fields.push((head.to_string(), FieldSpec::Nested(Vec::new())));
                    fields.len() - 1
                }
            };
            match &mut fields[idx].1 {
                FieldSpec::Nested(children) => insert_path(children, rest, spec)?,
                _ => return Err(Error::InvalidPipeline(format!("path collision at '{path}'"))),
            }
        }
    }
    Ok(())
}

impl Projection {
    pub fn parse(spec: &Value, vps: &mut VariablesParseState) -> Result<Self> {
        let Value::Document(doc) = spec else {
            return Err(Error::InvalidPipeline("$project specification must be an object".into()));
        };
        if doc.is_empty() {
            return Err(Error::location(
                codes::PROJECT_EMPTY,
                "$project specification must have at least one field",
            ));
        }
        let mut fields = Vec::new();
        let mut mode: Option<ProjectionMode> = None;
        let mut exclude_id = false;
        parse_level(doc, "", vps, &mut fields, &mut mode, &mut exclude_id)?;
        Ok(Self {
            // `{_id: 0}` alone is an exclusion.
            mode: mode.unwrap_or(ProjectionMode::Exclusion),
            fields,
            exclude_id,
            source: doc.clone(),
        })
    }

    /// `$unset`: a string or an array of strings.
    pub fn unset(spec: &Value) -> Result<Self> {
        let names: Vec<String> = match spec {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) if !items.is_empty() => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        Error::InvalidPipeline("$unset specification must be a string or an array of strings".into())
                    })
                })
                .collect::<Result<_>>()?,
            _ => {
                return Err(Error::InvalidPipeline(
                    "$unset specification must be a string or an array of strings".into(),
                ));
            }
        };
        Self::exclusion(&names)
    }

    pub fn exclusion(paths: &[String]) -> Result<Self> {
        let mut fields = Vec::new();
        let mut source = Document::new();
        let mut exclude_id = false;
        for path in paths {
            if path == "_id" {
                exclude_id = true;
            } else {
                insert_path(&mut fields, path, FieldSpec::Exclude)?;
            }
            source.insert(path.clone(), Value::Int32(0));
        }
        Ok(Self {
            mode: ProjectionMode::Exclusion,
            fields,
            exclude_id,
            source,
        })
    }

    pub fn mode(&self) -> ProjectionMode {
        self.mode
    }

    pub fn source(&self) -> &Document {
        &self.source
    }

    /// Top-level paths excluded by an exclusion projection.
    pub fn excluded_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.exclude_id {
            out.push("_id".to_string());
        }
        collect_excluded(&self.fields, "", &mut out);
        out
    }

    /// Combine two adjacent exclusion projections.
    pub fn coalesce_exclusion(&self, next: &Projection) -> Option<Projection> {
        if self.mode != ProjectionMode::Exclusion || next.mode != ProjectionMode::Exclusion {
            return None;
        }
        let mut paths = self.excluded_paths();
        for p in next.excluded_paths() {
            if !paths.contains(&p) {
                paths.push(p);
            }
        }
        Projection::exclusion(&paths).ok()
    }

    pub fn add_dependencies(&self, deps: &mut DepsTracker) {
        match self.mode {
            ProjectionMode::Exclusion => deps.needs_whole_document = true,
            ProjectionMode::Inclusion => {
                if !self.exclude_id {
                    deps.fields.insert("_id".into());
                }
                add_spec_dependencies(&self.fields, &mut Vec::new(), deps);
            }
        }
    }

    pub fn apply(&self, doc: &Document, vars: &mut Variables) -> Result<Document> {
        match self.mode {
            ProjectionMode::Exclusion => {
                let mut out = doc.clone();
                if self.exclude_id {
                    out.remove("_id");
                }
                exclude_level(&mut out, &self.fields);
                Ok(out)
            }
            ProjectionMode::Inclusion => {
                let mut out = Document::new();
                if !self.exclude_id && !self.fields.iter().any(|(k, _)| k == "_id") {
                    if let Some(id) = doc.get("_id") {
                        out.insert("_id", id.clone());
                    }
                }
                include_level(doc, doc, &self.fields, vars, &mut out)?;
                Ok(out)
            }
        }
    }
}

fn set_mode(mode: &mut Option<ProjectionMode>, m: ProjectionMode, path: &str) -> Result<()> {
    match mode {
        Some(existing) if *existing != m => Err(Error::location(
            codes::PROJECT_MIXED,
            format!("invalid $project: cannot mix inclusion and exclusion at '{path}'"),
        )),
        _ => {
            *mode = Some(m);
            Ok(())
        }
    }
}

fn parse_level(
    doc: &Document,
    prefix: &str,
    vps: &mut VariablesParseState,
    fields: &mut Vec<(String, FieldSpec)>,
    mode: &mut Option<ProjectionMode>,
    exclude_id: &mut bool,
) -> Result<()> {
    for (key, value) in doc {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if path == "_id" && as_flag(value) == Some(false) {
            *exclude_id = true;
            continue;
        }
        if let Some(flag) = as_flag(value) {
            if flag {
                set_mode(mode, ProjectionMode::Inclusion, &path)?;
                insert_path(fields, &path, FieldSpec::Include)?;
            } else {
                set_mode(mode, ProjectionMode::Exclusion, &path)?;
                insert_path(fields, &path, FieldSpec::Exclude)?;
            }
            continue;
        }
        match value {
            Value::Document(sub) if !sub.is_empty() && !is_operator_object(value) => {
                parse_level(sub, &path, vps, fields, mode, exclude_id)?;
            }
            _ => {
                set_mode(mode, ProjectionMode::Inclusion, &path)?;
                let expr = Expression::parse(value, vps)
                    .map_err(|e| e.context(format!("$project field '{path}'")))?
                    .optimize();
                insert_path(fields, &path, FieldSpec::Computed(expr))?;
            }
        }
    }
    Ok(())
}

fn collect_excluded(fields: &[(String, FieldSpec)], prefix: &str, out: &mut Vec<String>) {
    for (k, spec) in fields {
        let path = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match spec {
            FieldSpec::Exclude => out.push(path),
            FieldSpec::Nested(children) => collect_excluded(children, &path, out),
            _ => {}
        }
    }
}

fn add_spec_dependencies(fields: &[(String, FieldSpec)], prefix: &mut Vec<String>, deps: &mut DepsTracker) {
    for (k, spec) in fields {
        prefix.push(k.clone());
        match spec {
            FieldSpec::Include => deps.add_path(prefix),
            FieldSpec::Computed(e) => e.add_dependencies(deps),
            FieldSpec::Nested(children) => add_spec_dependencies(children, prefix, deps),
            FieldSpec::Exclude => {}
        }
        prefix.pop();
    }
}

fn exclude_level(doc: &mut Document, fields: &[(String, FieldSpec)]) {
    for (k, spec) in fields {
        match spec {
            FieldSpec::Exclude => {
                doc.remove(k);
            }
            FieldSpec::Nested(children) => match doc.get_mut(k) {
                Some(Value::Document(sub)) => exclude_level(sub, children),
                Some(Value::Array(items)) => exclude_array(items, children),
                _ => {}
            },
            _ => {}
        }
    }
}

fn exclude_array(items: &mut [Value], fields: &[(String, FieldSpec)]) {
    for item in items {
        match item {
            Value::Document(sub) => exclude_level(sub, fields),
            Value::Array(inner) => exclude_array(inner, fields),
            _ => {}
        }
    }
}

/// Included fields keep the input document's order; computed fields that
/// are not present in the input follow in specification order.
fn include_level(
    root: &Document,
    doc: &Document,
    fields: &[(String, FieldSpec)],
    vars: &mut Variables,
    out: &mut Document,
) -> Result<()> {
    for (key, value) in doc {
        let Some((_, spec)) = fields.iter().find(|(k, _)| k == key) else {
            continue;
        };
        match spec {
            FieldSpec::Include => out.insert(key.clone(), value.clone()),
            FieldSpec::Nested(children) => {
                if let Some(v) = include_nested(root, value, children, vars)? {
                    out.insert(key.clone(), v);
                }
            }
            FieldSpec::Computed(_) | FieldSpec::Exclude => {}
        }
    }
    for (key, spec) in fields {
        match spec {
            FieldSpec::Computed(expr) => {
                let v = expr.evaluate(root, vars)?;
                out.insert(key.clone(), v);
            }
            FieldSpec::Nested(children) if !doc.contains_key(key) && has_computed(children) => {
                let mut sub = Document::new();
                include_level(root, &Document::new(), children, vars, &mut sub)?;
                out.insert(key.clone(), Value::Document(sub));
            }
            _ => {}
        }
    }
    Ok(())
}

fn include_nested(
    root: &Document,
    value: &Value,
    children: &[(String, FieldSpec)],
    vars: &mut Variables,
) -> Result<Option<Value>> {
    match value {
        Value::Document(sub) => {
            let mut out = Document::new();
            include_level(root, sub, children, vars, &mut out)?;
            Ok(Some(Value::Document(out)))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(v) = include_nested(root, item, children, vars)? {
                    out.push(v);
                }
            }
            Ok(Some(Value::Array(out)))
        }
        // Scalars under a nested inclusion are dropped unless something is
        // computed there.
        _ if has_computed(children) => {
            let mut out = Document::new();
            include_level(root, &Document::new(), children, vars, &mut out)?;
            Ok(Some(Value::Document(out)))
        }
        _ => Ok(None),
    }
}

fn has_computed(fields: &[(String, FieldSpec)]) -> bool {
    fields.iter().any(|(_, s)| match s {
        FieldSpec::Computed(_) => true,
        FieldSpec::Nested(children) => has_computed(children),
        _ => false,
    })
}

// ---------------------------------------------------------------------------
// $addFields / $set
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AddFields {
    fields: Vec<(String, Expression)>,
    source: Document,
}

fn flatten_add_fields(
    doc: &Document,
    prefix: &str,
    vps: &mut VariablesParseState,
    out: &mut Vec<(String, Expression)>,
) -> Result<()> {
    for (key, value) in doc {
        if key.starts_with('$') {
            return Err(Error::location(
                codes::FIELD_NAME_DOLLAR,
                format!("field name '{key}' cannot start with '$'"),
            ));
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Document(sub) if !sub.is_empty() && !is_operator_object(value) => {
                flatten_add_fields(sub, &path, vps, out)?;
            }
            _ => {
                let expr = Expression::parse(value, vps)
                    .map_err(|e| e.context(format!("$addFields field '{path}'")))?
                    .optimize();
                out.push((path, expr));
            }
        }
    }
    Ok(())
}

impl AddFields {
    pub fn parse(spec: &Value, vps: &mut VariablesParseState) -> Result<Self> {
        let Value::Document(doc) = spec else {
            return Err(Error::InvalidPipeline("$addFields specification must be an object".into()));
        };
        let mut fields = Vec::new();
        flatten_add_fields(doc, "", vps, &mut fields)?;
        Ok(Self {
            fields,
            source: doc.clone(),
        })
    }

    pub fn source(&self) -> &Document {
        &self.source
    }

    /// Dotted paths this stage writes.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(p, _)| p.as_str())
    }

    pub fn add_dependencies(&self, deps: &mut DepsTracker) {
        for (_, e) in &self.fields {
            e.add_dependencies(deps);
        }
    }

    /// Merge `next` into `self` when `next` neither reads nor rewrites
    /// anything `self` writes.
    pub fn coalesce(&self, next: &AddFields) -> Option<AddFields> {
        let mut deps = DepsTracker::default();
        next.add_dependencies(&mut deps);
        if !deps.independent_of(self.paths()) {
            return None;
        }
        let overlaps = next.paths().any(|p| {
            self.paths()
                .any(|q| crate::expression::paths_overlap(p, q))
        });
        if overlaps {
            return None;
        }
        let mut fields = self.fields.clone();
        fields.extend(next.fields.iter().cloned());
        let mut source = self.source.clone();
        for (k, v) in &next.source {
            source.insert(k.clone(), v.clone());
        }
        Some(AddFields { fields, source })
    }

    /// All expressions see the input document; results are written after.
    pub fn apply(&self, doc: &Document, vars: &mut Variables) -> Result<Document> {
        let mut values = Vec::with_capacity(self.fields.len());
        for (_, expr) in &self.fields {
            values.push(expr.evaluate(doc, vars)?);
        }
        let mut out = doc.clone();
        for ((path, _), value) in self.fields.iter().zip(values) {
            if value.is_missing() {
                out.remove_path(path);
            } else {
                out.set_path(path, value);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_json(&v).unwrap()
    }

    fn project(spec: serde_json::Value, input: serde_json::Value) -> serde_json::Value {
        let mut vps = VariablesParseState::new();
        let p = Projection::parse(&Value::from_json(&spec), &mut vps).unwrap();
        p.apply(&doc(input), &mut Variables::default()).unwrap().to_json()
    }

    #[test]
    fn inclusion_keeps_id_and_input_order() {
        let out = project(json!({"b": 1, "a": 1}), json!({"_id": 1, "a": 2, "b": 3, "c": 4}));
        assert_eq!(out, json!({"_id": 1, "a": 2, "b": 3}));
        let keys: Vec<_> = out.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["_id", "a", "b"]);
    }

    #[test]
    fn exclusion_and_id_suppression() {
        assert_eq!(
            project(json!({"c": 0, "_id": 0}), json!({"_id": 1, "a": 2, "c": 4})),
            json!({"a": 2})
        );
        assert_eq!(project(json!({"_id": 0}), json!({"_id": 1, "a": 2})), json!({"a": 2}));
    }

    #[test]
    fn nested_and_computed_fields() {
        let out = project(
            json!({"a.x": 1, "total": {"$add": ["$n", 1]}, "meta": {"src": {"$literal": "t"}}}),
            json!({"_id": 7, "a": [{"x": 1, "y": 2}, {"y": 3}, 5], "n": 41}),
        );
        assert_eq!(
            out,
            json!({"_id": 7, "a": [{"x": 1}, {}], "total": 42, "meta": {"src": "t"}})
        );
    }

    #[test]
    fn mixed_and_empty_projections_rejected() {
        let mut vps = VariablesParseState::new();
        let err = Projection::parse(&Value::from_json(&json!({"a": 1, "b": 0})), &mut vps).unwrap_err();
        assert_eq!(err.code(), codes::PROJECT_MIXED);
        let err = Projection::parse(&Value::from_json(&json!({})), &mut vps).unwrap_err();
        assert_eq!(err.code(), codes::PROJECT_EMPTY);
    }

    #[test]
    fn unset_removes_paths() {
        let p = Projection::unset(&Value::from_json(&json!(["a.b", "c"]))).unwrap();
        let out = p
            .apply(&doc(json!({"a": {"b": 1, "k": 2}, "c": 3, "d": 4})), &mut Variables::default())
            .unwrap();
        assert_eq!(out.to_json(), json!({"a": {"k": 2}, "d": 4}));
    }

    #[test]
    fn add_fields_sees_original_document() {
        let mut vps = VariablesParseState::new();
        let a = AddFields::parse(
            &Value::from_json(&json!({"a": {"$add": ["$a", 1]}, "b": "$a", "n.m": 5, "gone": "$$REMOVE"})),
            &mut vps,
        )
        .unwrap();
        let out = a
            .apply(&doc(json!({"a": 1, "gone": true})), &mut Variables::default())
            .unwrap();
        assert_eq!(out.to_json(), json!({"a": 2, "b": 1, "n": {"m": 5}}));
    }

    #[test]
    fn add_fields_coalesce_requires_independence() {
        let mut vps = VariablesParseState::new();
        let first = AddFields::parse(&Value::from_json(&json!({"x": 1})), &mut vps).unwrap();
        let independent = AddFields::parse(&Value::from_json(&json!({"y": "$z"})), &mut vps).unwrap();
        let dependent = AddFields::parse(&Value::from_json(&json!({"y": "$x"})), &mut vps).unwrap();
        assert!(first.coalesce(&independent).is_some());
        assert!(first.coalesce(&dependent).is_none());
    }
}
