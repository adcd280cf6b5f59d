use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::expression::{DepsTracker, Expression, VariableId, VariablesParseState};
use crate::group::GroupSpec;
use crate::matcher::Matcher;
use crate::sink::{OutputTarget, WhenMatched, WhenNotMatched};
use crate::value::{Value, compare_values};

use super::project::{AddFields, Projection};
use super::sort::SortSpec;
use super::unpack_bucket::UnpackBucketSpec;

// ---------------------------------------------------------------------------
// Stage specifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindSpec {
    /// Dotted path without the leading `$`.
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqualityJoin {
    pub local_field: String,
    pub foreign_field: String,
}

#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub from: String,
    pub as_field: String,
    /// `localField`/`foreignField`. With a pipeline it pre-filters the
    /// foreign documents the pipeline sees.
    pub join: Option<EqualityJoin>,
    /// `let` bindings, evaluated against each local document.
    pub let_vars: Vec<(VariableId, Expression)>,
    pub pipeline: Option<Vec<Stage>>,
    pub source: Value,
}

#[derive(Debug, Clone)]
pub struct GraphLookupSpec {
    pub from: String,
    pub start_with: Expression,
    pub connect_from_field: String,
    pub connect_to_field: String,
    pub as_field: String,
    pub max_depth: Option<u64>,
    pub depth_field: Option<String>,
    pub restrict_search_with_match: Option<Matcher>,
    pub source: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSpec {
    pub into: OutputTarget,
    pub on: Vec<String>,
    pub when_matched: WhenMatched,
    pub when_not_matched: WhenNotMatched,
}

#[derive(Debug, Clone)]
pub enum Stage {
    Match(Matcher),
    Project(Projection),
    AddFields(AddFields),
    Unwind(UnwindSpec),
    ReplaceRoot { expr: Expression, source: Value },
    Redact { expr: Expression, source: Value },
    Group { spec: GroupSpec, source: Value },
    Sort(SortSpec),
    Skip(u64),
    Limit(u64),
    Lookup(LookupSpec),
    GraphLookup(GraphLookupSpec),
    UnpackBucket(UnpackBucketSpec),
    Facet(Vec<(String, Vec<Stage>)>),
    Sample(u64),
    Out(OutputTarget),
    Merge(MergeSpec),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Unwind(_) => "$unwind",
            Stage::ReplaceRoot { .. } => "$replaceRoot",
            Stage::Redact { .. } => "$redact",
            Stage::Group { .. } => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
            Stage::Lookup(_) => "$lookup",
            Stage::GraphLookup(_) => "$graphLookup",
            Stage::UnpackBucket(_) => "$_internalUnpackBucket",
            Stage::Facet(_) => "$facet",
            Stage::Sample(_) => "$sample",
            Stage::Out(_) => "$out",
            Stage::Merge(_) => "$merge",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Out(_) | Stage::Merge(_))
    }

    /// Fields this stage reads from its input.
    pub fn add_dependencies(&self, deps: &mut DepsTracker) {
        match self {
            Stage::Match(m) => m.add_dependencies(deps),
            Stage::Project(p) => p.add_dependencies(deps),
            Stage::AddFields(a) => a.add_dependencies(deps),
            Stage::Unwind(u) => {
                deps.fields.insert(u.path.clone());
            }
            Stage::Group { spec, .. } => {
                spec.id.add_dependencies(deps);
                for acc in &spec.accumulators {
                    acc.argument.add_dependencies(deps);
                }
            }
            Stage::Sort(s) => {
                for k in &s.keys {
                    deps.fields.insert(k.path.clone());
                }
            }
            Stage::Skip(_) | Stage::Limit(_) | Stage::Sample(_) => {}
            _ => deps.needs_whole_document = true,
        }
    }

    /// Source form for explain output.
    pub fn to_value(&self) -> Value {
        let body = match self {
            Stage::Match(m) => m.source().clone(),
            Stage::Project(p) => Value::Document(p.source().clone()),
            Stage::AddFields(a) => Value::Document(a.source().clone()),
            Stage::Unwind(u) => {
                let mut d = Document::new();
                d.insert("path", Value::String(format!("${}", u.path)));
                if let Some(idx) = &u.include_array_index {
                    d.insert("includeArrayIndex", Value::String(idx.clone()));
                }
                if u.preserve_null_and_empty {
                    d.insert("preserveNullAndEmptyArrays", Value::Bool(true));
                }
                Value::Document(d)
            }
            Stage::ReplaceRoot { source, .. } => {
                let mut d = Document::new();
                d.insert("newRoot", source.clone());
                Value::Document(d)
            }
            Stage::Redact { source, .. } | Stage::Group { source, .. } => source.clone(),
            Stage::Sort(s) => {
                let mut d = Document::new();
                d.insert("sortKey", s.to_value());
                if let Some(limit) = s.limit {
                    d.insert("limit", Value::Int64(limit as i64));
                }
                Value::Document(d)
            }
            Stage::Skip(n) | Stage::Limit(n) => Value::Int64(*n as i64),
            Stage::Lookup(l) => l.source.clone(),
            Stage::GraphLookup(g) => g.source.clone(),
            Stage::UnpackBucket(u) => u.to_value(),
            Stage::Facet(facets) => Value::Document(
                facets
                    .iter()
                    .map(|(name, stages)| {
                        (
                            name.clone(),
                            Value::Array(stages.iter().map(Stage::to_value).collect()),
                        )
                    })
                    .collect(),
            ),
            Stage::Sample(n) => {
                let mut d = Document::new();
                d.insert("size", Value::Int64(*n as i64));
                Value::Document(d)
            }
            Stage::Out(target) => target.to_value(),
            Stage::Merge(m) => {
                let mut d = Document::new();
                d.insert("into", m.into.to_value());
                d.insert(
                    "on",
                    Value::Array(m.on.iter().cloned().map(Value::String).collect()),
                );
                d.insert("whenMatched", Value::from(m.when_matched.name()));
                d.insert("whenNotMatched", Value::from(m.when_not_matched.name()));
                Value::Document(d)
            }
        };
        let mut d = Document::new();
        d.insert(self.name(), body);
        Value::Document(d)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn stage_object<'a>(body: &'a Value, stage: &str) -> Result<&'a Document> {
    body.as_document()
        .ok_or_else(|| Error::InvalidPipeline(format!("{stage} specification must be an object")))
}

fn required_str(doc: &Document, field: &str, stage: &str, code: i32) -> Result<String> {
    match doc.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(Error::location(
            code,
            format!("{stage} '{field}' must be a string, found {}", other.type_name()),
        )),
        None => Err(Error::location(code, format!("{stage} requires '{field}'"))),
    }
}

fn non_negative(body: &Value, stage: &str, code: i32) -> Result<u64> {
    body.integral_i64()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| Error::location(code, format!("{stage} must be a non-negative integer, found {body}")))
}

fn check_field_name(name: &str, stage: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('$') {
        return Err(Error::location(
            codes::FIELD_NAME_DOLLAR,
            format!("{stage} field name '{name}' must be non-empty and not start with '$'"),
        ));
    }
    Ok(())
}

/// An array of one-key stage objects. Desugared stages (`$count`,
/// `$sortByCount`, `$bucket`) expand in place.
pub fn parse_stages(pipeline: &Value, vps: &mut VariablesParseState) -> Result<Vec<Stage>> {
    let items = pipeline
        .as_array()
        .ok_or_else(|| Error::InvalidPipeline("pipeline must be an array".into()))?;
    let mut stages = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let parsed = parse_stage(item, vps)?;
        let terminal = parsed.iter().any(Stage::is_terminal);
        if terminal && i + 1 != items.len() {
            return Err(Error::location(
                codes::STAGE_MUST_BE_LAST,
                format!("{} can only be the final stage in the pipeline", parsed[0].name()),
            ));
        }
        stages.extend(parsed);
    }
    Ok(stages)
}

pub fn parse_stage(item: &Value, vps: &mut VariablesParseState) -> Result<Vec<Stage>> {
    let obj = item
        .as_document()
        .ok_or_else(|| Error::InvalidPipeline("each pipeline stage must be an object".into()))?;
    if obj.len() != 1 {
        return Err(Error::location(
            codes::STAGE_ONE_FIELD,
            "a pipeline stage specification object must contain exactly one field",
        ));
    }
    let Some((name, body)) = obj.iter().next() else {
        return Err(Error::location(codes::STAGE_ONE_FIELD, "empty stage specification"));
    };

    let stage = match name.as_str() {
        "$match" => {
            if !matches!(body, Value::Document(_)) {
                return Err(Error::InvalidPipeline("$match specification must be an object".into()));
            }
            Stage::Match(Matcher::parse(body, vps)?)
        }
        "$project" => Stage::Project(Projection::parse(body, vps)?),
        "$addFields" | "$set" => Stage::AddFields(AddFields::parse(body, vps)?),
        "$unset" => Stage::Project(Projection::unset(body)?),
        "$unwind" => Stage::Unwind(parse_unwind(body)?),
        "$replaceRoot" => {
            let obj = stage_object(body, "$replaceRoot")?;
            let source = obj
                .get("newRoot")
                .ok_or_else(|| Error::InvalidPipeline("$replaceRoot requires 'newRoot'".into()))?;
            Stage::ReplaceRoot {
                expr: Expression::parse(source, vps)?,
                source: source.clone(),
            }
        }
        "$replaceWith" => Stage::ReplaceRoot {
            expr: Expression::parse(body, vps)?,
            source: body.clone(),
        },
        "$redact" => Stage::Redact {
            expr: Expression::parse(body, vps)?,
            source: body.clone(),
        },
        "$group" => Stage::Group {
            spec: GroupSpec::parse(body, vps)?,
            source: body.clone(),
        },
        "$sort" => Stage::Sort(SortSpec::parse(body)?),
        "$skip" => Stage::Skip(non_negative(body, "$skip", codes::SKIP_BAD)?),
        "$limit" => {
            let n = non_negative(body, "$limit", codes::LIMIT_BAD)?;
            if n == 0 {
                return Err(Error::location(codes::LIMIT_BAD, "the limit must be positive"));
            }
            Stage::Limit(n)
        }
        "$count" => return parse_count(body, vps),
        "$sortByCount" => return parse_sort_by_count(body, vps),
        "$bucket" => return parse_bucket(body, vps),
        "$lookup" => Stage::Lookup(parse_lookup(body, vps)?),
        "$graphLookup" => Stage::GraphLookup(parse_graph_lookup(body, vps)?),
        "$facet" => Stage::Facet(parse_facet(body, vps)?),
        "$sample" => {
            let obj = stage_object(body, "$sample")?;
            let size = obj
                .get("size")
                .ok_or_else(|| Error::location(codes::SAMPLE_BAD_SIZE, "$sample requires 'size'"))?;
            Stage::Sample(non_negative(size, "$sample size", codes::SAMPLE_BAD_SIZE)?)
        }
        "$_internalUnpackBucket" => Stage::UnpackBucket(UnpackBucketSpec::parse_internal(body)?),
        "$_unpackBucket" => Stage::UnpackBucket(UnpackBucketSpec::parse_external(body)?),
        "$out" => Stage::Out(OutputTarget::parse(body, "$out")?),
        "$merge" => Stage::Merge(parse_merge(body)?),
        other => {
            return Err(Error::location(
                codes::STAGE_UNKNOWN,
                format!("unrecognized pipeline stage name: '{other}'"),
            ));
        }
    };
    Ok(vec![stage])
}

fn parse_unwind(body: &Value) -> Result<UnwindSpec> {
    let (path, include_array_index, preserve) = match body {
        Value::String(path) => (path.clone(), None, false),
        Value::Document(obj) => {
            let mut path = None;
            let mut index = None;
            let mut preserve = false;
            for (k, v) in obj {
                match (k.as_str(), v) {
                    ("path", Value::String(p)) => path = Some(p.clone()),
                    ("includeArrayIndex", Value::String(i)) => {
                        if i.is_empty() || i.starts_with('$') {
                            return Err(Error::location(
                                codes::UNWIND_BAD_OPTION,
                                format!("includeArrayIndex '{i}' must not be empty or start with '$'"),
                            ));
                        }
                        index = Some(i.clone());
                    }
                    ("preserveNullAndEmptyArrays", Value::Bool(b)) => preserve = *b,
                    (k, v) => {
                        return Err(Error::location(
                            codes::UNWIND_BAD_OPTION,
                            format!("invalid $unwind option '{k}': {v}"),
                        ));
                    }
                }
            }
            let path = path
                .ok_or_else(|| Error::location(codes::UNWIND_BAD_PATH, "no path specified to $unwind stage"))?;
            (path, index, preserve)
        }
        _ => {
            return Err(Error::location(
                codes::UNWIND_BAD_PATH,
                "expected either a string or an object as specification for $unwind stage",
            ));
        }
    };
    let Some(stripped) = path.strip_prefix('$').filter(|p| !p.is_empty() && !p.starts_with('$')) else {
        return Err(Error::location(
            codes::UNWIND_BAD_PATH,
            format!("path option to $unwind stage should be prefixed with a '$': {path}"),
        ));
    };
    Ok(UnwindSpec {
        path: stripped.to_string(),
        include_array_index,
        preserve_null_and_empty: preserve,
    })
}

fn single_field_doc(key: &str, value: Value) -> Value {
    let mut d = Document::new();
    d.insert(key, value);
    Value::Document(d)
}

fn sum_one() -> Value {
    single_field_doc("$sum", Value::Int32(1))
}

fn group_stage(spec: Value, vps: &mut VariablesParseState) -> Result<Stage> {
    Ok(Stage::Group {
        spec: GroupSpec::parse(&spec, vps)?,
        source: spec,
    })
}

/// `$count: name` is `$group` on a null key plus a projection dropping `_id`.
fn parse_count(body: &Value, vps: &mut VariablesParseState) -> Result<Vec<Stage>> {
    let name = match body {
        Value::String(s) if !s.is_empty() && !s.starts_with('$') && !s.contains('.') && s != "_id" => s,
        _ => {
            return Err(Error::location(
                codes::COUNT_BAD_FIELD,
                format!("the $count field must be a non-empty string without '$' or '.', found {body}"),
            ));
        }
    };
    let mut spec = Document::new();
    spec.insert("_id", Value::Null);
    spec.insert(name.clone(), sum_one());
    Ok(vec![
        group_stage(Value::Document(spec), vps)?,
        Stage::Project(Projection::exclusion(&["_id".to_string()])?),
    ])
}

fn is_group_by_expression(v: &Value) -> bool {
    match v {
        Value::String(s) => s.starts_with('$'),
        Value::Document(d) => d.len() == 1 && d.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn parse_sort_by_count(body: &Value, vps: &mut VariablesParseState) -> Result<Vec<Stage>> {
    if !is_group_by_expression(body) {
        return Err(Error::InvalidPipeline(
            "$sortByCount requires a field path or an expression object".into(),
        ));
    }
    let mut spec = Document::new();
    spec.insert("_id", body.clone());
    spec.insert("count", sum_one());
    Ok(vec![
        group_stage(Value::Document(spec), vps)?,
        Stage::Sort(SortSpec::parse(&single_field_doc("count", Value::Int32(-1)))?),
    ])
}

/// `$bucket` groups on the boundary range that contains `groupBy`, then
/// sorts by bucket.
fn parse_bucket(body: &Value, vps: &mut VariablesParseState) -> Result<Vec<Stage>> {
    let obj = stage_object(body, "$bucket")?;
    for key in obj.keys() {
        if !matches!(key.as_str(), "groupBy" | "boundaries" | "default" | "output") {
            return Err(Error::InvalidPipeline(format!("unrecognized option to $bucket: {key}")));
        }
    }
    let group_by = obj
        .get("groupBy")
        .filter(|v| is_group_by_expression(v))
        .ok_or_else(|| {
            Error::location(
                codes::BUCKET_GROUP_BY_BAD,
                "$bucket 'groupBy' must be a field path or an expression object",
            )
        })?;
    let boundaries = match obj.get("boundaries") {
        Some(Value::Array(b)) if b.len() >= 2 => b,
        _ => {
            return Err(Error::location(
                codes::BUCKET_BAD_BOUNDARIES,
                "$bucket 'boundaries' must be an array of at least two values",
            ));
        }
    };
    for pair in boundaries.windows(2) {
        if pair[0].canonical_type() != pair[1].canonical_type() {
            return Err(Error::location(
                codes::BUCKET_BAD_BOUNDARIES,
                "all $bucket boundaries must be of the same type",
            ));
        }
        if compare_values(&pair[0], &pair[1], None) != std::cmp::Ordering::Less {
            return Err(Error::location(
                codes::BUCKET_BAD_BOUNDARIES,
                "$bucket boundaries must be sorted in ascending order",
            ));
        }
    }
    let (lowest, highest) = (&boundaries[0], &boundaries[boundaries.len() - 1]);
    let default = obj.get("default");
    if let Some(d) = default {
        let same_type = d.canonical_type() == lowest.canonical_type();
        if same_type
            && compare_values(d, lowest, None) != std::cmp::Ordering::Less
            && compare_values(d, highest, None) == std::cmp::Ordering::Less
        {
            return Err(Error::location(
                codes::BUCKET_DEFAULT_IN_RANGE,
                "the $bucket 'default' must be less than the lowest boundary or greater than or \
                 equal to the highest boundary",
            ));
        }
    }

    let literal = |v: &Value| single_field_doc("$literal", v.clone());
    let branches: Vec<Value> = boundaries
        .windows(2)
        .map(|pair| {
            let gte = single_field_doc("$gte", Value::Array(vec![group_by.clone(), literal(&pair[0])]));
            let lt = single_field_doc("$lt", Value::Array(vec![group_by.clone(), literal(&pair[1])]));
            let mut branch = Document::new();
            branch.insert("case", single_field_doc("$and", Value::Array(vec![gte, lt])));
            branch.insert("then", literal(&pair[0]));
            Value::Document(branch)
        })
        .collect();
    let mut switch = Document::new();
    switch.insert("branches", Value::Array(branches));
    if let Some(d) = default {
        switch.insert("default", literal(d));
    }

    let mut spec = Document::new();
    spec.insert("_id", single_field_doc("$switch", Value::Document(switch)));
    match obj.get("output") {
        None => spec.insert("count", sum_one()),
        Some(Value::Document(output)) => {
            for (k, v) in output {
                spec.insert(k.clone(), v.clone());
            }
        }
        Some(_) => return Err(Error::InvalidPipeline("$bucket 'output' must be an object".into())),
    }
    let group = group_stage(Value::Document(spec), vps).map_err(|e| e.context("$bucket"))?;
    Ok(vec![
        group,
        Stage::Sort(SortSpec::parse(&single_field_doc("_id", Value::Int32(1)))?),
    ])
}

fn optional_str(doc: &Document, field: &str, stage: &str) -> Result<Option<String>> {
    match doc.get(field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(Error::InvalidPipeline(format!(
            "{stage} '{field}' must be a string, found {}",
            other.type_name()
        ))),
    }
}

/// Either the equality form, the `let`/`pipeline` form, or both together.
fn parse_lookup(body: &Value, vps: &mut VariablesParseState) -> Result<LookupSpec> {
    let obj = stage_object(body, "$lookup")?;
    for key in obj.keys() {
        if !matches!(
            key.as_str(),
            "from" | "localField" | "foreignField" | "as" | "let" | "pipeline"
        ) {
            return Err(Error::InvalidPipeline(format!("unknown argument to $lookup: {key}")));
        }
    }
    let join = match (
        optional_str(obj, "localField", "$lookup")?,
        optional_str(obj, "foreignField", "$lookup")?,
    ) {
        (Some(local_field), Some(foreign_field)) => Some(EqualityJoin {
            local_field,
            foreign_field,
        }),
        (None, None) => None,
        _ => {
            return Err(Error::InvalidPipeline(
                "$lookup requires both or neither of 'localField' and 'foreignField' to be specified".into(),
            ));
        }
    };
    let pipeline_spec = obj.get("pipeline");
    if pipeline_spec.is_none() {
        if obj.contains_key("let") {
            return Err(Error::InvalidPipeline(
                "$lookup with a 'let' argument must also specify 'pipeline'".into(),
            ));
        }
        if join.is_none() {
            return Err(Error::location(
                codes::LOOKUP_MISSING_FIELD,
                "$lookup requires either 'localField' and 'foreignField' or 'pipeline'",
            ));
        }
    }

    // Bindings are parsed in the enclosing scope; only the sub-pipeline
    // sees the names.
    let mut bindings = Vec::new();
    match obj.get("let") {
        None => {}
        Some(Value::Document(vars)) => {
            for (name, spec) in vars {
                bindings.push((name.clone(), Expression::parse(spec, vps)?.optimize()));
            }
        }
        Some(_) => return Err(Error::InvalidPipeline("$lookup 'let' must be an object".into())),
    }
    let (let_vars, pipeline) = match pipeline_spec {
        None => (Vec::new(), None),
        Some(sub) => {
            vps.push_scope();
            let parsed = parse_lookup_pipeline(sub, bindings, vps);
            vps.pop_scope();
            let (let_vars, stages) = parsed.map_err(|e| e.context("$lookup pipeline"))?;
            (let_vars, Some(stages))
        }
    };

    let spec = LookupSpec {
        from: required_str(obj, "from", "$lookup", codes::LOOKUP_MISSING_FIELD)?,
        as_field: required_str(obj, "as", "$lookup", codes::LOOKUP_MISSING_FIELD)?,
        join,
        let_vars,
        pipeline,
        source: body.clone(),
    };
    check_field_name(&spec.as_field, "$lookup")?;
    Ok(spec)
}

fn parse_lookup_pipeline(
    sub: &Value,
    bindings: Vec<(String, Expression)>,
    vps: &mut VariablesParseState,
) -> Result<(Vec<(VariableId, Expression)>, Vec<Stage>)> {
    let mut let_vars = Vec::with_capacity(bindings.len());
    for (name, expr) in bindings {
        let_vars.push((vps.define(&name)?, expr));
    }
    let stages = parse_stages(sub, vps)?;
    if let Some(bad) = stages.iter().find(|s| s.is_terminal()) {
        return Err(Error::location(
            codes::LOOKUP_PIPELINE_FORBIDDEN,
            format!("{} is not allowed within a $lookup's sub-pipeline", bad.name()),
        ));
    }
    Ok((let_vars, stages))
}

fn parse_graph_lookup(body: &Value, vps: &mut VariablesParseState) -> Result<GraphLookupSpec> {
    let obj = stage_object(body, "$graphLookup")?;
    let code = codes::GRAPH_LOOKUP_MISSING_FIELD;
    let start_with = obj
        .get("startWith")
        .ok_or_else(|| Error::location(code, "$graphLookup requires 'startWith'"))?;
    let max_depth = match obj.get("maxDepth") {
        None => None,
        Some(v) => Some(non_negative(v, "$graphLookup maxDepth", codes::GRAPH_LOOKUP_BAD_DEPTH)?),
    };
    let depth_field = match obj.get("depthField") {
        None => None,
        Some(Value::String(s)) => {
            check_field_name(s, "$graphLookup depthField")?;
            Some(s.clone())
        }
        Some(_) => return Err(Error::InvalidPipeline("$graphLookup 'depthField' must be a string".into())),
    };
    let restrict = match obj.get("restrictSearchWithMatch") {
        None => None,
        Some(v @ Value::Document(_)) => Some(Matcher::parse(v, vps)?),
        Some(_) => {
            return Err(Error::InvalidPipeline(
                "$graphLookup 'restrictSearchWithMatch' must be an object".into(),
            ));
        }
    };
    for key in obj.keys() {
        if !matches!(
            key.as_str(),
            "from"
                | "startWith"
                | "connectFromField"
                | "connectToField"
                | "as"
                | "maxDepth"
                | "depthField"
                | "restrictSearchWithMatch"
        ) {
            return Err(Error::InvalidPipeline(format!("unknown argument to $graphLookup: {key}")));
        }
    }
    let spec = GraphLookupSpec {
        from: required_str(obj, "from", "$graphLookup", code)?,
        start_with: Expression::parse(start_with, vps)?.optimize(),
        connect_from_field: required_str(obj, "connectFromField", "$graphLookup", code)?,
        connect_to_field: required_str(obj, "connectToField", "$graphLookup", code)?,
        as_field: required_str(obj, "as", "$graphLookup", code)?,
        max_depth,
        depth_field,
        restrict_search_with_match: restrict,
        source: body.clone(),
    };
    check_field_name(&spec.as_field, "$graphLookup")?;
    Ok(spec)
}

fn parse_facet(body: &Value, vps: &mut VariablesParseState) -> Result<Vec<(String, Vec<Stage>)>> {
    let obj = stage_object(body, "$facet")?;
    if obj.is_empty() {
        return Err(Error::InvalidPipeline("the $facet specification must be a non-empty object".into()));
    }
    let mut facets = Vec::with_capacity(obj.len());
    for (name, sub) in obj {
        if name.is_empty() || name.starts_with('$') || name.contains('.') {
            return Err(Error::InvalidPipeline(format!("invalid $facet output field name '{name}'")));
        }
        let stages = parse_stages(sub, vps).map_err(|e| e.context(format!("$facet '{name}'")))?;
        if let Some(bad) = stages
            .iter()
            .find(|s| matches!(s, Stage::Out(_) | Stage::Merge(_) | Stage::Facet(_)))
        {
            return Err(Error::location(
                codes::FACET_FORBIDDEN_STAGE,
                format!("{} is not allowed to be used within a $facet stage", bad.name()),
            ));
        }
        facets.push((name.clone(), stages));
    }
    Ok(facets)
}

fn parse_merge(body: &Value) -> Result<MergeSpec> {
    let obj = match body {
        Value::String(_) => {
            return Ok(MergeSpec {
                into: OutputTarget::parse(body, "$merge")?,
                on: vec!["_id".into()],
                when_matched: WhenMatched::Merge,
                when_not_matched: WhenNotMatched::Insert,
            });
        }
        Value::Document(obj) => obj,
        _ => return Err(Error::InvalidPipeline("$merge specification must be a string or an object".into())),
    };
    let into = obj
        .get("into")
        .ok_or_else(|| Error::InvalidPipeline("$merge requires 'into'".into()))
        .and_then(|v| OutputTarget::parse(v, "$merge"))?;
    let on = match obj.get("on") {
        None => vec!["_id".to_string()],
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::InvalidPipeline("$merge 'on' must contain only strings".into()))
            })
            .collect::<Result<_>>()?,
        Some(_) => {
            return Err(Error::InvalidPipeline(
                "$merge 'on' must be a string or a non-empty array of strings".into(),
            ));
        }
    };
    let when_matched = match obj.get("whenMatched") {
        None => WhenMatched::Merge,
        Some(v) => WhenMatched::parse(v)?,
    };
    let when_not_matched = match obj.get("whenNotMatched") {
        None => WhenNotMatched::Insert,
        Some(v) => WhenNotMatched::parse(v)?,
    };
    Ok(MergeSpec {
        into,
        on,
        when_matched,
        when_not_matched,
    })
}
