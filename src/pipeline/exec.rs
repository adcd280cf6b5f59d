use std::collections::VecDeque;
use std::sync::Arc;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::context::ExecContext;
use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::expression::{CURRENT_ID, DESCEND, Expression, KEEP, PRUNE, Variables};
use crate::group::GroupEngine;
use crate::matcher::{Matcher, path_values};
use crate::sink::{OutputSink, WriteAck, WriteMode};
use crate::source::{Catalog, DocumentCursor, DocumentSource, ScanSpec, VecCursor, scan_matching};
use crate::value::Value;

use super::graph_lookup;
use super::project::{AddFields, Projection};
use super::sort::Sorter;
use super::stage::{EqualityJoin, GraphLookupSpec, LookupSpec, Stage, UnwindSpec};
use super::unpack_bucket::{self, UnpackBucketSpec};

// ---------------------------------------------------------------------------
// Execution nodes
// ---------------------------------------------------------------------------

enum NodeKind {
    Scan(Box<dyn DocumentCursor>),
    Match(Matcher),
    Project(Projection),
    AddFields(AddFields),
    Unwind {
        spec: UnwindSpec,
        pending: VecDeque<Document>,
    },
    ReplaceRoot(Expression),
    Redact(Expression),
    Group {
        engine: GroupEngine,
        drained: bool,
    },
    Sort {
        sorter: Sorter,
        drained: bool,
    },
    Skip(u64),
    Limit {
        remaining: u64,
        closed: bool,
    },
    Lookup {
        spec: LookupSpec,
        foreign: Arc<dyn DocumentSource>,
        catalog: Arc<dyn Catalog>,
    },
    GraphLookup {
        spec: GraphLookupSpec,
        foreign: Arc<dyn DocumentSource>,
    },
    UnpackBucket {
        spec: UnpackBucketSpec,
        pending: VecDeque<Document>,
    },
    Facet {
        facets: Vec<(String, Vec<Stage>)>,
        catalog: Arc<dyn Catalog>,
        done: bool,
    },
    Sample {
        size: u64,
        output: Option<std::vec::IntoIter<Document>>,
    },
    Output {
        stage: &'static str,
        sink: Box<dyn OutputSink>,
        mode: WriteMode,
        done: bool,
    },
}

/// One stage of a running pipeline, pulling from its input.
pub struct Node {
    name: &'static str,
    kind: NodeKind,
    input: Option<Box<Node>>,
    processed: u64,
}

fn pull(input: &mut Option<Box<Node>>, ctx: &ExecContext, vars: &mut Variables) -> Result<Option<Document>> {
    match input {
        Some(node) => node.next(ctx, vars),
        None => Ok(None),
    }
}

impl Node {
    pub fn scan(cursor: Box<dyn DocumentCursor>) -> Self {
        Self {
            name: "$cursor",
            kind: NodeKind::Scan(cursor),
            input: None,
            processed: 0,
        }
    }

    /// Wrap `input` with `stage`.
    pub fn build(stage: Stage, input: Node, catalog: &Arc<dyn Catalog>, ctx: &ExecContext) -> Result<Self> {
        let name = stage.name();
        let kind = match stage {
            Stage::Match(m) => NodeKind::Match(m),
            Stage::Project(p) => NodeKind::Project(p),
            Stage::AddFields(a) => NodeKind::AddFields(a),
            Stage::Unwind(spec) => NodeKind::Unwind {
                spec,
                pending: VecDeque::new(),
            },
            Stage::ReplaceRoot { expr, .. } => NodeKind::ReplaceRoot(expr),
            Stage::Redact { expr, .. } => NodeKind::Redact(expr),
            Stage::Group { spec, .. } => NodeKind::Group {
                engine: GroupEngine::new(spec),
                drained: false,
            },
            Stage::Sort(spec) => NodeKind::Sort {
                sorter: Sorter::new(spec, ctx.collation.clone()),
                drained: false,
            },
            Stage::Skip(n) => NodeKind::Skip(n),
            Stage::Limit(n) => NodeKind::Limit {
                remaining: n,
                closed: false,
            },
            Stage::Lookup(spec) => NodeKind::Lookup {
                foreign: catalog.source(&spec.from)?,
                catalog: Arc::clone(catalog),
                spec,
            },
            Stage::GraphLookup(spec) => NodeKind::GraphLookup {
                foreign: catalog.source(&spec.from)?,
                spec,
            },
            Stage::UnpackBucket(spec) => NodeKind::UnpackBucket {
                spec,
                pending: VecDeque::new(),
            },
            Stage::Facet(facets) => NodeKind::Facet {
                facets,
                catalog: Arc::clone(catalog),
                done: false,
            },
            Stage::Sample(size) => NodeKind::Sample { size, output: None },
            Stage::Out(target) => NodeKind::Output {
                stage: "$out",
                sink: catalog.sink(&target)?,
                mode: WriteMode::Replace,
                done: false,
            },
            Stage::Merge(spec) => NodeKind::Output {
                stage: "$merge",
                sink: catalog.sink(&spec.into)?,
                mode: WriteMode::Merge {
                    on: spec.on,
                    when_matched: spec.when_matched,
                    when_not_matched: spec.when_not_matched,
                },
                done: false,
            },
        };
        Ok(Self {
            name,
            kind,
            input: Some(Box::new(input)),
            processed: 0,
        })
    }

    /// Chain `stages` on top of `root`.
    pub fn build_chain(
        stages: Vec<Stage>,
        root: Node,
        catalog: &Arc<dyn Catalog>,
        ctx: &ExecContext,
    ) -> Result<Self> {
        let mut node = root;
        for stage in stages {
            node = Node::build(stage, node, catalog, ctx)?;
        }
        Ok(node)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Pull the next output document.
    pub fn next(&mut self, ctx: &ExecContext, vars: &mut Variables) -> Result<Option<Document>> {
        let out = self.produce(ctx, vars)?;
        if out.is_some() {
            self.processed += 1;
            ctx.check_interrupt_every(self.processed)?;
        }
        Ok(out)
    }

    fn produce(&mut self, ctx: &ExecContext, vars: &mut Variables) -> Result<Option<Document>> {
        let Node { kind, input, .. } = self;
        match kind {
            NodeKind::Scan(cursor) => cursor.next_doc(ctx, vars),
            NodeKind::Match(matcher) => loop {
                let Some(doc) = pull(input, ctx, vars)? else {
                    return Ok(None);
                };
                if matcher.matches(&doc, ctx, vars)? {
                    return Ok(Some(doc));
                }
            },
            NodeKind::Project(p) => match pull(input, ctx, vars)? {
                Some(doc) => p.apply(&doc, vars).map(Some),
                None => Ok(None),
            },
            NodeKind::AddFields(a) => match pull(input, ctx, vars)? {
                Some(doc) => a.apply(&doc, vars).map(Some),
                None => Ok(None),
            },
            NodeKind::Unwind { spec, pending } => loop {
                if let Some(doc) = pending.pop_front() {
                    return Ok(Some(doc));
                }
                let Some(doc) = pull(input, ctx, vars)? else {
                    return Ok(None);
                };
                unwind(spec, doc, pending);
            },
            NodeKind::ReplaceRoot(expr) => {
                let Some(doc) = pull(input, ctx, vars)? else {
                    return Ok(None);
                };
                match expr.evaluate(&doc, vars)? {
                    Value::Document(root) => Ok(Some(root)),
                    other => Err(Error::location(
                        codes::REPLACE_ROOT_NOT_OBJECT,
                        format!(
                            "'newRoot' expression must evaluate to an object, but resulting value was: {other}. Type of resulting value: '{}'",
                            other.type_name()
                        ),
                    )),
                }
            }
            NodeKind::Redact(expr) => loop {
                let Some(doc) = pull(input, ctx, vars)? else {
                    return Ok(None);
                };
                let root = doc.clone();
                if let Some(kept) = redact(expr, &root, doc, vars)? {
                    return Ok(Some(kept));
                }
            },
            NodeKind::Group { engine, drained } => {
                if !*drained {
                    while let Some(doc) = pull(input, ctx, vars)? {
                        engine.process(&doc, ctx, vars)?;
                    }
                    engine.finish_input(ctx)?;
                    *drained = true;
                }
                engine.next_output(ctx)
            }
            NodeKind::Sort { sorter, drained } => {
                if !*drained {
                    while let Some(doc) = pull(input, ctx, vars)? {
                        sorter.add(doc, ctx)?;
                    }
                    sorter.finish_input(ctx)?;
                    *drained = true;
                }
                sorter.next_output(ctx)
            }
            NodeKind::Skip(remaining) => {
                while *remaining > 0 {
                    if pull(input, ctx, vars)?.is_none() {
                        return Ok(None);
                    }
                    *remaining -= 1;
                }
                pull(input, ctx, vars)
            }
            NodeKind::Limit { remaining, closed } => {
                if *remaining == 0 {
                    // Upstream will not be pulled again; release it now.
                    if !*closed {
                        *closed = true;
                        if let Some(upstream) = input.as_mut() {
                            upstream.close();
                        }
                    }
                    return Ok(None);
                }
                *remaining -= 1;
                pull(input, ctx, vars)
            }
            NodeKind::Lookup { spec, foreign, catalog } => {
                let Some(mut doc) = pull(input, ctx, vars)? else {
                    return Ok(None);
                };
                let joined = lookup(spec, &doc, foreign.as_ref(), catalog, ctx, vars)?;
                doc.set_path(&spec.as_field, Value::Array(joined.into_iter().map(Value::Document).collect()));
                Ok(Some(doc))
            }
            NodeKind::GraphLookup { spec, foreign } => {
                let Some(mut doc) = pull(input, ctx, vars)? else {
                    return Ok(None);
                };
                let found = graph_lookup::traverse(spec, &doc, foreign.as_ref(), ctx, vars)?;
                doc.set_path(&spec.as_field, Value::Array(found.into_iter().map(Value::Document).collect()));
                Ok(Some(doc))
            }
            NodeKind::UnpackBucket { spec, pending } => loop {
                if let Some(doc) = pending.pop_front() {
                    return Ok(Some(doc));
                }
                let Some(bucket) = pull(input, ctx, vars)? else {
                    return Ok(None);
                };
                unpack_bucket::unpack(spec, &bucket, pending)?;
            },
            NodeKind::Facet { facets, catalog, done } => {
                if *done {
                    return Ok(None);
                }
                *done = true;
                let mut buffered = Vec::new();
                let mut used = 0usize;
                while let Some(doc) = pull(input, ctx, vars)? {
                    used += doc.approx_size();
                    if used > ctx.config.max_memory_bytes {
                        return Err(Error::ExceededMemoryLimit(format!(
                            "$facet buffered {used} bytes, over the limit of {}",
                            ctx.config.max_memory_bytes
                        )));
                    }
                    buffered.push(doc);
                }
                let mut out = Document::with_capacity(facets.len());
                for (name, stages) in facets.iter() {
                    let root = Node::scan(Box::new(VecCursor::new(buffered.clone())));
                    let mut branch = Node::build_chain(stages.clone(), root, catalog, ctx)
                        .map_err(|e| e.context(format!("$facet '{name}'")))?;
                    let mut results = Vec::new();
                    let outcome = loop {
                        match branch.next(ctx, vars) {
                            Ok(Some(doc)) => results.push(Value::Document(doc)),
                            Ok(None) => break Ok(()),
                            Err(e) => break Err(e),
                        }
                    };
                    branch.close();
                    outcome?;
                    out.insert(name.clone(), Value::Array(results));
                }
                Ok(Some(out))
            }
            NodeKind::Sample { size, output } => {
                if output.is_none() {
                    *output = Some(sample(*size, input, ctx, vars)?.into_iter());
                }
                Ok(output.as_mut().and_then(Iterator::next))
            }
            NodeKind::Output {
                stage,
                sink,
                mode,
                done,
            } => {
                if *done {
                    return Ok(None);
                }
                *done = true;
                match write_all(sink.as_mut(), mode, input, ctx, vars) {
                    Ok(ack) => {
                        tracing::debug!(stage = *stage, ack = ?ack, "output stage committed");
                        Ok(None)
                    }
                    Err(e) => {
                        tracing::warn!(stage = *stage, error = %e, "output stage aborted");
                        sink.abort();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Release resources held by this node and everything upstream.
    pub fn close(&mut self) {
        match &mut self.kind {
            NodeKind::Group { engine, .. } => engine.close(),
            NodeKind::Sort { sorter, .. } => sorter.close(),
            NodeKind::Unwind { pending, .. } | NodeKind::UnpackBucket { pending, .. } => pending.clear(),
            NodeKind::Sample { output, .. } => *output = None,
            _ => {}
        }
        if let Some(input) = self.input.as_mut() {
            input.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Stage helpers
// ---------------------------------------------------------------------------

fn unwind(spec: &UnwindSpec, doc: Document, out: &mut VecDeque<Document>) {
    let set_index = |d: &mut Document, index: Value| {
        if let Some(field) = &spec.include_array_index {
            d.set_path(field, index);
        }
    };
    let value = doc.get_path(&spec.path).cloned();
    match value {
        Some(Value::Array(items)) if !items.is_empty() => {
            for (i, item) in items.into_iter().enumerate() {
                let mut d = doc.clone();
                d.set_path(&spec.path, item);
                set_index(&mut d, Value::Int64(i as i64));
                out.push_back(d);
            }
        }
        Some(Value::Array(_)) => {
            if spec.preserve_null_and_empty {
                let mut d = doc;
                d.remove_path(&spec.path);
                set_index(&mut d, Value::Null);
                out.push_back(d);
            }
        }
        None | Some(Value::Null | Value::Missing) => {
            if spec.preserve_null_and_empty {
                let mut d = doc;
                set_index(&mut d, Value::Null);
                out.push_back(d);
            }
        }
        Some(_) => {
            let mut d = doc;
            set_index(&mut d, Value::Null);
            out.push_back(d);
        }
    }
}

enum RedactAction {
    Keep,
    Prune,
    Descend,
}

fn redact_action(expr: &Expression, root: &Document, current: &Document, vars: &mut Variables) -> Result<RedactAction> {
    let previous = vars.set(CURRENT_ID, Value::Document(current.clone()));
    let result = expr.evaluate(root, vars);
    vars.restore(CURRENT_ID, previous);
    match result? {
        Value::String(s) if s == KEEP => Ok(RedactAction::Keep),
        Value::String(s) if s == PRUNE => Ok(RedactAction::Prune),
        Value::String(s) if s == DESCEND => Ok(RedactAction::Descend),
        other => Err(Error::location(
            codes::REDACT_BAD_RESULT,
            format!("$redact's expression should not return anything aside from the variables $$KEEP, $$DESCEND, and $$PRUNE, but returned {other}"),
        )),
    }
}

fn redact(expr: &Expression, root: &Document, doc: Document, vars: &mut Variables) -> Result<Option<Document>> {
    match redact_action(expr, root, &doc, vars)? {
        RedactAction::Keep => Ok(Some(doc)),
        RedactAction::Prune => Ok(None),
        RedactAction::Descend => {
            let mut out = Document::with_capacity(doc.len());
            for (key, value) in doc {
                match value {
                    Value::Document(sub) => {
                        if let Some(kept) = redact(expr, root, sub, vars)? {
                            out.insert(key, Value::Document(kept));
                        }
                    }
                    Value::Array(items) => out.insert(key, Value::Array(redact_array(expr, root, items, vars)?)),
                    other => out.insert(key, other),
                }
            }
            Ok(Some(out))
        }
    }
}

fn redact_array(expr: &Expression, root: &Document, items: Vec<Value>, vars: &mut Variables) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Document(sub) => {
                if let Some(kept) = redact(expr, root, sub, vars)? {
                    out.push(Value::Document(kept));
                }
            }
            Value::Array(nested) => out.push(Value::Array(redact_array(expr, root, nested, vars)?)),
            other => out.push(other),
        }
    }
    Ok(out)
}

/// `{foreignField: {$in: <local values>}}`. A missing local field joins on
/// null.
fn equality_matcher(join: &EqualityJoin, doc: &Document) -> Result<Matcher> {
    let mut values = Vec::new();
    for v in path_values(doc, &join.local_field) {
        match v {
            Value::Array(items) => values.extend(items.iter().cloned()),
            Value::Missing => values.push(Value::Null),
            other => values.push(other.clone()),
        }
    }
    if values.is_empty() {
        values.push(Value::Null);
    }
    let mut cond = Document::new();
    cond.insert("$in", Value::Array(values));
    let mut filter = Document::new();
    filter.insert(join.foreign_field.clone(), Value::Document(cond));
    Matcher::parse(&Value::Document(filter), &mut crate::expression::VariablesParseState::new())
}

/// Foreign documents joined to `doc`. With a sub-pipeline, the `let`
/// bindings are evaluated against `doc` and stay bound while it runs.
fn lookup(
    spec: &LookupSpec,
    doc: &Document,
    foreign: &dyn DocumentSource,
    catalog: &Arc<dyn Catalog>,
    ctx: &ExecContext,
    vars: &mut Variables,
) -> Result<Vec<Document>> {
    let Some(pipeline) = &spec.pipeline else {
        let Some(join) = &spec.join else {
            return Ok(Vec::new());
        };
        return scan_matching(foreign, &equality_matcher(join, doc)?, ctx, vars);
    };
    let mut bound = Vec::with_capacity(spec.let_vars.len());
    for (id, expr) in &spec.let_vars {
        bound.push((*id, expr.evaluate(doc, vars)?));
    }
    let previous: Vec<_> = bound
        .into_iter()
        .map(|(id, value)| (id, vars.set(id, value)))
        .collect();
    let result = run_sub_pipeline(spec, pipeline, doc, foreign, catalog, ctx, vars);
    for (id, value) in previous.into_iter().rev() {
        vars.restore(id, value);
    }
    result
}

fn run_sub_pipeline(
    spec: &LookupSpec,
    pipeline: &[Stage],
    doc: &Document,
    foreign: &dyn DocumentSource,
    catalog: &Arc<dyn Catalog>,
    ctx: &ExecContext,
    vars: &mut Variables,
) -> Result<Vec<Document>> {
    let cursor: Box<dyn DocumentCursor> = match &spec.join {
        Some(join) => {
            let matched = scan_matching(foreign, &equality_matcher(join, doc)?, ctx, vars)?;
            Box::new(VecCursor::new(matched))
        }
        None => foreign.open(&ScanSpec::default(), ctx)?.cursor,
    };
    let mut node = Node::build_chain(pipeline.to_vec(), Node::scan(cursor), catalog, ctx)?;
    let mut joined = Vec::new();
    let mut used = 0usize;
    let outcome = loop {
        match node.next(ctx, vars) {
            Ok(Some(found)) => {
                used += found.approx_size();
                if used > ctx.config.max_memory_bytes {
                    break Err(Error::ExceededMemoryLimit(format!(
                        "$lookup collected {used} bytes into '{}', over the limit of {}",
                        spec.as_field, ctx.config.max_memory_bytes
                    )));
                }
                joined.push(found);
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    node.close();
    outcome.map(|()| joined)
}

/// Reservoir sample of `size` documents, returned in random order.
fn sample(
    size: u64,
    input: &mut Option<Box<Node>>,
    ctx: &ExecContext,
    vars: &mut Variables,
) -> Result<Vec<Document>> {
    let size = usize::try_from(size).unwrap_or(usize::MAX);
    let mut rng = rand::rng();
    let mut reservoir: Vec<Document> = Vec::new();
    let mut used = 0usize;
    let mut seen = 0usize;
    while let Some(doc) = pull(input, ctx, vars)? {
        seen += 1;
        if reservoir.len() < size {
            used += doc.approx_size();
            if used > ctx.config.max_memory_bytes {
                return Err(Error::ExceededMemoryLimit(format!(
                    "$sample buffered {used} bytes, over the limit of {}",
                    ctx.config.max_memory_bytes
                )));
            }
            reservoir.push(doc);
        } else {
            let j = rng.random_range(0..seen);
            if j < size {
                reservoir[j] = doc;
            }
        }
    }
    reservoir.shuffle(&mut rng);
    Ok(reservoir)
}

fn write_all(
    sink: &mut dyn OutputSink,
    mode: &WriteMode,
    input: &mut Option<Box<Node>>,
    ctx: &ExecContext,
    vars: &mut Variables,
) -> Result<WriteAck> {
    let batch_size = ctx.config.output_batch_size.max(1);
    let mut ack = WriteAck::default();
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(doc) = pull(input, ctx, vars)? {
        batch.push(doc);
        if batch.len() >= batch_size {
            ack.absorb(sink.write(std::mem::take(&mut batch), mode)?);
        }
    }
    // The final batch is written even when empty so `$out` always replaces.
    ack.absorb(sink.write(batch, mode)?);
    ack.absorb(sink.commit()?);
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::VariablesParseState;
    use crate::pipeline::parse_stages;
    use crate::sink::OutputTarget;
    use crate::source::MemorySource;
    use serde_json::json;

    struct NoCatalog;

    impl Catalog for NoCatalog {
        fn source(&self, _collection: &str) -> Result<Arc<dyn DocumentSource>> {
            Ok(Arc::new(MemorySource::default()))
        }

        fn sink(&self, target: &OutputTarget) -> Result<Box<dyn OutputSink>> {
            Err(Error::NamespaceNotFound(target.to_string()))
        }

        fn ddl_epoch(&self) -> u64 {
            0
        }
    }

    /// Every collection name resolves to the same documents.
    struct FixedCatalog(Vec<Document>);

    impl Catalog for FixedCatalog {
        fn source(&self, _collection: &str) -> Result<Arc<dyn DocumentSource>> {
            Ok(Arc::new(MemorySource::new(self.0.clone())))
        }

        fn sink(&self, target: &OutputTarget) -> Result<Box<dyn OutputSink>> {
            Err(Error::NamespaceNotFound(target.to_string()))
        }

        fn ddl_epoch(&self) -> u64 {
            0
        }
    }

    fn docs(input: serde_json::Value) -> Vec<Document> {
        input
            .as_array()
            .unwrap()
            .iter()
            .map(|d| Document::from_json(d).unwrap())
            .collect()
    }

    fn run(pipeline: serde_json::Value, input: serde_json::Value) -> Result<Vec<serde_json::Value>> {
        run_with(Arc::new(NoCatalog), pipeline, input)
    }

    fn run_with(
        catalog: Arc<dyn Catalog>,
        pipeline: serde_json::Value,
        input: serde_json::Value,
    ) -> Result<Vec<serde_json::Value>> {
        let ctx = ExecContext::default();
        let stages = parse_stages(&Value::from_json(&pipeline), &mut VariablesParseState::new())?;
        let root = Node::scan(Box::new(VecCursor::new(docs(input))));
        let mut node = Node::build_chain(stages, root, &catalog, &ctx)?;
        let mut vars = ctx.variables();
        let mut out = Vec::new();
        while let Some(doc) = node.next(&ctx, &mut vars)? {
            out.push(doc.to_json());
        }
        node.close();
        Ok(out)
    }

    #[test]
    fn unwind_cardinality() {
        let input = json!([
            {"_id": 1, "a": [1, 2, 3]},
            {"_id": 2, "a": []},
            {"_id": 3, "a": null},
            {"_id": 4},
            {"_id": 5, "a": 7},
        ]);
        let out = run(json!([{"$unwind": "$a"}]), input.clone()).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[3], json!({"_id": 5, "a": 7}));

        let out = run(
            json!([{"$unwind": {"path": "$a", "includeArrayIndex": "i", "preserveNullAndEmptyArrays": true}}]),
            input,
        )
        .unwrap();
        assert_eq!(out.len(), 7);
        assert_eq!(out[1], json!({"_id": 1, "a": 2, "i": 1}));
        assert_eq!(out[3], json!({"_id": 2, "i": null}));
    }

    #[test]
    fn replace_root_requires_document() {
        let out = run(json!([{"$replaceRoot": {"newRoot": "$x"}}]), json!([{"x": {"y": 1}}])).unwrap();
        assert_eq!(out, vec![json!({"y": 1})]);
        let err = run(json!([{"$replaceRoot": {"newRoot": "$x"}}]), json!([{"x": 3}])).unwrap_err();
        assert_eq!(err.code(), codes::REPLACE_ROOT_NOT_OBJECT);
    }

    #[test]
    fn redact_descends_into_arrays() {
        let pipeline = json!([{"$redact": {"$cond": [{"$eq": ["$level", 5]}, "$$PRUNE", "$$DESCEND"]}}]);
        let input = json!([{
            "_id": 1,
            "level": 1,
            "subs": [{"level": 5, "secret": true}, {"level": 2, "x": 1}],
            "inner": {"level": 5}
        }]);
        let out = run(pipeline, input).unwrap();
        assert_eq!(out, vec![json!({"_id": 1, "level": 1, "subs": [{"level": 2, "x": 1}]})]);

        let err = run(json!([{"$redact": "yes"}]), json!([{}])).unwrap_err();
        assert_eq!(err.code(), codes::REDACT_BAD_RESULT);
    }

    #[test]
    fn skip_limit_and_count() {
        let input = json!([{"a": 1}, {"a": 2}, {"a": 3}, {"a": 4}]);
        let out = run(json!([{"$skip": 1}, {"$limit": 2}]), input.clone()).unwrap();
        assert_eq!(out, vec![json!({"a": 2}), json!({"a": 3})]);
        let out = run(json!([{"$match": {"a": {"$gt": 1}}}, {"$count": "n"}]), input).unwrap();
        assert_eq!(out, vec![json!({"n": 3})]);
    }

    #[test]
    fn facet_runs_each_branch_over_the_same_input() {
        let out = run(
            json!([{"$facet": {
                "total": [{"$count": "n"}],
                "top": [{"$sort": {"a": -1}}, {"$limit": 1}, {"$project": {"_id": 0, "a": 1}}],
                "none": [{"$match": {"a": 99}}]
            }}]),
            json!([{"_id": 1, "a": 1}, {"_id": 2, "a": 5}]),
        )
        .unwrap();
        assert_eq!(out, vec![json!({"total": [{"n": 2}], "top": [{"a": 5}], "none": []})]);
    }

    #[test]
    fn sample_returns_distinct_subset() {
        let input: Vec<_> = (0..50).map(|i| json!({"_id": i})).collect();
        let out = run(json!([{"$sample": {"size": 10}}]), json!(input)).unwrap();
        assert_eq!(out.len(), 10);
        let mut ids: Vec<i64> = out.iter().map(|d| d["_id"].as_i64().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);

        let out = run(json!([{"$sample": {"size": 10}}]), json!([{"_id": 1}])).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn lookup_against_missing_collection_is_empty() {
        let out = run(
            json!([{"$lookup": {"from": "nope", "localField": "a", "foreignField": "b", "as": "j"}}]),
            json!([{"a": 1}]),
        )
        .unwrap();
        assert_eq!(out, vec![json!({"a": 1, "j": []})]);
    }

    #[test]
    fn interrupt_stops_the_chain() {
        let ctx = ExecContext::default();
        ctx.interrupt_handle().interrupt();
        let stages = parse_stages(&Value::from_json(&json!([{"$group": {"_id": "$a"}}])), &mut VariablesParseState::new()).unwrap();
        let docs = (0..1000).map(|i| Document::from_json(&json!({"a": i})).unwrap()).collect();
        let catalog: Arc<dyn Catalog> = Arc::new(NoCatalog);
        let root = Node::scan(Box::new(VecCursor::new(docs)));
        let mut node = Node::build_chain(stages, root, &catalog, &ctx).unwrap();
        let mut vars = ctx.variables();
        let err = node.next(&ctx, &mut vars).unwrap_err();
        assert_eq!(err.code(), 11601);
    }

    fn stock() -> Arc<dyn Catalog> {
        Arc::new(FixedCatalog(docs(json!([
            {"_id": 1, "sku": "a", "qty": 5},
            {"_id": 2, "sku": "a", "qty": 50},
            {"_id": 3, "sku": "b", "qty": 7},
        ]))))
    }

    fn orders() -> serde_json::Value {
        json!([
            {"_id": 10, "item": "a", "min": 10},
            {"_id": 11, "item": "b", "min": 1},
            {"_id": 12, "item": "c", "min": 0},
        ])
    }

    #[test]
    fn lookup_pipeline_binds_let_per_document() {
        let pipeline = json!([
            {"$lookup": {
                "from": "stock",
                "let": {"item": "$item", "min": "$min"},
                "pipeline": [
                    {"$match": {"$expr": {"$and": [{"$eq": ["$sku", "$$item"]}, {"$gte": ["$qty", "$$min"]}]}}},
                    {"$project": {"_id": 0, "qty": 1}}
                ],
                "as": "stock"
            }},
            {"$project": {"stock": 1}}
        ]);
        let out = run_with(stock(), pipeline, orders()).unwrap();
        assert_eq!(
            out,
            vec![
                json!({"_id": 10, "stock": [{"qty": 50}]}),
                json!({"_id": 11, "stock": [{"qty": 7}]}),
                json!({"_id": 12, "stock": []}),
            ]
        );
    }

    #[test]
    fn lookup_pipeline_without_let_is_the_same_for_every_document() {
        let pipeline = json!([
            {"$lookup": {
                "from": "stock",
                "pipeline": [{"$match": {"qty": {"$gt": 6}}}, {"$count": "n"}],
                "as": "big"
            }},
            {"$project": {"big": 1}}
        ]);
        let out = run_with(stock(), pipeline, orders()).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|d| d["big"] == json!([{"n": 2}])));
    }

    #[test]
    fn lookup_equality_join_feeds_the_pipeline() {
        let pipeline = json!([
            {"$lookup": {
                "from": "stock",
                "localField": "item",
                "foreignField": "sku",
                "let": {"floor": "$min"},
                "pipeline": [{"$match": {"$expr": {"$gte": ["$qty", "$$floor"]}}}, {"$sort": {"qty": -1}}],
                "as": "stock"
            }},
            {"$project": {"ids": "$stock._id"}}
        ]);
        let out = run_with(stock(), pipeline, orders()).unwrap();
        assert_eq!(
            out,
            vec![
                json!({"_id": 10, "ids": [2]}),
                json!({"_id": 11, "ids": [3]}),
                json!({"_id": 12, "ids": []}),
            ]
        );
    }

    #[test]
    fn lookup_let_names_are_scoped_to_the_sub_pipeline() {
        // A later `$map` may reuse the name `v` with its own binding.
        let pipeline = json!([
            {"$lookup": {
                "from": "stock",
                "let": {"v": "$item"},
                "pipeline": [{"$match": {"$expr": {"$eq": ["$sku", "$$v"]}}}],
                "as": "hits"
            }},
            {"$project": {"_id": 1, "n": {"$size": "$hits"}, "doubled": {"$map": {"input": [1, 2], "as": "v", "in": {"$multiply": ["$$v", 2]}}}}}
        ]);
        let out = run_with(stock(), pipeline, orders()).unwrap();
        assert_eq!(out[0], json!({"_id": 10, "n": 2, "doubled": [2, 4]}));
        assert_eq!(out[2], json!({"_id": 12, "n": 0, "doubled": [2, 4]}));
    }

    fn bucket() -> serde_json::Value {
        json!({
            "_id": "b1",
            "control": {"version": 1, "min": {"time": 100}, "max": {"time": 102}},
            "meta": {"sensor": "s1"},
            "region": "eu",
            "data": {
                "_id": {"0": 1, "1": 2, "2": 3},
                "time": {"0": 100, "1": 101, "2": 102},
                "temp": {"0": 20.5, "2": 22.0}
            }
        })
    }

    #[test]
    fn unpack_bucket_emits_one_document_per_row() {
        let out = run(
            json!([{"$_internalUnpackBucket": {"timeField": "time", "metaField": "tag", "bucketMaxSpanSeconds": 3600}}]),
            json!([bucket()]),
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                json!({"time": 100, "tag": {"sensor": "s1"}, "_id": 1, "temp": 20.5}),
                json!({"time": 101, "tag": {"sensor": "s1"}, "_id": 2}),
                json!({"time": 102, "tag": {"sensor": "s1"}, "_id": 3, "temp": 22.0}),
            ]
        );

        let mut pending = VecDeque::new();
        let spec = UnpackBucketSpec::parse_internal(&Value::from_json(
            &json!({"timeField": "time", "metaField": "tag", "bucketMaxSpanSeconds": 3600}),
        ))
        .unwrap();
        unpack_bucket::unpack(&spec, &Document::from_json(&bucket()).unwrap(), &mut pending).unwrap();
        let keys: Vec<_> = pending[0].keys().cloned().collect();
        assert_eq!(keys, vec!["time", "tag", "_id", "temp"]);
    }

    #[test]
    fn unpack_bucket_include_exclude_and_computed_fields() {
        let include = run(
            json!([{"$_internalUnpackBucket": {
                "include": ["time", "temp"],
                "timeField": "time",
                "metaField": "tag",
                "bucketMaxSpanSeconds": 3600
            }}]),
            json!([bucket()]),
        )
        .unwrap();
        let exclude = run(
            json!([{"$_internalUnpackBucket": {
                "exclude": ["_id", "tag"],
                "timeField": "time",
                "metaField": "tag",
                "bucketMaxSpanSeconds": 3600
            }}]),
            json!([bucket()]),
        )
        .unwrap();
        assert_eq!(include, exclude);
        assert_eq!(include[1], json!({"time": 101}));

        let out = run(
            json!([
                {"$_internalUnpackBucket": {
                    "exclude": ["_id"],
                    "timeField": "time",
                    "bucketMaxSpanSeconds": 3600,
                    "computedMetaProjFields": ["region"]
                }},
                {"$match": {"temp": {"$gt": 21}}}
            ]),
            json!([bucket()]),
        )
        .unwrap();
        assert_eq!(out, vec![json!({"time": 102, "temp": 22.0, "region": "eu"})]);
    }

    #[test]
    fn limit_releases_upstream_once_reached() {
        let spill_dir = tempfile::tempdir().unwrap();
        let ctx = ExecContext::new(crate::config::AggregateConfig {
            max_memory_bytes: 1,
            spill_dir: Some(spill_dir.path().to_path_buf()),
            ..Default::default()
        });
        let stages = parse_stages(
            &Value::from_json(&json!([{"$sort": {"a": 1}}, {"$limit": 2}])),
            &mut VariablesParseState::new(),
        )
        .unwrap();
        let input = docs(json!((0..20).map(|i| json!({"a": 20 - i})).collect::<Vec<_>>()));
        let catalog: Arc<dyn Catalog> = Arc::new(NoCatalog);
        let root = Node::scan(Box::new(VecCursor::new(input)));
        let mut node = Node::build_chain(stages, root, &catalog, &ctx).unwrap();
        let mut vars = ctx.variables();
        assert!(node.next(&ctx, &mut vars).unwrap().is_some());
        assert!(node.next(&ctx, &mut vars).unwrap().is_some());
        let spill_entries = || std::fs::read_dir(spill_dir.path()).unwrap().count();
        assert_eq!(spill_entries(), 1);
        assert!(node.next(&ctx, &mut vars).unwrap().is_none());
        assert_eq!(spill_entries(), 0);
        let Some(upstream) = node.input.as_ref() else { panic!("limit has an input") };
        assert!(matches!(&upstream.kind, NodeKind::Sort { sorter, .. } if sorter.spills() == 20));
    }
}
