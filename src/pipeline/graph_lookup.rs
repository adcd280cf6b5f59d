use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;

use crate::context::ExecContext;
use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::expression::{Variables, VariablesParseState};
use crate::matcher::{Matcher, path_values};
use crate::source::{DocumentSource, scan_matching};
use crate::value::Value;

use super::stage::GraphLookupSpec;

/// Identity under which a found document is visited at most once.
fn identity(doc: &Document) -> Value {
    match doc.get("_id") {
        Some(id) => id.clone(),
        None => Value::Document(doc.clone()),
    }
}

/// Values a document contributes to the next frontier. Arrays contribute
/// their elements.
fn connect_values(doc: &Document, path: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for v in path_values(doc, path) {
        match v {
            Value::Array(items) => out.extend(items.iter().cloned()),
            Value::Missing => {}
            other => out.push(other.clone()),
        }
    }
    out
}

fn level_matcher(spec: &GraphLookupSpec, frontier: Vec<Value>) -> Result<Matcher> {
    let mut cond = Document::new();
    cond.insert("$in", Value::Array(frontier));
    let mut filter = Document::new();
    filter.insert(spec.connect_to_field.clone(), Value::Document(cond));
    let matcher = Matcher::parse(&Value::Document(filter), &mut VariablesParseState::new())?;
    Ok(match &spec.restrict_search_with_match {
        Some(restrict) => matcher.and(restrict.clone()),
        None => matcher,
    })
}

/// Breadth-first traversal of `foreign` starting from `startWith`.
///
/// Every connect value is queried once and every document is emitted once,
/// so cycles terminate. Results come back in discovery order.
pub(crate) fn traverse(
    spec: &GraphLookupSpec,
    doc: &Document,
    foreign: &dyn DocumentSource,
    ctx: &ExecContext,
    vars: &mut Variables,
) -> Result<Vec<Document>> {
    let start = spec.start_with.evaluate(doc, vars)?;
    let mut frontier: VecDeque<Value> = match start {
        Value::Missing => return Ok(Vec::new()),
        Value::Array(items) => items.into(),
        other => VecDeque::from([other]),
    };

    let mut seen: HashSet<Value> = HashSet::new();
    frontier.retain(|v| seen.insert(v.clone()));

    let mut visited: IndexMap<Value, Document> = IndexMap::new();
    let mut used_bytes = 0usize;
    let mut depth = 0u64;

    while !frontier.is_empty() {
        if spec.max_depth.is_some_and(|max| depth > max) {
            break;
        }
        ctx.check_interrupt()?;
        let level: Vec<Value> = frontier.drain(..).collect();
        let matcher = level_matcher(spec, level)?;
        for found in scan_matching(foreign, &matcher, ctx, vars)? {
            let key = identity(&found);
            if visited.contains_key(&key) {
                continue;
            }
            for next in connect_values(&found, &spec.connect_from_field) {
                if seen.insert(next.clone()) {
                    frontier.push_back(next);
                }
            }
            let mut found = found;
            if let Some(field) = &spec.depth_field {
                found.set_path(field, Value::Int64(depth as i64));
            }
            used_bytes += found.approx_size();
            if used_bytes > ctx.config.max_memory_bytes {
                return Err(Error::location(
                    codes::GRAPH_LOOKUP_MEMORY,
                    format!(
                        "$graphLookup reached maximum memory consumption of {} bytes",
                        ctx.config.max_memory_bytes
                    ),
                ));
            }
            visited.insert(key, found);
        }
        depth += 1;
    }
    tracing::trace!(
        from = %spec.from,
        found = visited.len(),
        depth,
        "graph lookup traversal"
    );
    Ok(visited.into_values().collect())
}
