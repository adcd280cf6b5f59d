//! Local, semantics-preserving rewrites of a parsed pipeline.

use crate::expression::DepsTracker;
use crate::pipeline::{ProjectionMode, SortSpec, Stage};
use crate::source::ScanSpec;

/// Upper bound on rewrite passes. Every rule shrinks the pipeline or moves a
/// `$match` earlier, so a fixpoint is reached long before this.
const MAX_PASSES: usize = 64;

/// Rewrite `stages` until no rule applies.
pub fn optimize(stages: Vec<Stage>) -> Vec<Stage> {
    let mut stages: Vec<Stage> = stages.into_iter().map(optimize_nested).collect();
    for pass in 0..MAX_PASSES {
        if !rewrite_pass(&mut stages) {
            tracing::trace!(passes = pass + 1, stages = stages.len(), "pipeline optimized");
            break;
        }
    }
    stages
}

fn optimize_nested(stage: Stage) -> Stage {
    match stage {
        Stage::Facet(facets) => Stage::Facet(
            facets
                .into_iter()
                .map(|(name, branch)| (name, optimize(branch)))
                .collect(),
        ),
        Stage::Lookup(mut spec) => {
            spec.pipeline = spec.pipeline.map(optimize);
            Stage::Lookup(spec)
        }
        Stage::ReplaceRoot { expr, source } => Stage::ReplaceRoot {
            expr: expr.optimize(),
            source,
        },
        Stage::Redact { expr, source } => Stage::Redact {
            expr: expr.optimize(),
            source,
        },
        other => other,
    }
}

fn match_deps(stage: &Stage) -> DepsTracker {
    let mut deps = DepsTracker::default();
    stage.add_dependencies(&mut deps);
    deps
}

/// One left-to-right sweep. Returns whether anything changed.
fn rewrite_pass(stages: &mut Vec<Stage>) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i < stages.len() {
        if let Some(rule) = rewrite_single(stages, i) {
            tracing::debug!(rule, index = i, "pipeline rewrite");
            changed = true;
            continue;
        }
        if i + 1 < stages.len() {
            if let Some(rule) = rewrite_pair(stages, i) {
                tracing::debug!(rule, index = i, "pipeline rewrite");
                changed = true;
                continue;
            }
        }
        i += 1;
    }
    changed
}

fn rewrite_single(stages: &mut Vec<Stage>, i: usize) -> Option<&'static str> {
    match &stages[i] {
        Stage::Match(m) if m.is_match_all() => {
            stages.remove(i);
            Some("remove empty $match")
        }
        Stage::Skip(0) => {
            stages.remove(i);
            Some("remove $skip 0")
        }
        _ => None,
    }
}

fn rewrite_pair(stages: &mut Vec<Stage>, i: usize) -> Option<&'static str> {
    let (left, right) = (&stages[i], &stages[i + 1]);
    let rule = match (left, right) {
        (Stage::Sort(s), Stage::Match(_)) if s.limit.is_none() => {
            stages.swap(i, i + 1);
            "$match before $sort"
        }
        (Stage::Unwind(u), Stage::Match(_)) => {
            let mut written = vec![u.path.as_str()];
            if let Some(idx) = &u.include_array_index {
                written.push(idx.as_str());
            }
            if !match_deps(right).independent_of(written) {
                return None;
            }
            stages.swap(i, i + 1);
            "$match before $unwind"
        }
        (Stage::AddFields(a), Stage::Match(_)) => {
            if !match_deps(right).independent_of(a.paths()) {
                return None;
            }
            stages.swap(i, i + 1);
            "$match before $addFields"
        }
        (Stage::Match(_), Stage::Match(_)) => {
            let Stage::Match(second) = stages.remove(i + 1) else {
                return None;
            };
            let Stage::Match(first) = stages.remove(i) else {
                return None;
            };
            stages.insert(i, Stage::Match(first.and(second)));
            "coalesce $match"
        }
        (Stage::AddFields(a), Stage::AddFields(b)) => {
            let merged = a.coalesce(b)?;
            stages.splice(i..i + 2, [Stage::AddFields(merged)]);
            "coalesce $addFields"
        }
        (Stage::Project(a), Stage::Project(b))
            if a.mode() == ProjectionMode::Exclusion && b.mode() == ProjectionMode::Exclusion =>
        {
            let merged = a.coalesce_exclusion(b)?;
            stages.splice(i..i + 2, [Stage::Project(merged)]);
            "coalesce exclusion $project"
        }
        (Stage::Sort(s), Stage::Limit(n)) => {
            let limit = s.limit.map_or(*n, |l| l.min(*n));
            let spec = SortSpec {
                keys: s.keys.clone(),
                limit: Some(limit),
            };
            stages.splice(i..i + 2, [Stage::Sort(spec)]);
            "top-k $sort"
        }
        (Stage::Skip(a), Stage::Skip(b)) => {
            let total = a.saturating_add(*b);
            stages.splice(i..i + 2, [Stage::Skip(total)]);
            "coalesce $skip"
        }
        (Stage::Limit(a), Stage::Limit(b)) => {
            let min = (*a).min(*b);
            stages.splice(i..i + 2, [Stage::Limit(min)]);
            "coalesce $limit"
        }
        _ => return None,
    };
    Some(rule)
}

/// Detach the leading `$match` and `$sort` so the source may satisfy them.
pub fn split_scan_prefix(stages: &mut Vec<Stage>) -> ScanSpec {
    let mut spec = ScanSpec::default();
    if let Some(Stage::Match(_)) = stages.first() {
        if let Stage::Match(m) = stages.remove(0) {
            spec.filter = Some(m);
        }
    }
    if let Some(Stage::Sort(_)) = stages.first() {
        if let Stage::Sort(s) = stages.remove(0) {
            spec.sort = Some(s);
        }
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::VariablesParseState;
    use crate::pipeline::parse_stages;
    use crate::value::Value;
    use serde_json::json;

    fn names(pipeline: serde_json::Value) -> Vec<serde_json::Value> {
        let stages = parse_stages(&Value::from_json(&pipeline), &mut VariablesParseState::new()).unwrap();
        optimize(stages).iter().map(|s| s.to_value().to_json()).collect()
    }

    #[test]
    fn match_moves_before_sort_and_coalesces() {
        let out = names(json!([
            {"$sort": {"a": 1}},
            {"$match": {"b": 1}},
            {"$match": {"c": 2}},
        ]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], json!({"$match": {"$and": [{"b": 1}, {"c": 2}]}}));
        assert_eq!(out[1], json!({"$sort": {"sortKey": {"a": 1}}}));
    }

    #[test]
    fn match_stays_after_dependent_unwind_and_add_fields() {
        let out = names(json!([
            {"$unwind": "$tags"},
            {"$match": {"tags": "x"}},
        ]));
        assert!(out[0].get("$unwind").is_some());

        let out = names(json!([
            {"$unwind": "$tags"},
            {"$match": {"other": "x"}},
        ]));
        assert!(out[0].get("$match").is_some());

        let out = names(json!([
            {"$addFields": {"y": {"$add": ["$x", 1]}}},
            {"$match": {"y": 2}},
        ]));
        assert!(out[0].get("$addFields").is_some());

        let out = names(json!([
            {"$set": {"y": 1}},
            {"$match": {"x": 2}},
        ]));
        assert!(out[0].get("$match").is_some());
    }

    #[test]
    fn sort_limit_becomes_top_k() {
        let out = names(json!([
            {"$sort": {"a": -1}},
            {"$limit": 10},
            {"$limit": 3},
        ]));
        assert_eq!(out, vec![json!({"$sort": {"sortKey": {"a": -1}, "limit": 3}})]);
    }

    #[test]
    fn top_k_sort_does_not_swap_with_match() {
        let out = names(json!([
            {"$sort": {"a": 1}},
            {"$limit": 2},
            {"$match": {"b": 1}},
        ]));
        assert!(out[0].get("$sort").is_some());
    }

    #[test]
    fn skip_chain_and_empty_match() {
        let out = names(json!([
            {"$match": {}},
            {"$skip": 2},
            {"$skip": 3},
        ]));
        assert_eq!(out, vec![json!({"$skip": 5})]);
    }

    #[test]
    fn exclusion_projects_coalesce() {
        let out = names(json!([
            {"$unset": "a"},
            {"$project": {"b": 0}},
        ]));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn facet_branches_are_optimized() {
        let out = names(json!([
            {"$facet": {"x": [{"$skip": 1}, {"$skip": 1}]}},
        ]));
        assert_eq!(out, vec![json!({"$facet": {"x": [{"$skip": 2}]}})]);
    }

    #[test]
    fn lookup_sub_pipelines_are_optimized() {
        let stages = parse_stages(
            &Value::from_json(&json!([{"$lookup": {
                "from": "f",
                "pipeline": [{"$skip": 1}, {"$skip": 2}],
                "as": "j"
            }}])),
            &mut VariablesParseState::new(),
        )
        .unwrap();
        let optimized = optimize(stages);
        let Stage::Lookup(spec) = &optimized[0] else { panic!("expected $lookup") };
        let sub = spec.pipeline.as_ref().unwrap();
        assert_eq!(sub.len(), 1);
        assert!(matches!(sub[0], Stage::Skip(3)));
    }

    #[test]
    fn scan_prefix_split() {
        let mut stages = parse_stages(
            &Value::from_json(&json!([{"$match": {"a": 1}}, {"$sort": {"b": 1}}, {"$limit": 1}])),
            &mut VariablesParseState::new(),
        )
        .unwrap();
        let spec = split_scan_prefix(&mut stages);
        assert!(spec.filter.is_some());
        assert!(spec.sort.is_some());
        assert_eq!(stages.len(), 1);
    }
}
