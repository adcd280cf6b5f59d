//! `$group` execution: hash partitioning with a memory budget and external
//! spilling of partial accumulator states.
//!
//! Phases run `Collecting -> (Spilling -> Collecting)* -> Finalizing ->
//! Exhausted`. Spilled runs hold `(key, partial states)` sorted by key and
//! are combined with the residual table by a k-way merge.

use std::cmp::Ordering;
use std::fmt;

use indexmap::IndexMap;

use crate::accumulator::{AccumulationStatement, AccumulatorEnv, AccumulatorState};
use crate::collation::Collation;
use crate::context::ExecContext;
use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::expression::{Expression, Variables, VariablesParseState};
use crate::spill::{MergeCursor, RunHandle, SpillStore, TempDirSpillStore, reduce_runs};
use crate::value::{Value, compare_values};

// ---------------------------------------------------------------------------
// Specification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub id: Expression,
    pub accumulators: Vec<AccumulationStatement>,
}

impl GroupSpec {
    pub fn parse(spec: &Value, vps: &mut VariablesParseState) -> Result<Self> {
        let Value::Document(doc) = spec else {
            return Err(Error::InvalidPipeline(
                "a group's fields must be specified in an object".into(),
            ));
        };
        let id_spec = doc.get("_id").ok_or_else(|| {
            Error::location(
                codes::GROUP_ID_REQUIRED,
                "a group specification must include an _id",
            )
        })?;
        let id = Expression::parse(id_spec, vps)?.optimize();
        let mut accumulators = Vec::new();
        for (field, acc) in doc {
            if field == "_id" {
                continue;
            }
            if field.contains('.') {
                return Err(Error::location(
                    codes::GROUP_FIELD_DOTTED,
                    format!("the group aggregate field name '{field}' cannot contain '.'"),
                ));
            }
            if field.starts_with('$') {
                return Err(Error::InvalidPipeline(format!(
                    "the group aggregate field name '{field}' cannot be an operator name"
                )));
            }
            let stmt = AccumulationStatement::parse(field, acc, vps)
                .map_err(|e| e.context(format!("$group field '{field}'")))?;
            accumulators.push(stmt);
        }
        Ok(Self { id, accumulators })
    }

    /// Whether every accumulator can be written to a spill run.
    pub fn is_spillable(&self) -> bool {
        self.accumulators.iter().all(|a| a.op.is_spillable())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    Collecting,
    Spilling,
    Finalizing,
    Exhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub input_docs: u64,
    pub groups: u64,
    pub spills: u64,
    pub spilled_records: u64,
    pub spilled_bytes: u64,
    pub merge_passes: u32,
    pub peak_memory: usize,
}

/// One key's partial result. `key` is the first-seen grouping value; the
/// table itself is keyed by its collation-normalized form.
#[derive(Debug, Clone)]
struct GroupEntry {
    key: Value,
    states: Vec<AccumulatorState>,
}

impl GroupEntry {
    fn mem_size(&self, table_key: &Value) -> usize {
        table_key.approx_size()
            + self.key.approx_size()
            + self.states.iter().map(AccumulatorState::mem_size).sum::<usize>()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.key.write_to(&mut buf)?;
        buf.extend_from_slice(&(self.states.len() as u32).to_le_bytes());
        for state in &self.states {
            state.write_to(&mut buf)?;
        }
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let key = Value::read_from(&mut cursor)?;
        let mut len = [0u8; 4];
        std::io::Read::read_exact(&mut cursor, &mut len)?;
        let n = u32::from_le_bytes(len) as usize;
        let mut states = Vec::with_capacity(n);
        for _ in 0..n {
            states.push(AccumulatorState::read_from(&mut cursor)?);
        }
        Ok(Self { key, states })
    }
}

type SpillEntry = (Value, GroupEntry);
type EntryOrder = fn(&SpillEntry, &SpillEntry) -> Ordering;
type SpillCursor = MergeCursor<'static, SpillEntry, EntryOrder>;

fn compare_entries(a: &SpillEntry, b: &SpillEntry) -> Ordering {
    compare_values(&a.0, &b.0, None)
}

fn run_entries(run: &RunHandle) -> Result<Box<dyn Iterator<Item = Result<SpillEntry>>>> {
    let reader = run.iterate()?;
    Ok(Box::new(reader.map(|record| {
        let (key, payload) = record?;
        Ok((key, GroupEntry::decode(&payload)?))
    })))
}

/// Next key out of `cursor` with every later entry for the same key merged
/// into it. `pending` carries the first entry of the following key.
fn next_combined(
    cursor: &mut MergeCursor<'_, SpillEntry, EntryOrder>,
    pending: &mut Option<SpillEntry>,
    ctx: &ExecContext,
    env: &AccumulatorEnv<'_>,
) -> Result<Option<SpillEntry>> {
    let first = match pending.take() {
        Some(e) => Some(e),
        None => cursor.next_item()?.map(|(_, e)| e),
    };
    let Some((table_key, mut merged)) = first else {
        return Ok(None);
    };
    let mut read = 0u64;
    loop {
        read += 1;
        ctx.check_interrupt_every(read)?;
        match cursor.next_item()? {
            Some((_, (k, later))) if compare_values(&k, &table_key, None) == Ordering::Equal => {
                for (state, other) in merged.states.iter_mut().zip(later.states) {
                    state.merge(other, env)?;
                }
            }
            Some((_, next)) => {
                *pending = Some(next);
                break;
            }
            None => break,
        }
    }
    Ok(Some((table_key, merged)))
}

enum Output {
    None,
    Table(indexmap::map::IntoIter<Value, GroupEntry>),
    Merge {
        cursor: SpillCursor,
        pending: Option<SpillEntry>,
    },
}

/// Grouping key under the active collation: strings that compare equal must
/// hash equal, so they are case-folded when the collation ignores case.
fn collation_key(value: &Value, collation: Option<&Collation>) -> Value {
    let Some(c) = collation.filter(|c| !c.is_simple()) else {
        return value.clone();
    };
    match value {
        Value::String(s) => Value::String(s.chars().flat_map(char::to_lowercase).collect()),
        Value::Array(items) => Value::Array(items.iter().map(|v| collation_key(v, Some(c))).collect()),
        Value::Document(doc) => Value::Document(
            doc.iter()
                .map(|(k, v)| (k.clone(), collation_key(v, Some(c))))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub struct GroupEngine {
    spec: GroupSpec,
    phase: GroupPhase,
    table: IndexMap<Value, GroupEntry>,
    mem_used: usize,
    store: Option<TempDirSpillStore>,
    runs: Vec<RunHandle>,
    output: Output,
    stats: GroupStats,
}

impl GroupEngine {
    pub fn new(spec: GroupSpec) -> Self {
        Self {
            spec,
            phase: GroupPhase::Collecting,
            table: IndexMap::new(),
            mem_used: 0,
            store: None,
            runs: Vec::new(),
            output: Output::None,
            stats: GroupStats::default(),
        }
    }

    pub fn phase(&self) -> GroupPhase {
        self.phase
    }

    pub fn stats(&self) -> &GroupStats {
        &self.stats
    }

    pub fn spec(&self) -> &GroupSpec {
        &self.spec
    }

    /// Feed one input document.
    pub fn process(&mut self, doc: &Document, ctx: &ExecContext, vars: &mut Variables) -> Result<()> {
        if self.phase != GroupPhase::Collecting {
            return Err(Error::InvalidPipeline(format!(
                "$group received input while {:?}",
                self.phase
            )));
        }
        self.stats.input_docs += 1;
        ctx.check_interrupt_every(self.stats.input_docs)?;

        let key = self.spec.id.evaluate(doc, vars)?.missing_to_null();
        let table_key = collation_key(&key, ctx.collation.as_ref());
        let env = ctx.accumulator_env();

        let entry = match self.table.get_index_of(&table_key) {
            Some(i) => &mut self.table[i],
            None => {
                let states = self
                    .spec
                    .accumulators
                    .iter()
                    .map(|stmt| stmt.init(doc, vars))
                    .collect::<Result<Vec<_>>>()?;
                let entry = GroupEntry { key, states };
                self.mem_used += entry.mem_size(&table_key);
                let (i, _) = self.table.insert_full(table_key.clone(), entry);
                &mut self.table[i]
            }
        };

        let mut delta: isize = 0;
        for (stmt, state) in self.spec.accumulators.iter().zip(entry.states.iter_mut()) {
            let value = stmt.argument.evaluate(doc, vars)?;
            let before = state.mem_size();
            state.accumulate(value, &env)?;
            delta += state.mem_size() as isize - before as isize;
        }
        self.mem_used = self.mem_used.saturating_add_signed(delta);
        self.stats.peak_memory = self.stats.peak_memory.max(self.mem_used);

        if self.mem_used > ctx.config.max_memory_bytes {
            self.over_budget(ctx)?;
        }
        Ok(())
    }

    fn over_budget(&mut self, ctx: &ExecContext) -> Result<()> {
        let limit = ctx.config.max_memory_bytes;
        if !ctx.config.allow_disk_use {
            return Err(Error::MemoryLimitNoDiskUse {
                stage: "$group",
                used: self.mem_used,
                limit,
            });
        }
        if let Some(stmt) = self.spec.accumulators.iter().find(|a| !a.op.is_spillable()) {
            return Err(Error::ExceededMemoryLimit(format!(
                "$group used {} bytes with a memory limit of {limit} bytes, and accumulator \
                 '{}' ({}) cannot spill to disk",
                self.mem_used,
                stmt.field,
                stmt.op.name()
            )));
        }
        self.spill(ctx)
    }

    fn spill(&mut self, ctx: &ExecContext) -> Result<()> {
        self.phase = GroupPhase::Spilling;
        ctx.check_interrupt()?;
        if self.store.is_none() {
            self.store = Some(ctx.spill_store()?);
        }
        let Some(store) = self.store.as_mut() else {
            return Err(Error::SpillCorrupted("spill store unavailable".into()));
        };

        let mut entries: Vec<(Value, GroupEntry)> = self.table.drain(..).collect();
        entries.sort_by(|a, b| compare_values(&a.0, &b.0, None));

        let mut run = store.create_run()?;
        for (i, (table_key, entry)) in entries.iter().enumerate() {
            ctx.check_interrupt_every(i as u64 + 1)?;
            run.append(table_key, &entry.encode()?)?;
        }
        run.finish()?;

        self.stats.spills += 1;
        self.stats.spilled_records += run.records();
        self.stats.spilled_bytes += run.bytes();
        tracing::debug!(
            run = self.runs.len(),
            records = run.records(),
            bytes = run.bytes(),
            memory = self.mem_used,
            "$group spilled partial states"
        );
        self.runs.push(run);
        self.mem_used = 0;
        self.phase = GroupPhase::Collecting;
        Ok(())
    }

    /// Upstream is exhausted; prepare the output.
    pub fn finish_input(&mut self, ctx: &ExecContext) -> Result<()> {
        if self.phase != GroupPhase::Collecting {
            return Ok(());
        }
        self.phase = GroupPhase::Finalizing;
        let table = std::mem::take(&mut self.table);
        if self.runs.is_empty() {
            self.stats.groups = table.len() as u64;
            tracing::debug!(groups = table.len(), "$group finalizing in memory");
            self.output = Output::Table(table.into_iter());
            return Ok(());
        }

        // The residual table takes one merge slot.
        let fan_in = ctx.config.merge_fan_in();
        if self.runs.len() >= fan_in {
            let Some(store) = self.store.as_mut() else {
                return Err(Error::SpillCorrupted("spill store unavailable".into()));
            };
            let env = ctx.accumulator_env();
            let passes = reduce_runs(store, &mut self.runs, fan_in - 1, fan_in, |batch, out| {
                let sources = batch.iter().map(run_entries).collect::<Result<Vec<_>>>()?;
                let mut cursor = MergeCursor::new(sources, compare_entries as EntryOrder);
                let mut pending = None;
                while let Some((table_key, entry)) = next_combined(&mut cursor, &mut pending, ctx, &env)? {
                    out.append(&table_key, &entry.encode()?)?;
                }
                Ok(())
            })?;
            self.stats.merge_passes += passes;
        }

        let mut residual: Vec<SpillEntry> = table.into_iter().collect();
        residual.sort_by(compare_entries);
        let mut sources = self.runs.iter().map(run_entries).collect::<Result<Vec<_>>>()?;
        sources.push(Box::new(residual.into_iter().map(Ok)));
        tracing::debug!(
            runs = self.runs.len(),
            merge_passes = self.stats.merge_passes,
            "$group merging spilled runs"
        );
        self.output = Output::Merge {
            cursor: MergeCursor::new(sources, compare_entries as EntryOrder),
            pending: None,
        };
        Ok(())
    }

    /// Next output document, or `None` once every group was emitted.
    pub fn next_output(&mut self, ctx: &ExecContext) -> Result<Option<Document>> {
        if self.phase == GroupPhase::Collecting {
            self.finish_input(ctx)?;
        }
        let env = ctx.accumulator_env();
        let entry = match &mut self.output {
            Output::None => None,
            Output::Table(iter) => iter.next().map(|(_, e)| e),
            Output::Merge { cursor, pending } => {
                let combined = next_combined(cursor, pending, ctx, &env)?;
                if combined.is_some() {
                    self.stats.groups += 1;
                }
                combined.map(|(_, e)| e)
            }
        };

        let Some(entry) = entry else {
            self.exhaust();
            return Ok(None);
        };
        let mut out = Document::with_capacity(self.spec.accumulators.len() + 1);
        out.insert("_id", entry.key.clone());
        for (stmt, state) in self.spec.accumulators.iter().zip(&entry.states) {
            out.insert(stmt.field.clone(), state.finalize(&entry.key, &env)?);
        }
        Ok(Some(out))
    }

    fn exhaust(&mut self) {
        if self.phase == GroupPhase::Exhausted {
            return;
        }
        self.phase = GroupPhase::Exhausted;
        self.output = Output::None;
        for run in self.runs.drain(..) {
            if let Err(e) = run.dispose() {
                tracing::warn!(error = %e, "failed to remove spill run");
            }
        }
        self.store = None;
        tracing::debug!(stats = ?self.stats, "$group exhausted");
    }

    /// Release all state early. Spill files go with the store.
    pub fn close(&mut self) {
        self.table.clear();
        self.mem_used = 0;
        self.exhaust();
    }
}

impl fmt::Debug for GroupEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupEngine")
            .field("phase", &self.phase)
            .field("groups_in_memory", &self.table.len())
            .field("mem_used", &self.mem_used)
            .field("runs", &self.runs.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregateConfig;
    use serde_json::json;

    fn ctx_with(max_memory_bytes: usize, allow_disk_use: bool) -> ExecContext {
        ExecContext::new(AggregateConfig {
            max_memory_bytes,
            allow_disk_use,
            ..AggregateConfig::default()
        })
    }

    fn run_group(
        ctx: &ExecContext,
        spec: serde_json::Value,
        docs: &[serde_json::Value],
    ) -> Result<(Vec<Document>, GroupStats)> {
        let mut vps = ctx.parse_state();
        let spec = GroupSpec::parse(&Value::from_json(&spec), &mut vps)?;
        let mut engine = GroupEngine::new(spec);
        let mut vars = ctx.variables();
        for d in docs {
            engine.process(&Document::from_json(d)?, ctx, &mut vars)?;
        }
        let mut out = Vec::new();
        while let Some(doc) = engine.next_output(ctx)? {
            out.push(doc);
        }
        assert_eq!(engine.phase(), GroupPhase::Exhausted);
        Ok((out, engine.stats().clone()))
    }

    fn sorted_by_id(mut docs: Vec<Document>) -> Vec<serde_json::Value> {
        docs.sort_by(|a, b| compare_values(&a.field("_id"), &b.field("_id"), None));
        docs.iter().map(Document::to_json).collect()
    }

    #[test]
    fn avg_over_missing_and_non_numeric_is_null() {
        let docs = [json!({"a": 1, "b": 2}), json!({"a": 1, "c": "string"}), json!({"a": 1})];
        let (out, _) = run_group(
            &ExecContext::default(),
            json!({"_id": "$a", "avg": {"$avg": "$d"}}),
            &docs,
        )
        .unwrap();
        assert_eq!(sorted_by_id(out), vec![json!({"_id": 1, "avg": null})]);
    }

    #[test]
    fn missing_key_groups_with_null_and_compound_keys() {
        let docs = [json!({"x": null, "v": 1}), json!({"v": 2}), json!({"x": 1, "y": 2, "v": 3})];
        let (out, _) = run_group(
            &ExecContext::default(),
            json!({"_id": {"x": "$x", "y": "$y"}, "total": {"$sum": "$v"}}),
            &docs,
        )
        .unwrap();
        assert_eq!(out.len(), 3);
        let (out, _) = run_group(
            &ExecContext::default(),
            json!({"_id": "$x", "total": {"$sum": "$v"}}),
            &docs,
        )
        .unwrap();
        assert_eq!(
            sorted_by_id(out),
            vec![json!({"_id": null, "total": 3}), json!({"_id": 1, "total": 3})]
        );
    }

    #[test]
    fn spilled_result_equals_in_memory_result() {
        let docs: Vec<_> = (0..400)
            .map(|i| json!({"k": i % 37, "v": i, "s": format!("s{}", i % 5)}))
            .collect();
        let spec = json!({
            "_id": "$k",
            "sum": {"$sum": "$v"},
            "avg": {"$avg": "$v"},
            "first": {"$first": "$v"},
            "last": {"$last": "$v"},
            "min": {"$min": "$v"},
            "top": {"$maxN": {"input": "$v", "n": 3}},
            "set": {"$addToSet": "$s"},
            "n": {"$count": {}}
        });
        let (in_memory, stats) = run_group(&ExecContext::default(), spec.clone(), &docs).unwrap();
        assert_eq!(stats.spills, 0);
        let (spilled, stats) = run_group(&ctx_with(4096, true), spec, &docs).unwrap();
        assert!(stats.spills > 1, "expected several spills, got {stats:?}");
        assert_eq!(sorted_by_id(in_memory), sorted_by_id(spilled));
    }

    #[test]
    fn many_spill_runs_merge_in_passes() {
        let docs: Vec<_> = (0..600).map(|i| json!({"k": i, "v": i % 7})).collect();
        let spec = json!({"_id": "$k", "sum": {"$sum": "$v"}, "first": {"$first": "$v"}});
        let (in_memory, _) = run_group(&ExecContext::default(), spec.clone(), &docs).unwrap();
        let ctx = ExecContext::new(AggregateConfig {
            max_memory_bytes: 1,
            max_merge_fan_in: 8,
            ..AggregateConfig::default()
        });
        let (spilled, stats) = run_group(&ctx, spec, &docs).unwrap();
        assert_eq!(stats.spills, 600);
        assert!(stats.merge_passes >= 2, "expected intermediate passes, got {stats:?}");
        assert_eq!(stats.groups, 600);
        assert_eq!(sorted_by_id(in_memory), sorted_by_id(spilled));
    }

    #[test]
    fn repeated_keys_combine_across_merge_passes() {
        let docs: Vec<_> = (0..300).map(|i| json!({"k": i % 5, "v": i})).collect();
        let spec = json!({"_id": "$k", "n": {"$sum": 1}, "first": {"$first": "$v"}, "last": {"$last": "$v"}});
        let ctx = ExecContext::new(AggregateConfig {
            max_memory_bytes: 1,
            max_merge_fan_in: 3,
            ..AggregateConfig::default()
        });
        let (out, stats) = run_group(&ctx, spec, &docs).unwrap();
        assert!(stats.merge_passes > 0);
        assert_eq!(
            sorted_by_id(out),
            (0..5)
                .map(|k| json!({"_id": k, "n": 60, "first": k, "last": 295 + k}))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn disk_use_disallowed_fails_at_threshold() {
        let docs: Vec<_> = (0..200).map(|i| json!({"k": i})).collect();
        let err = run_group(&ctx_with(1024, false), json!({"_id": "$k"}), &docs).unwrap_err();
        assert_eq!(err.code(), 292);
    }

    #[test]
    fn non_spillable_accumulators_fail_even_with_disk_use() {
        let docs: Vec<_> = (0..200).map(|i| json!({"k": i % 3, "xs": [i, i]})).collect();
        for spec in [
            json!({"_id": "$k", "all": {"$push": "$xs"}}),
            json!({"_id": "$k", "all": {"$concatArrays": "$xs"}}),
        ] {
            let err = run_group(&ctx_with(2048, true), spec, &docs).unwrap_err();
            assert_eq!(err.code(), 146);
            assert!(err.is_memory_limit());
        }
    }

    #[test]
    fn evaluation_error_aborts_without_output() {
        let docs = [json!({"k": 1, "xs": [1]}), json!({"k": 1, "xs": 5})];
        let err = run_group(
            &ExecContext::default(),
            json!({"_id": "$k", "all": {"$concatArrays": "$xs"}}),
            &docs,
        )
        .unwrap_err();
        assert_eq!(err.code(), codes::CONCAT_ARRAYS_ACC_NOT_ARRAY);
    }

    #[test]
    fn collation_groups_case_insensitively() {
        let opts = crate::config::AggregateOptions::from_json(&json!({
            "collation": {"locale": "en", "strength": 1}
        }))
        .unwrap();
        let ctx = ExecContext::from_options(&AggregateConfig::default(), &opts).unwrap();
        let docs = [json!({"s": "Abc"}), json!({"s": "aBC"}), json!({"s": "x"})];
        let (out, _) = run_group(&ctx, json!({"_id": "$s", "n": {"$sum": 1}}), &docs).unwrap();
        let out: Vec<_> = out.iter().map(Document::to_json).collect();
        assert_eq!(out, vec![json!({"_id": "Abc", "n": 2}), json!({"_id": "x", "n": 1})]);
    }

    #[test]
    fn parse_errors() {
        let mut vps = VariablesParseState::new();
        let err = GroupSpec::parse(&Value::from_json(&json!({"total": {"$sum": 1}})), &mut vps)
            .unwrap_err();
        assert_eq!(err.code(), codes::GROUP_ID_REQUIRED);
        let err = GroupSpec::parse(
            &Value::from_json(&json!({"_id": null, "a.b": {"$sum": 1}})),
            &mut vps,
        )
        .unwrap_err();
        assert_eq!(err.code(), codes::GROUP_FIELD_DOTTED);
    }

    #[test]
    fn interrupt_stops_collection() {
        let ctx = ExecContext::default();
        ctx.interrupt_handle().interrupt();
        let docs: Vec<_> = (0..1000).map(|i| json!({"k": i})).collect();
        let err = run_group(&ctx, json!({"_id": "$k"}), &docs).unwrap_err();
        assert_eq!(err.code(), 11601);
    }
}
