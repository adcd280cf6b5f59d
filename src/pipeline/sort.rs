//! `$sort`: stable, memory bounded, with an external merge sort through the
//! spill store and a bounded top-k mode when a `$limit` follows.

use std::cmp::Ordering;
use std::io::Read;

use crate::collation::Collation;
use crate::context::ExecContext;
use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::matcher::path_values;
use crate::spill::{MergeCursor, RunHandle, SpillStore, TempDirSpillStore, reduce_runs};
use crate::value::{Value, compare_values};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub keys: Vec<SortKey>,
    /// Set when a following `$limit` was folded in.
    pub limit: Option<u64>,
}

impl SortSpec {
    pub fn parse(spec: &Value) -> Result<Self> {
        let Value::Document(doc) = spec else {
            return Err(Error::location(codes::SORT_EMPTY, "the $sort key specification must be an object"));
        };
        if doc.is_empty() {
            return Err(Error::location(codes::SORT_EMPTY, "$sort stage must have at least one sort key"));
        }
        let mut keys = Vec::with_capacity(doc.len());
        for (path, dir) in doc {
            let descending = match dir.integral_i64() {
                Some(1) => false,
                Some(-1) => true,
                _ => {
                    return Err(Error::location(
                        codes::SORT_BAD_ORDER,
                        format!("$sort key ordering for '{path}' must be 1 (for ascending) or -1 (for descending)"),
                    ));
                }
            };
            if path.is_empty() || path.starts_with('$') {
                return Err(Error::InvalidPipeline(format!("invalid $sort field name '{path}'")));
            }
            keys.push(SortKey {
                path: path.clone(),
                descending,
            });
        }
        Ok(Self { keys, limit: None })
    }

    pub fn to_value(&self) -> Value {
        let mut doc = Document::new();
        for k in &self.keys {
            doc.insert(k.path.clone(), Value::Int32(if k.descending { -1 } else { 1 }));
        }
        Value::Document(doc)
    }

    /// Sort key of one document. For an array the smallest element counts
    /// when ascending and the largest when descending; missing sorts as null.
    pub fn extract(&self, doc: &Document, collation: Option<&Collation>) -> Vec<Value> {
        self.keys
            .iter()
            .map(|key| {
                let mut candidates: Vec<&Value> = Vec::new();
                for v in path_values(doc, &key.path) {
                    match v {
                        Value::Array(items) if !items.is_empty() => candidates.extend(items.iter()),
                        Value::Array(_) => {}
                        other => candidates.push(other),
                    }
                }
                let pick = if key.descending {
                    candidates.into_iter().max_by(|a, b| compare_values(a, b, collation))
                } else {
                    candidates.into_iter().min_by(|a, b| compare_values(a, b, collation))
                };
                pick.cloned().unwrap_or(Value::Null)
            })
            .collect()
    }

    pub fn compare_keys(&self, a: &[Value], b: &[Value], collation: Option<&Collation>) -> Ordering {
        for ((key, x), y) in self.keys.iter().zip(a).zip(b) {
            let ord = compare_values(x, y, collation);
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

// ---------------------------------------------------------------------------
// Sorter
// ---------------------------------------------------------------------------

/// A buffered row. `seq` is the arrival position and breaks ties so the
/// sort is stable across spilled runs.
#[derive(Debug, Clone)]
struct Row {
    keys: Vec<Value>,
    seq: u64,
    doc: Document,
}

impl Row {
    fn mem_size(&self) -> usize {
        self.keys.iter().map(Value::approx_size).sum::<usize>() + self.doc.approx_size() + 16
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.seq.to_le_bytes());
        self.doc.write_to(&mut buf)?;
        Ok(buf)
    }

    fn decode(key: Value, payload: &[u8]) -> Result<Self> {
        let mut cursor = payload;
        let mut seq = [0u8; 8];
        cursor.read_exact(&mut seq)?;
        let doc = Document::read_from(&mut cursor)?;
        let Value::Array(keys) = key else {
            return Err(Error::SpillCorrupted("sort run key is not an array".into()));
        };
        Ok(Self {
            keys,
            seq: u64::from_le_bytes(seq),
            doc,
        })
    }
}

type RowOrder = Box<dyn Fn(&Row, &Row) -> Ordering + Send + Sync>;
type RowCursor = MergeCursor<'static, Row, RowOrder>;

fn run_rows(run: &RunHandle) -> Result<Box<dyn Iterator<Item = Result<Row>>>> {
    let reader = run.iterate()?;
    Ok(Box::new(reader.map(|record| {
        let (key, payload) = record?;
        Row::decode(key, &payload)
    })))
}

enum SortedOutput {
    Pending,
    Memory(std::vec::IntoIter<Row>),
    Merge(RowCursor),
    Done,
}

pub struct Sorter {
    spec: SortSpec,
    collation: Option<Collation>,
    buffer: Vec<Row>,
    mem_used: usize,
    seq: u64,
    store: Option<TempDirSpillStore>,
    runs: Vec<RunHandle>,
    output: SortedOutput,
    emitted: u64,
    spilled: usize,
    merge_passes: u32,
}

impl Sorter {
    pub fn new(spec: SortSpec, collation: Option<Collation>) -> Self {
        Self {
            spec,
            collation,
            buffer: Vec::new(),
            mem_used: 0,
            seq: 0,
            store: None,
            runs: Vec::new(),
            output: SortedOutput::Pending,
            emitted: 0,
            spilled: 0,
            merge_passes: 0,
        }
    }

    pub fn spec(&self) -> &SortSpec {
        &self.spec
    }

    /// Runs written because the buffer outgrew its budget.
    pub fn spills(&self) -> usize {
        self.spilled
    }

    /// Intermediate passes needed to get under the merge fan-in.
    pub fn merge_passes(&self) -> u32 {
        self.merge_passes
    }

    fn row_order(&self) -> RowOrder {
        let spec = self.spec.clone();
        let collation = self.collation.clone();
        Box::new(move |a, b| {
            spec.compare_keys(&a.keys, &b.keys, collation.as_ref())
                .then(a.seq.cmp(&b.seq))
        })
    }

    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        self.spec
            .compare_keys(&a.keys, &b.keys, self.collation.as_ref())
            .then(a.seq.cmp(&b.seq))
    }

    fn sort_buffer(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.sort_by(|a, b| self.compare(a, b));
        self.buffer = buffer;
    }

    pub fn add(&mut self, doc: Document, ctx: &ExecContext) -> Result<()> {
        let row = Row {
            keys: self.spec.extract(&doc, self.collation.as_ref()),
            seq: self.seq,
            doc,
        };
        self.seq += 1;
        self.mem_used += row.mem_size();
        self.buffer.push(row);

        if let Some(limit) = self.spec.limit {
            // Top-k: keep at most 2k rows, trimming back to k.
            let k = usize::try_from(limit).unwrap_or(usize::MAX);
            if self.buffer.len() > k.saturating_mul(2).max(1) {
                self.sort_buffer();
                self.buffer.truncate(k);
                self.mem_used = self.buffer.iter().map(Row::mem_size).sum();
            }
        }

        if self.mem_used > ctx.config.max_memory_bytes {
            if !ctx.config.allow_disk_use {
                return Err(Error::MemoryLimitNoDiskUse {
                    stage: "$sort",
                    used: self.mem_used,
                    limit: ctx.config.max_memory_bytes,
                });
            }
            self.spill(ctx)?;
        }
        Ok(())
    }

    fn spill(&mut self, ctx: &ExecContext) -> Result<()> {
        ctx.check_interrupt()?;
        self.sort_buffer();
        if self.store.is_none() {
            self.store = Some(ctx.spill_store()?);
        }
        let Some(store) = self.store.as_mut() else {
            return Err(Error::SpillCorrupted("spill store unavailable".into()));
        };
        let mut run = store.create_run()?;
        for row in &self.buffer {
            run.append(&Value::Array(row.keys.clone()), &row.encode()?)?;
        }
        run.finish()?;
        tracing::debug!(
            run = self.runs.len(),
            records = run.records(),
            bytes = run.bytes(),
            "$sort spilled a sorted run"
        );
        self.runs.push(run);
        self.spilled += 1;
        self.buffer.clear();
        self.mem_used = 0;
        Ok(())
    }

    /// Upstream is exhausted; prepare sorted output.
    pub fn finish_input(&mut self, ctx: &ExecContext) -> Result<()> {
        if !matches!(self.output, SortedOutput::Pending) {
            return Ok(());
        }
        self.sort_buffer();
        let buffer = std::mem::take(&mut self.buffer);
        if self.runs.is_empty() {
            self.output = SortedOutput::Memory(buffer.into_iter());
            return Ok(());
        }
        // The residual buffer takes one merge slot.
        let fan_in = ctx.config.merge_fan_in();
        if self.runs.len() >= fan_in {
            let order = self.row_order();
            let Some(store) = self.store.as_mut() else {
                return Err(Error::SpillCorrupted("spill store unavailable".into()));
            };
            let passes = reduce_runs(store, &mut self.runs, fan_in - 1, fan_in, |batch, out| {
                ctx.check_interrupt()?;
                let sources = batch.iter().map(run_rows).collect::<Result<Vec<_>>>()?;
                let mut cursor = MergeCursor::new(sources, |a: &Row, b: &Row| order(a, b));
                while let Some((_, row)) = cursor.next_item()? {
                    let payload = row.encode()?;
                    out.append(&Value::Array(row.keys), &payload)?;
                }
                Ok(())
            })?;
            self.merge_passes += passes;
        }
        let mut sources = self.runs.iter().map(run_rows).collect::<Result<Vec<_>>>()?;
        sources.push(Box::new(buffer.into_iter().map(Ok)));
        tracing::debug!(
            runs = self.runs.len(),
            merge_passes = self.merge_passes,
            "$sort merging spilled runs"
        );
        self.output = SortedOutput::Merge(MergeCursor::new(sources, self.row_order()));
        Ok(())
    }

    pub fn next_output(&mut self, ctx: &ExecContext) -> Result<Option<Document>> {
        self.finish_input(ctx)?;
        if self.spec.limit.is_some_and(|l| self.emitted >= l) {
            self.close();
            return Ok(None);
        }
        let row = match &mut self.output {
            SortedOutput::Memory(iter) => iter.next(),
            SortedOutput::Merge(cursor) => cursor.next_item()?.map(|(_, row)| row),
            SortedOutput::Pending | SortedOutput::Done => None,
        };
        if row.is_none() {
            self.close();
        } else {
            self.emitted += 1;
        }
        Ok(row.map(|r| r.doc))
    }

    pub fn close(&mut self) {
        self.buffer.clear();
        self.mem_used = 0;
        self.output = SortedOutput::Done;
        for run in self.runs.drain(..) {
            if let Err(e) = run.dispose() {
                tracing::warn!(error = %e, "failed to remove spill run");
            }
        }
        self.store = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregateConfig;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_json(&v).unwrap()
    }

    fn sort_with(
        spec: serde_json::Value,
        limit: Option<u64>,
        docs: Vec<serde_json::Value>,
        config: AggregateConfig,
    ) -> Result<(Vec<serde_json::Value>, Sorter)> {
        let ctx = ExecContext::new(config);
        let mut spec = SortSpec::parse(&Value::from_json(&spec))?;
        spec.limit = limit;
        let mut sorter = Sorter::new(spec, None);
        for d in docs {
            sorter.add(doc(d), &ctx)?;
        }
        let mut out = Vec::new();
        while let Some(d) = sorter.next_output(&ctx)? {
            out.push(d.to_json());
        }
        Ok((out, sorter))
    }

    fn run_sort(spec: serde_json::Value, limit: Option<u64>, docs: Vec<serde_json::Value>, config: AggregateConfig) -> Result<Vec<serde_json::Value>> {
        sort_with(spec, limit, docs, config).map(|(out, _)| out)
    }

    #[test]
    fn stable_sort_with_array_keys() {
        let docs = vec![
            json!({"i": 0, "a": 2}),
            json!({"i": 1, "a": [5, 1]}),
            json!({"i": 2}),
            json!({"i": 3, "a": 2}),
        ];
        let out = run_sort(json!({"a": 1}), None, docs.clone(), AggregateConfig::default()).unwrap();
        let order: Vec<_> = out.iter().map(|d| d["i"].clone()).collect();
        assert_eq!(order, vec![json!(2), json!(1), json!(0), json!(3)]);

        let out = run_sort(json!({"a": -1}), None, docs, AggregateConfig::default()).unwrap();
        let order: Vec<_> = out.iter().map(|d| d["i"].clone()).collect();
        assert_eq!(order, vec![json!(1), json!(0), json!(3), json!(2)]);
    }

    #[test]
    fn external_sort_matches_in_memory() {
        let docs: Vec<_> = (0..200).map(|i| json!({"k": (i * 37) % 11, "i": i})).collect();
        let in_memory = run_sort(json!({"k": 1}), None, docs.clone(), AggregateConfig::default()).unwrap();
        let tiny = AggregateConfig {
            max_memory_bytes: 2048,
            ..AggregateConfig::default()
        };
        let spilled = run_sort(json!({"k": 1}), None, docs, tiny).unwrap();
        assert_eq!(in_memory, spilled);
    }

    #[test]
    fn many_runs_merge_under_fan_in() {
        let docs: Vec<_> = (0..600).map(|i| json!({"k": (i * 7919) % 600, "i": i})).collect();
        let in_memory = run_sort(json!({"k": 1}), None, docs.clone(), AggregateConfig::default()).unwrap();
        let config = AggregateConfig {
            max_memory_bytes: 1,
            max_merge_fan_in: 4,
            ..AggregateConfig::default()
        };
        let (spilled, sorter) = sort_with(json!({"k": 1}), None, docs, config).unwrap();
        assert_eq!(sorter.spills(), 600);
        assert!(sorter.merge_passes() >= 4);
        assert_eq!(in_memory, spilled);
    }

    #[test]
    fn memory_limit_without_disk_use() {
        let docs: Vec<_> = (0..100).map(|i| json!({"k": i, "pad": "x".repeat(64)})).collect();
        let config = AggregateConfig {
            max_memory_bytes: 1024,
            allow_disk_use: false,
            ..AggregateConfig::default()
        };
        let err = run_sort(json!({"k": 1}), None, docs, config).unwrap_err();
        assert_eq!(err.code(), 292);
    }

    #[test]
    fn top_k_keeps_first_k_stably() {
        let docs: Vec<_> = (0..50).map(|i| json!({"k": i % 3, "i": i})).collect();
        let out = run_sort(json!({"k": -1}), Some(4), docs, AggregateConfig::default()).unwrap();
        let order: Vec<_> = out.iter().map(|d| d["i"].clone()).collect();
        assert_eq!(order, vec![json!(2), json!(5), json!(8), json!(11)]);
    }

    #[test]
    fn bad_sort_specs() {
        assert_eq!(SortSpec::parse(&Value::from_json(&json!({}))).unwrap_err().code(), codes::SORT_EMPTY);
        assert_eq!(
            SortSpec::parse(&Value::from_json(&json!({"a": 2}))).unwrap_err().code(),
            codes::SORT_BAD_ORDER
        );
    }
}
