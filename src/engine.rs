use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;

use crate::collection::{Collection, CollectionSource};
use crate::config::{AggregateConfig, AggregateOptions};
use crate::context::ExecContext;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::matcher::Matcher;
use crate::pipeline::{AggregateCursor, Pipeline, PlanSummary};
use crate::scripting::{NativeScriptHost, ScriptingHost};
use crate::sink::{OutputSink, OutputTarget, WriteAck, WriteMode};
use crate::source::{Catalog, DocumentSource, MemorySource, scan_matching};
use crate::value::Value;

/// State shared between a database handle and the sinks of running
/// pipelines.
struct DbShared {
    name: String,
    collections: RwLock<HashMap<String, Arc<RwLock<Collection>>>>,
    /// DDL epoch. Writers hold the read lock; dropping the database takes the
    /// write lock and bumps it.
    ddl: RwLock<u64>,
}

impl DbShared {
    fn get(&self, name: &str) -> Result<Option<Arc<RwLock<Collection>>>> {
        let cols = self
            .collections
            .read()
            .map_err(|_| Error::LockPoisoned("collections"))?;
        Ok(cols.get(name).map(Arc::clone))
    }

    /// Return an Arc to a collection's RwLock, auto-creating if needed.
    fn get_or_create(&self, name: &str) -> Result<Arc<RwLock<Collection>>> {
        if let Some(col) = self.get(name)? {
            return Ok(col);
        }
        let mut cols = self
            .collections
            .write()
            .map_err(|_| Error::LockPoisoned("collections"))?;
        let col = cols
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Collection::new(name))));
        Ok(Arc::clone(col))
    }

    /// A missing collection reads as empty.
    fn source(&self, collection: &str) -> Result<Arc<dyn DocumentSource>> {
        Ok(match self.get(collection)? {
            Some(col) => Arc::new(CollectionSource::new(col)),
            None => Arc::new(MemorySource::default()),
        })
    }

    fn epoch(&self) -> Result<u64> {
        self.ddl
            .read()
            .map(|e| *e)
            .map_err(|_| Error::LockPoisoned("ddl"))
    }
}

/// Catalog handed to pipelines: resolves sources and opens sinks bound to
/// the epoch observed when the pipeline started.
struct DbCatalog(Arc<DbShared>);

impl Catalog for DbCatalog {
    fn source(&self, collection: &str) -> Result<Arc<dyn DocumentSource>> {
        self.0.source(collection)
    }

    fn sink(&self, target: &OutputTarget) -> Result<Box<dyn OutputSink>> {
        if let Some(db) = &target.db {
            if db != &self.0.name {
                return Err(Error::InvalidOptions(format!(
                    "cannot write to database '{db}' from '{}'",
                    self.0.name
                )));
            }
        }
        Ok(Box::new(CollectionSink {
            shared: Arc::clone(&self.0),
            target: target.clone(),
            epoch: self.0.epoch()?,
            staged: None,
        }))
    }

    fn ddl_epoch(&self) -> u64 {
        self.0.epoch().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Output sink
// ---------------------------------------------------------------------------

struct CollectionSink {
    shared: Arc<DbShared>,
    target: OutputTarget,
    epoch: u64,
    /// `$out` documents waiting for commit.
    staged: Option<Vec<Document>>,
}

impl CollectionSink {
    /// Run `f` on the target under the DDL read lock, failing if the
    /// database was dropped since the sink was opened.
    fn with_target<T>(&self, f: impl FnOnce(&mut Collection) -> Result<T>) -> Result<T> {
        let ddl = self.shared.ddl.read().map_err(|_| Error::LockPoisoned("ddl"))?;
        if *ddl != self.epoch {
            return Err(Error::NamespaceNotFound(format!(
                "{}.{} (database dropped during aggregation)",
                self.shared.name, self.target.coll
            )));
        }
        let col = self.shared.get_or_create(&self.target.coll)?;
        let mut col = col.write().map_err(|_| Error::LockPoisoned("collection"))?;
        f(&mut col)
    }
}

impl OutputSink for CollectionSink {
    fn write(&mut self, batch: Vec<Document>, mode: &WriteMode) -> Result<WriteAck> {
        match mode {
            WriteMode::Replace => {
                self.staged.get_or_insert_with(Vec::new).extend(batch);
                Ok(WriteAck::default())
            }
            WriteMode::Merge {
                on,
                when_matched,
                when_not_matched,
            } => self
                .with_target(|col| col.merge_batch(batch, on, *when_matched, *when_not_matched))
                .map_err(|e| e.context(format!("$merge into {}", self.target))),
        }
    }

    fn commit(&mut self) -> Result<WriteAck> {
        // Nothing staged means the sink was used by `$merge`.
        let Some(docs) = self.staged.take() else {
            return Ok(WriteAck::default());
        };
        let inserted = self
            .with_target(|col| col.replace_all(docs))
            .map_err(|e| e.context(format!("$out to {}", self.target)))?;
        Ok(WriteAck {
            inserted,
            ..WriteAck::default()
        })
    }

    fn abort(&mut self) {
        self.staged = None;
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// An in-memory database: a catalog of collections that pipelines read from
/// and write to.
///
/// Thread-safe: a `RwLock` guards the collection map and each collection has
/// its own `RwLock`, so reads on different collections never block each
/// other.
pub struct Database {
    shared: Arc<DbShared>,
    config: AggregateConfig,
    scripting: Arc<dyn ScriptingHost>,
}

impl Database {
    pub fn new(name: &str) -> Self {
        Self::with_config(name, AggregateConfig::default())
    }

    pub fn with_config(name: &str, config: AggregateConfig) -> Self {
        Self {
            shared: Arc::new(DbShared {
                name: name.to_string(),
                collections: RwLock::new(HashMap::new()),
                ddl: RwLock::new(0),
            }),
            config,
            scripting: Arc::new(NativeScriptHost::new()),
        }
    }

    /// Host used for `$where`, `$function` and `$accumulator`.
    pub fn with_scripting(mut self, host: Arc<dyn ScriptingHost>) -> Self {
        self.scripting = host;
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &AggregateConfig {
        &self.config
    }

    pub fn catalog(&self) -> Arc<dyn Catalog> {
        Arc::new(DbCatalog(Arc::clone(&self.shared)))
    }

    pub fn collection(&self, name: &str) -> Result<Option<Arc<RwLock<Collection>>>> {
        self.shared.get(name)
    }

    /// List all collection names, sorted.
    pub fn list_collections(&self) -> Result<Vec<String>> {
        let cols = self
            .shared
            .collections
            .read()
            .map_err(|_| Error::LockPoisoned("collections"))?;
        let mut names: Vec<String> = cols.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    // -----------------------------------------------------------------------
    // DDL
    // -----------------------------------------------------------------------

    pub fn create_index(&self, collection: &str, field: &str) -> Result<bool> {
        let col = self.shared.get_or_create(collection)?;
        let mut col = col.write().map_err(|_| Error::LockPoisoned("collection"))?;
        col.create_index(field)
    }

    /// Returns whether the collection existed.
    pub fn drop_collection(&self, collection: &str) -> Result<bool> {
        let _ddl = self.shared.ddl.read().map_err(|_| Error::LockPoisoned("ddl"))?;
        let mut cols = self
            .shared
            .collections
            .write()
            .map_err(|_| Error::LockPoisoned("collections"))?;
        Ok(cols.remove(collection).is_some())
    }

    /// Remove every collection. Output stages that started before the drop
    /// fail instead of recreating their targets.
    pub fn drop_database(&self) -> Result<()> {
        let mut ddl = self.shared.ddl.write().map_err(|_| Error::LockPoisoned("ddl"))?;
        let mut cols = self
            .shared
            .collections
            .write()
            .map_err(|_| Error::LockPoisoned("collections"))?;
        cols.clear();
        *ddl += 1;
        tracing::debug!(db = %self.shared.name, epoch = *ddl, "database dropped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Convenience methods that delegate to collections
    // -----------------------------------------------------------------------

    /// Insert JSON documents. The batch is all-or-nothing.
    pub fn insert_many(&self, collection: &str, docs: &[JsonValue]) -> Result<Vec<JsonValue>> {
        let docs = docs
            .iter()
            .map(Document::from_json)
            .collect::<Result<Vec<_>>>()?;
        let col = self.shared.get_or_create(collection)?;
        let mut col = col.write().map_err(|_| Error::LockPoisoned("collection"))?;
        Ok(col.insert_many(docs)?.iter().map(Value::to_json).collect())
    }

    /// Documents matching a query filter, in natural order.
    pub fn find(&self, collection: &str, filter: &JsonValue) -> Result<Vec<JsonValue>> {
        let ctx = self.context(&AggregateOptions::default())?;
        let matcher = Matcher::parse(&Value::from_json(filter), &mut ctx.parse_state())?;
        let source = self.shared.source(collection)?;
        let mut vars = ctx.variables();
        let docs = scan_matching(source.as_ref(), &matcher, &ctx, &mut vars)?;
        Ok(docs.iter().map(Document::to_json).collect())
    }

    fn context(&self, opts: &AggregateOptions) -> Result<ExecContext> {
        Ok(ExecContext::from_options(&self.config, opts)?.with_scripting(Arc::clone(&self.scripting)))
    }

    /// Parse, optimize and open a pipeline over `collection`.
    pub fn aggregate_cursor(
        &self,
        collection: &str,
        pipeline: &JsonValue,
        opts: &AggregateOptions,
    ) -> Result<AggregateCursor> {
        let ctx = self.context(opts)?;
        let pipeline = Pipeline::parse(&Value::from_json(pipeline), &ctx)?;
        let source = self.shared.source(collection)?;
        tracing::debug!(
            db = %self.shared.name,
            collection,
            stages = pipeline.stages().len(),
            "aggregate"
        );
        pipeline.plan(source.as_ref(), self.catalog(), ctx)
    }

    /// Run a pipeline to completion.
    pub fn aggregate(
        &self,
        collection: &str,
        pipeline: &JsonValue,
        opts: &AggregateOptions,
    ) -> Result<Vec<JsonValue>> {
        self.aggregate_cursor(collection, pipeline, opts)?
            .map(|doc| doc.map(|d| d.to_json()))
            .collect()
    }

    /// The plan a pipeline would run with, without pulling any results.
    pub fn explain(
        &self,
        collection: &str,
        pipeline: &JsonValue,
        opts: &AggregateOptions,
    ) -> Result<PlanSummary> {
        let mut cursor = self.aggregate_cursor(collection, pipeline, opts)?;
        let summary = cursor.plan().clone();
        cursor.close();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> Database {
        let db = Database::new("test");
        db.insert_many(
            "items",
            &[
                json!({"_id": 1, "k": "a", "n": 3}),
                json!({"_id": 2, "k": "b", "n": 1}),
                json!({"_id": 3, "k": "a", "n": 2}),
            ],
        )
        .unwrap();
        db
    }

    #[test]
    fn find_and_aggregate() {
        let db = db();
        assert_eq!(db.find("items", &json!({"k": "a"})).unwrap().len(), 2);
        let out = db
            .aggregate(
                "items",
                &json!([{"$group": {"_id": "$k", "total": {"$sum": "$n"}}}, {"$sort": {"_id": 1}}]),
                &AggregateOptions::default(),
            )
            .unwrap();
        assert_eq!(out, vec![json!({"_id": "a", "total": 5}), json!({"_id": "b", "total": 1})]);
    }

    #[test]
    fn missing_collection_reads_empty() {
        let db = db();
        assert!(db.find("nope", &json!({})).unwrap().is_empty());
        assert!(db.collection("nope").unwrap().is_none());
    }

    #[test]
    fn out_replaces_target() {
        let db = db();
        db.insert_many("dest", &[json!({"_id": 99})]).unwrap();
        let out = db
            .aggregate(
                "items",
                &json!([{"$match": {"k": "a"}}, {"$out": "dest"}]),
                &AggregateOptions::default(),
            )
            .unwrap();
        assert!(out.is_empty());
        let dest = db.find("dest", &json!({})).unwrap();
        assert_eq!(dest.len(), 2);
        assert_eq!(dest[0]["_id"], json!(1));
    }

    #[test]
    fn merge_into_other_database_is_rejected() {
        let db = db();
        let err = db
            .aggregate(
                "items",
                &json!([{"$merge": {"into": {"db": "other", "coll": "x"}}}]),
                &AggregateOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.code(), 2);
    }

    #[test]
    fn drop_database_fails_pending_output() {
        let db = db();
        let mut cursor = db
            .aggregate_cursor(
                "items",
                &json!([{"$merge": {"into": "dest"}}]),
                &AggregateOptions::default(),
            )
            .unwrap();
        db.drop_database().unwrap();
        let err = cursor.next().unwrap().unwrap_err();
        assert_eq!(err.code(), 26);
        assert!(db.list_collections().unwrap().is_empty());
    }

    #[test]
    fn explain_reports_index_pushdown() {
        let db = db();
        db.create_index("items", "k").unwrap();
        let plan = db
            .explain("items", &json!([{"$match": {"k": "a"}}]), &AggregateOptions::default())
            .unwrap();
        assert!(plan.filter_pushed_down);
        assert!(plan.stages.is_empty());
    }
}
