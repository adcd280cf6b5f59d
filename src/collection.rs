use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::context::ExecContext;
use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::expression::Variables;
use crate::index::FieldIndex;
use crate::matcher::{IndexPredicate, Matcher};
use crate::sink::{WhenMatched, WhenNotMatched, WriteAck};
use crate::source::{DocumentCursor, DocumentSource, OpenedScan, ScanSpec};
use crate::value::{ObjectId, Value, compare_values};

/// Insertion-ordered record identifier. Natural scan order follows it.
pub type RecordId = u64;

/// Metadata about an index on a collection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexInfo {
    pub field: String,
    pub multikey: bool,
}

/// An in-memory collection with single-field secondary indexes and a
/// unique `_id`.
#[derive(Debug, Clone)]
pub struct Collection {
    name: String,
    records: BTreeMap<RecordId, Document>,
    ids: HashMap<Value, RecordId>,
    indexes: BTreeMap<String, FieldIndex>,
    next_id: RecordId,
}

fn assign_id(doc: &mut Document) -> Result<Value> {
    match doc.get("_id") {
        None | Some(Value::Missing) => {
            let id = Value::ObjectId(ObjectId::new());
            let mut with_id = Document::with_capacity(doc.len() + 1);
            with_id.insert("_id", id.clone());
            for (k, v) in std::mem::take(doc) {
                with_id.insert(k, v);
            }
            *doc = with_id;
            Ok(id)
        }
        Some(Value::Array(_)) => Err(Error::InvalidOptions("_id cannot be an array".into())),
        Some(id) => Ok(id.clone()),
    }
}

impl Collection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: BTreeMap::new(),
            ids: HashMap::new(),
            indexes: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // -----------------------------------------------------------------------
    // Index management
    // -----------------------------------------------------------------------

    /// Create a single-field index, building it from existing documents.
    /// Returns false when the index already exists.
    pub fn create_index(&mut self, field: &str) -> Result<bool> {
        if field.is_empty() || field.starts_with('$') {
            return Err(Error::InvalidOptions(format!("invalid index field '{field}'")));
        }
        if self.indexes.contains_key(field) {
            return Ok(false);
        }
        let mut idx = FieldIndex::new(field);
        for (rid, doc) in &self.records {
            idx.insert(*rid, doc);
        }
        tracing::debug!(collection = %self.name, field, "created index");
        self.indexes.insert(field.to_string(), idx);
        Ok(true)
    }

    pub fn list_indexes(&self) -> Vec<IndexInfo> {
        self.indexes
            .values()
            .map(|idx| IndexInfo {
                field: idx.field.clone(),
                multikey: idx.is_multikey(),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    fn index_record(&mut self, rid: RecordId, id: Value, doc: Document) {
        for idx in self.indexes.values_mut() {
            idx.insert(rid, &doc);
        }
        self.ids.insert(id, rid);
        self.records.insert(rid, doc);
    }

    /// Insert one document, generating an ObjectId `_id` when absent.
    pub fn insert(&mut self, mut doc: Document) -> Result<Value> {
        let id = assign_id(&mut doc)?;
        if self.ids.contains_key(&id) {
            return Err(Error::DuplicateKey(format!("{}: _id {id}", self.name)));
        }
        let rid = self.next_id;
        self.next_id += 1;
        self.index_record(rid, id.clone(), doc);
        Ok(id)
    }

    /// Insert a batch. Either every document is inserted or none is.
    pub fn insert_many(&mut self, docs: Vec<Document>) -> Result<Vec<Value>> {
        let mut prepared = Vec::with_capacity(docs.len());
        let mut batch_ids = BTreeSet::new();
        for mut doc in docs {
            let id = assign_id(&mut doc)?;
            if self.ids.contains_key(&id) || !batch_ids.insert(id.clone()) {
                return Err(Error::DuplicateKey(format!("{}: _id {id}", self.name)));
            }
            prepared.push((id, doc));
        }
        let mut out = Vec::with_capacity(prepared.len());
        for (id, doc) in prepared {
            let rid = self.next_id;
            self.next_id += 1;
            out.push(id.clone());
            self.index_record(rid, id, doc);
        }
        Ok(out)
    }

    fn replace_record(&mut self, rid: RecordId, doc: Document) {
        if let Some(old) = self.records.get(&rid) {
            for idx in self.indexes.values_mut() {
                idx.remove(rid, old);
            }
        }
        for idx in self.indexes.values_mut() {
            idx.insert(rid, &doc);
        }
        self.records.insert(rid, doc);
    }

    /// Replace the whole contents, keeping index definitions. The swap only
    /// happens when every document is accepted.
    pub fn replace_all(&mut self, docs: Vec<Document>) -> Result<u64> {
        let mut fresh = Collection::new(&self.name);
        for field in self.indexes.keys() {
            fresh.create_index(field)?;
        }
        let n = fresh.insert_many(docs)?.len() as u64;
        *self = fresh;
        Ok(n)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.ids.clear();
        for idx in self.indexes.values_mut() {
            idx.clear();
        }
    }

    fn find_on(&self, on: &[String], doc: &Document) -> Option<RecordId> {
        if on.len() == 1 && on[0] == "_id" {
            return doc.get("_id").and_then(|id| self.ids.get(id).copied());
        }
        let candidates: Box<dyn Iterator<Item = RecordId> + '_> =
            match (self.indexes.get(&on[0]), doc.get_path(&on[0])) {
                (Some(idx), Some(v)) => Box::new(idx.find_eq(v).into_iter()),
                _ => Box::new(self.records.keys().copied()),
            };
        for rid in candidates {
            let Some(existing) = self.records.get(&rid) else {
                continue;
            };
            let all_equal = on.iter().all(|field| match (existing.get_path(field), doc.get_path(field)) {
                (Some(a), Some(b)) => compare_values(a, b, None).is_eq(),
                _ => false,
            });
            if all_equal {
                return Some(rid);
            }
        }
        None
    }

    /// Apply one `$merge` batch.
    pub fn merge_batch(
        &mut self,
        batch: Vec<Document>,
        on: &[String],
        when_matched: WhenMatched,
        when_not_matched: WhenNotMatched,
    ) -> Result<WriteAck> {
        let mut ack = WriteAck::default();
        let on_id_only = on.len() == 1 && on[0] == "_id";
        for mut doc in batch {
            if on_id_only {
                assign_id(&mut doc)?;
            }
            for field in on {
                match doc.get_path(field) {
                    None | Some(Value::Null | Value::Missing | Value::Array(_)) => {
                        return Err(Error::location(
                            codes::MERGE_ON_FIELD_MISSING,
                            format!("$merge write error: 'on' field '{field}' cannot be missing, null or an array"),
                        ));
                    }
                    _ => {}
                }
            }
            match self.find_on(on, &doc) {
                Some(rid) => {
                    ack.matched += 1;
                    let Some(existing) = self.records.get(&rid) else {
                        continue;
                    };
                    let existing_id = existing.field("_id");
                    if let Some(new_id) = doc.get("_id") {
                        if !compare_values(new_id, &existing_id, None).is_eq() {
                            return Err(Error::location(
                                codes::IMMUTABLE_ID,
                                format!("$merge would modify the immutable field '_id' of {existing_id}"),
                            ));
                        }
                    }
                    let updated = match when_matched {
                        WhenMatched::KeepExisting => continue,
                        WhenMatched::Fail => {
                            return Err(Error::DuplicateKey(format!(
                                "{}: $merge found an existing document for {existing_id}",
                                self.name
                            )));
                        }
                        WhenMatched::Replace => {
                            let mut out = Document::with_capacity(doc.len() + 1);
                            out.insert("_id", existing_id);
                            for (k, v) in doc {
                                if k != "_id" {
                                    out.insert(k, v);
                                }
                            }
                            out
                        }
                        WhenMatched::Merge => {
                            let mut out = existing.clone();
                            for (k, v) in doc {
                                out.insert(k, v);
                            }
                            out
                        }
                    };
                    if &updated != existing {
                        ack.modified += 1;
                    }
                    self.replace_record(rid, updated);
                }
                None => match when_not_matched {
                    WhenNotMatched::Insert => {
                        self.insert(doc)?;
                        ack.inserted += 1;
                    }
                    WhenNotMatched::Discard => ack.discarded += 1,
                    WhenNotMatched::Fail => {
                        return Err(Error::MergeNoMatchingDocument(format!(
                            "{}: no document matches on {on:?}",
                            self.name
                        )));
                    }
                },
            }
        }
        Ok(ack)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Documents in natural (insertion) order.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.records.values()
    }

    /// Candidate records for the filter's indexable conjuncts, or None when
    /// no index applies.
    fn index_candidates(&self, spec: &ScanSpec, ctx: &ExecContext) -> Option<BTreeSet<RecordId>> {
        let filter = spec.filter.as_ref()?;
        let mut candidates: Option<BTreeSet<RecordId>> = None;
        for (path, pred) in filter.query().index_predicates(ctx.collation.as_ref()) {
            let Some(idx) = self.indexes.get(path) else {
                continue;
            };
            let ids = match pred {
                IndexPredicate::Eq(v) => idx.find_eq(v),
                IndexPredicate::In(values) => idx.find_in(values),
                IndexPredicate::Range { lower, upper } => idx.find_range(lower, upper),
            };
            candidates = Some(match candidates {
                Some(c) => c.intersection(&ids).copied().collect(),
                None => ids,
            });
        }
        candidates
    }

    /// Record order from a single-key sort an index can provide.
    fn index_order(&self, spec: &ScanSpec, ctx: &ExecContext) -> Option<Vec<RecordId>> {
        let sort = spec.sort.as_ref()?;
        let [key] = sort.keys.as_slice() else {
            return None;
        };
        let idx = self.indexes.get(&key.path)?;
        // String order differs under a non-simple collation.
        if idx.is_multikey() || ctx.collation.is_some() {
            return None;
        }
        let mut order = Vec::with_capacity(self.records.len());
        let entries: Box<dyn Iterator<Item = _>> = if key.descending {
            Box::new(idx.iter_desc())
        } else {
            Box::new(idx.iter_asc())
        };
        for (_, ids) in entries {
            order.extend(ids.iter().copied());
        }
        Some(order)
    }

    /// Records a scan spec selects, using indexes where they apply. Also
    /// reports whether the filter and the sort were satisfied.
    fn plan_scan(&self, spec: &ScanSpec, ctx: &ExecContext) -> (ScanIds, bool, bool) {
        let candidates = self.index_candidates(spec, ctx);
        let order = self.index_order(spec, ctx);
        let filter_applied = candidates.is_some();
        let sort_applied = order.is_some();
        let ids = match (order, candidates) {
            (Some(order), Some(c)) => ScanIds::Listed(
                order
                    .into_iter()
                    .filter(|id| c.contains(id))
                    .collect::<Vec<_>>()
                    .into_iter(),
            ),
            (Some(order), None) => ScanIds::Listed(order.into_iter()),
            (None, Some(c)) => ScanIds::Listed(c.into_iter().collect::<Vec<_>>().into_iter()),
            (None, None) => ScanIds::Natural {
                next: 0,
                end: self.next_id,
            },
        };
        (ids, filter_applied, sort_applied)
    }
}

/// Record ids a scan visits, fixed when it opens.
#[derive(Debug)]
enum ScanIds {
    /// Natural order, up to the first id unassigned at open.
    Natural { next: RecordId, end: RecordId },
    Listed(std::vec::IntoIter<RecordId>),
}

/// Reads one record per pull under a short read lock. Records inserted
/// after the scan opened are not visited; records removed before the cursor
/// reaches them are skipped; changed records are read as they are now.
pub struct CollectionCursor {
    inner: Arc<RwLock<Collection>>,
    ids: ScanIds,
    /// Index candidates are a superset of the matches; each is re-checked.
    filter: Option<Matcher>,
    scanned: u64,
}

impl DocumentCursor for CollectionCursor {
    fn next_doc(&mut self, ctx: &ExecContext, vars: &mut Variables) -> Result<Option<Document>> {
        let coll = self
            .inner
            .read()
            .map_err(|_| Error::LockPoisoned("collection"))?;
        loop {
            let doc = match &mut self.ids {
                ScanIds::Natural { next, end } => {
                    let Some((rid, doc)) = coll.records.range(*next..*end).next() else {
                        return Ok(None);
                    };
                    *next = rid + 1;
                    doc
                }
                ScanIds::Listed(ids) => {
                    let Some(rid) = ids.next() else {
                        return Ok(None);
                    };
                    match coll.records.get(&rid) {
                        Some(doc) => doc,
                        None => continue,
                    }
                }
            };
            self.scanned += 1;
            ctx.check_interrupt_every(self.scanned)?;
            if let Some(filter) = &self.filter {
                if !filter.matches(doc, ctx, vars)? {
                    continue;
                }
            }
            return Ok(Some(doc.clone()));
        }
    }
}

/// Shared handle used as a pipeline's document source.
#[derive(Debug, Clone)]
pub struct CollectionSource {
    inner: Arc<RwLock<Collection>>,
}

impl CollectionSource {
    pub fn new(inner: Arc<RwLock<Collection>>) -> Self {
        Self { inner }
    }
}

impl DocumentSource for CollectionSource {
    fn open(&self, spec: &ScanSpec, ctx: &ExecContext) -> Result<OpenedScan> {
        let coll = self
            .inner
            .read()
            .map_err(|_| Error::LockPoisoned("collection"))?;
        let (ids, filter_applied, sort_applied) = coll.plan_scan(spec, ctx);
        tracing::trace!(
            collection = %coll.name,
            filter_applied,
            sort_applied,
            "collection scan opened"
        );
        Ok(OpenedScan {
            cursor: Box::new(CollectionCursor {
                inner: Arc::clone(&self.inner),
                ids,
                filter: if filter_applied { spec.filter.clone() } else { None },
                scanned: 0,
            }),
            filter_applied,
            sort_applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::VariablesParseState;
    use crate::matcher::Matcher;
    use crate::pipeline::SortSpec;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_json(&v).unwrap()
    }

    fn ids(docs: &[Document]) -> Vec<serde_json::Value> {
        docs.iter().map(|d| d.field("_id").to_json()).collect()
    }

    fn scan(c: &Collection, spec: &ScanSpec) -> (Vec<Document>, bool, bool) {
        let source = CollectionSource::new(Arc::new(RwLock::new(c.clone())));
        let ctx = ExecContext::default();
        let mut vars = ctx.variables();
        let mut opened = source.open(spec, &ctx).unwrap();
        let mut docs = Vec::new();
        while let Some(d) = opened.cursor.next_doc(&ctx, &mut vars).unwrap() {
            docs.push(d);
        }
        (docs, opened.filter_applied, opened.sort_applied)
    }

    fn sample() -> Collection {
        let mut c = Collection::new("c");
        c.insert_many(vec![
            doc(json!({"_id": 1, "a": 3})),
            doc(json!({"_id": 2, "a": 1})),
            doc(json!({"_id": 3})),
            doc(json!({"_id": 4, "a": 1})),
        ])
        .unwrap();
        c
    }

    #[test]
    fn insert_generates_id_first() {
        let mut c = Collection::new("c");
        let id = c.insert(doc(json!({"x": 1}))).unwrap();
        assert!(matches!(id, Value::ObjectId(_)));
        let first = c.documents().next().unwrap();
        assert_eq!(first.keys().next().map(String::as_str), Some("_id"));
    }

    #[test]
    fn insert_many_is_all_or_nothing() {
        let mut c = sample();
        let err = c
            .insert_many(vec![doc(json!({"_id": 9})), doc(json!({"_id": 1}))])
            .unwrap_err();
        assert_eq!(err.code(), 11000);
        assert_eq!(c.len(), 4);
    }

    #[test]
    fn scan_uses_index_for_filter_and_sort() {
        let mut c = sample();
        c.create_index("a").unwrap();
        let spec = ScanSpec {
            filter: Some(Matcher::parse(&Value::from_json(&json!({"a": 1})), &mut VariablesParseState::new()).unwrap()),
            sort: None,
        };
        let (docs, filter_applied, _) = scan(&c, &spec);
        assert!(filter_applied);
        assert_eq!(ids(&docs), vec![json!(2), json!(4)]);

        let spec = ScanSpec {
            filter: None,
            sort: Some(SortSpec::parse(&Value::from_json(&json!({"a": -1}))).unwrap()),
        };
        let (docs, _, sort_applied) = scan(&c, &spec);
        assert!(sort_applied);
        assert_eq!(ids(&docs), vec![json!(1), json!(2), json!(4), json!(3)]);
    }

    #[test]
    fn multikey_index_does_not_sort() {
        let mut c = sample();
        c.insert(doc(json!({"_id": 5, "a": [0, 9]}))).unwrap();
        c.create_index("a").unwrap();
        let spec = ScanSpec {
            filter: None,
            sort: Some(SortSpec::parse(&Value::from_json(&json!({"a": 1}))).unwrap()),
        };
        let (_, _, sort_applied) = scan(&c, &spec);
        assert!(!sort_applied);
    }

    #[test]
    fn cursor_reads_records_on_demand() {
        let shared = Arc::new(RwLock::new(sample()));
        let source = CollectionSource::new(Arc::clone(&shared));
        let ctx = ExecContext::default();
        let mut vars = ctx.variables();
        let mut opened = source.open(&ScanSpec::default(), &ctx).unwrap();
        let first = opened.cursor.next_doc(&ctx, &mut vars).unwrap().unwrap();
        assert_eq!(first.to_json(), json!({"_id": 1, "a": 3}));

        {
            let mut c = shared.write().unwrap();
            c.merge_batch(
                vec![doc(json!({"_id": 3, "b": "late"}))],
                &["_id".to_string()],
                WhenMatched::Merge,
                WhenNotMatched::Insert,
            )
            .unwrap();
            c.insert(doc(json!({"_id": 9}))).unwrap();
        }

        let mut rest = Vec::new();
        while let Some(d) = opened.cursor.next_doc(&ctx, &mut vars).unwrap() {
            rest.push(d.to_json());
        }
        // The change to `_id: 3` is seen; the record inserted after open is not.
        assert_eq!(
            rest,
            vec![json!({"_id": 2, "a": 1}), json!({"_id": 3, "b": "late"}), json!({"_id": 4, "a": 1})]
        );
    }

    #[test]
    fn index_candidates_are_rechecked() {
        let mut c = sample();
        c.create_index("a").unwrap();
        let filter = Matcher::parse(
            &Value::from_json(&json!({"a": 1, "_id": {"$gt": 2}})),
            &mut VariablesParseState::new(),
        )
        .unwrap();
        let spec = ScanSpec {
            filter: Some(filter),
            sort: None,
        };
        let (docs, filter_applied, _) = scan(&c, &spec);
        assert!(filter_applied);
        assert_eq!(ids(&docs), vec![json!(4)]);
    }

    #[test]
    fn merge_modes() {
        let mut c = sample();
        let ack = c
            .merge_batch(
                vec![doc(json!({"_id": 1, "b": 2})), doc(json!({"_id": 8, "b": 0}))],
                &["_id".to_string()],
                WhenMatched::Merge,
                WhenNotMatched::Insert,
            )
            .unwrap();
        assert_eq!((ack.matched, ack.modified, ack.inserted), (1, 1, 1));
        let first = c.documents().next().unwrap().to_json();
        assert_eq!(first, json!({"_id": 1, "a": 3, "b": 2}));

        let err = c
            .merge_batch(
                vec![doc(json!({"_id": 42}))],
                &["_id".to_string()],
                WhenMatched::Replace,
                WhenNotMatched::Fail,
            )
            .unwrap_err();
        assert_eq!(err.code(), 13113);

        let err = c
            .merge_batch(
                vec![doc(json!({"_id": 2}))],
                &["_id".to_string()],
                WhenMatched::Fail,
                WhenNotMatched::Insert,
            )
            .unwrap_err();
        assert_eq!(err.code(), 11000);
    }

    #[test]
    fn replace_all_keeps_indexes_and_is_atomic() {
        let mut c = sample();
        c.create_index("a").unwrap();
        let err = c
            .replace_all(vec![doc(json!({"_id": 1})), doc(json!({"_id": 1}))])
            .unwrap_err();
        assert_eq!(err.code(), 11000);
        assert_eq!(c.len(), 4);
        c.replace_all(vec![doc(json!({"_id": 10, "a": 5}))]).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.list_indexes()[0].field, "a");
    }
}
