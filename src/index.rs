use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::collection::RecordId;
use crate::document::Document;
use crate::matcher::path_values;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Single-field index
// ---------------------------------------------------------------------------

/// Ordered map from field value to the records holding it.
///
/// Array values are indexed under the array itself and under each element,
/// which makes the index multikey. Documents without the field are indexed
/// under null so that a full index walk visits every record.
#[derive(Debug, Clone)]
pub struct FieldIndex {
    pub field: String,
    tree: BTreeMap<Value, BTreeSet<RecordId>>,
    multikey: bool,
}

impl FieldIndex {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            tree: BTreeMap::new(),
            multikey: false,
        }
    }

    /// Keys a document contributes, deduplicated.
    fn keys_of(&self, doc: &Document) -> (BTreeSet<Value>, bool) {
        let leaves = path_values(doc, &self.field);
        let mut keys = BTreeSet::new();
        let mut multikey = leaves.len() > 1;
        if leaves.is_empty() {
            keys.insert(Value::Null);
        }
        for leaf in leaves {
            match leaf {
                Value::Array(items) => {
                    multikey = true;
                    keys.insert(leaf.clone());
                    keys.extend(items.iter().cloned());
                }
                Value::Missing => {
                    keys.insert(Value::Null);
                }
                other => {
                    keys.insert(other.clone());
                }
            }
        }
        (keys, multikey)
    }

    pub fn insert(&mut self, id: RecordId, doc: &Document) {
        let (keys, multikey) = self.keys_of(doc);
        self.multikey |= multikey;
        for key in keys {
            self.tree.entry(key).or_default().insert(id);
        }
    }

    pub fn remove(&mut self, id: RecordId, doc: &Document) {
        let (keys, _) = self.keys_of(doc);
        for key in keys {
            if let Some(set) = self.tree.get_mut(&key) {
                set.remove(&id);
                if set.is_empty() {
                    self.tree.remove(&key);
                }
            }
        }
    }

    /// Whether any record contributed more than one key. A multikey index
    /// cannot provide sort order.
    pub fn is_multikey(&self) -> bool {
        self.multikey
    }

    // -- Query helpers -------------------------------------------------------

    pub fn find_eq(&self, value: &Value) -> BTreeSet<RecordId> {
        self.tree.get(value).cloned().unwrap_or_default()
    }

    pub fn find_in(&self, values: &[Value]) -> BTreeSet<RecordId> {
        let mut result = BTreeSet::new();
        for v in values {
            if let Some(ids) = self.tree.get(v) {
                result.extend(ids);
            }
        }
        result
    }

    /// Records whose key falls in the range and shares the bounds' type
    /// bracket. Callers re-check the full predicate.
    pub fn find_range(&self, start: Bound<&Value>, end: Bound<&Value>) -> BTreeSet<RecordId> {
        let mut result = BTreeSet::new();
        let empty = match (start, end) {
            (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            (Bound::Included(s) | Bound::Excluded(s), Bound::Included(e) | Bound::Excluded(e)) => s > e,
            _ => false,
        };
        if empty {
            return result;
        }
        for (_key, ids) in self.tree.range::<Value, _>((start, end)) {
            result.extend(ids);
        }
        result
    }

    /// Iterate (value, record ids) in ascending order.
    pub fn iter_asc(&self) -> impl Iterator<Item = (&Value, &BTreeSet<RecordId>)> {
        self.tree.iter()
    }

    /// Iterate (value, record ids) in descending order.
    pub fn iter_desc(&self) -> impl Iterator<Item = (&Value, &BTreeSet<RecordId>)> {
        self.tree.iter().rev()
    }

    /// Remove all entries while keeping the field.
    pub fn clear(&mut self) {
        self.tree.clear();
        self.multikey = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_json(&v).unwrap()
    }

    #[test]
    fn scalar_and_missing_keys() {
        let mut idx = FieldIndex::new("a");
        idx.insert(1, &doc(json!({"a": 5})));
        idx.insert(2, &doc(json!({"b": 1})));
        idx.insert(3, &doc(json!({"a": 5.0})));
        assert_eq!(idx.find_eq(&Value::Int32(5)).into_iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(idx.find_eq(&Value::Null).into_iter().collect::<Vec<_>>(), vec![2]);
        assert!(!idx.is_multikey());
    }

    #[test]
    fn arrays_make_the_index_multikey() {
        let mut idx = FieldIndex::new("tags");
        let d = doc(json!({"tags": ["x", "y"]}));
        idx.insert(7, &d);
        assert!(idx.is_multikey());
        assert!(idx.find_eq(&Value::from("y")).contains(&7));
        idx.remove(7, &d);
        assert!(idx.find_eq(&Value::from("y")).is_empty());
    }

    #[test]
    fn range_lookup() {
        let mut idx = FieldIndex::new("n");
        for i in 0..10 {
            idx.insert(i as u64, &doc(json!({"n": i})));
        }
        let hits = idx.find_range(Bound::Included(&Value::Int32(3)), Bound::Excluded(&Value::Int32(6)));
        assert_eq!(hits.into_iter().collect::<Vec<_>>(), vec![3, 4, 5]);
        let empty = idx.find_range(Bound::Included(&Value::Int32(6)), Bound::Excluded(&Value::Int32(3)));
        assert!(empty.is_empty());
    }
}
