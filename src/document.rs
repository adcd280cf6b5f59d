use std::io::{self, Read, Write};

use indexmap::IndexMap;
use indexmap::map::{IntoIter, Iter};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::value::{Value, read_str, read_u32, write_str};

/// An ordered mapping from field names to values.
///
/// Field order is preserved for output but does not take part in equality.
/// Missing values are never stored: inserting one removes the field.
#[derive(Debug, Clone, Default)]
pub struct Document {
    fields: IndexMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            fields: IndexMap::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields.get_mut(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if value.is_missing() {
            self.fields.shift_remove(&name);
        } else {
            self.fields.insert(name, value);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.shift_remove(name)
    }

    pub fn iter(&self) -> Iter<'_, String, Value> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Top-level field value, or Missing.
    pub fn field(&self, name: &str) -> Value {
        self.fields.get(name).cloned().unwrap_or(Value::Missing)
    }

    /// Access a nested field using dot notation without array traversal:
    /// "user.address.city".
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            match current {
                Value::Document(doc) => current = doc.fields.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Set a dotted path, creating intermediate documents. A non-document
    /// intermediate is replaced.
    pub fn set_path(&mut self, path: &str, value: Value) {
        match path.split_once('.') {
            None => self.insert(path, value),
            Some((head, rest)) => {
                let needs_doc = !matches!(self.fields.get(head), Some(Value::Document(_)));
                if needs_doc {
                    if value.is_missing() {
                        return;
                    }
                    self.fields
                        .insert(head.to_string(), Value::Document(Document::new()));
                }
                if let Some(Value::Document(child)) = self.fields.get_mut(head) {
                    child.set_path(rest, value);
                }
            }
        }
    }

    /// Remove a dotted path. Arrays on the path are traversed element-wise.
    pub fn remove_path(&mut self, path: &str) {
        match path.split_once('.') {
            None => {
                self.fields.shift_remove(path);
            }
            Some((head, rest)) => match self.fields.get_mut(head) {
                Some(Value::Document(child)) => child.remove_path(rest),
                Some(Value::Array(items)) => {
                    for item in items.iter_mut() {
                        if let Value::Document(child) = item {
                            child.remove_path(rest);
                        }
                    }
                }
                _ => {}
            },
        }
    }

    pub fn approx_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(k, v)| k.len() + v.approx_size())
            .sum::<usize>()
            + std::mem::size_of::<Self>()
    }

    pub fn from_json(json: &JsonValue) -> Result<Self> {
        match json {
            JsonValue::Object(map) => Ok(Self::from_json_map(map)),
            _ => Err(Error::NotAnObject),
        }
    }

    pub(crate) fn from_json_map(map: &Map<String, JsonValue>) -> Self {
        let mut doc = Self::with_capacity(map.len());
        for (k, v) in map {
            doc.fields.insert(k.clone(), Value::from_json(v));
        }
        doc
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::with_capacity(self.fields.len());
        for (k, v) in &self.fields {
            if !v.is_missing() {
                map.insert(k.clone(), v.to_json());
            }
        }
        JsonValue::Object(map)
    }

    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&(self.fields.len() as u32).to_le_bytes())?;
        for (k, v) in &self.fields {
            write_str(w, k)?;
            v.write_to(w)?;
        }
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let len = read_u32(r)? as usize;
        let mut doc = Self::with_capacity(len.min(1024));
        for _ in 0..len {
            let k = read_str(r)?;
            let v = Value::read_from(r)?;
            doc.fields.insert(k, v);
        }
        Ok(doc)
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        Value::Document(self.clone()) == Value::Document(other.clone())
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = (&'a String, &'a Value);
    type IntoIter = Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: JsonValue) -> Document {
        Document::from_json(&v).unwrap()
    }

    #[test]
    fn preserves_insertion_order() {
        let d = doc(json!({"b": 1, "a": 2, "c": 3}));
        let keys: Vec<_> = d.keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn missing_is_not_stored() {
        let mut d = doc(json!({"a": 1}));
        d.insert("a", Value::Missing);
        d.insert("b", Value::Missing);
        assert!(d.is_empty());
    }

    #[test]
    fn dotted_paths() {
        let mut d = doc(json!({"user": {"address": {"city": "Paris"}}}));
        assert_eq!(d.get_path("user.address.city"), Some(&Value::from("Paris")));
        assert_eq!(d.get_path("user.phone"), None);
        d.set_path("user.address.zip", Value::from("75001"));
        d.set_path("meta.tags", Value::Int32(1));
        assert_eq!(
            d.to_json(),
            json!({"user": {"address": {"city": "Paris", "zip": "75001"}}, "meta": {"tags": 1}})
        );
        d.remove_path("user.address");
        assert_eq!(d.to_json(), json!({"user": {}, "meta": {"tags": 1}}));
    }

    #[test]
    fn remove_path_through_arrays() {
        let mut d = doc(json!({"items": [{"a": 1, "b": 2}, {"a": 3}]}));
        d.remove_path("items.a");
        assert_eq!(d.to_json(), json!({"items": [{"b": 2}, {}]}));
    }

    #[test]
    fn from_json_rejects_non_objects() {
        assert!(matches!(
            Document::from_json(&json!([1, 2])),
            Err(Error::NotAnObject)
        ));
    }
}
