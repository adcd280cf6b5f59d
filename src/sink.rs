//! Destination side of `$out` and `$merge`.

use std::fmt;

use serde::Serialize;

use crate::document::Document;
use crate::error::{Error, Result, codes};
use crate::value::Value;

/// `{db, coll}` of an output stage. `db` defaults to the pipeline's own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputTarget {
    pub db: Option<String>,
    pub coll: String,
}

impl OutputTarget {
    pub fn parse(spec: &Value, stage: &str) -> Result<Self> {
        match spec {
            Value::String(coll) if !coll.is_empty() => Ok(Self {
                db: None,
                coll: coll.clone(),
            }),
            Value::Document(doc) => {
                let coll = doc
                    .get("coll")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| Error::InvalidPipeline(format!("{stage} target must name a 'coll'")))?;
                let db = match doc.get("db") {
                    None => None,
                    Some(Value::String(db)) => Some(db.clone()),
                    Some(_) => return Err(Error::InvalidPipeline(format!("{stage} 'db' must be a string"))),
                };
                Ok(Self {
                    db,
                    coll: coll.to_string(),
                })
            }
            _ => Err(Error::InvalidPipeline(format!(
                "{stage} target must be a string or an object"
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match &self.db {
            None => Value::String(self.coll.clone()),
            Some(db) => {
                let mut doc = Document::new();
                doc.insert("db", Value::String(db.clone()));
                doc.insert("coll", Value::String(self.coll.clone()));
                Value::Document(doc)
            }
        }
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.db {
            Some(db) => write!(f, "{db}.{}", self.coll),
            None => f.write_str(&self.coll),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WhenMatched {
    Replace,
    KeepExisting,
    Merge,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WhenNotMatched {
    Insert,
    Discard,
    Fail,
}

impl WhenMatched {
    pub fn parse(v: &Value) -> Result<Self> {
        match v.as_str() {
            Some("replace") => Ok(Self::Replace),
            Some("keepExisting") => Ok(Self::KeepExisting),
            Some("merge") => Ok(Self::Merge),
            Some("fail") => Ok(Self::Fail),
            _ => Err(Error::location(
                codes::MERGE_BAD_MODE,
                format!("unsupported $merge whenMatched mode: {v}"),
            )),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::KeepExisting => "keepExisting",
            Self::Merge => "merge",
            Self::Fail => "fail",
        }
    }
}

impl WhenNotMatched {
    pub fn parse(v: &Value) -> Result<Self> {
        match v.as_str() {
            Some("insert") => Ok(Self::Insert),
            Some("discard") => Ok(Self::Discard),
            Some("fail") => Ok(Self::Fail),
            _ => Err(Error::location(
                codes::MERGE_BAD_MODE,
                format!("unsupported $merge whenNotMatched mode: {v}"),
            )),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Discard => "discard",
            Self::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// `$out`: batches are staged and replace the target on commit.
    Replace,
    /// `$merge`: each batch is applied immediately.
    Merge {
        on: Vec<String>,
        when_matched: WhenMatched,
        when_not_matched: WhenNotMatched,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteAck {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub discarded: u64,
}

impl WriteAck {
    pub fn absorb(&mut self, other: WriteAck) {
        self.inserted += other.inserted;
        self.matched += other.matched;
        self.modified += other.modified;
        self.discarded += other.discarded;
    }
}

pub trait OutputSink: Send {
    fn write(&mut self, batch: Vec<Document>, mode: &WriteMode) -> Result<WriteAck>;

    /// Make everything written visible. `$out` swaps the staged contents in
    /// here; `$merge` sinks have nothing left to do.
    fn commit(&mut self) -> Result<WriteAck> {
        Ok(WriteAck::default())
    }

    /// Abandon staged output after a failure.
    fn abort(&mut self) {}
}
