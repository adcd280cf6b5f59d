//! OxiAgg: an in-process aggregation pipeline engine over JSON-like
//! documents, with streaming stages, spill-to-disk grouping and sorting,
//! and a small in-memory database to run pipelines against.

pub mod accumulator;
pub mod collation;
pub mod collection;
pub mod config;
pub mod context;
pub mod document;
pub mod engine;
pub mod error;
pub mod expression;
pub mod group;
pub mod index;
pub mod matcher;
pub mod numeric;
pub mod optimizer;
pub mod pipeline;
pub mod scripting;
pub mod sink;
pub mod source;
pub mod spill;
pub mod value;

pub use collection::Collection;
pub use config::{AggregateConfig, AggregateOptions};
pub use context::{ExecContext, InterruptHandle};
pub use document::Document;
pub use engine::Database;
pub use error::{Error, Result};
pub use pipeline::{AggregateCursor, Pipeline};
pub use scripting::{NativeScriptHost, ScriptingHost};
pub use value::Value;
