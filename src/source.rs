//! Input side of a pipeline: scan specs offered to a document source and
//! the catalog that resolves collection names.

use std::sync::Arc;

use crate::context::ExecContext;
use crate::document::Document;
use crate::error::Result;
use crate::expression::Variables;
use crate::matcher::Matcher;
use crate::pipeline::SortSpec;
use crate::sink::{OutputSink, OutputTarget};

/// The leading `$match`/`$sort` of a pipeline, offered to the source.
#[derive(Debug, Clone, Default)]
pub struct ScanSpec {
    pub filter: Option<Matcher>,
    pub sort: Option<SortSpec>,
}

impl ScanSpec {
    pub fn is_empty(&self) -> bool {
        self.filter.is_none() && self.sort.is_none()
    }
}

pub trait DocumentCursor: Send {
    /// `ctx` and `vars` are those of the pipeline pulling the cursor.
    fn next_doc(&mut self, ctx: &ExecContext, vars: &mut Variables) -> Result<Option<Document>>;
}

/// What a source did with the scan spec. Only parts reported as applied are
/// removed from the pipeline.
pub struct OpenedScan {
    pub cursor: Box<dyn DocumentCursor>,
    pub filter_applied: bool,
    pub sort_applied: bool,
}

pub trait DocumentSource: Send + Sync {
    fn open(&self, spec: &ScanSpec, ctx: &ExecContext) -> Result<OpenedScan>;
}

/// Resolves collection names to sources and output targets.
pub trait Catalog: Send + Sync {
    /// A missing collection reads as empty.
    fn source(&self, collection: &str) -> Result<Arc<dyn DocumentSource>>;

    fn sink(&self, target: &OutputTarget) -> Result<Box<dyn OutputSink>>;

    /// Bumped by every database drop; output stages compare it before
    /// writing.
    fn ddl_epoch(&self) -> u64;
}

// ---------------------------------------------------------------------------
// In-memory sources
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct VecCursor {
    docs: std::vec::IntoIter<Document>,
}

impl VecCursor {
    pub fn new(docs: Vec<Document>) -> Self {
        Self {
            docs: docs.into_iter(),
        }
    }
}

impl DocumentCursor for VecCursor {
    fn next_doc(&mut self, _ctx: &ExecContext, _vars: &mut Variables) -> Result<Option<Document>> {
        Ok(self.docs.next())
    }
}

/// An unindexed list of documents. Never applies any part of a scan spec.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    docs: Vec<Document>,
}

impl MemorySource {
    pub fn new(docs: Vec<Document>) -> Self {
        Self { docs }
    }
}

impl DocumentSource for MemorySource {
    fn open(&self, _spec: &ScanSpec, _ctx: &ExecContext) -> Result<OpenedScan> {
        Ok(OpenedScan {
            cursor: Box::new(VecCursor::new(self.docs.clone())),
            filter_applied: false,
            sort_applied: false,
        })
    }
}

/// All documents of `source` matching `matcher`, in scan order.
pub(crate) fn scan_matching(
    source: &dyn DocumentSource,
    matcher: &Matcher,
    ctx: &ExecContext,
    vars: &mut Variables,
) -> Result<Vec<Document>> {
    let spec = ScanSpec {
        filter: Some(matcher.clone()),
        sort: None,
    };
    let mut opened = source.open(&spec, ctx)?;
    let mut out = Vec::new();
    let mut scanned = 0u64;
    while let Some(doc) = opened.cursor.next_doc(ctx, vars)? {
        scanned += 1;
        ctx.check_interrupt_every(scanned)?;
        if opened.filter_applied || matcher.matches(&doc, ctx, vars)? {
            out.push(doc);
        }
    }
    Ok(out)
}
