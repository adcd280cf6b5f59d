//! Parsed pipelines, planning and the pull-based result cursor.

mod exec;
mod graph_lookup;
mod project;
mod sort;
mod stage;
mod unpack_bucket;

use std::sync::Arc;

use serde::Serialize;

use crate::context::{ExecContext, InterruptHandle};
use crate::document::Document;
use crate::error::Result;
use crate::expression::Variables;
use crate::optimizer;
use crate::source::{Catalog, DocumentSource, ScanSpec};
use crate::value::Value;

pub use exec::Node;
pub use project::{AddFields, Projection, ProjectionMode};
pub use sort::{SortKey, SortSpec, Sorter};
pub use stage::{
    EqualityJoin, GraphLookupSpec, LookupSpec, MergeSpec, Stage, UnwindSpec, parse_stage,
    parse_stages,
};
pub use unpack_bucket::{BucketFields, UnpackBucketSpec};

/// A parsed aggregation pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// How a pipeline was planned against its source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub stages: Vec<serde_json::Value>,
    pub filter_pushed_down: bool,
    pub sort_pushed_down: bool,
}

impl Pipeline {
    /// Parse a JSON array of stages. `let` variables from `ctx` are in scope.
    pub fn parse(value: &Value, ctx: &ExecContext) -> Result<Self> {
        let mut vps = ctx.parse_state();
        Ok(Self {
            stages: parse_stages(value, &mut vps)?,
        })
    }

    pub fn from_stages(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Stages in their source form.
    pub fn explain(&self) -> Value {
        Value::Array(self.stages.iter().map(Stage::to_value).collect())
    }

    /// Open `source` and build the execution chain. With optimization on,
    /// the stages are rewritten and the leading `$match`/`$sort` is offered
    /// to the source; whatever it does not satisfy stays in the chain.
    pub fn plan(
        self,
        source: &dyn DocumentSource,
        catalog: Arc<dyn Catalog>,
        ctx: ExecContext,
    ) -> Result<AggregateCursor> {
        let (mut stages, scan) = if ctx.config.optimize {
            let mut stages = optimizer::optimize(self.stages);
            let scan = optimizer::split_scan_prefix(&mut stages);
            (stages, scan)
        } else {
            (self.stages, ScanSpec::default())
        };

        let opened = source.open(&scan, &ctx)?;
        let mut prefix = Vec::with_capacity(2);
        if let Some(filter) = scan.filter {
            if !opened.filter_applied {
                prefix.push(Stage::Match(filter));
            }
        }
        if let Some(sort) = scan.sort {
            if !opened.sort_applied {
                prefix.push(Stage::Sort(sort));
            } else if let Some(k) = sort.limit {
                prefix.push(Stage::Limit(k));
            }
        }
        stages.splice(0..0, prefix);

        let summary = PlanSummary {
            stages: stages.iter().map(|s| s.to_value().to_json()).collect(),
            filter_pushed_down: opened.filter_applied,
            sort_pushed_down: opened.sort_applied,
        };
        tracing::debug!(
            stages = summary.stages.len(),
            filter_pushed_down = summary.filter_pushed_down,
            sort_pushed_down = summary.sort_pushed_down,
            "pipeline planned"
        );

        let root = Node::scan(opened.cursor);
        let root = Node::build_chain(stages, root, &catalog, &ctx)?;
        let vars = ctx.variables();
        Ok(AggregateCursor {
            root,
            ctx,
            vars,
            summary,
            done: false,
        })
    }
}

/// Lazily pulls results through the stage chain. Dropping the cursor
/// releases spill files and other stage state.
pub struct AggregateCursor {
    root: Node,
    ctx: ExecContext,
    vars: Variables,
    summary: PlanSummary,
    done: bool,
}

impl AggregateCursor {
    pub fn plan(&self) -> &PlanSummary {
        &self.summary
    }

    /// Handle that cancels this cursor from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.ctx.interrupt_handle()
    }

    pub fn close(&mut self) {
        if !self.done {
            self.done = true;
            self.root.close();
        }
    }
}

impl Iterator for AggregateCursor {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.root.next(&self.ctx, &mut self.vars) {
            Ok(Some(doc)) => Some(Ok(doc)),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}

impl Drop for AggregateCursor {
    fn drop(&mut self) {
        self.close();
    }
}
