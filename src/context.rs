use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::accumulator::AccumulatorEnv;
use crate::collation::Collation;
use crate::config::{AggregateConfig, AggregateOptions};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::expression::{Expression, Variables, VariablesParseState};
use crate::scripting::{NativeScriptHost, ScriptingHost};
use crate::spill::TempDirSpillStore;

/// Cancellation flag shared between a running pipeline and its owner.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-execution state threaded through every stage: configuration,
/// collation, bound variables, the scripting host and cancellation.
pub struct ExecContext {
    pub config: AggregateConfig,
    pub collation: Option<Collation>,
    pub scripting: Arc<dyn ScriptingHost>,
    /// Values of the `let` option, also the read-only scope for scripts.
    pub let_scope: Document,
    variables: Variables,
    parse_state: VariablesParseState,
    interrupt: InterruptHandle,
    deadline: Option<Instant>,
}

impl ExecContext {
    pub fn new(config: AggregateConfig) -> Self {
        let deadline = config.max_time().map(|d| Instant::now() + d);
        Self {
            config,
            collation: None,
            scripting: Arc::new(NativeScriptHost::new()),
            let_scope: Document::new(),
            variables: Variables::default(),
            parse_state: VariablesParseState::new(),
            interrupt: InterruptHandle::new(),
            deadline,
        }
    }

    /// Build a context from base configuration and command options. `let`
    /// values may be expressions; they are evaluated once here.
    pub fn from_options(base: &AggregateConfig, opts: &AggregateOptions) -> Result<Self> {
        let mut ctx = Self::new(opts.apply(base));
        ctx.collation = opts.collation.clone().filter(|c| !c.is_simple());
        ctx.variables = Variables::new(ctx.collation.clone());
        let empty = Document::new();
        for (name, raw) in &opts.let_vars {
            let expr = Expression::parse(raw, &mut ctx.parse_state)
                .map_err(|e| e.context(format!("let variable '{name}'")))?;
            let value = expr.evaluate(&empty, &mut ctx.variables)?;
            let id = ctx.parse_state.define(name)?;
            ctx.variables.set(id, value.clone());
            ctx.let_scope.insert(name.clone(), value);
        }
        Ok(ctx)
    }

    pub fn with_scripting(mut self, host: Arc<dyn ScriptingHost>) -> Self {
        self.scripting = host;
        self
    }

    pub fn with_interrupt(mut self, handle: InterruptHandle) -> Self {
        self.interrupt = handle;
        self
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Fails once the pipeline is cancelled or past its deadline.
    pub fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.is_interrupted() {
            tracing::warn!("aggregation interrupted");
            return Err(Error::Interrupted);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::warn!(max_time_ms = ?self.config.max_time_ms, "aggregation exceeded time limit");
            return Err(Error::MaxTimeExpired);
        }
        Ok(())
    }

    /// Check every `interruptCheckInterval` documents.
    pub fn check_interrupt_every(&self, processed: u64) -> Result<()> {
        if processed % self.config.interrupt_check_interval.max(1) == 0 {
            self.check_interrupt()?;
        }
        Ok(())
    }

    /// Fresh variable bindings carrying the `let` values.
    pub fn variables(&self) -> Variables {
        self.variables.clone()
    }

    /// Scope used while parsing stages so `let` names resolve.
    pub fn parse_state(&self) -> VariablesParseState {
        self.parse_state.clone()
    }

    pub fn accumulator_env(&self) -> AccumulatorEnv<'_> {
        AccumulatorEnv {
            collation: self.collation.as_ref(),
            max_bytes: self.config.max_accumulator_bytes,
            scripting: self.scripting.as_ref(),
            scope: &self.let_scope,
        }
    }

    pub fn spill_store(&self) -> Result<TempDirSpillStore> {
        TempDirSpillStore::new(self.config.spill_dir.as_deref())
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("config", &self.config)
            .field("collation", &self.collation)
            .field("let_scope", &self.let_scope)
            .field("interrupted", &self.interrupt.is_interrupted())
            .finish()
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new(AggregateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use serde_json::json;

    #[test]
    fn interrupt_flag_is_observed() {
        let ctx = ExecContext::default();
        assert!(ctx.check_interrupt().is_ok());
        ctx.interrupt_handle().interrupt();
        assert_eq!(ctx.check_interrupt().unwrap_err().code(), 11601);
    }

    #[test]
    fn deadline_expires() {
        let config = AggregateConfig {
            max_time_ms: Some(1),
            ..AggregateConfig::default()
        };
        let ctx = ExecContext::new(config);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(ctx.check_interrupt().unwrap_err().code(), 50);
    }

    #[test]
    fn let_variables_are_bound() {
        let opts = AggregateOptions::from_json(&json!({"let": {"two": {"$add": [1, 1]}}})).unwrap();
        let ctx = ExecContext::from_options(&AggregateConfig::default(), &opts).unwrap();
        let mut vps = ctx.parse_state();
        let expr = Expression::parse(&Value::from_json(&json!("$$two")), &mut vps).unwrap();
        let mut vars = ctx.variables();
        assert_eq!(expr.evaluate(&Document::new(), &mut vars).unwrap(), Value::Int32(2));
        assert_eq!(ctx.let_scope.get("two"), Some(&Value::Int32(2)));
    }

    #[test]
    fn reserved_let_name_rejected() {
        let opts = AggregateOptions::from_json(&json!({"let": {"ROOT": 1}})).unwrap();
        assert!(ExecContext::from_options(&AggregateConfig::default(), &opts).is_err());
    }
}
