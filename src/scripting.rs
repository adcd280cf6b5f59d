use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::value::Value;

/// Evaluates user-supplied function source for `$where` and
/// `$_internalJsReduce`. The engine treats the host as opaque.
pub trait ScriptingHost: Send + Sync {
    /// Run `source` with positional `args`. `scope` holds read-only constants.
    fn invoke(&self, source: &str, args: &[Value], scope: &Document) -> Result<Value>;
}

type NativeFn = Arc<dyn Fn(&[Value], &Document) -> Result<Value> + Send + Sync>;

/// A host that maps function source text to Rust closures.
///
/// Embedders register every function their pipelines reference; invoking an
/// unregistered source fails with a scripting error.
#[derive(Default, Clone)]
pub struct NativeScriptHost {
    functions: HashMap<String, NativeFn>,
}

impl NativeScriptHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, source: impl Into<String>, f: F)
    where
        F: Fn(&[Value], &Document) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(normalize(&source.into()), Arc::new(f));
    }

    pub fn with<F>(mut self, source: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value], &Document) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(source, f);
        self
    }
}

/// Whitespace runs collapse so reformatted source still resolves.
fn normalize(source: &str) -> String {
    source.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl ScriptingHost for NativeScriptHost {
    fn invoke(&self, source: &str, args: &[Value], scope: &Document) -> Result<Value> {
        let f = self
            .functions
            .get(&normalize(source))
            .ok_or_else(|| Error::Script(format!("no function registered for source: {source}")))?;
        f(args, scope)
    }
}

impl fmt::Debug for NativeScriptHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeScriptHost")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_function_runs_with_scope() {
        let host = NativeScriptHost::new().with("function(k, vs) { return vs.length * factor; }", |args, scope| {
            let n = args[1].as_array().map_or(0, |a| a.len()) as i64;
            let factor = scope.field("factor").integral_i64().unwrap_or(1);
            Ok(Value::Int64(n * factor))
        });
        let mut scope = Document::new();
        scope.insert("factor", Value::Int32(10));
        let out = host
            .invoke(
                "function(k, vs) {\n    return vs.length * factor;\n}",
                &[Value::Null, Value::Array(vec![Value::Int32(1), Value::Int32(2)])],
                &scope,
            )
            .unwrap();
        assert_eq!(out, Value::Int64(20));
    }

    #[test]
    fn unknown_source_is_script_error() {
        let err = NativeScriptHost::new()
            .invoke("function() {}", &[], &Document::new())
            .unwrap_err();
        assert_eq!(err.code(), 139);
    }
}
