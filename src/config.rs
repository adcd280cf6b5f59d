use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::value::Value;

const MIB: usize = 1024 * 1024;

/// Process-wide aggregation settings. Read-only once a pipeline starts; each
/// execution gets its own copy inside its `ExecContext`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregateConfig {
    /// Byte budget for a blocking stage's in-memory state.
    pub max_memory_bytes: usize,
    pub allow_disk_use: bool,
    /// Cap for a single accumulator whose state grows with its input.
    pub max_accumulator_bytes: usize,
    /// Parent directory for spill runs; the system temp dir when unset.
    pub spill_dir: Option<PathBuf>,
    /// Spill runs read at once by a merge. More runs than this are merged
    /// in intermediate passes first.
    pub max_merge_fan_in: usize,
    /// Documents processed between interrupt checks.
    pub interrupt_check_interval: u64,
    pub max_time_ms: Option<u64>,
    pub output_batch_size: usize,
    pub optimize: bool,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 100 * MIB,
            allow_disk_use: true,
            max_accumulator_bytes: 100 * MIB,
            spill_dir: None,
            max_merge_fan_in: 64,
            interrupt_check_interval: 128,
            max_time_ms: None,
            output_batch_size: 1000,
            optimize: true,
        }
    }
}

impl AggregateConfig {
    /// Defaults overlaid with `OXIAGG_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| Error::InvalidOptions(format!("{key}: cannot parse '{raw}'")))
        }

        if let Some(v) = lookup("OXIAGG_MAX_MEMORY_BYTES") {
            self.max_memory_bytes = parse("OXIAGG_MAX_MEMORY_BYTES", &v)?;
        }
        if let Some(v) = lookup("OXIAGG_ALLOW_DISK_USE") {
            self.allow_disk_use = parse("OXIAGG_ALLOW_DISK_USE", &v)?;
        }
        if let Some(v) = lookup("OXIAGG_MAX_ACCUMULATOR_BYTES") {
            self.max_accumulator_bytes = parse("OXIAGG_MAX_ACCUMULATOR_BYTES", &v)?;
        }
        if let Some(v) = lookup("OXIAGG_SPILL_DIR") {
            self.spill_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("OXIAGG_MAX_MERGE_FAN_IN") {
            self.max_merge_fan_in = parse("OXIAGG_MAX_MERGE_FAN_IN", &v)?;
        }
        if let Some(v) = lookup("OXIAGG_INTERRUPT_CHECK_INTERVAL") {
            self.interrupt_check_interval = parse("OXIAGG_INTERRUPT_CHECK_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("OXIAGG_MAX_TIME_MS") {
            self.max_time_ms = Some(parse("OXIAGG_MAX_TIME_MS", &v)?);
        }
        if let Some(v) = lookup("OXIAGG_OUTPUT_BATCH_SIZE") {
            self.output_batch_size = parse("OXIAGG_OUTPUT_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("OXIAGG_OPTIMIZE") {
            self.optimize = parse("OXIAGG_OPTIMIZE", &v)?;
        }
        if self.interrupt_check_interval == 0 {
            self.interrupt_check_interval = 1;
        }
        Ok(())
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time_ms.map(Duration::from_millis)
    }

    /// A merge needs at least two inputs to make progress.
    pub fn merge_fan_in(&self) -> usize {
        self.max_merge_fan_in.max(2)
    }
}

/// Per-invocation options from an aggregate command object.
#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    pub allow_disk_use: Option<bool>,
    pub max_time_ms: Option<u64>,
    pub collation: Option<Collation>,
    /// Constants bound as `$$name` for the whole pipeline.
    pub let_vars: Document,
    pub bypass_optimizer: bool,
}

impl AggregateOptions {
    /// Parse `{allowDiskUse, maxTimeMS, collation, let, bypassOptimizer}`.
    /// Unrecognised keys are rejected.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Document(doc) = value else {
            return Err(Error::InvalidOptions("aggregate options must be an object".into()));
        };
        let mut opts = Self::default();
        for (key, v) in doc {
            match key.as_str() {
                "allowDiskUse" => match v {
                    Value::Bool(b) => opts.allow_disk_use = Some(*b),
                    _ => return Err(Error::TypeMismatch("allowDiskUse must be a boolean".into())),
                },
                "maxTimeMS" => match v.integral_i64() {
                    Some(ms) if ms >= 0 => opts.max_time_ms = (ms > 0).then_some(ms as u64),
                    _ => {
                        return Err(Error::InvalidOptions(
                            "maxTimeMS must be a non-negative integer".into(),
                        ));
                    }
                },
                "collation" => opts.collation = Some(Collation::from_value(v)?),
                "let" => match v {
                    Value::Document(vars) => opts.let_vars = vars.clone(),
                    _ => return Err(Error::TypeMismatch("let must be an object".into())),
                },
                "bypassOptimizer" => match v {
                    Value::Bool(b) => opts.bypass_optimizer = *b,
                    _ => {
                        return Err(Error::TypeMismatch("bypassOptimizer must be a boolean".into()));
                    }
                },
                other => {
                    return Err(Error::InvalidOptions(format!(
                        "unrecognized aggregate option: {other}"
                    )));
                }
            }
        }
        Ok(opts)
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        Self::from_value(&Value::from_json(json))
    }

    /// Effective configuration for one execution.
    pub fn apply(&self, base: &AggregateConfig) -> AggregateConfig {
        let mut config = base.clone();
        if let Some(allow) = self.allow_disk_use {
            config.allow_disk_use = allow;
        }
        if self.max_time_ms.is_some() {
            config.max_time_ms = self.max_time_ms;
        }
        if self.bypass_optimizer {
            config.optimize = false;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("OXIAGG_MAX_MEMORY_BYTES", "4096"),
            ("OXIAGG_ALLOW_DISK_USE", "false"),
            ("OXIAGG_INTERRUPT_CHECK_INTERVAL", "0"),
            ("OXIAGG_MAX_MERGE_FAN_IN", "1"),
        ]
        .into_iter()
        .collect();
        let mut config = AggregateConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_memory_bytes, 4096);
        assert!(!config.allow_disk_use);
        assert_eq!(config.interrupt_check_interval, 1);
        assert_eq!(config.max_merge_fan_in, 1);
        assert_eq!(config.merge_fan_in(), 2);
        assert!(config.optimize);
    }

    #[test]
    fn bad_env_value() {
        let mut config = AggregateConfig::default();
        let err = config
            .apply_overrides(|k| (k == "OXIAGG_OPTIMIZE").then(|| "maybe".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), 2);
    }

    #[test]
    fn deserialize_camel_case() {
        let config: AggregateConfig =
            serde_json::from_value(json!({"maxMemoryBytes": 10, "outputBatchSize": 2})).unwrap();
        assert_eq!(config.max_memory_bytes, 10);
        assert_eq!(config.output_batch_size, 2);
        assert!(config.allow_disk_use);
    }

    #[test]
    fn options_apply_over_config() {
        let opts = AggregateOptions::from_json(&json!({
            "allowDiskUse": false,
            "maxTimeMS": 50,
            "let": {"x": 1},
            "bypassOptimizer": true
        }))
        .unwrap();
        let config = opts.apply(&AggregateConfig::default());
        assert!(!config.allow_disk_use);
        assert_eq!(config.max_time(), Some(Duration::from_millis(50)));
        assert!(!config.optimize);
        assert_eq!(opts.let_vars.get("x"), Some(&Value::Int32(1)));

        let err = AggregateOptions::from_json(&json!({"cursor": {}})).unwrap_err();
        assert_eq!(err.code(), 2);
    }
}
