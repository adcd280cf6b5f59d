mod display;

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::{Map, Value as JsonValue, json};

use oxiagg::{AggregateConfig, AggregateOptions, Database, Error, Result, Value};

#[derive(Parser)]
#[command(name = "oxiagg", about = "Run aggregation pipelines over JSON documents")]
struct Cli {
    /// Load a collection: NAME=FILE (JSON array or one document per line)
    #[arg(long = "load", value_name = "NAME=FILE")]
    loads: Vec<String>,

    /// Create an index: COLLECTION.FIELD
    #[arg(long = "index", value_name = "COLL.FIELD")]
    indexes: Vec<String>,

    /// Collection the pipeline reads from
    #[arg(long, short)]
    collection: String,

    /// Pipeline as a JSON array
    #[arg(long, short, conflicts_with = "pipeline_file")]
    pipeline: Option<String>,

    /// Read the pipeline from a file
    #[arg(long)]
    pipeline_file: Option<PathBuf>,

    /// Allow blocking stages to spill to disk (overrides OXIAGG_ALLOW_DISK_USE)
    #[arg(long)]
    allow_disk_use: Option<bool>,

    /// Per-stage memory budget in bytes
    #[arg(long)]
    max_memory_bytes: Option<usize>,

    #[arg(long)]
    max_time_ms: Option<u64>,

    /// Collation as a JSON object, e.g. '{"locale":"en","strength":2}'
    #[arg(long)]
    collation: Option<String>,

    /// Pipeline variables as a JSON object
    #[arg(long = "let")]
    let_vars: Option<String>,

    /// Run the stages exactly as written
    #[arg(long)]
    no_optimize: bool,

    /// Print the plan instead of running the pipeline
    #[arg(long)]
    explain: bool,

    /// Output raw JSON (no pretty-printing)
    #[arg(long)]
    json: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(out) => println!("{out}"),
        Err(e) => {
            tracing::debug!(error = ?e, "aggregation failed");
            eprintln!("{}", display::format_error(&e.to_json(), cli.json));
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<String> {
    let mut config = AggregateConfig::from_env()?;
    if let Some(bytes) = cli.max_memory_bytes {
        config.max_memory_bytes = bytes;
    }
    let db = Database::with_config("cli", config);

    for load in &cli.loads {
        let (name, path) = load
            .split_once('=')
            .ok_or_else(|| Error::InvalidOptions(format!("--load expects NAME=FILE, got '{load}'")))?;
        let docs = read_documents(Path::new(path))?;
        let n = db.insert_many(name, &docs)?.len();
        tracing::info!(collection = name, documents = n, "loaded");
    }
    for index in &cli.indexes {
        let (coll, field) = index
            .split_once('.')
            .ok_or_else(|| Error::InvalidOptions(format!("--index expects COLL.FIELD, got '{index}'")))?;
        db.create_index(coll, field)?;
    }

    let pipeline: JsonValue = match (&cli.pipeline, &cli.pipeline_file) {
        (Some(text), _) => serde_json::from_str(text)?,
        (None, Some(path)) => serde_json::from_str(&fs::read_to_string(path)?)?,
        (None, None) => json!([]),
    };
    let opts = options(cli)?;

    if cli.explain {
        let plan = db.explain(&cli.collection, &pipeline, &opts)?;
        let plan = serde_json::to_value(&plan)?;
        return Ok(display::format_plan(&plan, cli.json));
    }
    let docs = db.aggregate(&cli.collection, &pipeline, &opts)?;
    Ok(display::format_results(&docs, cli.json))
}

fn options(cli: &Cli) -> Result<AggregateOptions> {
    let mut obj = Map::new();
    if let Some(allow) = cli.allow_disk_use {
        obj.insert("allowDiskUse".into(), json!(allow));
    }
    if let Some(ms) = cli.max_time_ms {
        obj.insert("maxTimeMS".into(), json!(ms));
    }
    if let Some(collation) = &cli.collation {
        obj.insert("collation".into(), serde_json::from_str(collation)?);
    }
    if let Some(vars) = &cli.let_vars {
        obj.insert("let".into(), serde_json::from_str(vars)?);
    }
    if cli.no_optimize {
        obj.insert("bypassOptimizer".into(), json!(true));
    }
    AggregateOptions::from_value(&Value::from_json(&JsonValue::Object(obj)))
}

/// A JSON array of documents, or newline-delimited documents.
fn read_documents(path: &Path) -> Result<Vec<JsonValue>> {
    let text = fs::read_to_string(path)?;
    if text.trim_start().starts_with('[') {
        return match serde_json::from_str(&text)? {
            JsonValue::Array(docs) => Ok(docs),
            _ => Err(Error::NotAnObject),
        };
    }
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Error::from))
        .collect()
}
