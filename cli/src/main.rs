//! `scribe`: a terminal collaborator over `scribe-core`'s public surface.
//!
//! Exercises every `core` operation at least once; does not carry its own
//! test suite or packaging polish, per the out-of-scope framing of the
//! collaborators `core` is built to serve.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scribe_core::document::Key;
use scribe_core::error::StoreError;
use scribe_core::query::{Projection, QuerySpec};
use scribe_core::store::{FormatTarget, Store, StoreOptions};
use serde::Deserialize;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "scribe", about = "Operate a scribe document store from a terminal")]
struct Cli {
    /// Path to a store.toml config file; defaults to ./store.toml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the store root from the config file.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a document; `json` is the full document body.
    Put { r#type: String, id: String, json: String },
    Get { r#type: String, id: String },
    Remove { r#type: String, id: String },
    List { r#type: String },
    Query {
        #[arg(long = "type")]
        r#type: Option<String>,
        #[arg(long, default_value = "{}")]
        filter: String,
        /// Repeatable `field:1` / `field:-1` pairs, applied left-to-right.
        #[arg(long = "sort")]
        sort: Vec<String>,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long = "include")]
        include: Vec<String>,
        #[arg(long = "exclude")]
        exclude: Vec<String>,
    },
    EnsureIndex { r#type: String, field: String },
    RebuildIndexes {
        r#type: String,
        #[arg(long = "field")]
        fields: Vec<String>,
    },
    Format {
        #[arg(long = "type")]
        r#type: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        fail_fast: bool,
    },
    Stats {
        #[arg(long = "type")]
        r#type: Option<String>,
        #[arg(long)]
        detailed: bool,
    },
    Verify,
    ReadAttachment { r#type: String, id: String, field: String },
    WriteAttachment { r#type: String, id: String, rel_path: String, content: String },
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    root: Option<PathBuf>,
    indent: Option<usize>,
    enable_indexes: Option<bool>,
    sidecar_types: Option<Vec<String>>,
    indexes: Option<std::collections::HashMap<String, Vec<String>>>,
}

#[derive(Debug)]
struct InvalidArguments(String);

impl std::fmt::Display for InvalidArguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for InvalidArguments {}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<InvalidArguments>().is_some() {
        return 3;
    }
    if let Some(store_err) = err.downcast_ref::<StoreError>() {
        return match store_err {
            StoreError::NotFound(_) => 2,
            _ => 1,
        };
    }
    1
}

fn load_config(cli: &Cli) -> Result<FileConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| Some(PathBuf::from("store.toml")).filter(|p| p.exists()));
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn open_store(cli: &Cli) -> Result<Store> {
    let config = load_config(cli)?;
    let root = cli
        .root
        .clone()
        .or(config.root)
        .ok_or_else(|| InvalidArguments("no store root: pass --root or set 'root' in store.toml".into()))?;

    let mut options = StoreOptions::new(root);
    if let Some(indent) = config.indent {
        options = options.indent(indent);
    }
    if let Some(enable) = config.enable_indexes {
        options = options.enable_indexes(enable);
    }
    for r#type in config.sidecar_types.unwrap_or_default() {
        options = options.sidecar_type(r#type);
    }
    for (r#type, fields) in config.indexes.unwrap_or_default() {
        for field in fields {
            options = options.with_index(r#type.clone(), field);
        }
    }
    Ok(Store::open(options)?)
}

fn parse_sort(specs: &[String]) -> Result<Vec<(String, i32)>> {
    specs
        .iter()
        .map(|s| {
            let (field, dir) = s
                .split_once(':')
                .ok_or_else(|| InvalidArguments(format!("--sort must be field:1 or field:-1, got {s:?}")))?;
            let dir: i32 = dir
                .parse()
                .map_err(|_| InvalidArguments(format!("invalid sort direction in {s:?}")))?;
            Ok((field.to_string(), dir))
        })
        .collect::<Result<Vec<_>, InvalidArguments>>()
        .map_err(Into::into)
}

fn run(cli: Cli) -> Result<()> {
    let store = open_store(&cli)?;
    match &cli.command {
        Command::Put { r#type, id, json } => {
            let doc: Value =
                serde_json::from_str(json).map_err(|e| InvalidArguments(format!("invalid document JSON: {e}")))?;
            store.put(&Key::new(r#type.clone(), id.clone()), &doc)?;
        }
        Command::Get { r#type, id } => {
            match store.get(&Key::new(r#type.clone(), id.clone()))? {
                Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
                None => return Err(StoreError::NotFound(format!("{type}/{id}")).into()),
            }
        }
        Command::Remove { r#type, id } => {
            store.remove(&Key::new(r#type.clone(), id.clone()))?;
        }
        Command::List { r#type } => {
            for id in store.list(r#type)? {
                println!("{id}");
            }
        }
        Command::Query {
            r#type,
            filter,
            sort,
            skip,
            limit,
            include,
            exclude,
        } => {
            let filter: Value =
                serde_json::from_str(filter).map_err(|e| InvalidArguments(format!("invalid filter JSON: {e}")))?;
            if !include.is_empty() && !exclude.is_empty() {
                return Err(InvalidArguments("--include and --exclude are mutually exclusive".into()).into());
            }
            let projection = if !include.is_empty() {
                Projection::Include(include.clone())
            } else if !exclude.is_empty() {
                Projection::Exclude(exclude.clone())
            } else {
                Projection::None
            };
            let spec = QuerySpec {
                r#type: r#type.clone(),
                filter,
                sort: parse_sort(sort)?,
                skip: *skip,
                limit: *limit,
                projection,
            };
            let results = store.query(spec)?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::EnsureIndex { r#type, field } => {
            store.ensure_index(r#type, field)?;
        }
        Command::RebuildIndexes { r#type, fields } => {
            let fields = if fields.is_empty() { None } else { Some(fields.as_slice()) };
            store.rebuild_indexes(r#type, fields)?;
        }
        Command::Format { r#type, dry_run, fail_fast } => {
            let target = match r#type {
                Some(t) => FormatTarget::Type(t.clone()),
                None => FormatTarget::All,
            };
            let report = store.format(target, *dry_run, *fail_fast)?;
            println!("{} file(s) reformatted", report.changed);
            for (path, reason) in &report.failures {
                eprintln!("parse failure at {}: {reason}", path.display());
            }
        }
        Command::Stats { r#type, detailed } => {
            if *detailed {
                let stats = store.detailed_stats(r#type.as_deref())?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                let stats = store.stats(r#type.as_deref())?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        Command::Verify => {
            let report = store.verify()?;
            println!(
                "format drift: {}, parse failures: {}, index mismatches: {}",
                report.format_drift,
                report.parse_failures.len(),
                report.index_mismatches.len()
            );
        }
        Command::ReadAttachment { r#type, id, field } => {
            let content = store.read_attachment(&Key::new(r#type.clone(), id.clone()), field)?;
            println!("{content}");
        }
        Command::WriteAttachment { r#type, id, rel_path, content } => {
            store.write_attachment(&Key::new(r#type.clone(), id.clone()), rel_path, content)?;
        }
    }
    store.close();
    Ok(())
}
