//! Workload replay tool for the chunkmerge engine.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`CHUNKMERGE_*`), and CLI flags. Replays a script of writes, flushes and aggregate queries
//! against an in-memory engine and prints each query result.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

use chunkmerge::telemetry::{noop_event_listener, EngineEvent, EngineEventListener};
use chunkmerge::{
    AggregateKind, AggregateOptions, DataType, Engine, EngineConfig, TimeFilter, Timestamp, Value,
};
use clap::Parser;
use config::{Config, Environment, File};

// ---------- CLI ----------

/// Replays a chunkmerge workload script.
#[derive(Parser, Debug)]
#[command(name = "chunkmerge", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `chunkmerge.toml` is loaded when present.
    #[arg(long, env = "CHUNKMERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the effective settings, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// Workload script. Read from stdin when omitted.
    #[arg(long, env = "CHUNKMERGE_SCRIPT")]
    pub script: Option<PathBuf>,

    /// Memtable flush threshold in bytes.
    #[arg(long)]
    pub memtable_size_threshold: Option<usize>,

    /// Route every overlap group through the merge iterator (no fast paths, no parallelism).
    #[arg(long, default_value_t = false)]
    pub merge_only: bool,

    /// Print engine events (flushes, compactions, aborted queries) to stderr.
    #[arg(long, default_value_t = false)]
    pub trace_events: bool,
}

// ---------- File/env config (all optional for partial config) ----------

/// Read-path section in config file.
#[derive(Debug, Default, serde::Deserialize)]
pub struct AggregateFileConfig {
    pub direct_singletons: Option<bool>,
    pub use_statistics: Option<bool>,
    pub parallel_groups: Option<bool>,
}

/// Top-level config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ReplayFileConfig {
    pub memtable_size_threshold: Option<usize>,
    pub script: Option<String>,
    pub aggregate: Option<AggregateFileConfig>,
}

/// Load merged engine config and script path. CLI overrides file/env.
fn load_replay_config(cli: &Cli) -> Result<(EngineConfig, Option<PathBuf>), String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("chunkmerge.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("CHUNKMERGE")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: ReplayFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut engine_config = EngineConfig::default();
    merge_into_engine_config(&mut engine_config, &partial);

    if let Some(n) = cli.memtable_size_threshold {
        engine_config.memtable_size_threshold = n;
    }
    if cli.merge_only {
        engine_config.aggregate = AggregateOptions::merge_only();
    }
    if engine_config.memtable_size_threshold == 0 {
        return Err("memtable_size_threshold must be greater than zero".to_string());
    }
    engine_config.event_listener = if cli.trace_events {
        Arc::new(StderrEventListener)
    } else {
        noop_event_listener()
    };

    let script = cli
        .script
        .clone()
        .or_else(|| partial.script.as_ref().map(PathBuf::from));
    Ok((engine_config, script))
}

/// Merge file/env partial config onto `EngineConfig`. Only overwrites fields that are `Some`.
fn merge_into_engine_config(base: &mut EngineConfig, partial: &ReplayFileConfig) {
    if let Some(n) = partial.memtable_size_threshold {
        base.memtable_size_threshold = n;
    }
    if let Some(agg) = &partial.aggregate {
        if let Some(b) = agg.direct_singletons {
            base.aggregate.direct_singletons = b;
        }
        if let Some(b) = agg.use_statistics {
            base.aggregate.use_statistics = b;
        }
        if let Some(b) = agg.parallel_groups {
            base.aggregate.parallel_groups = b;
        }
    }
}

#[derive(Debug)]
struct StderrEventListener;

impl EngineEventListener for StderrEventListener {
    fn on_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::ChunkFlushed {
                series,
                kind,
                version,
                points,
            } => eprintln!("flushed {:?} chunk v{} for {} ({} points)", kind, version, series, points),
            EngineEvent::ChunksCompacted {
                series,
                inputs,
                version,
                points,
            } => eprintln!(
                "compacted {} chunks of {} into v{} ({} points)",
                inputs, series, version, points
            ),
            EngineEvent::QueryAborted { series, error } => {
                eprintln!("query on {} aborted: {}", series, error)
            }
        }
    }
}

// ---------- Script ----------

/// One script line.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Create {
        series: String,
        data_type: DataType,
    },
    Insert {
        series: String,
        timestamp: Timestamp,
        raw_value: String,
    },
    Flush,
    Compact {
        series: String,
    },
    Select {
        kind: AggregateKind,
        series: String,
        filter: TimeFilter,
    },
    Scan {
        series: String,
        filter: TimeFilter,
    },
}

fn parse_data_type(raw: &str) -> Result<DataType, String> {
    match raw.to_ascii_lowercase().as_str() {
        "boolean" | "bool" => Ok(DataType::Boolean),
        "int32" => Ok(DataType::Int32),
        "int64" => Ok(DataType::Int64),
        "float" => Ok(DataType::Float),
        "double" => Ok(DataType::Double),
        other => Err(format!("unknown data type {:?}", other)),
    }
}

/// Parses `time <op> <n> [and time <op> <n>]...`.
fn parse_where(tokens: &[&str]) -> Result<TimeFilter, String> {
    let mut filter = TimeFilter::all();
    for (i, clause) in tokens.split(|t| t.eq_ignore_ascii_case("and")).enumerate() {
        let [field, op, raw] = clause else {
            return Err(format!("malformed predicate #{}: {:?}", i + 1, clause.join(" ")));
        };
        if !field.eq_ignore_ascii_case("time") {
            return Err(format!("only time predicates are supported, got {:?}", field));
        }
        let t: Timestamp = raw
            .parse()
            .map_err(|_| format!("invalid timestamp {:?}", raw))?;
        let next = match *op {
            "<" => TimeFilter::lt(t),
            "<=" => TimeFilter::lt_eq(t),
            ">" => TimeFilter::gt(t),
            ">=" => TimeFilter::gt_eq(t),
            "=" | "==" => TimeFilter::eq(t),
            other => return Err(format!("unknown operator {:?}", other)),
        };
        filter = filter.and(next);
    }
    Ok(filter)
}

fn parse_filter_suffix(tokens: &[&str]) -> Result<TimeFilter, String> {
    match tokens {
        [] => Ok(TimeFilter::all()),
        [kw, rest @ ..] if kw.eq_ignore_ascii_case("where") => parse_where(rest),
        _ => Err(format!("expected `where`, got {:?}", tokens.join(" "))),
    }
}

/// Parses one line. Blank lines and `#` comments yield `None`.
fn parse_line(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let command = match tokens.as_slice() {
        ["create", series, dt] => Command::Create {
            series: series.to_string(),
            data_type: parse_data_type(dt)?,
        },
        ["insert", series, ts, value] => Command::Insert {
            series: series.to_string(),
            timestamp: ts
                .parse()
                .map_err(|_| format!("invalid timestamp {:?}", ts))?,
            raw_value: value.to_string(),
        },
        ["flush"] => Command::Flush,
        ["compact", series] => Command::Compact {
            series: series.to_string(),
        },
        ["select", agg, series, rest @ ..] => Command::Select {
            kind: agg.parse()?,
            series: series.to_string(),
            filter: parse_filter_suffix(rest)?,
        },
        ["scan", series, rest @ ..] => Command::Scan {
            series: series.to_string(),
            filter: parse_filter_suffix(rest)?,
        },
        _ => return Err(format!("unrecognized command {:?}", line)),
    };
    Ok(Some(command))
}

/// Runs one command and returns the lines it prints.
fn execute(
    engine: &Engine,
    types: &mut std::collections::HashMap<String, DataType>,
    command: Command,
) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>> {
    match command {
        Command::Create { series, data_type } => {
            engine.create_series(&series, data_type)?;
            types.insert(series, data_type);
            Ok(Vec::new())
        }
        Command::Insert {
            series,
            timestamp,
            raw_value,
        } => {
            let data_type = types
                .get(&series)
                .copied()
                .ok_or_else(|| format!("series {} must be created before insert", series))?;
            let value = Value::parse(data_type, &raw_value)
                .ok_or_else(|| format!("invalid {:?} value {:?}", data_type, raw_value))?;
            engine.insert(&series, timestamp, value)?;
            Ok(Vec::new())
        }
        Command::Flush => {
            engine.flush()?;
            Ok(Vec::new())
        }
        Command::Compact { series } => {
            let line = match engine.compact(&series)? {
                Some(v) => format!("compacted {} into v{}", series, v),
                None => format!("nothing to compact for {}", series),
            };
            Ok(vec![line])
        }
        Command::Select {
            kind,
            series,
            filter,
        } => {
            let value = engine.aggregate(&series, &filter, kind)?;
            Ok(vec![format!("{}({}) where {} = {}", kind.name(), series, filter, value)])
        }
        Command::Scan { series, filter } => Ok(engine
            .query(&series, &filter)?
            .into_iter()
            .map(|p| format!("{},{}", p.timestamp, p.value))
            .collect()),
    }
}

fn replay<R: BufRead>(
    engine: &Engine,
    script: R,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut types = std::collections::HashMap::new();
    for (n, line) in script.lines().enumerate() {
        let line = line?;
        let Some(command) =
            parse_line(&line).map_err(|e| format!("line {}: {}", n + 1, e))?
        else {
            continue;
        };
        let output = execute(engine, &mut types, command)
            .map_err(|e| format!("line {}: {}", n + 1, e))?;
        for out in output {
            println!("{}", out);
        }
    }
    Ok(())
}

// ---------- Main ----------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let (engine_config, script) = load_replay_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        println!("memtable_size_threshold={}", engine_config.memtable_size_threshold);
        println!("direct_singletons={}", engine_config.aggregate.direct_singletons);
        println!("use_statistics={}", engine_config.aggregate.use_statistics);
        println!("parallel_groups={}", engine_config.aggregate.parallel_groups);
        match &script {
            Some(p) => println!("script={}", p.display()),
            None => println!("script=-"),
        }
        return Ok(());
    }

    let engine = Engine::with_config(engine_config).map_err(|e| {
        eprintln!("failed to create engine: {}", e);
        e
    })?;

    let input: Box<dyn Read> = match &script {
        Some(path) => Box::new(
            std::fs::File::open(path)
                .map_err(|e| format!("cannot open script {}: {}", path.display(), e))?,
        ),
        None => Box::new(std::io::stdin()),
    };
    replay(&engine, BufReader::new(input)).map_err(|e| {
        eprintln!("replay failed: {}", e);
        e
    })
}
