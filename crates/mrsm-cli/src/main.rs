//! mrsm — the command line interface (spec §6).
//!
//! Grammar: `<verb> <noun> [keys] [flags]`. Keys (`-c/-m/-l/-t`) filter a
//! set of pipes with globs and `_`-prefixed negation; `+` chains
//! multiple invocations sequentially in one process; `--nopretty` emits
//! newline-delimited JSON success tuples instead of human-readable
//! text. Exit codes: `0` success, `1` generic failure, `2` misuse, `130`
//! interrupted.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::Level;

use mrsm_core::config::Config;
use mrsm_core::dataframe::RecordBatch;
use mrsm_core::dtype::Value;
use mrsm_core::error::{MrsmError, Result as MrsmResult};
use mrsm_core::success::SuccessTuple;
use mrsm_core::telemetry::init_tracing;
use mrsm_pipes::{ConnectorKey, Pipe, PipeKeys};
use mrsm_scheduler::{Executor as JobExecutor, Job, RestartPolicy, Supervisor};
use mrsm_sql::Flavor;
use mrsm_storage::{Instance, MemoryInstance, PipesFilter, SqlInstance, Window};
use mrsm_sync::pipeline::{Chunk, ChunkStream, Fetcher, SyncOptions};
use mrsm_sync::verify::VerifyOptions;

#[derive(Parser)]
#[command(name = "mrsm")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental time-series data ingestion engine", long_about = None)]
struct Cli {
    /// Filter by connector label/glob, e.g. `-c sql:source` or `-c '_sql*'` to exclude.
    #[arg(short = 'c', long = "connector", global = true)]
    connector: Vec<String>,

    /// Filter by metric label/glob.
    #[arg(short = 'm', long = "metric", global = true)]
    metric: Vec<String>,

    /// Filter by location label/glob.
    #[arg(short = 'l', long = "location", global = true)]
    location: Vec<String>,

    /// Instance connector key to bind newly registered pipes to, e.g. `sql:main`.
    #[arg(short = 'i', long = "instance", global = true)]
    instance: Option<String>,

    /// Filter by tag.
    #[arg(short = 't', long = "tag", global = true)]
    tag: Vec<String>,

    /// Connection URL for the SQL-backed instance. Omit to use an
    /// ephemeral in-process store (demos and tests only — nothing
    /// persists past this invocation).
    #[arg(long, global = true)]
    url: Option<String>,

    /// Flavor of the backend named by `--url` (default: postgres).
    #[arg(long, global = true, default_value = "postgres")]
    flavor: String,

    /// Suppress human-readable formatting; emit newline-delimited JSON success tuples.
    #[arg(long, global = true)]
    nopretty: bool,

    /// Skip confirmation prompts.
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    yes: bool,

    /// Verbose (debug-level) logging.
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    verb: Verb,
}

#[derive(Subcommand)]
enum Verb {
    /// Fetch new/changed rows into a pipe's instance (spec §4.4).
    Sync {
        noun: String,
        /// Read incoming rows as newline-delimited JSON from this file instead of stdin.
        #[arg(long)]
        from: Option<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        skip_check_existing: bool,
    },
    /// Compare local and remote rowcounts chunk by chunk, resyncing discrepancies (spec §4.6).
    Verify {
        noun: String,
        #[arg(long)]
        from: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        chunk_days: i64,
        #[arg(long)]
        check_rowcounts_only: bool,
    },
    /// Remove duplicate index tuples from a pipe's local data (spec §4.6).
    Deduplicate {
        noun: String,
        #[arg(long, default_value_t = 1)]
        chunk_days: i64,
    },
    /// Register a new pipe (spec §3).
    Register {
        noun: String,
        /// Pipe attributes as JSON (columns/dtypes/parameters). Reads stdin if omitted.
        #[arg(long)]
        params: Option<PathBuf>,
    },
    /// Patch an existing pipe's attributes (spec §3).
    Edit {
        noun: String,
        #[arg(long)]
        params: PathBuf,
    },
    /// Print a pipe's or job's attributes.
    Show { noun: String },
    /// Delete all rows in a pipe's target table, keeping its registration.
    Clear { noun: String },
    /// Drop a pipe's target table, keeping its registration.
    Drop { noun: String },
    /// Remove a pipe's (or job's) registration entirely.
    Delete { noun: String },
    /// Start a local job under this process's supervisor (spec §4.7).
    Start {
        noun: String,
        name: String,
        /// Schedule expression, e.g. `daily`, `every 5 minutes`, `0 */6 * * *`.
        #[arg(long)]
        schedule: Option<String>,
        /// The command to run, after a literal `--`.
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Request a running job to stop.
    Stop {
        noun: String,
        name: String,
        #[arg(long, default_value_t = 5)]
        grace_secs: u64,
    },
    /// Pause a running job.
    Pause { noun: String, name: String },
    /// Resume a paused job.
    Resume { noun: String, name: String },
}

fn main() -> ExitCode {
    let raw_args: Vec<String> = std::env::args().collect();
    let chains = split_chains(&raw_args);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let mut last_code = ExitCode::from(0);
    for chain in chains {
        let cli = match Cli::try_parse_from(&chain) {
            Ok(cli) => cli,
            Err(e) => {
                e.print().ok();
                return ExitCode::from(2);
            }
        };
        last_code = runtime.block_on(run(cli));
        if last_code != ExitCode::from(0) {
            return last_code;
        }
    }
    last_code
}

/// Split `argv` on bare `+` tokens into separately-parsed invocations
/// (spec §6: "Chaining: `+` runs sequentially in one process"). The
/// program name is repeated onto the front of every segment after the
/// first so each one parses as a standalone `Cli`.
fn split_chains(argv: &[String]) -> Vec<Vec<String>> {
    let Some((prog, rest)) = argv.split_first() else {
        return vec![argv.to_vec()];
    };
    let mut chains = vec![Vec::new()];
    for arg in rest {
        if arg == "+" {
            chains.push(Vec::new());
        } else {
            chains.last_mut().unwrap().push(arg.clone());
        }
    }
    chains
        .into_iter()
        .map(|mut segment| {
            segment.insert(0, prog.clone());
            segment
        })
        .collect()
}

async fn run(cli: Cli) -> ExitCode {
    init_tracing(cli.nopretty, if cli.verbose { Level::DEBUG } else { Level::INFO });

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => return emit_failure(cli.nopretty, &e.to_string()),
    };

    let outcome = tokio::select! {
        result = dispatch(&cli, &config) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow!("interrupted")),
    };

    match outcome {
        Ok(tuples) => {
            let all_ok = tuples.iter().all(|t| t.is_ok());
            for t in &tuples {
                emit(cli.nopretty, t);
            }
            if all_ok {
                ExitCode::from(0)
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) if e.to_string() == "interrupted" => ExitCode::from(130),
        Err(e) => emit_failure(cli.nopretty, &e.to_string()),
    }
}

fn emit_failure(nopretty: bool, message: &str) -> ExitCode {
    emit(nopretty, &SuccessTuple::fail(message.to_string()));
    ExitCode::from(1)
}

fn emit(nopretty: bool, tuple: &SuccessTuple) {
    if nopretty {
        println!("{}", serde_json::to_string(tuple).unwrap_or_default());
    } else if tuple.is_ok() {
        println!("✓ {}", tuple.message);
    } else {
        eprintln!("✗ {}", tuple.message);
    }
}

async fn dispatch(cli: &Cli, config: &Config) -> anyhow::Result<Vec<SuccessTuple>> {
    match &cli.verb {
        Verb::Sync { noun, from, workers, timeout_secs, skip_check_existing } => {
            expect_noun(noun, "pipes")?;
            let instance = resolve_instance(cli, config).await?;
            let rows = read_ndjson(from.as_deref())?;
            let pipes = matched_pipes(cli, instance.as_ref()).await?;
            let mut out = Vec::new();
            for pipe in pipes {
                let fetcher: Arc<dyn Fetcher> = Arc::new(StaticFetcher(rows.clone()));
                let options = SyncOptions {
                    workers: workers.unwrap_or(4),
                    timeout: timeout_secs.map(std::time::Duration::from_secs),
                    skip_check_existing: *skip_check_existing,
                    ..SyncOptions::default()
                };
                let outcome = mrsm_sync::pipeline::sync(instance.clone(), pipe, fetcher, options, None, None).await?;
                out.push(outcome.success);
            }
            Ok(out)
        }

        Verb::Verify { noun, from, chunk_days, check_rowcounts_only } => {
            expect_noun(noun, "pipes")?;
            let instance = resolve_instance(cli, config).await?;
            let rows = read_ndjson(from.as_deref()).unwrap_or_default();
            let pipes = matched_pipes(cli, instance.as_ref()).await?;
            let mut out = Vec::new();
            for pipe in pipes {
                let fetcher: Arc<dyn Fetcher> = Arc::new(StaticFetcher(rows.clone()));
                let options = VerifyOptions {
                    chunk_interval: chrono::Duration::days(*chunk_days),
                    check_rowcounts_only: *check_rowcounts_only,
                    ..VerifyOptions::default()
                };
                let outcome = mrsm_sync::verify::verify(instance.clone(), pipe, fetcher, options).await?;
                out.push(outcome.success);
            }
            Ok(out)
        }

        Verb::Deduplicate { noun, chunk_days } => {
            expect_noun(noun, "pipes")?;
            let instance = resolve_instance(cli, config).await?;
            let pipes = matched_pipes(cli, instance.as_ref()).await?;
            let mut out = Vec::new();
            for pipe in pipes {
                let outcome = mrsm_sync::dedup::deduplicate(instance.clone(), pipe, None, chrono::Duration::days(*chunk_days)).await?;
                out.push(outcome.success);
            }
            Ok(out)
        }

        Verb::Register { noun, params } => {
            expect_noun(noun, "pipes")?;
            let instance = resolve_instance(cli, config).await?;
            let pipe = read_pipe_params(cli, params.as_deref())?;
            Ok(vec![instance.register_pipe(&pipe).await?])
        }

        Verb::Edit { noun, params } => {
            expect_noun(noun, "pipes")?;
            let instance = resolve_instance(cli, config).await?;
            let text = std::fs::read_to_string(params).with_context(|| format!("reading {}", params.display()))?;
            let patch: serde_json::Value = serde_json::from_str(&text)?;
            let pipes = matched_pipes(cli, instance.as_ref()).await?;
            let mut out = Vec::new();
            for mut pipe in pipes {
                apply_pipe_patch(&mut pipe, &patch);
                out.push(instance.edit_pipe(&pipe).await?);
            }
            Ok(out)
        }

        Verb::Show { noun } => match noun.as_str() {
            "pipes" => {
                let instance = resolve_instance(cli, config).await?;
                let pipes = matched_pipes(cli, instance.as_ref()).await?;
                let mut out = Vec::new();
                for pipe in pipes {
                    let text = serde_json::to_string_pretty(&pipe)?;
                    out.push(SuccessTuple::ok(text));
                }
                Ok(out)
            }
            "jobs" => Err(anyhow!("`show jobs` requires a running `mrsmd` supervisor; not available from this process")),
            other => Err(unexpected_noun(other)),
        },

        Verb::Clear { noun } => {
            expect_noun(noun, "pipes")?;
            let instance = resolve_instance(cli, config).await?;
            let pipes = matched_pipes(cli, instance.as_ref()).await?;
            let mut out = Vec::new();
            for pipe in pipes {
                out.push(instance.clear_pipe(&pipe, &Window::default()).await?);
            }
            Ok(out)
        }

        Verb::Drop { noun } => {
            expect_noun(noun, "pipes")?;
            confirm(cli, "drop the target table(s) for the matched pipe(s)")?;
            let instance = resolve_instance(cli, config).await?;
            let pipes = matched_pipes(cli, instance.as_ref()).await?;
            let mut out = Vec::new();
            for pipe in pipes {
                out.push(instance.drop_pipe(&pipe).await?);
            }
            Ok(out)
        }

        Verb::Delete { noun } => {
            expect_noun(noun, "pipes")?;
            confirm(cli, "delete the registration for the matched pipe(s)")?;
            let instance = resolve_instance(cli, config).await?;
            let pipes = matched_pipes(cli, instance.as_ref()).await?;
            let mut out = Vec::new();
            for pipe in pipes {
                out.push(instance.delete_pipe(&pipe.keys).await?);
            }
            Ok(out)
        }

        Verb::Start { noun, name, schedule, command } => {
            expect_noun(noun, "jobs")?;
            if command.is_empty() {
                return Err(anyhow!("start jobs requires a command after `--`"));
            }
            let mut job = Job::new(name.clone(), command.clone(), JobExecutor::Local);
            if let Some(expr) = schedule {
                job = job.with_schedule(expr).map_err(MrsmError::into_anyhow)?;
            } else {
                job = job.with_restart(RestartPolicy::Always);
            }
            let supervisor = shared_supervisor();
            Ok(vec![supervisor.start(job).await?])
        }

        Verb::Stop { noun, name, grace_secs } => {
            expect_noun(noun, "jobs")?;
            let supervisor = shared_supervisor();
            Ok(vec![supervisor.stop(name, std::time::Duration::from_secs(*grace_secs)).await?])
        }

        Verb::Pause { noun, name } => {
            expect_noun(noun, "jobs")?;
            let supervisor = shared_supervisor();
            Ok(vec![supervisor.pause(name).await?])
        }

        Verb::Resume { noun, name } => {
            expect_noun(noun, "jobs")?;
            let supervisor = shared_supervisor();
            Ok(vec![supervisor.resume(name).await?])
        }
    }
}

fn expect_noun(actual: &str, expected: &str) -> anyhow::Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(unexpected_noun(actual))
    }
}

fn unexpected_noun(noun: &str) -> anyhow::Error {
    anyhow!("unrecognized noun '{noun}'")
}

fn confirm(cli: &Cli, action: &str) -> anyhow::Result<()> {
    if cli.yes || mrsm_core::config::noask() {
        return Ok(());
    }
    eprint!("about to {action}. Continue? [y/N] ");
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
        Ok(())
    } else {
        Err(anyhow!("aborted: confirmation declined"))
    }
}

/// Resolve the backend named by `--url`/`--flavor`, or an ephemeral
/// in-process store when neither is given (local testing only — every
/// invocation starts from empty state).
async fn resolve_instance(cli: &Cli, config: &Config) -> anyhow::Result<Arc<dyn Instance>> {
    let label = cli.instance.as_deref().unwrap_or("main");
    let url = cli
        .url
        .clone()
        .or_else(|| config.get(&format!("connectors.sql.{label}.url")).and_then(|v| v.as_str().map(str::to_string)));

    match url {
        Some(url) => {
            let flavor = parse_flavor(&cli.flavor)?;
            let instance = SqlInstance::connect(&url, flavor).await?;
            Ok(Arc::new(instance))
        }
        None => {
            tracing::warn!("no --url or connectors.sql.{label}.url configured; using an ephemeral in-process store");
            Ok(Arc::new(MemoryInstance::new()))
        }
    }
}

fn parse_flavor(s: &str) -> anyhow::Result<Flavor> {
    match s.to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" => Ok(Flavor::Postgres),
        "sqlite" => Ok(Flavor::Sqlite),
        "duckdb" => Ok(Flavor::Duckdb),
        "mssql" | "sqlserver" => Ok(Flavor::Mssql),
        "mysql" | "mariadb" => Ok(Flavor::Mysql),
        other => Err(anyhow!("unrecognized SQL flavor '{other}'")),
    }
}

fn build_filter(cli: &Cli) -> PipesFilter {
    PipesFilter {
        connector_patterns: cli.connector.clone(),
        metric_patterns: cli.metric.clone(),
        location_patterns: cli.location.clone(),
        tags: cli.tag.clone(),
    }
}

async fn matched_pipes(cli: &Cli, instance: &dyn Instance) -> anyhow::Result<Vec<Pipe>> {
    let filter = build_filter(cli);
    let keys = instance.fetch_pipes_keys(&filter).await?;
    let mut pipes = Vec::with_capacity(keys.len());
    for k in keys {
        match instance.get_pipe_attributes(&k).await? {
            Some(pipe) => pipes.push(pipe),
            None => tracing::warn!(pipe = %k, "registry listed a pipe with no attributes row; skipping"),
        }
    }
    if pipes.is_empty() {
        tracing::warn!("no pipes matched the given -c/-m/-l/-t filters");
    }
    Ok(pipes)
}

fn read_pipe_params(cli: &Cli, path: Option<&std::path::Path>) -> anyhow::Result<Pipe> {
    let text = match path {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let mut pipe: Pipe = serde_json::from_str(&text).context("parsing pipe attributes JSON")?;
    if let Some(connector) = cli.connector.first() {
        pipe.keys.connector = ConnectorKey::parse(connector);
    }
    if let Some(metric) = cli.metric.first() {
        pipe.keys.metric = metric.clone();
    }
    if let Some(location) = cli.location.first() {
        pipe.keys.location = Some(location.clone());
    }
    if let Some(instance) = &cli.instance {
        pipe.keys.instance = ConnectorKey::parse(instance);
    }
    Ok(pipe)
}

fn apply_pipe_patch(pipe: &mut Pipe, patch: &serde_json::Value) {
    let mut doc = serde_json::to_value(&*pipe).expect("Pipe always serializes");
    mrsm_core::config::merge_patch(&mut doc, patch);
    if let Ok(updated) = serde_json::from_value(doc) {
        *pipe = updated;
    }
}

fn read_ndjson(path: Option<&std::path::Path>) -> anyhow::Result<Vec<serde_json::Value>> {
    let text = match path {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(anyhow::Error::from))
        .collect()
}

/// A minimal built-in connector: the rows a `sync`/`verify` invocation
/// was handed on the command line (spec GLOSSARY "Connector": "a
/// plugin `fetch()`, or a custom class").
struct StaticFetcher(Vec<serde_json::Value>);

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, _pipe: &Pipe, _begin: Option<Value>, _end: Option<Value>) -> MrsmResult<ChunkStream> {
        let batch = RecordBatch::from_json_rows(&self.0)?;
        Ok(Box::pin(futures::stream::once(async move { Ok(Chunk::Rows(batch)) })))
    }
}

/// This process's only `Supervisor`: jobs started by a `mrsm start`
/// invocation live only as long as this process runs. A long-running
/// job host belongs in `mrsmd`, which owns a `Supervisor` across its
/// whole lifetime.
fn shared_supervisor() -> &'static Supervisor {
    use std::sync::OnceLock;
    static SUPERVISOR: OnceLock<Supervisor> = OnceLock::new();
    SUPERVISOR.get_or_init(|| Supervisor::new(default_logs_dir()))
}

fn default_logs_dir() -> PathBuf {
    mrsm_core::config::plugins_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from(".mrsm/logs"))
}

trait MrsmErrorExt {
    fn into_anyhow(self) -> anyhow::Error;
}

impl MrsmErrorExt for MrsmError {
    fn into_anyhow(self) -> anyhow::Error {
        anyhow!(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_chains_separates_on_bare_plus() {
        let argv = vec!["mrsm".into(), "sync".into(), "pipes".into(), "+".into(), "verify".into(), "pipes".into()];
        let chains = split_chains(&argv);
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0], vec!["mrsm", "sync", "pipes"]);
        assert_eq!(chains[1], vec!["mrsm", "verify", "pipes"]);
    }

    #[test]
    fn split_chains_with_no_plus_is_a_single_chain() {
        let argv = vec!["mrsm".into(), "show".into(), "pipes".into()];
        assert_eq!(split_chains(&argv).len(), 1);
    }

    #[test]
    fn expect_noun_rejects_mismatch() {
        assert!(expect_noun("jobs", "pipes").is_err());
        assert!(expect_noun("pipes", "pipes").is_ok());
    }

    #[test]
    fn cli_parses_sync_pipes_with_key_filters() {
        let cli = Cli::try_parse_from(["mrsm", "-c", "sql:source", "-m", "temp", "sync", "pipes"]).unwrap();
        assert_eq!(cli.connector, vec!["sql:source"]);
        assert_eq!(cli.metric, vec!["temp"]);
    }

    #[test]
    fn cli_rejects_unknown_verb() {
        assert!(Cli::try_parse_from(["mrsm", "teleport", "pipes"]).is_err());
    }

    #[tokio::test]
    async fn matched_pipes_returns_empty_for_a_fresh_instance() {
        let instance = MemoryInstance::new();
        let cli = Cli::try_parse_from(["mrsm", "show", "pipes"]).unwrap();
        let pipes = matched_pipes(&cli, &instance).await.unwrap();
        assert!(pipes.is_empty());
    }
}
