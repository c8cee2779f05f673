#![forbid(unsafe_code)]

mod bin_detect;
mod defaults;
mod worker;


use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tt_runtime::{CommandProvider, JobExecutor, RuntimeConfig, SharedStore};
use tt_storage::SqliteStore;
use worker::{Worker, WorkerSettings};

const DEFAULT_LOG_FILTER: &str = "tt_runner=info,tt_runtime=info";

#[derive(Debug, Clone, PartialEq)]
struct RunnerConfig {
    storage_dir: PathBuf,
    config_path: Option<PathBuf>,
    runner_id: String,
    poll_ms: Option<u64>,
    max_parallel: usize,
    retention_s: Option<u64>,
    provider_bin: String,
    provider_args: Vec<String>,
    once: bool,
}

fn usage() -> &'static str {
    "tt_runner: execute Tether JOB-* records through a completion provider CLI\n\n\
USAGE:\n\
  tt_runner [--storage-dir DIR] [--config FILE] [--runner-id ID]\n\
            [--poll-ms MS] [--max-parallel N] [--retention-s S]\n\
            [--provider-bin PATH] [--provider-arg ARG]... [--once]\n\n\
NOTES:\n\
  - Every flag has a TT_* environment fallback (TT_STORAGE_DIR, TT_CONFIG, TT_RUNNER_ID,\n\
    TT_POLL_MS, TT_MAX_PARALLEL, TT_RETENTION_S, TT_PROVIDER_BIN).\n\
  - Jobs left `running` by a previous runner are re-executed on startup.\n\
  - `--once` drains the pending queue and exits.\n\
  - `--retention-s 0` keeps settled jobs forever.\n\
  - The provider receives the prompt on stdin and streams JSON event lines or plain text.\n"
}

fn parse_number<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, String> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("{what} must be an integer"))
}

/// Flags win over `TT_*` environment values, which win over defaults.
fn parse_args_from(
    args: &[String],
    env: impl Fn(&str) -> Option<String>,
    cwd: &Path,
    pid: u32,
) -> Result<RunnerConfig, String> {
    let env = |name: &str| {
        env(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let mut storage_dir = env("TT_STORAGE_DIR").map(PathBuf::from);
    let mut config_path = env("TT_CONFIG").map(PathBuf::from);
    let mut runner_id = env("TT_RUNNER_ID");
    let mut poll_ms = env("TT_POLL_MS")
        .map(|v| parse_number::<u64>(&v, "TT_POLL_MS"))
        .transpose()?;
    let mut max_parallel = env("TT_MAX_PARALLEL")
        .map(|v| parse_number::<usize>(&v, "TT_MAX_PARALLEL"))
        .transpose()?
        .unwrap_or(defaults::DEFAULT_MAX_PARALLEL);
    let mut retention_s = env("TT_RETENTION_S")
        .map(|v| parse_number::<u64>(&v, "TT_RETENTION_S"))
        .transpose()?;
    let mut provider_bin = env("TT_PROVIDER_BIN");
    let mut provider_args = Vec::new();
    let mut once = false;

    let mut i = 0usize;
    while i < args.len() {
        let a = args[i].as_str();
        match a {
            "--storage-dir" => {
                i += 1;
                let v = args.get(i).ok_or("--storage-dir requires DIR")?;
                storage_dir = Some(PathBuf::from(v));
            }
            "--config" => {
                i += 1;
                let v = args.get(i).ok_or("--config requires FILE")?;
                config_path = Some(PathBuf::from(v));
            }
            "--runner-id" => {
                i += 1;
                let v = args.get(i).ok_or("--runner-id requires ID")?;
                runner_id = Some(v.to_string());
            }
            "--poll-ms" => {
                i += 1;
                let v = args.get(i).ok_or("--poll-ms requires MS")?;
                poll_ms = Some(parse_number(v, "--poll-ms")?);
            }
            "--max-parallel" => {
                i += 1;
                let v = args.get(i).ok_or("--max-parallel requires N")?;
                max_parallel = parse_number(v, "--max-parallel")?;
            }
            "--retention-s" => {
                i += 1;
                let v = args.get(i).ok_or("--retention-s requires S")?;
                retention_s = Some(parse_number(v, "--retention-s")?);
            }
            "--provider-bin" => {
                i += 1;
                let v = args.get(i).ok_or("--provider-bin requires PATH")?;
                provider_bin = Some(v.to_string());
            }
            "--provider-arg" => {
                i += 1;
                let v = args.get(i).ok_or("--provider-arg requires ARG")?;
                provider_args.push(v.to_string());
            }
            "--once" => once = true,
            other => return Err(format!("unknown argument: {other}\n\n{}", usage())),
        }
        i += 1;
    }

    if poll_ms == Some(0) {
        return Err("--poll-ms must be greater than 0".to_string());
    }
    if max_parallel == 0 {
        return Err("--max-parallel must be greater than 0".to_string());
    }
    let runner_id = runner_id
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| defaults::default_runner_id_from_start(cwd, pid));

    Ok(RunnerConfig {
        storage_dir: storage_dir
            .unwrap_or_else(|| defaults::default_storage_dir_from_start(cwd)),
        config_path,
        runner_id,
        poll_ms,
        max_parallel,
        retention_s,
        provider_bin: provider_bin.unwrap_or_else(|| defaults::DEFAULT_PROVIDER_BIN.to_string()),
        provider_args,
        once,
    })
}

fn parse_args() -> Result<RunnerConfig, String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        std::process::exit(0);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("cannot read current dir: {e}"))?;
    parse_args_from(&args, |name| std::env::var(name).ok(), &cwd, std::process::id())
}

fn worker_settings(cfg: &RunnerConfig, runtime: &RuntimeConfig) -> WorkerSettings {
    WorkerSettings {
        poll: cfg
            .poll_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| runtime.poll_interval()),
        max_parallel: cfg.max_parallel,
        retention: cfg
            .retention_s
            .map(Duration::from_secs)
            .unwrap_or_else(|| runtime.job_retention()),
        once: cfg.once,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Everything that can fail before the first job is picked up.
fn build_worker(cfg: &RunnerConfig) -> Result<Worker, String> {
    let runtime = RuntimeConfig::load(cfg.config_path.as_deref()).map_err(|e| e.to_string())?;
    let provider_bin = bin_detect::resolve_command(&cfg.provider_bin)?;
    let store = SqliteStore::open(&cfg.storage_dir)
        .map_err(|e| format!("cannot open store at {}: {e}", cfg.storage_dir.display()))?;

    let provider = CommandProvider::new(
        provider_bin.to_string_lossy().to_string(),
        cfg.provider_args.clone(),
    );
    let executor = JobExecutor::new(SharedStore::new(store), Arc::new(provider), &runtime)
        .with_runner_id(cfg.runner_id.clone());
    info!(
        runner_id = %cfg.runner_id,
        storage_dir = %cfg.storage_dir.display(),
        provider = %provider_bin.display(),
        max_parallel = cfg.max_parallel,
        "runner starting"
    );
    Ok(Worker::new(executor, worker_settings(cfg, &runtime)))
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cfg = parse_args().unwrap_or_else(|e| {
        eprintln!("{e}");
        std::process::exit(2);
    });
    let mut worker = build_worker(&cfg).unwrap_or_else(|e| {
        error!(error = %e, "runner startup failed");
        eprintln!("{e}");
        std::process::exit(2);
    });

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received"),
                Err(err) => {
                    warn!(error = %err, "cannot listen for ctrl-c");
                    return;
                }
            }
            shutdown.cancel();
        });
    }

    if let Err(err) = worker.run(shutdown).await {
        error!(error = %err, "runner stopped");
        std::process::exit(1);
    }
}
