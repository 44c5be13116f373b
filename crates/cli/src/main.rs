use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use karchive_filters::{handle::load_and_report, spawn_reload, FilterHandle, FilterSet};
use karchive_kubehub::KubeDeleter;
use karchive_logs::{load_headers_or_empty, LogProxy, LogProxyConfig};
use karchive_persist::SqliteStore;
use karchive_sink::{spawn_workers, EventProcessor, ProcessorConfig};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "karchive", version, about = "Policy-driven Kubernetes resource archiver")]
struct Cli {
    /// Tracing filter directives, e.g. `info,karchive_sink=debug`
    #[arg(long = "log", env = "KARCHIVE_LOG", global = true, default_value = "info")]
    log: String,

    /// Expose Prometheus metrics on this host:port
    #[arg(long = "metrics-addr", env = "KARCHIVE_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Receive resource change events, archive and delete per policy
    Sink(SinkArgs),
    /// Serve the log retrieval proxy
    Logs(LogsArgs),
    /// Load the policy directory and report every error
    CheckPolicies {
        /// Policy directory (one file per namespace, `_global` for all)
        #[arg(long = "policies", env = "MOUNT_PATH")]
        policies: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct SinkArgs {
    #[arg(long = "policies", env = "MOUNT_PATH")]
    policies: Option<PathBuf>,
    /// SQLite archive path (default ~/.karchive/archive.db)
    #[arg(long = "db", env = "KARCHIVE_DB_PATH")]
    db: Option<String>,
    #[arg(long = "listen", env = "KARCHIVE_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
    #[arg(long = "workers", env = "KARCHIVE_WORKERS", default_value_t = 4)]
    workers: usize,
    #[arg(long = "queue-cap", env = "KARCHIVE_QUEUE_CAP", default_value_t = 1024)]
    queue_cap: usize,
    #[arg(long = "persist-timeout-secs", env = "KARCHIVE_PERSIST_TIMEOUT_SECS", default_value_t = 5)]
    persist_timeout_secs: u64,
    #[arg(long = "delete-timeout-secs", env = "KARCHIVE_DELETE_TIMEOUT_SECS", default_value_t = 5)]
    delete_timeout_secs: u64,
    /// Policy directory poll interval; 0 disables reloading
    #[arg(long = "reload-secs", env = "KARCHIVE_RELOAD_SECS", default_value_t = 10)]
    reload_secs: u64,
}

#[derive(clap::Args, Debug)]
struct LogsArgs {
    #[arg(long = "listen", env = "KARCHIVE_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
    /// Directory of header secrets injected into backend requests
    #[arg(long = "headers-dir", env = "LOGGING_DIR")]
    headers_dir: Option<PathBuf>,
    #[arg(long = "timeout-secs", env = "KARCHIVE_LOGS_TIMEOUT_SECS", default_value_t = 60)]
    timeout_secs: u64,
    #[arg(long = "insecure-skip-verify", env = "KARCHIVE_LOGS_INSECURE_SKIP_VERIFY", action = ArgAction::SetTrue)]
    insecure_skip_verify: bool,
}

fn init_observability(log: &str, metrics_addr: Option<SocketAddr>) {
    let filter = tracing_subscriber::EnvFilter::from_str(log).unwrap_or_else(|e| {
        eprintln!("invalid log filter {log:?} ({e}); falling back to info");
        tracing_subscriber::EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    let Some(addr) = metrics_addr else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
        Err(e) => warn!(addr = %addr, error = %e, "failed to install metrics exporter"),
    }
}

async fn run_sink(args: SinkArgs) -> Result<()> {
    let policies = args.policies.unwrap_or_default();
    let filters = FilterHandle::new(load_and_report(&policies));
    let reload = (args.reload_secs > 0 && !policies.as_os_str().is_empty())
        .then(|| spawn_reload(policies.clone(), filters.clone(), Duration::from_secs(args.reload_secs)));

    let store = SqliteStore::open_or_default(args.db.as_deref())?;
    let deleter = KubeDeleter::try_default().await.context("building kubernetes client")?;
    let cfg = ProcessorConfig {
        persist_timeout: Duration::from_secs(args.persist_timeout_secs),
        delete_timeout: Duration::from_secs(args.delete_timeout_secs),
    };
    let processor = Arc::new(EventProcessor::new(filters, Arc::new(store), Arc::new(deleter), cfg));

    let (tx, rx) = mpsc::channel(args.queue_cap.max(1));
    let workers = spawn_workers(args.workers.max(1), processor, rx);
    info!(workers = workers.len(), queue_cap = args.queue_cap, "sink started");

    tokio::select! {
        res = karchive_sink::serve(args.listen, tx) => {
            if let Err(e) = &res {
                error!(error = %e, "sink receiver stopped");
            }
            res?;
        }
        _ = signal::ctrl_c() => info!("shutting down sink"),
    }
    if let Some(h) = reload {
        h.abort();
    }
    // receiver dropped its sender; workers finish what is queued
    for w in workers {
        let _ = w.await;
    }
    Ok(())
}

async fn run_logs(args: LogsArgs) -> Result<()> {
    let cfg = LogProxyConfig {
        timeout: Duration::from_secs(args.timeout_secs),
        insecure_skip_verify: args.insecure_skip_verify,
        headers: load_headers_or_empty(args.headers_dir.as_deref()),
    };
    info!(headers = cfg.headers.len(), "log proxy configured");
    let proxy = Arc::new(LogProxy::new(cfg)?);
    tokio::select! {
        res = karchive_logs::serve(args.listen, proxy) => res?,
        _ = signal::ctrl_c() => info!("shutting down log proxy"),
    }
    Ok(())
}

fn check_policies(policies: Option<PathBuf>) -> Result<()> {
    let policies = policies.unwrap_or_default();
    let (set, errors) = FilterSet::build(&policies);
    println!("archive filters: {}", set.archive_len());
    println!("delete filters:  {}", set.delete_len());
    match errors {
        None => Ok(()),
        Some(errors) => {
            for e in errors.iter() {
                eprintln!("error: {e}");
            }
            anyhow::bail!("{} policy error(s) in {}", errors.len(), policies.display())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_observability(&cli.log, cli.metrics_addr);

    match cli.command {
        Commands::Sink(args) => run_sink(args).await,
        Commands::Logs(args) => run_logs(args).await,
        Commands::CheckPolicies { policies } => check_policies(policies),
    }
}
