//! shardtest CLI.
//!
//! `shardtest run <file>` executes one job spec. Exit codes: 0 success,
//! 1 at least one main-step subtask failed, 2 argument or validation
//! error, 3 fatal orchestrator error, 4 terminated by signal.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use shardtest::backend::{Backend, CancelToken};
use shardtest::config::{load_key_list, SpecLoader};
use shardtest::logging::{LogLevel, Logger};
use shardtest::report::ResultStatus;
use shardtest::resources::SecretReader;
use shardtest::runner::{Runner, RunnerError};

const EXIT_SUCCESS: i32 = 0;
const EXIT_TEST_FAILURE: i32 = 1;
const EXIT_INVALID: i32 = 2;
const EXIT_FATAL: i32 = 3;
const EXIT_SIGNAL: i32 = 4;

#[derive(Parser)]
#[command(name = "shardtest")]
#[command(about = "Declarative distributed-test orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test job spec file (YAML or JSON)
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to the job spec file
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Namespace pods are created in
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Cluster config path (default: $HOME/.kube/config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the in-cluster configuration
    #[arg(long)]
    in_cluster: bool,

    /// Validate the job end-to-end without running anything
    #[arg(long)]
    dry_run: bool,

    /// Run containers as local processes instead of cluster pods
    #[arg(long)]
    local: bool,

    /// Log level (debug/info/warn/error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// File of newline-separated static strategy keys; overrides the
    /// strategy key source
    #[arg(long)]
    list: Option<PathBuf>,

    /// Template substitution applied to the file before decoding
    /// (repeatable, key=value)
    #[arg(long = "template", value_name = "KEY=VALUE")]
    template: Vec<String>,
}

fn parse_substitutions(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("invalid template parameter {} (expected key=value)", pair))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

fn init_tracing(level: LogLevel) {
    let directive = match level {
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Error => tracing::Level::ERROR,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn cluster_backend(
    config_path: Option<PathBuf>,
    in_cluster: bool,
    namespace: &str,
) -> Result<(Backend, SecretReader)> {
    let config = if in_cluster {
        kube::Config::incluster().context("failed to load in-cluster configuration")?
    } else {
        let path = match config_path {
            Some(path) => path,
            None => PathBuf::from(std::env::var("HOME").unwrap_or_default())
                .join(".kube")
                .join("config"),
        };
        let kubeconfig = kube::config::Kubeconfig::read_from(&path)
            .with_context(|| format!("failed to read cluster config from {}", path.display()))?;
        kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &kube::config::KubeConfigOptions::default(),
        )
        .await
        .context("failed to build client configuration")?
    };
    let client = kube::Client::try_from(config).context("failed to create cluster client")?;
    let reader = SecretReader::Cluster {
        client: client.clone(),
        namespace: namespace.to_string(),
    };
    Ok((Backend::cluster(client, namespace), reader))
}

async fn run(args: RunArgs) -> i32 {
    let level: LogLevel = match args.log_level.parse() {
        Ok(level) => level,
        Err(err) => {
            eprintln!("shardtest: {}", err);
            return EXIT_INVALID;
        }
    };
    init_tracing(level);

    let substitutions = match parse_substitutions(&args.template) {
        Ok(map) => map,
        Err(err) => {
            eprintln!("shardtest: {:#}", err);
            return EXIT_INVALID;
        }
    };

    let job = match SpecLoader::load_file(&args.file, &substitutions) {
        Ok(job) => job,
        Err(err) => {
            eprintln!("shardtest: {}", err);
            return EXIT_INVALID;
        }
    };

    let static_keys = match &args.list {
        Some(path) => match load_key_list(path) {
            Ok(keys) => Some(keys),
            Err(err) => {
                eprintln!("shardtest: {}", err);
                return EXIT_INVALID;
            }
        },
        None => None,
    };
    if static_keys.is_some() && job.spec.main_step.strategy.is_none() {
        eprintln!("shardtest: --list requires the main step to declare a strategy");
        return EXIT_INVALID;
    }

    let (backend, secret_reader) = if args.dry_run {
        (Backend::dry_run(), SecretReader::Unavailable)
    } else if args.local {
        (Backend::local(), SecretReader::Unavailable)
    } else {
        match cluster_backend(args.config, args.in_cluster, &args.namespace).await {
            Ok(pair) => pair,
            Err(err) => {
                eprintln!("shardtest: {:#}", err);
                return EXIT_FATAL;
            }
        }
    };

    let logger = Arc::new(Logger::new(level));
    let mut runner =
        Runner::new(backend, args.namespace, logger).with_secret_reader(secret_reader);
    if let Some(keys) = static_keys {
        runner = runner.with_static_keys(keys);
    }

    let cancel = CancelToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        eprintln!("shardtest: received stop signal, trying to stop gracefully");
        signal_cancel.cancel();
    });

    match runner.run(&cancel, job).await {
        Ok(report) => {
            match report.to_json_pretty() {
                Ok(json) => println!("{}", json),
                Err(err) => {
                    eprintln!("shardtest: failed to encode report: {}", err);
                    return EXIT_FATAL;
                }
            }
            if report.status == ResultStatus::Failure {
                EXIT_TEST_FAILURE
            } else {
                EXIT_SUCCESS
            }
        }
        Err(err) if err.is_canceled() => {
            eprintln!("shardtest: {}", err);
            EXIT_SIGNAL
        }
        Err(err @ RunnerError::Validation(_)) => {
            eprintln!("shardtest: {}", err);
            EXIT_INVALID
        }
        Err(err) => {
            eprintln!("shardtest: {}", err);
            EXIT_FATAL
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run(args) => run(args).await,
    };
    std::process::exit(code);
}
