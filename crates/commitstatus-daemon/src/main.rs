//! commitstatus-daemon - commit status controller.
//!
//! `run` starts the controller. The other subcommands feed it: `submit`
//! appends workload instances to the workload feed, `activity` registers a
//! pipeline activity, and `report` records check outcomes against a status
//! record.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use commitstatus_core::config::CommitStatusConfig;
use commitstatus_core::status::{PipelineActivityRef, SubCheck};
use commitstatus_core::{BuildIdentityExtractor, WorkloadInstance};
use commitstatus_daemon::{
    CommitStatusNotifier, ConfiguredContextResolver, Controller, ControllerSettings,
    GitHubNotifierConfig, GitHubStatusNotifier, LogOnlyNotifier, ReconcilerConfig, SqliteStore,
    StatusEvaluator, StatusReconciler,
};
use secrecy::SecretString;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Configuration file used when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "commitstatus.toml";

/// commitstatus daemon - reconciles build workloads into commit statuses
#[derive(Parser, Debug)]
#[command(name = "commitstatus-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: commitstatus.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the controller database, overriding `controller.database`
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller until SIGINT/SIGTERM
    Run,

    /// Append workload instances (JSON object or array) to the workload feed
    Submit {
        /// File to read, or `-` for stdin
        #[arg(short, long, default_value = "-")]
        file: PathBuf,
    },

    /// Register or replace a pipeline activity
    Activity {
        /// Activity name (`{owner}-{repo}-{branch}-{build}`, normalized)
        #[arg(long)]
        name: String,

        /// Unique id of this activity instance
        #[arg(long)]
        uid: String,

        /// Resource kind
        #[arg(long, default_value = "PipelineActivity")]
        kind: String,

        /// Resource API version
        #[arg(long, default_value = "jenkins.io/v1")]
        api_version: String,
    },

    /// Record check outcomes for one commit of a status record
    Report {
        /// Status record name
        #[arg(long)]
        record: String,

        /// Commit sha
        #[arg(long)]
        sha: String,

        /// Sub-check outcome, `name=pass` or `name=fail[:description]`
        #[arg(long = "check", value_parser = parse_check)]
        checks: Vec<SubCheck>,
    },

    /// Print a status record as JSON
    Show {
        /// Status record name
        #[arg(long)]
        record: String,
    },
}

/// Workload submission: a single instance or a list.
#[derive(Deserialize)]
#[serde(untagged)]
enum Submission {
    One(WorkloadInstance),
    Many(Vec<WorkloadInstance>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = load_config(args.config.as_deref())?;
    let database = args
        .database
        .clone()
        .unwrap_or_else(|| config.controller.database.clone());

    match args.command {
        Command::Run => run(&config, &database).await,
        Command::Submit { file } => submit(&database, &file),
        Command::Activity {
            name,
            uid,
            kind,
            api_version,
        } => {
            let store = open_store(&database)?;
            store
                .upsert_activity(&PipelineActivityRef {
                    name: name.clone(),
                    kind,
                    uid: uid.clone(),
                    api_version,
                })
                .context("failed to store pipeline activity")?;
            info!(name = %name, uid = %uid, "pipeline activity registered");
            Ok(())
        },
        Command::Report {
            record,
            sha,
            checks,
        } => {
            let store = open_store(&database)?;
            let revision = store
                .record_check_results(&record, &sha, checks)
                .with_context(|| format!("failed to record check results for {record}"))?;
            info!(record = %record, sha = %sha, revision, "check results recorded");
            Ok(())
        },
        Command::Show { record } => {
            let store = open_store(&database)?;
            let Some(stored) = store.load_record(&record)? else {
                bail!("status record {record} not found");
            };
            println!("{}", serde_json::to_string_pretty(&stored.value)?);
            Ok(())
        },
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CommitStatusConfig> {
    if let Some(path) = path {
        return CommitStatusConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()));
    }

    let default = Path::new(DEFAULT_CONFIG_FILE);
    if default.exists() {
        CommitStatusConfig::from_file(default)
            .with_context(|| format!("failed to load configuration from {DEFAULT_CONFIG_FILE}"))
    } else {
        info!("no configuration file found, using defaults");
        Ok(CommitStatusConfig::default())
    }
}

fn open_store(database: &Path) -> Result<SqliteStore> {
    SqliteStore::open(database)
        .with_context(|| format!("failed to open database {}", database.display()))
}

fn submit(database: &Path, file: &Path) -> Result<()> {
    let mut payload = String::new();
    if file == Path::new("-") {
        std::io::stdin()
            .read_to_string(&mut payload)
            .context("failed to read stdin")?;
    } else {
        payload = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
    }

    let submission =
        serde_json::from_str::<Submission>(&payload).context("invalid workload JSON")?;
    let workloads = match submission {
        Submission::One(workload) => vec![workload],
        Submission::Many(workloads) => workloads,
    };

    let store = open_store(database)?;
    for workload in &workloads {
        let seq = store
            .append_workload_event(workload)
            .with_context(|| format!("failed to submit workload {}", workload.name))?;
        info!(workload = %workload.name, seq, "workload submitted");
    }
    Ok(())
}

fn build_notifier(
    config: &CommitStatusConfig,
    database: &Path,
) -> Result<Arc<dyn CommitStatusNotifier>> {
    if !config.github.enabled {
        warn!("GitHub notifications disabled, commit statuses are only logged");
        return Ok(Arc::new(LogOnlyNotifier));
    }

    let token_env = config
        .github
        .token_env
        .as_deref()
        .context("github.token_env is required when GitHub is enabled")?;
    let token = std::env::var(token_env)
        .with_context(|| format!("environment variable {token_env} is not set"))?;

    let mut github = GitHubNotifierConfig::new(config.github.api_url.clone())?
        .with_api_token(SecretString::from(token));
    if let Some(target_url) = &config.github.target_url {
        github = github.with_target_url(target_url.clone());
    }

    let cache_path = database.with_extension("notifications.db");
    let notifier = GitHubStatusNotifier::new(github, &cache_path)
        .with_context(|| format!("failed to open notification cache {}", cache_path.display()))?;
    info!(api_url = %config.github.api_url, "GitHub notifications enabled");
    Ok(Arc::new(notifier))
}

async fn run(config: &CommitStatusConfig, database: &Path) -> Result<()> {
    let store = open_store(database)?;

    let reconciler = StatusReconciler::new(
        BuildIdentityExtractor::new(config.controller.build_number_env.clone()),
        Arc::new(ConfiguredContextResolver::new(config.branch_protection.clone())),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        ReconcilerConfig::from(&config.controller),
    );
    let evaluator = StatusEvaluator::new(build_notifier(config, database)?);
    let controller = Arc::new(Controller::new(
        reconciler,
        evaluator,
        ControllerSettings::from(&config.controller),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "signal handling failed, shutting down");
        }
        // Receivers may already be gone if the controller stopped first.
        let _ = shutdown_tx.send(true);
    });

    info!(database = %database.display(), "commit status controller starting");
    controller.run(store.connection(), shutdown_rx).await?;
    info!("commit status controller stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
        let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        info!("Received Ctrl-C");
    }

    Ok(())
}

/// Parses `name=pass` or `name=fail[:description]`.
fn parse_check(value: &str) -> Result<SubCheck, String> {
    let (name, outcome) = value
        .split_once('=')
        .ok_or_else(|| format!("expected name=pass|fail[:description], got {value:?}"))?;
    if name.is_empty() {
        return Err("check name cannot be empty".to_string());
    }

    let (verdict, description) = outcome.split_once(':').unwrap_or((outcome, ""));
    let pass = match verdict {
        "pass" => true,
        "fail" => false,
        other => return Err(format!("unknown check outcome {other:?}, expected pass or fail")),
    };
    Ok(SubCheck::new(name, description, pass))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_report_checks() {
        let args = Args::try_parse_from([
            "commitstatus-daemon",
            "report",
            "--record",
            "acme-widgets-pr-7-build",
            "--sha",
            "head111",
            "--check",
            "unit=pass",
            "--check",
            "lint=fail:2 style errors",
        ])
        .unwrap();

        let Command::Report { checks, .. } = args.command else {
            panic!("expected report");
        };
        assert_eq!(
            checks,
            vec![
                SubCheck::new("unit", "", true),
                SubCheck::new("lint", "2 style errors", false),
            ]
        );
    }

    #[test]
    fn rejects_malformed_checks() {
        assert!(parse_check("unit").is_err());
        assert!(parse_check("=pass").is_err());
        assert!(parse_check("unit=maybe").is_err());
    }

    #[test]
    fn submission_accepts_object_or_array() {
        let one: Submission = serde_json::from_str(r#"{"name": "pod-1"}"#).unwrap();
        assert!(matches!(one, Submission::One(w) if w.name == "pod-1"));

        let many: Submission =
            serde_json::from_str(r#"[{"name": "pod-1"}, {"name": "pod-2"}]"#).unwrap();
        assert!(matches!(many, Submission::Many(w) if w.len() == 2));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn github_disabled_uses_log_only_notifier() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = CommitStatusConfig::default();
        assert!(build_notifier(&config, &dir.path().join("state.db")).is_ok());
    }
}
