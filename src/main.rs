//! Cycler
//!
//! Crawls one bucket, evaluates the configured policy for every object and
//! applies the configured effect to the objects it selects.
//!
//! Exit codes: 0 on success, 1 when the run aborted on a fatal fault, 2 when
//! the run could not start.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::cli::{CommonArgs, utils};
use common::config::{EffectConfig, RunConfig};
use common::storage::resolve_location;
use crawler::{
    BackpressurePolicy, BucketClient, BucketRegistry, Completion, CrawlOptions, Effect,
    ObjectStoreClient, PolicyEvaluator, RuleDocumentEvaluator, RunCoordinator, RunLog, RunReport,
};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bucket to crawl, overrides the run configuration
    #[arg(long)]
    bucket: Option<String>,

    /// Run configuration (.toml, .json or binary)
    #[arg(long)]
    run_config_path: PathBuf,

    /// Concurrent object workers
    #[arg(long, default_value_t = 2000)]
    worker_jobs: usize,

    /// Concurrent prefix iterators
    #[arg(long, default_value_t = 2000)]
    iter_jobs: usize,

    #[arg(long, default_value_t = 1_048_576)]
    prefix_channel_depth: usize,

    #[arg(long, default_value_t = 4_194_304)]
    work_unit_channel_depth: usize,

    /// Attempts per prefix or object before it is abandoned
    #[arg(long, default_value_t = 5)]
    retry_count: u32,

    /// Prefix to start crawling from
    #[arg(long, default_value = "")]
    prefix_root: String,

    /// Must agree with `mutation_allowed` in the run configuration
    #[arg(long)]
    mutation_allowed: bool,

    /// Write the report as JSON to this file instead of text to stdout
    #[arg(long)]
    json_out_file: Option<PathBuf>,

    /// Run log destination, overrides the run configuration
    #[arg(long)]
    runlog_url: Option<String>,

    /// What to do when a crawl channel is full: block, spill or fail-fast
    #[arg(long, default_value_t = BackpressurePolicy::Spill)]
    backpressure: BackpressurePolicy,

    /// Directory for spill files, defaults to the system temp directory
    #[arg(long)]
    spill_dir: Option<PathBuf>,

    #[command(flatten)]
    common: CommonArgs,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => tracing::info!("Received SIGINT"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                }
            }
            _ => {
                tracing::warn!("Failed to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C");
        }
    }
}

fn load_config(args: &Args) -> Result<RunConfig> {
    let mut config =
        RunConfig::load_from_path(&args.run_config_path).context("Failed to load run config")?;

    if let Some(bucket) = &args.bucket {
        config.override_bucket(bucket);
    }
    if let Some(url) = &args.runlog_url {
        config.run_log.destination_url = url.clone();
    }

    config.validate().context("Invalid run config")?;
    Ok(config)
}

/// Relative policy documents resolve against the run configuration's directory.
fn policy_document_path(args: &Args, config: &RunConfig) -> PathBuf {
    let document = Path::new(&config.policy.policy_document_path);
    if document.is_absolute() {
        return document.to_path_buf();
    }
    args.run_config_path
        .parent()
        .map(|dir| dir.join(document))
        .unwrap_or_else(|| document.to_path_buf())
}

/// Everything a run needs, built before the first listing.
struct Startup {
    config: RunConfig,
    client: Arc<dyn BucketClient>,
    policy: Arc<PolicyEvaluator>,
    run_log: RunLog,
}

async fn start(args: &Args) -> Result<Startup> {
    let config = load_config(args)?;
    let effect_config = config
        .policy
        .effect
        .clone()
        .context("Effect configuration type not set")?;

    let destination = match &effect_config {
        EffectConfig::Move(c) => Some(c.destination_bucket.as_str()),
        EffectConfig::Duplicate(c) => Some(c.destination_bucket.as_str()),
        _ => None,
    };
    let buckets = std::iter::once(config.bucket.as_str()).chain(destination);
    let registry = BucketRegistry::from_config(&config, buckets)
        .context("Failed to open bucket stores")?;

    let rules = RuleDocumentEvaluator::load(&policy_document_path(args, &config))
        .context("Failed to load policy document")?;
    let client: Arc<dyn BucketClient> = Arc::new(
        ObjectStoreClient::new(registry).with_storage_class_lookup(rules.uses_storage_class()),
    );

    let effect = Effect::initialize(
        &effect_config,
        client.clone(),
        &[config.mutation_allowed, args.mutation_allowed],
    )
    .context("Failed to initialize effect")?;

    let location = resolve_location(&config.run_log.destination_url)
        .context("Failed to resolve run log destination")?;
    let run_log = RunLog::start(&config.run_log, location, Uuid::new_v4())
        .await
        .context("Failed to start run log")?;

    let policy = PolicyEvaluator::new(
        &config.policy,
        &config.stats,
        effect,
        Arc::new(rules),
        run_log.sink(),
    )
    .context("Failed to initialize policy")?;

    Ok(Startup {
        config,
        client,
        policy: Arc::new(policy),
        run_log,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    utils::init_logging(&args.common);

    tracing::info!(version = %utils::version_info(), "Starting cycler");

    let startup = match start(&args).await {
        Ok(startup) => startup,
        Err(e) => {
            tracing::error!(error = ?e, "Startup failed");
            eprintln!("cycler: {e:#}");
            return ExitCode::from(2);
        }
    };

    let options = CrawlOptions {
        worker_jobs: args.worker_jobs,
        iterator_jobs: args.iter_jobs,
        prefix_channel_depth: args.prefix_channel_depth,
        object_channel_depth: args.work_unit_channel_depth,
        retry_limit: args.retry_count,
        prefix_root: args.prefix_root.clone(),
        backpressure: args.backpressure,
        spill_dir: args.spill_dir.clone(),
        ..Default::default()
    };

    let Startup {
        config,
        client,
        policy,
        run_log,
    } = startup;
    let invocation_id = run_log.invocation_id();

    let outcome = match RunCoordinator::new(&config.bucket, options, client, policy.clone(), run_log)
        .run(wait_for_shutdown_signal())
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "Run failed");
            eprintln!("cycler: {e}");
            return ExitCode::from(1);
        }
    };

    let report = RunReport::new(invocation_id, &config.bucket, &policy, &outcome);
    match &args.json_out_file {
        Some(path) => {
            if let Err(e) = report.write_json(path) {
                tracing::error!(error = %e, path = %path.display(), "Failed to write JSON report");
                eprintln!("cycler: failed to write {}: {e}", path.display());
                return ExitCode::from(1);
            }
        }
        None => print!("{}", report.text()),
    }

    for warning in report.abandoned_warnings() {
        eprintln!("WARNING: {warning}");
    }

    match (outcome.completion, outcome.fault) {
        (Completion::Aborted, Some(fault)) => {
            eprintln!("cycler: run aborted: {fault}");
            ExitCode::from(1)
        }
        (Completion::Interrupted, _) => {
            tracing::warn!("Run interrupted before completion");
            ExitCode::SUCCESS
        }
        _ => ExitCode::SUCCESS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["cycler", "--run-config-path", "run.toml"]);
        assert_eq!(args.worker_jobs, 2000);
        assert_eq!(args.iter_jobs, 2000);
        assert_eq!(args.prefix_channel_depth, 1_048_576);
        assert_eq!(args.work_unit_channel_depth, 4_194_304);
        assert_eq!(args.retry_count, 5);
        assert_eq!(args.backpressure, BackpressurePolicy::Spill);
        assert!(!args.mutation_allowed);
        assert!(args.json_out_file.is_none());
    }

    #[test]
    fn test_args_backpressure() {
        let args = Args::parse_from([
            "cycler",
            "--run-config-path",
            "run.toml",
            "--backpressure",
            "fail-fast",
            "--mutation-allowed",
        ]);
        assert_eq!(args.backpressure, BackpressurePolicy::FailFast);
        assert!(args.mutation_allowed);

        let result = Args::try_parse_from([
            "cycler",
            "--run-config-path",
            "run.toml",
            "--backpressure",
            "drop",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_config_path_required() {
        assert!(Args::try_parse_from(["cycler"]).is_err());
    }

    fn write_config(dir: &Path, mutation_allowed: bool) -> PathBuf {
        std::fs::write(
            dir.join("rules.toml"),
            "[[rules]]\nname = \"old\"\nmin_age_days = 180\n",
        )
        .unwrap();
        let config = format!(
            r#"
            bucket = "src"
            mutation_allowed = {mutation_allowed}

            [stores]
            src = "memory://"
            dst = "memory://"

            [policy]
            policy_document_path = "rules.toml"

            [policy.effect.move]
            destination_bucket = "dst"
            destination_prefix = "archived/"

            [run_log]
            destination_url = "memory://"
            channel_size = 16
            chunk_size_bytes = 1024
            max_unpersisted_logs = 2
            persist_retries = 1
            initial_backoff = "10ms"
            "#
        );
        let path = dir.join("run.toml");
        std::fs::write(&path, config).unwrap();
        path
    }

    #[tokio::test]
    async fn test_startup_rejects_mutation_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), true);
        let args = Args::parse_from(["cycler", "--run-config-path", path.to_str().unwrap()]);

        let err = start(&args).await.err().unwrap();
        assert!(format!("{err:#}").contains("Mutation not allowed"));
    }

    #[tokio::test]
    async fn test_startup_succeeds_when_flags_agree() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), true);
        let args = Args::parse_from([
            "cycler",
            "--run-config-path",
            path.to_str().unwrap(),
            "--mutation-allowed",
            "--bucket",
            "gs://src",
        ]);

        let startup = start(&args).await.unwrap();
        assert_eq!(startup.config.bucket, "src");
        assert_eq!(startup.policy.effect().name(), "move");
        startup.run_log.stop().await.unwrap();
    }

    #[test]
    fn test_policy_document_resolves_next_to_config() {
        let args = Args::parse_from(["cycler", "--run-config-path", "/etc/cycler/run.toml"]);
        let mut config = RunConfig::default();
        config.policy.policy_document_path = "rules.toml".to_string();
        assert_eq!(
            policy_document_path(&args, &config),
            PathBuf::from("/etc/cycler/rules.toml")
        );

        config.policy.policy_document_path = "/abs/rules.toml".to_string();
        assert_eq!(
            policy_document_path(&args, &config),
            PathBuf::from("/abs/rules.toml")
        );
    }
}
