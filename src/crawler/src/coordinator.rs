//! Wires queues, iterators, workers and the run log into one crawl and
//! decides when it is over.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::BucketClient;
use crate::crawler::{
    CounterSnapshot, CrawlContext, CrawlCounters, CrawlFault, object_worker, prefix_iterator,
    progress_reporter,
};
use crate::policy::PolicyEvaluator;
use crate::queue::{BackpressurePolicy, QueueError, UnitQueue};
use crate::runlog::{RunLog, RunLogError, RunLogSummary};
use crate::shutdown::stop_channel;
use crate::units::PrefixUnit;

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub worker_jobs: usize,
    pub iterator_jobs: usize,
    pub prefix_channel_depth: usize,
    pub object_channel_depth: usize,
    /// Attempts per unit before it is abandoned
    pub retry_limit: u32,
    pub prefix_root: String,
    pub backpressure: BackpressurePolicy,
    pub spill_dir: Option<PathBuf>,
    pub poll_interval: Duration,
    pub report_interval: Duration,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            worker_jobs: 2000,
            iterator_jobs: 2000,
            prefix_channel_depth: 1 << 20,
            object_channel_depth: 1 << 22,
            retry_limit: 5,
            prefix_root: String::new(),
            backpressure: BackpressurePolicy::default(),
            spill_dir: None,
            poll_interval: Duration::from_millis(100),
            report_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to set up crawl queues: {0}")]
    Setup(#[from] QueueError),

    #[error(transparent)]
    Crawl(#[from] CrawlFault),

    #[error(transparent)]
    RunLog(#[from] RunLogError),
}

/// How the crawl ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Every discovered unit was worked or abandoned
    Quiescent,
    /// Stopped by the shutdown future
    Interrupted,
    /// Aborted by a fatal fault
    Aborted,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub completion: Completion,
    pub counters: CounterSnapshot,
    pub run_log: RunLogSummary,
    /// The fault that aborted the run
    pub fault: Option<RunError>,
}

pub struct RunCoordinator {
    bucket: String,
    options: CrawlOptions,
    client: Arc<dyn BucketClient>,
    policy: Arc<PolicyEvaluator>,
    run_log: RunLog,
}

impl RunCoordinator {
    pub fn new(
        bucket: impl Into<String>,
        options: CrawlOptions,
        client: Arc<dyn BucketClient>,
        policy: Arc<PolicyEvaluator>,
        run_log: RunLog,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            options,
            client,
            policy,
            run_log,
        }
    }

    /// Crawl until quiescence, a fatal fault or `shutdown` resolving, then
    /// stop every task in order and flush the run log.
    pub async fn run<F>(mut self, shutdown: F) -> Result<RunOutcome, RunError>
    where
        F: Future<Output = ()>,
    {
        let options = &self.options;
        let prefixes = UnitQueue::new(
            "prefix",
            options.prefix_channel_depth,
            options.backpressure,
            options.spill_dir.as_deref(),
        )?;
        let objects = UnitQueue::new(
            "object",
            options.object_channel_depth,
            options.backpressure,
            options.spill_dir.as_deref(),
        )?;

        let (fault_tx, mut faults) = mpsc::unbounded_channel();
        let ctx = Arc::new(CrawlContext {
            bucket: self.bucket.clone(),
            client: self.client.clone(),
            policy: self.policy.clone(),
            prefixes,
            objects,
            counters: CrawlCounters::default(),
            retry_limit: options.retry_limit,
            faults: fault_tx,
        });

        let (iterator_stop, iterator_signal) = stop_channel();
        let (worker_stop, worker_signal) = stop_channel();
        let (reporter_stop, reporter_signal) = stop_channel();

        ctx.prefixes
            .enqueue(
                PrefixUnit::new(options.prefix_root.clone()),
                &mut iterator_signal.clone(),
            )
            .await?;

        tracing::info!(
            invocation_id = %self.run_log.invocation_id(),
            bucket = %self.bucket,
            prefix_root = %options.prefix_root,
            iterators = options.iterator_jobs,
            workers = options.worker_jobs,
            backpressure = %options.backpressure,
            "Starting crawl"
        );

        let iterators: Vec<JoinHandle<()>> = (0..options.iterator_jobs.max(1))
            .map(|id| tokio::spawn(prefix_iterator(id, ctx.clone(), iterator_signal.clone())))
            .collect();
        let workers: Vec<JoinHandle<()>> = (0..options.worker_jobs.max(1))
            .map(|id| tokio::spawn(object_worker(id, ctx.clone(), worker_signal.clone())))
            .collect();
        let reporter = tokio::spawn(progress_reporter(
            ctx.clone(),
            options.report_interval,
            reporter_signal,
        ));

        let mut log_faults = self.run_log.take_faults();
        let mut ticker = tokio::time::interval(options.poll_interval);
        tokio::pin!(shutdown);

        let (completion, fault) = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::warn!("Shutdown requested, stopping crawl");
                    break (Completion::Interrupted, None);
                }
                Some(fault) = faults.recv() => {
                    break (Completion::Aborted, Some(RunError::from(fault)));
                }
                Some(fault) = next_fault(&mut log_faults) => {
                    tracing::error!(error = %fault, "Run log fault");
                    break (Completion::Aborted, Some(RunError::from(fault)));
                }
                _ = ticker.tick() => {
                    if is_quiescent(&ctx) {
                        tracing::info!("Crawl finished");
                        break (Completion::Quiescent, None);
                    }
                }
            }
        };

        iterator_stop.stop();
        worker_stop.stop();
        join_all("iterator", iterators).await;
        join_all("worker", workers).await;
        reporter_stop.stop();
        join_all("reporter", vec![reporter]).await;

        let run_log = self.run_log.stop().await?;
        let counters = ctx.counters.snapshot();

        Ok(RunOutcome {
            completion,
            counters,
            run_log,
            fault,
        })
    }
}

async fn next_fault(
    faults: &mut Option<mpsc::UnboundedReceiver<RunLogError>>,
) -> Option<RunLogError> {
    match faults {
        Some(faults) => faults.recv().await,
        None => std::future::pending().await,
    }
}

/// Nothing buffered, nothing spilled, no listing in flight and every
/// discovered unit accounted for.
fn is_quiescent(ctx: &CrawlContext) -> bool {
    ctx.prefixes.is_empty()
        && ctx.objects.is_empty()
        && ctx.prefixes.spilled() == 0
        && ctx.objects.spilled() == 0
        && ctx.counters.active_iterators() == 0
        && ctx.prefixes.outstanding() == 0
        && ctx.objects.outstanding() == 0
}

async fn join_all(kind: &str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(task = kind, error = %e, "Crawl task ended abnormally");
        }
    }
}
