//! Prefix iterators and object workers.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::client::BucketClient;
use crate::policy::PolicyEvaluator;
use crate::queue::{QueueError, UnitQueue};
use crate::shutdown::StopSignal;
use crate::units::{ObjectUnit, PrefixUnit};

#[derive(Debug, Default)]
struct CountersInner {
    prefixes_found: AtomicU64,
    prefixes_listed: AtomicU64,
    prefixes_abandoned: AtomicU64,
    objects_found: AtomicU64,
    objects_worked: AtomicU64,
    objects_abandoned: AtomicU64,
    active_iterators: AtomicI64,
}

/// Run-wide progress counters, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CrawlCounters {
    inner: Arc<CountersInner>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub prefixes_found: u64,
    pub prefixes_listed: u64,
    pub prefixes_abandoned: u64,
    pub objects_found: u64,
    pub objects_worked: u64,
    pub objects_abandoned: u64,
}

/// Keeps `active_iterators` raised while a listing is in flight,
/// including across a panic.
pub struct ActiveIterator<'a> {
    counters: &'a CrawlCounters,
}

impl Drop for ActiveIterator<'_> {
    fn drop(&mut self) {
        self.counters
            .inner
            .active_iterators
            .fetch_sub(1, Ordering::SeqCst);
    }
}

impl CrawlCounters {
    pub fn iterator_started(&self) -> ActiveIterator<'_> {
        self.inner.active_iterators.fetch_add(1, Ordering::SeqCst);
        ActiveIterator { counters: self }
    }

    pub fn active_iterators(&self) -> i64 {
        self.inner.active_iterators.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let inner = &self.inner;
        CounterSnapshot {
            prefixes_found: inner.prefixes_found.load(Ordering::Relaxed),
            prefixes_listed: inner.prefixes_listed.load(Ordering::Relaxed),
            prefixes_abandoned: inner.prefixes_abandoned.load(Ordering::Relaxed),
            objects_found: inner.objects_found.load(Ordering::Relaxed),
            objects_worked: inner.objects_worked.load(Ordering::Relaxed),
            objects_abandoned: inner.objects_abandoned.load(Ordering::Relaxed),
        }
    }
}

/// A fault a crawl task cannot recover from; the coordinator aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum CrawlFault {
    #[error("Failed to enqueue from {task}: {source}")]
    Enqueue {
        task: String,
        #[source]
        source: QueueError,
    },
    #[error("Failed to dequeue from {queue} queue in {task}: {source}")]
    Dequeue {
        queue: &'static str,
        task: String,
        #[source]
        source: QueueError,
    },
}

/// State shared by every crawl task.
pub struct CrawlContext {
    pub bucket: String,
    pub client: Arc<dyn BucketClient>,
    pub policy: Arc<PolicyEvaluator>,
    pub prefixes: UnitQueue<PrefixUnit>,
    pub objects: UnitQueue<ObjectUnit>,
    pub counters: CrawlCounters,
    /// Attempts per unit before it is abandoned
    pub retry_limit: u32,
    pub faults: mpsc::UnboundedSender<CrawlFault>,
}

impl CrawlContext {
    fn fault(&self, fault: CrawlFault) {
        tracing::error!(error = %fault, "Crawl task fault");
        let _ = self.faults.send(fault);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

enum Step {
    Continue,
    Exit,
}

/// Lists prefixes until stopped: child prefixes go back into the prefix
/// queue, objects into the object queue.
pub async fn prefix_iterator(id: usize, ctx: Arc<CrawlContext>, mut stop: StopSignal) {
    tracing::debug!(iterator = id, "Prefix iterator started");
    loop {
        let unit = match ctx.prefixes.recv(&mut stop).await {
            Ok(Some(unit)) => unit,
            Ok(None) => break,
            Err(e) => {
                ctx.fault(CrawlFault::Dequeue {
                    queue: ctx.prefixes.name(),
                    task: format!("iterator {id}"),
                    source: e,
                });
                break;
            }
        };

        let prefix = unit.prefix.clone();
        let step = AssertUnwindSafe(list_prefix(id, &ctx, unit, &mut stop))
            .catch_unwind()
            .await;
        match step {
            Ok(Step::Continue) => {}
            Ok(Step::Exit) => break,
            Err(payload) => {
                tracing::error!(
                    iterator = id,
                    prefix = %prefix,
                    panic = panic_message(payload.as_ref()),
                    backtrace = %Backtrace::force_capture(),
                    "Prefix iterator panicked, abandoning prefix"
                );
                ctx.counters
                    .inner
                    .prefixes_abandoned
                    .fetch_add(1, Ordering::Relaxed);
                ctx.prefixes.complete();
                break;
            }
        }
    }
    tracing::debug!(iterator = id, "Prefix iterator stopped");
}

async fn list_prefix(
    id: usize,
    ctx: &CrawlContext,
    unit: PrefixUnit,
    stop: &mut StopSignal,
) -> Step {
    let _active = ctx.counters.iterator_started();

    let listing = match ctx.client.list(&ctx.bucket, &unit.prefix).await {
        Ok(listing) => listing,
        Err(e) => {
            let unit = unit.retried();
            if unit.try_count < ctx.retry_limit {
                tracing::debug!(
                    iterator = id,
                    prefix = %unit.prefix,
                    try_count = unit.try_count,
                    error = %e,
                    "Listing failed, retrying"
                );
                return requeue(ctx, &ctx.prefixes, unit, stop, id).await;
            }
            tracing::warn!(
                iterator = id,
                prefix = %unit.prefix,
                try_count = unit.try_count,
                error = %e,
                "Abandoning prefix after retry limit"
            );
            ctx.counters
                .inner
                .prefixes_abandoned
                .fetch_add(1, Ordering::Relaxed);
            ctx.prefixes.complete();
            return Step::Continue;
        }
    };

    let counters = &ctx.counters.inner;
    counters
        .objects_found
        .fetch_add(listing.objects.len() as u64, Ordering::Relaxed);
    counters
        .prefixes_found
        .fetch_add(listing.prefixes.len() as u64, Ordering::Relaxed);

    for object in listing.objects {
        if let Err(e) = ctx.objects.enqueue(ObjectUnit::new(object), stop).await {
            return enqueue_failed(ctx, id, e);
        }
    }
    for prefix in listing.prefixes {
        if let Err(e) = ctx.prefixes.enqueue(PrefixUnit::new(prefix), stop).await {
            return enqueue_failed(ctx, id, e);
        }
    }

    counters.prefixes_listed.fetch_add(1, Ordering::Relaxed);
    ctx.prefixes.complete();
    Step::Continue
}

async fn requeue<T>(
    ctx: &CrawlContext,
    queue: &UnitQueue<T>,
    unit: T,
    stop: &mut StopSignal,
    id: usize,
) -> Step
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    match queue.requeue(unit, stop).await {
        Ok(()) => Step::Continue,
        Err(e) => enqueue_failed(ctx, id, e),
    }
}

fn enqueue_failed(ctx: &CrawlContext, id: usize, error: QueueError) -> Step {
    if !matches!(error, QueueError::Stopped) {
        ctx.fault(CrawlFault::Enqueue {
            task: format!("task {id}"),
            source: error,
        });
    }
    Step::Exit
}

/// Submits objects to the policy until stopped.
pub async fn object_worker(id: usize, ctx: Arc<CrawlContext>, mut stop: StopSignal) {
    tracing::debug!(worker = id, "Object worker started");
    loop {
        let unit = match ctx.objects.recv(&mut stop).await {
            Ok(Some(unit)) => unit,
            Ok(None) => break,
            Err(e) => {
                ctx.fault(CrawlFault::Dequeue {
                    queue: ctx.objects.name(),
                    task: format!("worker {id}"),
                    source: e,
                });
                break;
            }
        };

        let counters = &ctx.counters.inner;
        let outcome = AssertUnwindSafe(ctx.policy.submit(&unit))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                counters.objects_worked.fetch_add(1, Ordering::Relaxed);
                ctx.objects.complete();
            }
            Ok(Err(e)) => {
                let unit = unit.retried();
                if unit.try_count < ctx.retry_limit {
                    tracing::debug!(
                        worker = id,
                        name = %unit.attributes.name,
                        try_count = unit.try_count,
                        error = %e,
                        "Object failed, retrying"
                    );
                    if let Step::Exit = requeue(&ctx, &ctx.objects, unit, &mut stop, id).await {
                        break;
                    }
                } else {
                    tracing::warn!(
                        worker = id,
                        name = %unit.attributes.name,
                        try_count = unit.try_count,
                        error = %e,
                        "Abandoning object after retry limit"
                    );
                    counters.objects_abandoned.fetch_add(1, Ordering::Relaxed);
                    ctx.objects.complete();
                }
            }
            Err(payload) => {
                tracing::error!(
                    worker = id,
                    name = %unit.attributes.name,
                    panic = panic_message(payload.as_ref()),
                    backtrace = %Backtrace::force_capture(),
                    "Object worker panicked, abandoning object"
                );
                counters.objects_abandoned.fetch_add(1, Ordering::Relaxed);
                ctx.objects.complete();
                break;
            }
        }
    }
    tracing::debug!(worker = id, "Object worker stopped");
}

/// Logs crawl progress every `interval` until stopped.
pub async fn progress_reporter(ctx: Arc<CrawlContext>, interval: Duration, mut stop: StopSignal) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.stopped() => break,
            _ = ticker.tick() => {
                let counters = ctx.counters.snapshot();
                let percent_worked = if counters.objects_found == 0 {
                    0.0
                } else {
                    counters.objects_worked as f64 * 100.0 / counters.objects_found as f64
                };
                tracing::info!(
                    objects_found = counters.objects_found,
                    objects_worked = counters.objects_worked,
                    percent_worked = (percent_worked * 10.0).round() / 10.0,
                    objects_abandoned = counters.objects_abandoned,
                    prefixes_found = counters.prefixes_found,
                    prefixes_abandoned = counters.prefixes_abandoned,
                    prefix_queue = ctx.prefixes.len(),
                    object_queue = ctx.objects.len(),
                    spilled = ctx.prefixes.spilled() + ctx.objects.spilled(),
                    active_iterators = ctx.counters.active_iterators(),
                    total_size = %crate::util::byte_count_si(ctx.policy.all_objects().total_bytes()),
                    acted_size = %crate::util::byte_count_si(ctx.policy.acted_objects().total_bytes()),
                    "Crawl progress"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_guard_decrements_on_drop() {
        let counters = CrawlCounters::default();
        {
            let _first = counters.iterator_started();
            let _second = counters.iterator_started();
            assert_eq!(counters.active_iterators(), 2);
        }
        assert_eq!(counters.active_iterators(), 0);
    }

    #[test]
    fn test_dequeue_fault_names_queue() {
        let queue: UnitQueue<PrefixUnit> =
            UnitQueue::new("prefix", 4, crate::queue::BackpressurePolicy::Block, None).unwrap();
        let fault = CrawlFault::Dequeue {
            queue: queue.name(),
            task: "iterator 3".to_string(),
            source: QueueError::Stopped,
        };
        assert!(
            fault
                .to_string()
                .starts_with("Failed to dequeue from prefix queue in iterator 3")
        );
    }

    #[test]
    fn test_active_guard_survives_panic() {
        let counters = CrawlCounters::default();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _active = counters.iterator_started();
            panic!("listing exploded");
        }));
        assert!(result.is_err());
        assert_eq!(counters.active_iterators(), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
