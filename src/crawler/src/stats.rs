//! Per-run statistics over a stream of objects.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use common::config::StatsConfig;
use serde::{Deserialize, Serialize};

use crate::histogram::Histogram;
use crate::units::ObjectAttributes;
use crate::util::{InvalidTimestamp, age_in_days, byte_count_si};

/// Aggregates total size, per-prefix sizes and age/size histograms.
///
/// Safe to share between tasks; the total is kept outside the lock so
/// progress reporting never contends with submitters.
#[derive(Debug)]
pub struct StatsSnapshot {
    max_depth: usize,
    root_size_bytes: AtomicU64,
    inner: Mutex<StatsInner>,
}

#[derive(Debug)]
struct StatsInner {
    object_count: u64,
    prefix_size_bytes: BTreeMap<String, u64>,
    age_days: Histogram,
    size_bytes: Histogram,
}

/// Point-in-time copy of a [`StatsSnapshot`], as written to JSON reports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub object_count: u64,
    pub root_size_bytes: u64,
    pub prefix_size_bytes: BTreeMap<String, u64>,
    pub age_days_histogram: Histogram,
    pub size_bytes_histogram: Histogram,
}

impl StatsSnapshot {
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            max_depth: config.prefix_report_max_depth,
            root_size_bytes: AtomicU64::new(0),
            inner: Mutex::new(StatsInner {
                object_count: 0,
                prefix_size_bytes: BTreeMap::new(),
                age_days: Histogram::new(&config.age_days_histogram),
                size_bytes: Histogram::new(&config.size_bytes_histogram),
            }),
        }
    }

    /// Fold one object into the statistics.
    ///
    /// The age is computed first, so an object created after `now` leaves
    /// every figure untouched.
    pub fn submit(
        &self,
        attributes: &ObjectAttributes,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTimestamp> {
        let age = age_in_days(attributes.created, now)?;

        self.root_size_bytes
            .fetch_add(attributes.size, Ordering::Relaxed);

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.object_count += 1;
        for prefix in prefixes_of(&attributes.name, self.max_depth) {
            *inner.prefix_size_bytes.entry(prefix).or_default() += attributes.size;
        }
        inner.age_days.add(age);
        inner.size_bytes.add(attributes.size.min(i64::MAX as u64) as i64);
        Ok(())
    }

    pub fn total_bytes(&self) -> u64 {
        self.root_size_bytes.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> StatsReport {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        StatsReport {
            object_count: inner.object_count,
            root_size_bytes: self.total_bytes(),
            prefix_size_bytes: inner.prefix_size_bytes.clone(),
            age_days_histogram: inner.age_days.clone(),
            size_bytes_histogram: inner.size_bytes.clone(),
        }
    }
}

impl StatsReport {
    /// Histograms, the prefix table sorted by name and the total size.
    pub fn text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Age Histogram (days):");
        out.push_str(&self.age_days_histogram.render());
        let _ = writeln!(out, "Size Histogram (bytes):");
        out.push_str(&self.size_bytes_histogram.render());
        let _ = writeln!(out, "Prefix Sizes:");
        for (prefix, size) in &self.prefix_size_bytes {
            let _ = writeln!(out, "{prefix}: {}", byte_count_si(*size));
        }
        let _ = writeln!(out, "Total Size: {}", byte_count_si(self.root_size_bytes));
        out
    }
}

/// Leading path prefixes of `name`, up to `max_depth` segments.
///
/// The last segment is the object itself and never counts as a prefix.
fn prefixes_of(name: &str, max_depth: usize) -> Vec<String> {
    let segments: Vec<&str> = name.split('/').collect();
    let depth = max_depth.min(segments.len().saturating_sub(1));
    (1..=depth).map(|i| segments[..i].join("/")).collect()
}
