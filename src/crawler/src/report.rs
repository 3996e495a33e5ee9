//! End-of-run report.

use std::fmt::Write;
use std::path::Path;

use serde::Serialize;
use uuid::Uuid;

use crate::coordinator::{Completion, RunOutcome};
use crate::crawler::CounterSnapshot;
use crate::policy::PolicyEvaluator;
use crate::runlog::RunLogSummary;
use crate::stats::StatsReport;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub invocation_id: Uuid,
    pub bucket: String,
    pub effect: common::config::EffectConfig,
    pub completion: Completion,
    pub counters: CounterSnapshot,
    pub run_log: RunLogSummary,
    pub all_objects: StatsReport,
    pub acted_objects: StatsReport,
}

impl RunReport {
    pub fn new(
        invocation_id: Uuid,
        bucket: &str,
        policy: &PolicyEvaluator,
        outcome: &RunOutcome,
    ) -> Self {
        Self {
            invocation_id,
            bucket: bucket.to_string(),
            effect: policy.effect().config(),
            completion: outcome.completion,
            counters: outcome.counters,
            run_log: outcome.run_log.clone(),
            all_objects: policy.all_objects().report(),
            acted_objects: policy.acted_objects().report(),
        }
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Policy application results:");
        let _ = writeln!(out, "All objects iterated stats:");
        out.push_str(&self.all_objects.text());
        let _ = writeln!(out, "Acted objects stats:");
        out.push_str(&self.acted_objects.text());
        out
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)
    }

    /// Warnings about units that were never worked.
    pub fn abandoned_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.counters.prefixes_abandoned > 0 {
            warnings.push(format!(
                "{} prefixes were abandoned after exhausting retries; objects beneath them were not evaluated",
                self.counters.prefixes_abandoned
            ));
        }
        if self.counters.objects_abandoned > 0 {
            warnings.push(format!(
                "{} objects were abandoned after exhausting retries",
                self.counters.objects_abandoned
            ));
        }
        warnings
    }
}
