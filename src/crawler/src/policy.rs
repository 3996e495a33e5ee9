//! Per-object decision: statistics, rule evaluation, effect, audit record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::config::{PolicyConfig, StatsConfig};
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};

use crate::effect::{Effect, EffectError};
use crate::rules::{ResultSet, RuleError, RuleEvaluator};
use crate::runlog::RunLogSink;
use crate::stats::StatsSnapshot;
use crate::units::ObjectUnit;
use crate::util::{InvalidTimestamp, age_in_days};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid prefix regexp: {0}")]
    InvalidPrefixRegexp(#[from] regex::Error),

    #[error(transparent)]
    InvalidTimestamp(#[from] InvalidTimestamp),

    #[error("Rule evaluation failed: {0}")]
    Evaluation(#[from] RuleError),

    #[error("Rule evaluation returned {0} results, expected exactly one")]
    UnexpectedResultCount(usize),

    #[error(transparent)]
    Effect(#[from] EffectError),

    #[error("Decision mismatch: policy chose to act but the {effect} effect did not")]
    DecisionMismatch { effect: &'static str },

    #[error("Failed to serialize audit record: {0}")]
    AuditSerialization(#[from] serde_json::Error),

    #[error("Run log sink is closed")]
    RunLogClosed,
}

/// One line of the run log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuditRecord {
    pub input_object: Value,
    pub result_set: ResultSet,
    pub action_time: DateTime<Utc>,
}

/// `act` of the single result.
pub fn should_act(result_set: &ResultSet) -> Result<bool, PolicyError> {
    match result_set.as_slice() {
        [result] => Ok(result.get("act").and_then(Value::as_bool).unwrap_or(false)),
        other => Err(PolicyError::UnexpectedResultCount(other.len())),
    }
}

/// Decides for each object and applies the effect to those selected.
#[derive(Debug)]
pub struct PolicyEvaluator {
    effect: Effect,
    evaluator: Arc<dyn RuleEvaluator>,
    name_filter: Option<Regex>,
    all_objects: StatsSnapshot,
    acted_objects: StatsSnapshot,
    log_sink: RunLogSink,
}

impl PolicyEvaluator {
    pub fn new(
        config: &PolicyConfig,
        stats: &StatsConfig,
        effect: Effect,
        evaluator: Arc<dyn RuleEvaluator>,
        log_sink: RunLogSink,
    ) -> Result<Self, PolicyError> {
        let name_filter = config
            .prefix_regexp
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .map(Regex::new)
            .transpose()?;

        Ok(Self {
            effect,
            evaluator,
            name_filter,
            all_objects: StatsSnapshot::new(stats),
            acted_objects: StatsSnapshot::new(stats),
            log_sink,
        })
    }

    /// Evaluate one object.
    ///
    /// Every submission counts towards the all-objects statistics, so a
    /// retried object is counted again. Objects outside the prefix filter
    /// are never evaluated. An object the rules
    /// select is handed to the effect, audited, and counted as acted upon.
    pub async fn submit(&self, unit: &ObjectUnit) -> Result<(), PolicyError> {
        let attributes = &unit.attributes;
        let now = Utc::now();

        self.all_objects.submit(attributes, now)?;
        let age_days = age_in_days(attributes.created, now)?;

        if self
            .name_filter
            .as_ref()
            .is_some_and(|filter| !filter.is_match(&attributes.name))
        {
            tracing::trace!(name = %attributes.name, "Outside prefix filter");
            return Ok(());
        }

        let input = json!({
            "ageDays": age_days,
            "attr": attributes,
        });
        let result_set = self.evaluator.evaluate(&input)?;
        if !should_act(&result_set)? {
            return Ok(());
        }

        let result = self.effect.enact(attributes).await?;
        if !result.has_acted() {
            return Err(PolicyError::DecisionMismatch {
                effect: self.effect.name(),
            });
        }
        tracing::debug!(result = result.text_result(), "Effect applied");

        let record = AuditRecord {
            input_object: input,
            result_set,
            action_time: Utc::now(),
        };
        let line = serde_json::to_vec(&record)?;
        self.log_sink
            .send(line)
            .await
            .map_err(|_| PolicyError::RunLogClosed)?;

        // The effect already happened, so a timestamp error here is moot.
        let _ = self.acted_objects.submit(attributes, now);
        Ok(())
    }

    pub fn effect(&self) -> &Effect {
        &self.effect
    }

    pub fn all_objects(&self) -> &StatsSnapshot {
        &self.all_objects
    }

    pub fn acted_objects(&self) -> &StatsSnapshot {
        &self.acted_objects
    }
}
