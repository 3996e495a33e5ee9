//! Bucket crawler: walks an object store prefix tree, evaluates a policy
//! for every object and applies an effect to the selected ones while
//! keeping statistics and a durable audit log.

pub mod client;
pub mod coordinator;
pub mod crawler;
pub mod effect;
pub mod histogram;
pub mod policy;
pub mod queue;
pub mod report;
pub mod rules;
pub mod runlog;
pub mod shutdown;
pub mod stats;
pub mod units;
pub mod util;

pub use client::{BucketClient, BucketRegistry, Listing, ObjectStoreClient, StoreError};
pub use coordinator::{Completion, CrawlOptions, RunCoordinator, RunError, RunOutcome};
pub use effect::{Effect, EffectError, EffectResult};
pub use policy::{AuditRecord, PolicyError, PolicyEvaluator};
pub use queue::BackpressurePolicy;
pub use report::RunReport;
pub use rules::{RuleDocumentEvaluator, RuleEvaluator};
pub use runlog::{RunLog, RunLogError, RunLogSummary};
pub use units::{ObjectAttributes, ObjectUnit, PrefixUnit};
