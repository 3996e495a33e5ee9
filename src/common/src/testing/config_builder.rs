//! Test configuration builder for creating run setups quickly.

use std::time::Duration;

use crate::config::{EffectConfig, NoopEffectConfig, PolicyConfig, RunConfig, RunLogConfig};

/// Builder for run configurations suitable for tests.
///
/// # Example
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new()
///     .with_bucket("src")
///     .with_mutation_allowed(true)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: RunConfig,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    /// In-memory run log, small chunks, fast retries and a no-op effect.
    pub fn new() -> Self {
        Self {
            config: RunConfig {
                bucket: "test-bucket".to_string(),
                mutation_allowed: false,
                policy: PolicyConfig {
                    policy_document_path: "rules.toml".to_string(),
                    prefix_regexp: None,
                    effect: Some(EffectConfig::Noop(NoopEffectConfig {})),
                },
                run_log: RunLogConfig {
                    destination_url: "memory://".to_string(),
                    channel_size: 64,
                    chunk_size_bytes: 4 * 1024,
                    max_unpersisted_logs: 4,
                    persist_retries: 2,
                    initial_backoff: Duration::from_millis(10),
                },
                ..Default::default()
            },
        }
    }

    pub fn with_bucket(mut self, bucket: &str) -> Self {
        self.config.bucket = bucket.to_string();
        self
    }

    pub fn with_store(mut self, bucket: &str, dsn: &str) -> Self {
        self.config
            .stores
            .insert(bucket.to_string(), dsn.to_string());
        self
    }

    pub fn with_effect(mut self, effect: EffectConfig) -> Self {
        self.config.policy.effect = Some(effect);
        self
    }

    pub fn with_mutation_allowed(mut self, allowed: bool) -> Self {
        self.config.mutation_allowed = allowed;
        self
    }

    pub fn with_policy_document(mut self, path: &str) -> Self {
        self.config.policy.policy_document_path = path.to_string();
        self
    }

    pub fn with_prefix_regexp(mut self, pattern: &str) -> Self {
        self.config.policy.prefix_regexp = Some(pattern.to_string());
        self
    }

    pub fn with_run_log_destination(mut self, url: &str) -> Self {
        self.config.run_log.destination_url = url.to_string();
        self
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.config.run_log.chunk_size_bytes = bytes;
        self
    }

    pub fn build(self) -> RunConfig {
        self.config
    }
}
