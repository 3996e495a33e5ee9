use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};

/// Environment prefix for overriding any run configuration field,
/// e.g. `CYCLER__RUN_LOG__CHUNK_SIZE_BYTES=1048576`.
pub const ENV_PREFIX: &str = "CYCLER__";

/// Storage classes understood by the change-storage-class effect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageClass {
    #[default]
    Unknown,
    Standard,
    Nearline,
    Coldline,
    Archive,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Unknown => "UNKNOWN",
            StorageClass::Standard => "STANDARD",
            StorageClass::Nearline => "NEARLINE",
            StorageClass::Coldline => "COLDLINE",
            StorageClass::Archive => "ARCHIVE",
        }
    }
}

impl std::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NoopEffectConfig {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MoveEffectConfig {
    pub destination_bucket: String,
    /// Joined verbatim in front of every object name (e.g. `archived/`).
    #[serde(default)]
    pub destination_prefix: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DuplicateEffectConfig {
    pub destination_bucket: String,
    #[serde(default)]
    pub destination_prefix: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeStorageClassEffectConfig {
    #[serde(default)]
    pub to_storage_class: StorageClass,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteEffectConfig {}

/// Exactly one effect is active per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectConfig {
    Noop(NoopEffectConfig),
    Move(MoveEffectConfig),
    Duplicate(DuplicateEffectConfig),
    ChangeStorageClass(ChangeStorageClassEffectConfig),
    Delete(DeleteEffectConfig),
}

impl EffectConfig {
    pub fn name(&self) -> &'static str {
        match self {
            EffectConfig::Noop(_) => "noop",
            EffectConfig::Move(_) => "move",
            EffectConfig::Duplicate(_) => "duplicate",
            EffectConfig::ChangeStorageClass(_) => "change_storage_class",
            EffectConfig::Delete(_) => "delete",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Path to the rule document handed to the rule evaluator
    pub policy_document_path: String,
    /// Only objects whose names match are submitted to the rule evaluator
    #[serde(default)]
    pub prefix_regexp: Option<String>,
    #[serde(default)]
    pub effect: Option<EffectConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramOptions {
    pub num_buckets: usize,
    pub growth_factor: f64,
    pub base_bucket_size: f64,
    pub min_value: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// How many leading path segments get an entry in the per-prefix size table
    pub prefix_report_max_depth: usize,
    pub age_days_histogram: HistogramOptions,
    pub size_bytes_histogram: HistogramOptions,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            // Depth 1 keeps report sizes manageable on large buckets.
            prefix_report_max_depth: 1,
            age_days_histogram: HistogramOptions {
                num_buckets: 13,
                growth_factor: 1.0,
                base_bucket_size: 1.0,
                min_value: 0,
            },
            size_bytes_histogram: HistogramOptions {
                num_buckets: 28,
                growth_factor: 1.0,
                base_bucket_size: 512.0,
                min_value: 0,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunLogConfig {
    /// `file:///path/to/logs`, `memory://`, `s3://host/bucket/prefix` or `gs://bucket/prefix`
    pub destination_url: String,
    /// Capacity of the record sink channel
    pub channel_size: usize,
    /// Buffered bytes that trigger a flush
    pub chunk_size_bytes: u64,
    /// Maximum number of flushed batches compressing or uploading at once
    pub max_unpersisted_logs: usize,
    /// Upload attempts per batch, also bounds the shutdown wait
    pub persist_retries: u32,
    /// First backoff between upload attempts, doubled each retry
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
}

impl Default for RunLogConfig {
    fn default() -> Self {
        Self {
            destination_url: String::from("file:///tmp/cycler/logs"),
            channel_size: 10_000,
            chunk_size_bytes: 64 * 1024 * 1024, // 64MB
            max_unpersisted_logs: 16,
            persist_retries: 5,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Bucket to crawl
    pub bucket: String,
    /// Must agree with the command line flag before any mutating effect runs
    #[serde(default)]
    pub mutation_allowed: bool,
    /// Bucket name to storage DSN, for the crawled bucket and any destination bucket
    #[serde(default)]
    pub stores: HashMap<String, String>,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub run_log: RunLogConfig,
}

impl RunConfig {
    /// Load a run configuration.
    ///
    /// `.toml` and `.json` files are parsed as text, anything else is decoded
    /// as the binary (bincode) representation. `CYCLER__` environment
    /// variables are merged on top in every case.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read run config {}", path.display()))?;

        let base = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {
                let text = String::from_utf8(bytes).context("Run config is not valid UTF-8")?;
                Figment::from(Serialized::defaults(RunConfig::default()))
                    .merge(Toml::string(&text))
            }
            Some("json") => {
                let text = String::from_utf8(bytes).context("Run config is not valid UTF-8")?;
                Figment::from(Serialized::defaults(RunConfig::default()))
                    .merge(Json::string(&text))
            }
            _ => {
                let decoded = Self::from_binary(&bytes)?;
                Figment::from(Serialized::defaults(decoded))
            }
        };

        let config = base
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract::<RunConfig>()
            .map_err(Box::new)
            .context("Failed to parse run config")?;

        Ok(config)
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("Failed to decode binary run config")
    }

    pub fn to_binary(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("Failed to encode binary run config")
    }

    /// Strip a `gs://` decoration and replace the configured bucket.
    pub fn override_bucket(&mut self, bucket: &str) {
        self.bucket = bucket.strip_prefix("gs://").unwrap_or(bucket).to_string();
    }

    /// DSN of the store holding `bucket`.
    ///
    /// Buckets listed under `stores` use their mapping, otherwise the bucket
    /// name is assumed to be a Google Cloud Storage bucket.
    pub fn store_dsn(&self, bucket: &str) -> String {
        self.stores
            .get(bucket)
            .cloned()
            .unwrap_or_else(|| format!("gs://{bucket}"))
    }

    /// Reject configurations that can never produce a valid run
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            anyhow::bail!("Bucket cannot be empty");
        }

        if self.policy.policy_document_path.is_empty() {
            anyhow::bail!("Policy document path cannot be empty");
        }

        if self.policy.effect.is_none() {
            anyhow::bail!("Effect configuration type not set");
        }

        if self.run_log.destination_url.is_empty() {
            anyhow::bail!("Run log destination cannot be empty");
        }

        if self.run_log.chunk_size_bytes == 0 {
            anyhow::bail!("Run log chunk size must be positive");
        }

        if self.run_log.max_unpersisted_logs == 0 || self.run_log.channel_size == 0 {
            anyhow::bail!("Run log channel size and max unpersisted logs must be positive");
        }

        for (name, histogram) in [
            ("age_days_histogram", &self.stats.age_days_histogram),
            ("size_bytes_histogram", &self.stats.size_bytes_histogram),
        ] {
            if histogram.num_buckets == 0
                || histogram.base_bucket_size <= 0.0
                || histogram.growth_factor <= 0.0
            {
                anyhow::bail!(
                    "{name} needs at least one bucket, a positive base size and a positive growth factor"
                );
            }
        }

        Ok(())
    }
}
