//! Units of work flowing through the crawl channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of one stored object, as handed to statistics, rules and effects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectAttributes {
    pub bucket: String,
    pub name: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub e_tag: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// One "directory" still to be listed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixUnit {
    pub prefix: String,
    pub try_count: u32,
}

impl PrefixUnit {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            try_count: 0,
        }
    }

    /// The same prefix with one more failed attempt recorded
    pub fn retried(mut self) -> Self {
        self.try_count += 1;
        self
    }
}

/// One discovered object awaiting policy evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectUnit {
    pub attributes: ObjectAttributes,
    pub try_count: u32,
}

impl ObjectUnit {
    pub fn new(attributes: ObjectAttributes) -> Self {
        Self {
            attributes,
            try_count: 0,
        }
    }

    pub fn retried(mut self) -> Self {
        self.try_count += 1;
        self
    }
}
