//! Rule evaluation.
//!
//! A [`RuleEvaluator`] receives the evaluation document of one object,
//! `{"ageDays": <int>, "attr": <object attributes>}`, and answers with a
//! result set. The policy layer expects exactly one result carrying a
//! boolean `act` field.
//!
//! The built-in evaluator reads an ordered rule document:
//!
//! ```toml
//! default_act = false
//!
//! [[rules]]
//! name = "archive-old-logs"
//! name_pattern = "^logs/"
//! min_age_days = 180
//!
//! [[rules]]
//! name = "keep-everything-else"
//! act = false
//! ```
//!
//! The first rule whose every condition matches decides; without a match
//! `default_act` applies.

use std::fmt::Debug;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};

pub type ResultSet = Vec<Value>;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Failed to read rule document {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse rule document {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Rule {rule} has an invalid name pattern: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    #[error("Evaluation input is missing {0}")]
    InvalidInput(&'static str),
}

pub trait RuleEvaluator: Send + Sync + Debug {
    fn evaluate(&self, input: &Value) -> Result<ResultSet, RuleError>;
}

fn default_act() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub default_act: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default = "default_act")]
    pub act: bool,
    #[serde(default)]
    pub min_age_days: Option<i64>,
    #[serde(default)]
    pub max_age_days: Option<i64>,
    #[serde(default)]
    pub name_pattern: Option<String>,
    #[serde(default)]
    pub storage_classes: Option<Vec<String>>,
    #[serde(default)]
    pub min_size_bytes: Option<u64>,
    #[serde(default)]
    pub max_size_bytes: Option<u64>,
}

#[derive(Debug)]
struct CompiledRule {
    rule: Rule,
    name_pattern: Option<Regex>,
}

struct Candidate<'a> {
    age_days: i64,
    name: &'a str,
    size: u64,
    storage_class: Option<&'a str>,
}

impl CompiledRule {
    fn matches(&self, candidate: &Candidate<'_>) -> bool {
        let rule = &self.rule;
        rule.min_age_days.is_none_or(|min| candidate.age_days >= min)
            && rule.max_age_days.is_none_or(|max| candidate.age_days <= max)
            && rule.min_size_bytes.is_none_or(|min| candidate.size >= min)
            && rule.max_size_bytes.is_none_or(|max| candidate.size <= max)
            && self
                .name_pattern
                .as_ref()
                .is_none_or(|pattern| pattern.is_match(candidate.name))
            && rule.storage_classes.as_ref().is_none_or(|classes| {
                candidate
                    .storage_class
                    .is_some_and(|class| classes.iter().any(|c| c.eq_ignore_ascii_case(class)))
            })
    }
}

/// Evaluator over a [`RuleDocument`].
#[derive(Debug)]
pub struct RuleDocumentEvaluator {
    default_act: bool,
    rules: Vec<CompiledRule>,
}

impl RuleDocumentEvaluator {
    /// Read a rule document, JSON for `.json` files and TOML otherwise.
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: display.clone(),
            source,
        })?;

        let document: RuleDocument = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&text).map_err(|e| RuleError::Parse {
                path: display.clone(),
                message: e.to_string(),
            })?,
            _ => toml::from_str(&text).map_err(|e| RuleError::Parse {
                path: display.clone(),
                message: e.to_string(),
            })?,
        };

        Self::from_document(document)
    }

    pub fn from_document(document: RuleDocument) -> Result<Self, RuleError> {
        let rules = document
            .rules
            .into_iter()
            .map(|rule| {
                let name_pattern = rule
                    .name_pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|source| RuleError::InvalidPattern {
                        rule: rule.name.clone(),
                        source,
                    })?;
                Ok(CompiledRule { rule, name_pattern })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;

        Ok(Self {
            default_act: document.default_act,
            rules,
        })
    }

    /// Whether any rule filters on storage class, which listings only
    /// report when asked to look it up.
    pub fn uses_storage_class(&self) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.rule.storage_classes.is_some())
    }
}

impl RuleEvaluator for RuleDocumentEvaluator {
    fn evaluate(&self, input: &Value) -> Result<ResultSet, RuleError> {
        let attr = input.get("attr").ok_or(RuleError::InvalidInput("attr"))?;
        let candidate = Candidate {
            age_days: input
                .get("ageDays")
                .and_then(Value::as_i64)
                .ok_or(RuleError::InvalidInput("ageDays"))?,
            name: attr
                .get("name")
                .and_then(Value::as_str)
                .ok_or(RuleError::InvalidInput("attr.name"))?,
            size: attr
                .get("size")
                .and_then(Value::as_u64)
                .ok_or(RuleError::InvalidInput("attr.size"))?,
            storage_class: attr.get("storage_class").and_then(Value::as_str),
        };

        let decision = self.rules.iter().find(|rule| rule.matches(&candidate));
        let result = match decision {
            Some(rule) => json!({"act": rule.rule.act, "rule": rule.rule.name}),
            None => json!({"act": self.default_act, "rule": Value::Null}),
        };
        Ok(vec![result])
    }
}
