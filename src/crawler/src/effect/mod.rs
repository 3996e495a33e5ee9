//! Effects: the action applied to objects the policy selects.

mod delete;
mod duplicate;
mod move_object;
mod noop;
mod storage_class;

use std::sync::Arc;

use common::config::EffectConfig;
use serde_json::json;

pub use delete::DeleteEffect;
pub use duplicate::DuplicateEffect;
pub use move_object::MoveEffect;
pub use noop::NoopEffect;
pub use storage_class::ChangeStorageClassEffect;

use crate::client::{BucketClient, StoreError};
use crate::units::ObjectAttributes;

#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    #[error("Mutation not allowed: every mutation check must be true")]
    MutationNotAllowed,

    #[error("Invalid {effect} effect configuration: {message}")]
    InvalidConfiguration {
        effect: &'static str,
        message: String,
    },

    #[error("{effect} of {bucket}/{name} failed: {source}")]
    Store {
        effect: &'static str,
        bucket: String,
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to serialize effect result: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of enacting an effect on one object.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectResult {
    acted: bool,
    json_result: String,
    text_result: String,
}

impl EffectResult {
    /// Result of an effect that handled `attributes`.
    pub(crate) fn acted_on(
        effect: &'static str,
        attributes: &ObjectAttributes,
    ) -> Result<Self, EffectError> {
        let json_result = serde_json::to_string(&json!({
            "effect": effect,
            "object": attributes,
        }))?;
        Ok(Self {
            acted: true,
            json_result,
            text_result: format!("{effect}: {}/{}", attributes.bucket, attributes.name),
        })
    }

    pub fn has_acted(&self) -> bool {
        self.acted
    }

    pub fn json_result(&self) -> &str {
        &self.json_result
    }

    pub fn text_result(&self) -> &str {
        &self.text_result
    }
}

/// Mutating effects only initialize when every check agrees.
pub(crate) fn check_mutation_allowed(checks: &[bool]) -> Result<(), EffectError> {
    if checks.iter().all(|allowed| *allowed) {
        Ok(())
    } else {
        Err(EffectError::MutationNotAllowed)
    }
}

/// The configured effect of a run.
#[derive(Clone)]
pub enum Effect {
    Noop(NoopEffect),
    Move(MoveEffect),
    Duplicate(DuplicateEffect),
    ChangeStorageClass(ChangeStorageClassEffect),
    Delete(DeleteEffect),
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Effect").field(&self.config()).finish()
    }
}

impl Effect {
    /// Build the effect described by `config`.
    ///
    /// `mutation_checks` are the independent opt-ins (configuration file,
    /// command line) that mutating effects require to all be true.
    pub fn initialize(
        config: &EffectConfig,
        actor: Arc<dyn BucketClient>,
        mutation_checks: &[bool],
    ) -> Result<Self, EffectError> {
        let effect = match config {
            EffectConfig::Noop(config) => Effect::Noop(NoopEffect::initialize(config.clone())),
            EffectConfig::Move(config) => {
                Effect::Move(MoveEffect::initialize(config.clone(), actor, mutation_checks)?)
            }
            EffectConfig::Duplicate(config) => Effect::Duplicate(DuplicateEffect::initialize(
                config.clone(),
                actor,
                mutation_checks,
            )?),
            EffectConfig::ChangeStorageClass(config) => Effect::ChangeStorageClass(
                ChangeStorageClassEffect::initialize(config.clone(), actor, mutation_checks)?,
            ),
            EffectConfig::Delete(config) => {
                Effect::Delete(DeleteEffect::initialize(config.clone(), actor, mutation_checks)?)
            }
        };
        Ok(effect)
    }

    pub async fn enact(&self, attributes: &ObjectAttributes) -> Result<EffectResult, EffectError> {
        match self {
            Effect::Noop(effect) => effect.enact(attributes),
            Effect::Move(effect) => effect.enact(attributes).await,
            Effect::Duplicate(effect) => effect.enact(attributes).await,
            Effect::ChangeStorageClass(effect) => effect.enact(attributes).await,
            Effect::Delete(effect) => effect.enact(attributes).await,
        }
    }

    pub fn config(&self) -> EffectConfig {
        match self {
            Effect::Noop(effect) => EffectConfig::Noop(effect.config.clone()),
            Effect::Move(effect) => EffectConfig::Move(effect.config.clone()),
            Effect::Duplicate(effect) => EffectConfig::Duplicate(effect.config.clone()),
            Effect::ChangeStorageClass(effect) => {
                EffectConfig::ChangeStorageClass(effect.config.clone())
            }
            Effect::Delete(effect) => EffectConfig::Delete(effect.config.clone()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.config().name()
    }
}

/// Wrap a store failure with the effect and object it happened on.
pub(crate) fn store_error<'a>(
    effect: &'static str,
    attributes: &'a ObjectAttributes,
) -> impl FnOnce(StoreError) -> EffectError + 'a {
    move |source| EffectError::Store {
        effect,
        bucket: attributes.bucket.clone(),
        name: attributes.name.clone(),
        source,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBucketClient;
    use common::config::{
        ChangeStorageClassEffectConfig, DeleteEffectConfig, DuplicateEffectConfig,
        MoveEffectConfig, NoopEffectConfig, StorageClass,
    };

    fn mutating_configs() -> Vec<EffectConfig> {
        vec![
            EffectConfig::Move(MoveEffectConfig {
                destination_bucket: "dst".to_string(),
                destination_prefix: "archived/".to_string(),
            }),
            EffectConfig::Duplicate(DuplicateEffectConfig {
                destination_bucket: "dst".to_string(),
                destination_prefix: String::new(),
            }),
            EffectConfig::ChangeStorageClass(ChangeStorageClassEffectConfig {
                to_storage_class: StorageClass::Archive,
            }),
            EffectConfig::Delete(DeleteEffectConfig {}),
        ]
    }

    #[test]
    fn test_check_mutation_allowed() {
        assert!(check_mutation_allowed(&[]).is_ok());
        assert!(check_mutation_allowed(&[true, true]).is_ok());
        assert!(check_mutation_allowed(&[true, false]).is_err());
        assert!(check_mutation_allowed(&[false, true]).is_err());
    }

    #[test]
    fn test_mutating_effects_require_every_check() {
        for config in mutating_configs() {
            for checks in [[true, false], [false, true], [false, false]] {
                let result = Effect::initialize(&config, Arc::new(MockBucketClient::new()), &checks);
                assert!(
                    matches!(result, Err(EffectError::MutationNotAllowed)),
                    "{} initialized with {checks:?}",
                    config.name()
                );
            }

            let effect =
                Effect::initialize(&config, Arc::new(MockBucketClient::new()), &[true, true])
                    .unwrap();
            assert_eq!(effect.name(), config.name());
            assert_eq!(effect.config(), config);
        }
    }

    #[test]
    fn test_noop_ignores_checks() {
        let config = EffectConfig::Noop(NoopEffectConfig {});
        let effect =
            Effect::initialize(&config, Arc::new(MockBucketClient::new()), &[false, false])
                .unwrap();
        assert_eq!(effect.name(), "noop");
    }

    #[test]
    fn test_store_error_names_effect_and_object() {
        let object = test_support::object("a/one");
        let wrap = store_error("delete", &object);
        let err = wrap(StoreError::UnknownBucket("src".to_string()));

        assert!(matches!(
            err,
            EffectError::Store {
                effect: "delete",
                ref bucket,
                ref name,
                source: StoreError::UnknownBucket(_),
            } if bucket == "src" && name == "a/one"
        ));
    }

    #[test]
    fn test_effect_result_serializes_object() {
        let object = test_support::object("a/one");
        let result = EffectResult::acted_on("move", &object).unwrap();
        assert!(result.has_acted());
        assert_eq!(result.text_result(), "move: src/a/one");

        let json: serde_json::Value = serde_json::from_str(result.json_result()).unwrap();
        assert_eq!(json["effect"], "move");
        assert_eq!(json["object"]["name"], "a/one");
    }
}
