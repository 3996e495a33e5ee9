use std::sync::Arc;

use common::config::DuplicateEffectConfig;

use super::{EffectError, EffectResult, check_mutation_allowed, store_error};
use crate::client::BucketClient;
use crate::units::ObjectAttributes;

/// Copies the object under the destination prefix, leaving the source.
#[derive(Clone)]
pub struct DuplicateEffect {
    pub(super) config: DuplicateEffectConfig,
    actor: Arc<dyn BucketClient>,
}

impl DuplicateEffect {
    pub fn initialize(
        config: DuplicateEffectConfig,
        actor: Arc<dyn BucketClient>,
        mutation_checks: &[bool],
    ) -> Result<Self, EffectError> {
        check_mutation_allowed(mutation_checks)?;
        if config.destination_bucket.is_empty() {
            return Err(EffectError::InvalidConfiguration {
                effect: "duplicate",
                message: "destination bucket cannot be empty".to_string(),
            });
        }
        Ok(Self { config, actor })
    }

    pub async fn enact(&self, attributes: &ObjectAttributes) -> Result<EffectResult, EffectError> {
        let destination = format!("{}{}", self.config.destination_prefix, attributes.name);
        self.actor
            .copy(attributes, &self.config.destination_bucket, &destination)
            .await
            .map_err(store_error("duplicate", attributes))?;
        EffectResult::acted_on("duplicate", attributes)
    }
}
