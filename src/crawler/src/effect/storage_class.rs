use std::sync::Arc;

use common::config::{ChangeStorageClassEffectConfig, StorageClass};

use super::{EffectError, EffectResult, check_mutation_allowed, store_error};
use crate::client::BucketClient;
use crate::units::ObjectAttributes;

/// Rewrites the object with the configured storage class.
#[derive(Clone)]
pub struct ChangeStorageClassEffect {
    pub(super) config: ChangeStorageClassEffectConfig,
    actor: Arc<dyn BucketClient>,
}

impl ChangeStorageClassEffect {
    pub fn initialize(
        config: ChangeStorageClassEffectConfig,
        actor: Arc<dyn BucketClient>,
        mutation_checks: &[bool],
    ) -> Result<Self, EffectError> {
        check_mutation_allowed(mutation_checks)?;
        if config.to_storage_class == StorageClass::Unknown {
            return Err(EffectError::InvalidConfiguration {
                effect: "change_storage_class",
                message: "target storage class must be set".to_string(),
            });
        }
        Ok(Self { config, actor })
    }

    pub async fn enact(&self, attributes: &ObjectAttributes) -> Result<EffectResult, EffectError> {
        self.actor
            .change_storage_class(attributes, self.config.to_storage_class)
            .await
            .map_err(store_error("change_storage_class", attributes))?;
        EffectResult::acted_on("change_storage_class", attributes)
    }
}
