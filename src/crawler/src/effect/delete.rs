use std::sync::Arc;

use common::config::DeleteEffectConfig;

use super::{EffectError, EffectResult, check_mutation_allowed, store_error};
use crate::client::BucketClient;
use crate::units::ObjectAttributes;

/// Deletes the object.
#[derive(Clone)]
pub struct DeleteEffect {
    pub(super) config: DeleteEffectConfig,
    actor: Arc<dyn BucketClient>,
}

impl DeleteEffect {
    pub fn initialize(
        config: DeleteEffectConfig,
        actor: Arc<dyn BucketClient>,
        mutation_checks: &[bool],
    ) -> Result<Self, EffectError> {
        check_mutation_allowed(mutation_checks)?;
        Ok(Self { config, actor })
    }

    pub async fn enact(&self, attributes: &ObjectAttributes) -> Result<EffectResult, EffectError> {
        self.actor
            .delete(attributes)
            .await
            .map_err(store_error("delete", attributes))?;
        EffectResult::acted_on("delete", attributes)
    }
}
