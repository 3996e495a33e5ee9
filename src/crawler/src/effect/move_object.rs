use std::sync::Arc;

use common::config::MoveEffectConfig;

use super::{EffectError, EffectResult, check_mutation_allowed, store_error};
use crate::client::BucketClient;
use crate::units::ObjectAttributes;

/// Copies the object under the destination prefix, then deletes the source.
#[derive(Clone)]
pub struct MoveEffect {
    pub(super) config: MoveEffectConfig,
    actor: Arc<dyn BucketClient>,
}

impl MoveEffect {
    pub fn initialize(
        config: MoveEffectConfig,
        actor: Arc<dyn BucketClient>,
        mutation_checks: &[bool],
    ) -> Result<Self, EffectError> {
        check_mutation_allowed(mutation_checks)?;
        if config.destination_bucket.is_empty() {
            return Err(EffectError::InvalidConfiguration {
                effect: "move",
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
            .map_err(store_error("move", attributes))?;
        self.actor
            .delete(attributes)
            .await
            .map_err(store_error("move", attributes))?;
        EffectResult::acted_on("move", attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockBucketClient, StoreError};
    use crate::effect::test_support::object;
    use mockall::Sequence;

    fn config() -> MoveEffectConfig {
        MoveEffectConfig {
            destination_bucket: "dst".to_string(),
            destination_prefix: "archived/".to_string(),
        }
    }

    #[tokio::test]
    async fn test_move_copies_then_deletes() {
        let mut client = MockBucketClient::new();
        let mut sequence = Sequence::new();
        client
            .expect_copy()
            .withf(|source, bucket, name| {
                source.name == "a/one" && bucket == "dst" && name == "archived/a/one"
            })
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _| Ok(()));
        client
            .expect_delete()
            .withf(|source| source.name == "a/one")
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));

        let effect = MoveEffect::initialize(config(), Arc::new(client), &[true, true]).unwrap();
        let result = effect.enact(&object("a/one")).await.unwrap();
        assert!(result.has_acted());
    }

    #[tokio::test]
    async fn test_failed_copy_keeps_source() {
        let mut client = MockBucketClient::new();
        client
            .expect_copy()
            .times(1)
            .returning(|_, _, _| Err(StoreError::UnknownBucket("dst".to_string())));
        client.expect_delete().never();

        let effect = MoveEffect::initialize(config(), Arc::new(client), &[true]).unwrap();
        let err = effect.enact(&object("a/one")).await.unwrap_err();
        assert!(matches!(err, EffectError::Store { effect: "move", .. }));
    }

    #[test]
    fn test_empty_destination_rejected() {
        let config = MoveEffectConfig::default();
        let result = MoveEffect::initialize(config, Arc::new(MockBucketClient::new()), &[true]);
        assert!(matches!(
            result,
            Err(EffectError::InvalidConfiguration { effect: "move", .. })
        ));
    }
}
