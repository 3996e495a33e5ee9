use common::config::NoopEffectConfig;

use super::{EffectError, EffectResult};
use crate::units::ObjectAttributes;

/// Reports every selected object without touching it.
#[derive(Debug, Clone)]
pub struct NoopEffect {
    pub(super) config: NoopEffectConfig,
}

impl NoopEffect {
    pub fn initialize(config: NoopEffectConfig) -> Self {
        Self { config }
    }

    pub fn enact(&self, attributes: &ObjectAttributes) -> Result<EffectResult, EffectError> {
        EffectResult::acted_on("noop", attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::test_support::object;

    #[test]
    fn test_noop_acts() {
        let effect = NoopEffect::initialize(NoopEffectConfig {});
        let result = effect.enact(&object("a/one")).unwrap();
        assert!(result.has_acted());
    }
}
