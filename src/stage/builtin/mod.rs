mod adjust;
mod morphology;
mod threshold;

pub use adjust::ImageAdjustmentsStage;
pub use morphology::{MorphologyMode, MorphologyStage};
pub use threshold::ThresholdStage;

use super::shared;
use crate::registry::StageRegistry;

impl StageRegistry {
    /// Registry pre-populated with every built-in stage type.
    pub fn with_builtin_stages() -> Self {
        let mut registry = Self::new("stage");
        registry.register(ThresholdStage::TYPE_NAME, |_| shared(ThresholdStage::new()));
        registry.register(ImageAdjustmentsStage::TYPE_NAME, |_| {
            shared(ImageAdjustmentsStage::new())
        });
        registry.register(MorphologyStage::TYPE_NAME, |_| shared(MorphologyStage::new()));
        registry
    }
}
