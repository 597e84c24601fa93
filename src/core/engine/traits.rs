use super::{ExecuteOptions, InferenceOutput, Metrics, ModelHandle, ModelRef, TokenStream};
use crate::core::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub parallel: bool,
    pub gpu: bool,
    pub streaming: bool,
    pub quantization: bool,
    pub multi_modal: bool,
    pub batch_processing: bool,
}

impl CapabilitySet {
    pub const fn none() -> Self {
        Self {
            parallel: false,
            gpu: false,
            streaming: false,
            quantization: false,
            multi_modal: false,
            batch_processing: false,
        }
    }

    pub const fn streaming() -> Self {
        let mut caps = Self::none();
        caps.streaming = true;
        caps
    }

    // True when every flag set in `required` is also set here.
    pub fn satisfies(&self, required: &CapabilitySet) -> bool {
        (!required.parallel || self.parallel)
            && (!required.gpu || self.gpu)
            && (!required.streaming || self.streaming)
            && (!required.quantization || self.quantization)
            && (!required.multi_modal || self.multi_modal)
            && (!required.batch_processing || self.batch_processing)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let flags = [
            (self.parallel, "parallel"),
            (self.gpu, "gpu"),
            (self.streaming, "streaming"),
            (self.quantization, "quantization"),
            (self.multi_modal, "multi_modal"),
            (self.batch_processing, "batch_processing"),
        ];
        flags.iter().filter(|(on, _)| *on).map(|(_, name)| *name).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    pub name: String,
    pub priority: i32,
    pub supported: bool,
    pub capabilities: CapabilitySet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Uninitialized,
    Healthy,
    Degraded,
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;

    // Must not touch engine state; the selector calls it right after construction.
    fn probe_support(&self) -> bool;

    fn is_initialized(&self) -> bool;

    async fn initialize(&self) -> Result<()>;

    async fn load_model(&self, handle: ModelHandle) -> Result<ModelRef>;

    async fn execute(
        &self,
        model: &ModelRef,
        input: &[f32],
        options: &ExecuteOptions,
    ) -> Result<InferenceOutput>;

    fn stream(&self, model: &ModelRef, input: &[f32], options: &ExecuteOptions) -> Result<TokenStream>;

    fn status(&self) -> EngineStatus;

    fn metrics(&self) -> Metrics;

    async fn cleanup(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfies() {
        let caps = CapabilitySet { parallel: true, streaming: true, ..CapabilitySet::none() };
        assert!(caps.satisfies(&CapabilitySet::none()));
        assert!(caps.satisfies(&CapabilitySet::streaming()));
        assert!(!caps.satisfies(&CapabilitySet { gpu: true, ..CapabilitySet::none() }));
        assert_eq!(caps.names(), vec!["parallel", "streaming"]);
    }
}
