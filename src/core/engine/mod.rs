pub mod base;
pub mod metrics;
pub mod model;
pub mod stream;
pub mod traits;

pub use base::EngineCore;
pub use metrics::{Metrics, DEGRADED_ERROR_RATE};
pub use model::{ExecuteOptions, InferenceOutput, ModelHandle, ModelRef};
pub use stream::{CancelHandle, Token, TokenSender, TokenStream};
pub use traits::{CapabilitySet, Engine, EngineDescriptor, EngineStatus};
