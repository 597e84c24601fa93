pub mod engine;
pub mod error;

pub use engine::{
    CancelHandle, CapabilitySet, Engine, EngineCore, EngineDescriptor, EngineStatus,
    ExecuteOptions, InferenceOutput, Metrics, ModelHandle, ModelRef, Token, TokenStream,
};
pub use error::{EngineError, ErrorKind};

pub type Result<T> = std::result::Result<T, EngineError>;
