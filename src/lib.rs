pub mod app;
pub mod core;
pub mod discover;
pub mod engines;
pub mod envconfig;
pub mod kernel;
pub mod selector;

pub use app::{Event, EventBus, EventHandler, HandlerId, LoggingHandler};

pub use core::{
    CancelHandle, CapabilitySet, Engine, EngineDescriptor, EngineError, EngineStatus, ErrorKind,
    ExecuteOptions, InferenceOutput, Metrics, ModelHandle, ModelRef, Result, Token, TokenStream,
};

pub use engines::{EdgeEngine, GpuEngine, SandboxEngine, WorkerEngine};

pub use envconfig::RuntimeConfig;

pub use selector::{EngineRegistry, EngineSelector, SelectionCriteria};
