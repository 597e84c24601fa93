use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Initialization,
    ModelLoad,
    Inference,
    UnsupportedCapability,
    WorkerCrash,
    WorkerTimeout,
    Cancelled,
    ResourceLimit,
    NoEngineAvailable,
    Config,
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("{engine}: initialization failed: {message}")]
    Initialization { engine: String, message: String },

    #[error("{engine}: engine is not initialized")]
    NotInitialized { engine: String },

    #[error("{engine}: failed to load model: {message}")]
    ModelLoad { engine: String, message: String },

    #[error("{engine}: model '{model}' is not loaded")]
    ModelNotFound { engine: String, model: String },

    #[error("{engine}: inference failed: {message}")]
    Inference { engine: String, message: String },

    #[error("{engine}: capability '{capability}' is not supported")]
    UnsupportedCapability { engine: String, capability: String },

    #[error("{engine}: worker slot {slot} crashed: {message}")]
    WorkerCrash { engine: String, slot: usize, message: String },

    #[error("{engine}: task {task} timed out after {timeout:?}")]
    WorkerTimeout { engine: String, task: String, timeout: Duration },

    #[error("{engine}: task {task} was cancelled")]
    Cancelled { engine: String, task: String },

    #[error("{engine}: resource limit exceeded: {message}")]
    ResourceLimit { engine: String, message: String },

    #[error("no engine available: {message}")]
    NoEngineAvailable { message: String },

    #[error("engine '{name}' is not supported in this process")]
    EngineNotSupported { name: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl EngineError {
    pub fn initialization(engine: impl Into<String>, message: impl ToString) -> Self {
        Self::Initialization { engine: engine.into(), message: message.to_string() }
    }

    pub fn not_initialized(engine: impl Into<String>) -> Self {
        Self::NotInitialized { engine: engine.into() }
    }

    pub fn model_load(engine: impl Into<String>, message: impl ToString) -> Self {
        Self::ModelLoad { engine: engine.into(), message: message.to_string() }
    }

    pub fn model_not_found(engine: impl Into<String>, model: impl Into<String>) -> Self {
        Self::ModelNotFound { engine: engine.into(), model: model.into() }
    }

    pub fn inference(engine: impl Into<String>, message: impl ToString) -> Self {
        Self::Inference { engine: engine.into(), message: message.to_string() }
    }

    pub fn unsupported(engine: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::UnsupportedCapability { engine: engine.into(), capability: capability.into() }
    }

    pub fn resource_limit(engine: impl Into<String>, message: impl ToString) -> Self {
        Self::ResourceLimit { engine: engine.into(), message: message.to_string() }
    }

    pub fn config(message: impl ToString) -> Self {
        Self::Config { message: message.to_string() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Initialization { .. } | Self::NotInitialized { .. } => ErrorKind::Initialization,
            Self::ModelLoad { .. } | Self::ModelNotFound { .. } => ErrorKind::ModelLoad,
            Self::Inference { .. } => ErrorKind::Inference,
            Self::UnsupportedCapability { .. } => ErrorKind::UnsupportedCapability,
            Self::WorkerCrash { .. } => ErrorKind::WorkerCrash,
            Self::WorkerTimeout { .. } => ErrorKind::WorkerTimeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ResourceLimit { .. } => ErrorKind::ResourceLimit,
            Self::NoEngineAvailable { .. } | Self::EngineNotSupported { .. } => {
                ErrorKind::NoEngineAvailable
            }
            Self::Config { .. } => ErrorKind::Config,
        }
    }

    // Only worker failures are retried, and only inside the worker engine.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WorkerCrash { .. } | Self::WorkerTimeout { .. })
    }
}
