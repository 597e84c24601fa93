use super::{CapabilitySet, EngineStatus, InferenceOutput, Metrics, ModelHandle, ModelRef};
use crate::app::events::{Event, EventBus};
use crate::core::{EngineError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Bookkeeping shared by every backend: lifecycle flags, metrics and event emission.
pub struct EngineCore {
    name: String,
    capabilities: CapabilitySet,
    events: Arc<EventBus>,
    metrics: Mutex<Metrics>,
    initialized: AtomicBool,
    poisoned: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl EngineCore {
    pub fn new(name: impl Into<String>, capabilities: CapabilitySet, events: Arc<EventBus>) -> Self {
        Self {
            name: name.into(),
            capabilities,
            events,
            metrics: Mutex::new(Metrics::default()),
            initialized: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub async fn initialize_with<F, Fut>(&self, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.init_lock.lock().await;
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(EngineError::initialization(
                &self.name,
                "a previous initialization failed; instance is unusable",
            ));
        }
        if self.is_initialized() {
            return Ok(());
        }

        match init().await {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                tracing::info!("{} engine initialized", self.name);
                self.events.publish(Event::Initialized { engine: self.name.clone() });
                Ok(())
            }
            Err(e) => {
                self.poisoned.store(true, Ordering::SeqCst);
                self.record_error(&e, None);
                Err(e)
            }
        }
    }

    pub async fn cleanup_with<F, Fut>(&self, teardown: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.init_lock.lock().await;
        teardown().await?;
        if self.initialized.swap(false, Ordering::SeqCst) {
            tracing::info!("{} engine cleaned up", self.name);
        }
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(EngineError::not_initialized(&self.name))
        }
    }

    // Fails before anything is counted or emitted.
    pub fn ensure_streaming(&self) -> Result<()> {
        if self.capabilities.streaming {
            Ok(())
        } else {
            Err(EngineError::unsupported(&self.name, "streaming"))
        }
    }

    pub fn ensure_owned(&self, model: &ModelRef) -> Result<()> {
        if model.engine == self.name {
            Ok(())
        } else {
            Err(EngineError::model_not_found(&self.name, &model.id))
        }
    }

    pub fn validate_handle(&self, handle: &ModelHandle) -> Result<()> {
        let result = if !self.is_initialized() {
            Err(EngineError::not_initialized(&self.name))
        } else if handle.id.trim().is_empty() {
            Err(EngineError::model_load(&self.name, "model handle has no id"))
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            self.record_error(e, None);
        }
        result
    }

    pub fn model_loaded(&self, handle: &ModelHandle, load_time: Duration) -> ModelRef {
        tracing::info!("{}: loaded model {} in {:?}", self.name, handle.id, load_time);
        self.events.publish(Event::ModelLoaded {
            engine: self.name.clone(),
            model: handle.id.clone(),
            load_time,
        });
        ModelRef {
            id: handle.id.clone(),
            name: handle.name.clone(),
            output_size: handle.output_size,
            engine: self.name.clone(),
            load_time,
        }
    }

    pub async fn track<Fut>(&self, model: &ModelRef, input_size: usize, fut: Fut) -> Result<InferenceOutput>
    where
        Fut: Future<Output = Result<InferenceOutput>>,
    {
        self.metrics.lock().record_attempt();
        let start = Instant::now();

        match fut.await {
            Ok(mut output) => {
                let latency = start.elapsed();
                output.latency = latency;
                output.engine = self.name.clone();
                self.metrics.lock().record_success(latency);
                tracing::debug!(
                    "{}: {} -> {} values in {:?} (cached={})",
                    self.name,
                    model.id,
                    output.len(),
                    latency,
                    output.cached
                );
                self.events.publish(Event::Inference {
                    engine: self.name.clone(),
                    model: model.id.clone(),
                    latency,
                    input_size,
                    output_size: output.len(),
                    cached: output.cached,
                });
                Ok(output)
            }
            Err(e) => {
                self.metrics.lock().record_failure();
                self.record_error(&e, Some(&model.id));
                Err(e)
            }
        }
    }

    pub fn record_error(&self, error: &EngineError, model: Option<&str>) {
        tracing::warn!("{}: {}", self.name, error);
        self.events.publish(Event::Error {
            engine: self.name.clone(),
            kind: error.kind(),
            error: error.to_string(),
            model: model.map(String::from),
        });
    }

    pub fn stream_complete(&self, model: &str, tokens: usize) {
        self.events.publish(Event::StreamComplete {
            engine: self.name.clone(),
            model: model.to_string(),
            tokens,
        });
    }

    pub fn status(&self) -> EngineStatus {
        if !self.is_initialized() {
            return EngineStatus::Uninitialized;
        }
        if self.metrics.lock().is_degraded() {
            EngineStatus::Degraded
        } else {
            EngineStatus::Healthy
        }
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.lock().clone()
    }
}
