// Edge platform engine for short-lived, resource-capped invocations. Requests
// hit the response cache first; a miss lazily materializes a tiny model and
// computes under the execution ceiling. Missing platform bindings fall back to
// in-memory stores. Cache consistency across invocations is eventual only.

pub mod cache;
pub mod platform;

pub use cache::{cache_key, CacheStats, ResponseCache};
pub use platform::{KeyValueStore, MemoryStore, PlatformBindings, PlatformCapabilities};

use crate::app::events::EventBus;
use crate::core::engine::{
    CapabilitySet, Engine, EngineCore, EngineStatus, ExecuteOptions, InferenceOutput, Metrics,
    ModelHandle, ModelRef, TokenStream,
};
use crate::core::{EngineError, Result};
use crate::envconfig::{CacheStrategy, EdgeConfig};
use crate::kernel;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub const ENGINE_NAME: &str = "edge";

const CAPABILITIES: CapabilitySet = CapabilitySet {
    parallel: false,
    gpu: false,
    streaming: false,
    quantization: true,
    multi_modal: false,
    batch_processing: false,
};

struct TinyModel {
    weights: Arc<[f32]>,
    output_size: usize,
}

struct EdgeModel {
    handle: ModelHandle,
    revision: String,
    tiny: Option<Arc<TinyModel>>,
}

struct EdgeState {
    cache: ResponseCache,
    model_store: Arc<dyn KeyValueStore>,
    models: Mutex<HashMap<String, EdgeModel>>,
}

pub struct EdgeEngine {
    core: EngineCore,
    config: EdgeConfig,
    bindings: PlatformBindings,
    state: Mutex<Option<Arc<EdgeState>>>,
}

impl EdgeEngine {
    pub fn new(config: EdgeConfig, bindings: PlatformBindings, events: Arc<EventBus>) -> Self {
        Self {
            core: EngineCore::new(ENGINE_NAME, CAPABILITIES, events),
            config,
            bindings,
            state: Mutex::new(None),
        }
    }

    pub fn platform_capabilities(&self) -> PlatformCapabilities {
        self.bindings.capabilities()
    }

    pub fn region(&self) -> Option<&str> {
        self.config.region.as_deref()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.state.lock().as_ref().map(|s| s.cache.stats()).unwrap_or_default()
    }

    pub fn is_materialized(&self, model_id: &str) -> bool {
        self.state
            .lock()
            .as_ref()
            .and_then(|s| s.models.lock().get(model_id).map(|m| m.tiny.is_some()))
            .unwrap_or(false)
    }

    fn state(&self) -> Result<Arc<EdgeState>> {
        self.state
            .lock()
            .clone()
            .ok_or_else(|| EngineError::not_initialized(ENGINE_NAME))
    }

    fn build_state(&self) -> EdgeState {
        let ttl = self.config.cache_ttl();
        let cache = match self.config.cache_strategy {
            CacheStrategy::Disabled => ResponseCache::disabled(),
            CacheStrategy::Memory => ResponseCache::new(Some(MemoryStore::shared()), ttl),
            CacheStrategy::Platform => {
                let store = self.bindings.response_store().unwrap_or_else(|| {
                    tracing::debug!("no platform cache binding, using in-memory responses");
                    MemoryStore::shared()
                });
                ResponseCache::new(Some(store), ttl)
            }
        };
        let model_store = self.bindings.model_store().unwrap_or_else(|| MemoryStore::shared());
        EdgeState { cache, model_store, models: Mutex::new(HashMap::new()) }
    }

    async fn materialize(&self, state: &EdgeState, model_id: &str) -> Result<Arc<TinyModel>> {
        let (handle, revision) = {
            let models = state.models.lock();
            let entry = models
                .get(model_id)
                .ok_or_else(|| EngineError::model_not_found(ENGINE_NAME, model_id))?;
            if let Some(tiny) = &entry.tiny {
                return Ok(Arc::clone(tiny));
            }
            (entry.handle.clone(), entry.revision.clone())
        };

        let supplied = handle.weights_f32();
        let weights = if supplied.is_empty() {
            self.restore_or_synthesize(state, model_id, &revision).await?
        } else {
            self.check_model_size(model_id, &supplied)?;
            supplied
        };

        let tiny = Arc::new(TinyModel { weights: Arc::from(weights), output_size: handle.output_size });
        if let Some(entry) = state.models.lock().get_mut(model_id) {
            // A reload may have replaced the entry while this one was being built.
            if entry.revision == revision {
                entry.tiny = Some(Arc::clone(&tiny));
            }
        }
        Ok(tiny)
    }

    // Persisted entries are keyed by revision, so a store shared with older
    // invocations never hands back weights built with other parameters.
    async fn restore_or_synthesize(&self, state: &EdgeState, model_id: &str, revision: &str) -> Result<Vec<f32>> {
        let key = format!("model:{}:{}", model_id, revision);
        let persisted = match state.model_store.get(&key).await {
            Ok(Some(raw)) if raw.len() % 4 == 0 && !raw.is_empty() => Some(decode_weights(&raw)),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("edge: could not read persisted model {}: {:#}", model_id, e);
                None
            }
        };

        if let Some(weights) = persisted {
            tracing::debug!("edge: restored {} from platform store", model_id);
            self.check_model_size(model_id, &weights)?;
            return Ok(weights);
        }

        let weights = kernel::synthesize_weights(model_seed(model_id), self.config.tiny_model_params);
        self.check_model_size(model_id, &weights)?;
        if self.config.persist_models {
            let raw = Bytes::copy_from_slice(bytemuck::cast_slice(&weights));
            if let Err(e) = state.model_store.put(&key, raw, None).await {
                tracing::warn!("edge: could not persist model {}: {:#}", model_id, e);
            }
        }
        Ok(weights)
    }

    fn check_model_size(&self, model_id: &str, weights: &[f32]) -> Result<()> {
        let size = (weights.len() * 4) as u64;
        if size > self.config.max_memory_bytes {
            return Err(EngineError::resource_limit(
                ENGINE_NAME,
                format!("model {} needs {} bytes, ceiling is {}", model_id, size, self.config.max_memory_bytes),
            ));
        }
        Ok(())
    }

    async fn compute(&self, model: &ModelRef, input: &[f32], options: &ExecuteOptions) -> Result<InferenceOutput> {
        self.core.ensure_owned(model)?;
        let state = self.state()?;

        let payload_bytes = input.len() * 4;
        if payload_bytes > self.config.max_payload_bytes {
            return Err(EngineError::resource_limit(
                ENGINE_NAME,
                format!("payload of {} bytes exceeds {}", payload_bytes, self.config.max_payload_bytes),
            ));
        }

        let revision = state
            .models
            .lock()
            .get(&model.id)
            .map(|entry| entry.revision.clone())
            .ok_or_else(|| EngineError::model_not_found(ENGINE_NAME, &model.id))?;
        let key = cache_key(&format!("{}@{}", model.id, revision), &options.operation, options.temperature, input);
        if let Some(data) = state.cache.get(&key).await {
            let mut output = InferenceOutput::new(ENGINE_NAME, data);
            output.cached = true;
            return Ok(output);
        }

        let tiny = self.materialize(&state, &model.id).await?;
        let ceiling = match options.timeout {
            Some(timeout) => timeout.min(self.config.max_execution()),
            None => self.config.max_execution(),
        };
        let input = input.to_vec();
        let temperature = options.temperature;
        let job = tokio::task::spawn_blocking(move || {
            kernel::forward(&tiny.weights, &input, tiny.output_size, temperature)
        });

        let data = match tokio::time::timeout(ceiling, job).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => return Err(EngineError::inference(ENGINE_NAME, e)),
            Err(_) => {
                return Err(EngineError::resource_limit(
                    ENGINE_NAME,
                    format!("execution exceeded {:?}", ceiling),
                ))
            }
        };

        state.cache.put(&key, &data).await;
        Ok(InferenceOutput::new(ENGINE_NAME, data))
    }
}

fn decode_weights(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// Supplied weights are identified by content; synthesized ones by their parameter count.
fn model_revision(handle: &ModelHandle, tiny_model_params: usize) -> String {
    if handle.weights.is_empty() {
        return format!("synthetic-{}", tiny_model_params);
    }
    let digest = format!("{:x}", Sha256::digest(&handle.weights));
    digest[..16].to_string()
}

fn model_seed(model_id: &str) -> u64 {
    let digest = Sha256::digest(model_id.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(seed)
}

#[async_trait]
impl Engine for EdgeEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn capabilities(&self) -> CapabilitySet {
        self.core.capabilities()
    }

    // Missing bindings degrade to in-memory stores instead of disabling the engine.
    fn probe_support(&self) -> bool {
        true
    }

    fn is_initialized(&self) -> bool {
        self.core.is_initialized()
    }

    async fn initialize(&self) -> Result<()> {
        self.core
            .initialize_with(|| async {
                let caps = self.bindings.capabilities();
                tracing::info!(
                    "edge platform: kv={} durable={} cache={} region={}",
                    caps.kv,
                    caps.durable,
                    caps.cache,
                    self.region().unwrap_or("unknown")
                );
                *self.state.lock() = Some(Arc::new(self.build_state()));
                Ok(())
            })
            .await
    }

    async fn load_model(&self, handle: ModelHandle) -> Result<ModelRef> {
        self.core.validate_handle(&handle)?;
        let start = Instant::now();

        let result = if handle.size_bytes > self.config.max_memory_bytes {
            Err(EngineError::resource_limit(
                ENGINE_NAME,
                format!(
                    "model {} is {} bytes, ceiling is {}",
                    handle.id, handle.size_bytes, self.config.max_memory_bytes
                ),
            ))
        } else {
            self.state().map(|state| {
                let revision = model_revision(&handle, self.config.tiny_model_params);
                let previous = state.models.lock().insert(
                    handle.id.clone(),
                    EdgeModel { handle: handle.clone(), revision: revision.clone(), tiny: None },
                );
                if previous.is_some_and(|p| p.revision != revision) {
                    tracing::debug!("edge: {} reloaded as revision {}", handle.id, revision);
                }
            })
        };

        match result {
            Ok(()) => Ok(self.core.model_loaded(&handle, start.elapsed())),
            Err(e) => {
                self.core.record_error(&e, Some(&handle.id));
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        model: &ModelRef,
        input: &[f32],
        options: &ExecuteOptions,
    ) -> Result<InferenceOutput> {
        self.core
            .track(model, input.len(), self.compute(model, input, options))
            .await
    }

    fn stream(&self, _model: &ModelRef, _input: &[f32], _options: &ExecuteOptions) -> Result<TokenStream> {
        self.core.ensure_streaming()?;
        Err(EngineError::unsupported(ENGINE_NAME, "streaming"))
    }

    fn status(&self) -> EngineStatus {
        self.core.status()
    }

    fn metrics(&self) -> Metrics {
        self.core.metrics()
    }

    async fn cleanup(&self) -> Result<()> {
        self.core
            .cleanup_with(|| async {
                self.state.lock().take();
                Ok(())
            })
            .await
    }
}
