// Sandboxed compute engine. Inference runs inside a WebAssembly instance with
// one bounded linear memory whose allocator lives on the host. Every call
// allocates its input and output regions and frees both before returning.
// Calls are serialized on a single instance.

pub mod arena;
pub mod runtime;

use crate::app::events::EventBus;
use crate::core::engine::{
    CapabilitySet, Engine, EngineCore, EngineStatus, ExecuteOptions, InferenceOutput, Metrics,
    ModelHandle, ModelRef, Token, TokenStream,
};
use crate::core::{EngineError, Result};
use crate::envconfig::SandboxConfig;
use crate::kernel::Sampler;
use async_trait::async_trait;
use parking_lot::Mutex;
use runtime::{SandboxRuntime, WeightRegion, DEFAULT_RUNTIME_WAT};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub const ENGINE_NAME: &str = "sandbox";

const CAPABILITIES: CapabilitySet = CapabilitySet {
    parallel: false,
    gpu: false,
    streaming: true,
    quantization: true,
    multi_modal: false,
    batch_processing: false,
};

struct LoadedModel {
    region: WeightRegion,
    output_size: usize,
}

struct SandboxState {
    runtime: SandboxRuntime,
    models: HashMap<String, LoadedModel>,
}

struct SandboxInner {
    core: EngineCore,
    config: SandboxConfig,
    state: Mutex<Option<SandboxState>>,
}

impl SandboxInner {
    fn run(&self, model_id: &str, input: &[f32], temperature: f32, top_k: usize) -> Result<Vec<f32>> {
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| EngineError::not_initialized(ENGINE_NAME))?;
        let model = state
            .models
            .get(model_id)
            .ok_or_else(|| EngineError::model_not_found(ENGINE_NAME, model_id))?;
        state
            .runtime
            .run(model.region, input, model.output_size, temperature, top_k)
            .map_err(|e| EngineError::inference(ENGINE_NAME, format!("{:#}", e)))
    }
}

#[derive(Clone)]
pub struct SandboxEngine {
    inner: Arc<SandboxInner>,
}

impl SandboxEngine {
    pub fn new(config: SandboxConfig, events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(SandboxInner {
                core: EngineCore::new(ENGINE_NAME, CAPABILITIES, events),
                config,
                state: Mutex::new(None),
            }),
        }
    }

    pub fn arena_usage(&self) -> usize {
        self.inner.state.lock().as_ref().map(|s| s.runtime.arena_usage()).unwrap_or(0)
    }

    pub fn arena_capacity(&self) -> usize {
        self.inner.state.lock().as_ref().map(|s| s.runtime.arena_capacity()).unwrap_or(0)
    }

    fn module_source(&self) -> Result<Vec<u8>> {
        match &self.inner.config.runtime_module {
            Some(path) => std::fs::read(path).map_err(|e| {
                EngineError::initialization(ENGINE_NAME, format!("{}: {}", path.display(), e))
            }),
            None => Ok(DEFAULT_RUNTIME_WAT.as_bytes().to_vec()),
        }
    }
}

#[async_trait]
impl Engine for SandboxEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn capabilities(&self) -> CapabilitySet {
        self.inner.core.capabilities()
    }

    fn probe_support(&self) -> bool {
        cfg!(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "riscv64",
            target_arch = "s390x"
        ))
    }

    fn is_initialized(&self) -> bool {
        self.inner.core.is_initialized()
    }

    async fn initialize(&self) -> Result<()> {
        self.inner
            .core
            .initialize_with(|| async {
                let source = self.module_source()?;
                let runtime = SandboxRuntime::new(&self.inner.config, &source)
                    .map_err(|e| EngineError::initialization(ENGINE_NAME, format!("{:#}", e)))?;
                tracing::debug!(
                    "sandbox arena ready: {} bytes, max {} pages",
                    runtime.arena_capacity(),
                    self.inner.config.maximum_pages
                );
                *self.inner.state.lock() = Some(SandboxState { runtime, models: HashMap::new() });
                Ok(())
            })
            .await
    }

    async fn load_model(&self, handle: ModelHandle) -> Result<ModelRef> {
        self.inner.core.validate_handle(&handle)?;
        let start = Instant::now();

        let result = {
            let mut guard = self.inner.state.lock();
            match guard.as_mut() {
                None => Err(EngineError::not_initialized(ENGINE_NAME)),
                Some(state) => {
                    let released = match state.models.remove(&handle.id) {
                        Some(previous) => state.runtime.free(previous.region.ptr).map_err(|e| {
                            EngineError::model_load(ENGINE_NAME, format!("releasing previous {}: {:#}", handle.id, e))
                        }),
                        None => Ok(()),
                    };
                    released.and_then(|()| {
                        let usable = handle.weights.len() - handle.weights.len() % 4;
                        let region = state
                            .runtime
                            .load_weights(&handle.weights[..usable])
                            .map_err(|e| EngineError::model_load(ENGINE_NAME, format!("{:#}", e)))?;
                        state
                            .models
                            .insert(handle.id.clone(), LoadedModel { region, output_size: handle.output_size });
                        Ok(())
                    })
                }
            }
        };

        match result {
            Ok(()) => Ok(self.inner.core.model_loaded(&handle, start.elapsed())),
            Err(e) => {
                self.inner.core.record_error(&e, Some(&handle.id));
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
        let core = &self.inner.core;
        core.track(model, input.len(), async {
            core.ensure_initialized()?;
            core.ensure_owned(model)?;
            let inner = Arc::clone(&self.inner);
            let model_id = model.id.clone();
            let input = input.to_vec();
            let (temperature, top_k) = (options.temperature, options.top_k);
            let data = tokio::task::spawn_blocking(move || inner.run(&model_id, &input, temperature, top_k))
                .await
                .map_err(|e| EngineError::inference(ENGINE_NAME, e))??;
            Ok(InferenceOutput::new(ENGINE_NAME, data))
        })
        .await
    }

    // Each token is a full `execute` over the whole sequence so far, so producing
    // n tokens costs O(n^2) in sequence length.
    fn stream(&self, model: &ModelRef, input: &[f32], options: &ExecuteOptions) -> Result<TokenStream> {
        self.inner.core.ensure_streaming()?;
        self.inner.core.ensure_initialized()?;
        self.inner.core.ensure_owned(model)?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::inference(ENGINE_NAME, e))?;

        let (tx, stream) = TokenStream::channel(options.max_tokens.clamp(1, 64));
        let inner = Arc::clone(&self.inner);
        let model = model.clone();
        let options = options.clone();
        let mut sequence = input.to_vec();

        handle.spawn_blocking(move || {
            let mut sampler = Sampler::new(options.temperature, options.top_k, options.seed);
            let mut produced = 0;

            for index in 0..options.max_tokens {
                if tx.is_cancelled() {
                    break;
                }
                // Temperature is applied once, by the sampler.
                let step = futures::executor::block_on(inner.core.track(&model, sequence.len(), async {
                    inner
                        .run(&model.id, &sequence, 1.0, options.top_k)
                        .map(|data| InferenceOutput::new(ENGINE_NAME, data))
                }));
                let logits = match step {
                    Ok(output) => output.data,
                    Err(e) => {
                        tx.blocking_send(Err(e));
                        break;
                    }
                };
                let Some((id, logit)) = sampler.sample(&logits) else {
                    break;
                };
                if !tx.blocking_send(Ok(Token { id: id as u32, index, logit })) {
                    break;
                }
                produced += 1;
                if options.stop_token == Some(id as u32) {
                    break;
                }
                sequence.push(id as f32);
            }

            tracing::debug!("sandbox stream for {} finished after {} tokens", model.id, produced);
            inner.core.stream_complete(&model.id, produced);
        });

        Ok(stream)
    }

    fn status(&self) -> EngineStatus {
        self.inner.core.status()
    }

    fn metrics(&self) -> Metrics {
        self.inner.core.metrics()
    }

    async fn cleanup(&self) -> Result<()> {
        self.inner
            .core
            .cleanup_with(|| async {
                if let Some(state) = self.inner.state.lock().take() {
                    tracing::debug!("releasing sandbox instance with {} models", state.models.len());
                }
                Ok(())
            })
            .await
    }
}
