pub mod policy;
pub mod pool;
pub mod task;

pub use policy::SlotStats;
pub use pool::WorkerPool;
pub use task::{KernelHandler, PoolModel, TaskHandle, TaskHandler, TaskId, TaskKind, TaskPayload, WorkerContext};

use crate::app::events::EventBus;
use crate::core::engine::{
    CapabilitySet, Engine, EngineCore, EngineStatus, ExecuteOptions, InferenceOutput, Metrics,
    ModelHandle, ModelRef, Token, TokenStream,
};
use crate::core::{EngineError, Result};
use crate::envconfig::WorkerConfig;
use crate::kernel::Sampler;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const NATIVE_ENGINE: &str = "native";
pub const WORKER_ENGINE: &str = "worker";

const CAPABILITIES: CapabilitySet = CapabilitySet {
    parallel: true,
    gpu: false,
    streaming: true,
    quantization: false,
    multi_modal: false,
    batch_processing: true,
};

pub struct WorkerEngine {
    core: Arc<EngineCore>,
    config: WorkerConfig,
    parallelism: usize,
    handler: Arc<dyn TaskHandler>,
    pool: Mutex<Option<WorkerPool>>,
    models: Mutex<HashMap<String, Arc<PoolModel>>>,
}

impl WorkerEngine {
    pub fn new(name: &str, config: WorkerConfig, events: Arc<EventBus>) -> Self {
        Self {
            core: Arc::new(EngineCore::new(name, CAPABILITIES, events)),
            config,
            parallelism: crate::discover::available_parallelism(),
            handler: Arc::new(KernelHandler),
            pool: Mutex::new(None),
            models: Mutex::new(HashMap::new()),
        }
    }

    // Native OS threads sharing one copy of each model's weights.
    pub fn native(config: WorkerConfig, events: Arc<EventBus>) -> Self {
        Self::new(NATIVE_ENGINE, config, events)
    }

    // Isolated contexts, each holding its own copy of the weights it has used.
    pub fn worker(config: WorkerConfig, events: Arc<EventBus>) -> Self {
        Self::new(WORKER_ENGINE, config, events)
    }

    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_available_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn pool_size(&self) -> usize {
        self.config.max_workers.min(self.parallelism).max(1)
    }

    fn pool(&self) -> Result<WorkerPool> {
        self.pool
            .lock()
            .clone()
            .ok_or_else(|| EngineError::not_initialized(self.core.name()))
    }

    fn model(&self, model: &ModelRef) -> Result<Arc<PoolModel>> {
        self.core.ensure_owned(model)?;
        self.models
            .lock()
            .get(&model.id)
            .cloned()
            .ok_or_else(|| EngineError::model_not_found(self.core.name(), &model.id))
    }

    pub fn submit(&self, payload: TaskPayload) -> Result<TaskHandle> {
        self.pool()?.submit(payload, None)
    }

    pub fn submit_with_timeout(&self, payload: TaskPayload, timeout: Duration) -> Result<TaskHandle> {
        self.pool()?.submit(payload, Some(timeout))
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.pool().map(|pool| pool.cancel(id)).unwrap_or(false)
    }

    pub fn queue_len(&self) -> usize {
        self.pool().map(|pool| pool.queue_len()).unwrap_or(0)
    }

    pub fn busy_slots(&self) -> usize {
        self.pool().map(|pool| pool.busy_slots()).unwrap_or(0)
    }

    pub fn peak_busy(&self) -> usize {
        self.pool().map(|pool| pool.peak_busy()).unwrap_or(0)
    }

    pub fn slot_stats(&self) -> Vec<SlotStats> {
        self.pool().map(|pool| pool.slot_stats()).unwrap_or_default()
    }
}

#[async_trait]
impl Engine for WorkerEngine {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn capabilities(&self) -> CapabilitySet {
        self.core.capabilities()
    }

    fn probe_support(&self) -> bool {
        cfg!(not(target_arch = "wasm32")) && self.parallelism > 0
    }

    fn is_initialized(&self) -> bool {
        self.core.is_initialized()
    }

    async fn initialize(&self) -> Result<()> {
        self.core
            .initialize_with(|| async {
                let pool = WorkerPool::start(
                    self.core.name(),
                    self.config.clone(),
                    self.pool_size(),
                    Arc::clone(&self.handler),
                    Arc::clone(self.core.events()),
                )?;
                *self.pool.lock() = Some(pool);
                Ok(())
            })
            .await
    }

    async fn load_model(&self, handle: ModelHandle) -> Result<ModelRef> {
        self.core.validate_handle(&handle)?;
        let start = Instant::now();
        let model = PoolModel {
            id: handle.id.clone(),
            weights: Arc::from(handle.weights_f32()),
            output_size: handle.output_size,
            shared: self.config.share_weights,
        };
        self.models.lock().insert(handle.id.clone(), Arc::new(model));
        Ok(self.core.model_loaded(&handle, start.elapsed()))
    }

    async fn execute(
        &self,
        model: &ModelRef,
        input: &[f32],
        options: &ExecuteOptions,
    ) -> Result<InferenceOutput> {
        self.core
            .track(model, input.len(), async {
                let pool_model = self.model(model)?;
                let payload = TaskPayload::Inference {
                    model: pool_model,
                    input: input.to_vec(),
                    temperature: options.temperature,
                };
                let data = self.pool()?.submit(payload, options.timeout)?.wait().await?;
                Ok(InferenceOutput::new(self.core.name(), data))
            })
            .await
    }

    // Every token re-submits the whole sequence, so n tokens cost O(n^2).
    fn stream(&self, model: &ModelRef, input: &[f32], options: &ExecuteOptions) -> Result<TokenStream> {
        self.core.ensure_streaming()?;
        self.core.ensure_initialized()?;
        let pool_model = self.model(model)?;
        let pool = self.pool()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::inference(self.core.name(), e))?;

        let (tx, stream) = TokenStream::channel(options.max_tokens.clamp(1, 64));
        let core = Arc::clone(&self.core);
        let model = model.clone();
        let options = options.clone();
        let mut sequence = input.to_vec();

        runtime.spawn(async move {
            let mut sampler = Sampler::new(options.temperature, options.top_k, options.seed);
            let mut produced = 0;

            for index in 0..options.max_tokens {
                if tx.is_cancelled() {
                    break;
                }
                let payload = TaskPayload::Inference {
                    model: Arc::clone(&pool_model),
                    input: sequence.clone(),
                    temperature: 1.0,
                };
                let step = core
                    .track(&model, sequence.len(), async {
                        let data = pool.submit(payload, options.timeout)?.wait().await?;
                        Ok(InferenceOutput::new(core.name(), data))
                    })
                    .await;
                let logits = match step {
                    Ok(output) => output.data,
                    Err(e) => {
                        tx.send(Err(e)).await;
                        break;
                    }
                };
                let Some((id, logit)) = sampler.sample(&logits) else {
                    break;
                };
                if !tx.send(Ok(Token { id: id as u32, index, logit })).await {
                    break;
                }
                produced += 1;
                if options.stop_token == Some(id as u32) {
                    break;
                }
                sequence.push(id as f32);
            }

            core.stream_complete(&model.id, produced);
        });

        Ok(stream)
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
                if let Some(pool) = self.pool.lock().take() {
                    pool.shutdown();
                }
                self.models.lock().clear();
                Ok(())
            })
            .await
    }
}
