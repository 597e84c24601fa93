use crate::app::events::EventBus;
use crate::core::engine::{
    CapabilitySet, Engine, EngineCore, EngineStatus, ExecuteOptions, InferenceOutput, Metrics,
    ModelHandle, ModelRef, TokenStream,
};
use crate::core::{EngineError, Result};
use crate::envconfig::{GpuConfig, LimitsPreset, PowerPreference};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use wgpu::util::DeviceExt;

pub const ENGINE_NAME: &str = "gpu";

pub const WORKGROUP_SIZE: u32 = 64;

// Bindings: 0 input, 1 output, 2 weights, 3 params. Custom shaders must use the same layout.
pub const DEFAULT_SHADER: &str = r#"
struct Params {
    output_size: u32,
    weight_count: u32,
    input_len: u32,
    temperature: f32,
}

@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;
@group(0) @binding(2) var<storage, read> weights: array<f32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let j = gid.x;
    if (j >= params.output_size) {
        return;
    }
    var acc = 0.0;
    for (var i = 0u; i < params.input_len; i = i + 1u) {
        var w = 1.0;
        if (params.weight_count > 0u) {
            w = weights[(i * params.output_size + j) % params.weight_count];
        }
        acc = acc + input[i] * w;
    }
    output[j] = acc / params.temperature;
}
"#;

const CAPABILITIES: CapabilitySet = CapabilitySet {
    parallel: true,
    gpu: true,
    streaming: false,
    quantization: true,
    multi_modal: false,
    batch_processing: true,
};

struct GpuModel {
    pipeline: wgpu::ComputePipeline,
    weights: wgpu::Buffer,
    weight_count: u32,
    output_size: usize,
}

struct GpuContext {
    adapter_info: wgpu::AdapterInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    models: Mutex<HashMap<String, Arc<GpuModel>>>,
}

pub struct GpuEngine {
    core: EngineCore,
    config: GpuConfig,
    context: Mutex<Option<Arc<GpuContext>>>,
}

impl GpuEngine {
    pub fn new(config: GpuConfig, events: Arc<EventBus>) -> Self {
        Self {
            core: EngineCore::new(ENGINE_NAME, CAPABILITIES, events),
            config,
            context: Mutex::new(None),
        }
    }

    pub fn adapter_info(&self) -> Option<wgpu::AdapterInfo> {
        self.context.lock().as_ref().map(|ctx| ctx.adapter_info.clone())
    }

    fn context(&self) -> Result<Arc<GpuContext>> {
        self.context
            .lock()
            .clone()
            .ok_or_else(|| EngineError::not_initialized(ENGINE_NAME))
    }

    fn instance() -> wgpu::Instance {
        wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        })
    }

    fn limits(&self, adapter: &wgpu::Adapter) -> Result<wgpu::Limits> {
        let mut limits = match self.config.limits {
            LimitsPreset::Default => wgpu::Limits::default(),
            LimitsPreset::Downlevel => wgpu::Limits::downlevel_defaults(),
            LimitsPreset::DownlevelWebgl2 => wgpu::Limits::downlevel_webgl2_defaults(),
        };
        if let Some(size) = self.config.max_storage_buffer_binding_size {
            limits.max_storage_buffer_binding_size = size;
        }
        if !limits.check_limits(&adapter.limits()) {
            return Err(EngineError::initialization(
                ENGINE_NAME,
                "adapter does not satisfy the requested limits",
            ));
        }
        Ok(limits)
    }

    async fn open_device(&self) -> Result<GpuContext> {
        let instance = Self::instance();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: power_preference(self.config.power_preference),
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| EngineError::initialization(ENGINE_NAME, "no compatible adapter"))?;

        let required_features = parse_features(&self.config.required_features)?;
        let missing = required_features - adapter.features();
        if !missing.is_empty() {
            return Err(EngineError::initialization(
                ENGINE_NAME,
                format!("adapter lacks features {:?}", missing),
            ));
        }
        let required_limits = self.limits(&adapter)?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("engine-router"),
                    required_features,
                    required_limits,
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| EngineError::initialization(ENGINE_NAME, e))?;

        device.on_uncaptured_error(Box::new(|e: wgpu::Error| {
            tracing::error!("uncaptured gpu error: {}", e);
        }));

        let adapter_info = adapter.get_info();
        tracing::info!(
            "gpu adapter: {} ({:?}, {:?})",
            adapter_info.name,
            adapter_info.backend,
            adapter_info.device_type
        );

        Ok(GpuContext { adapter_info, device, queue, models: Mutex::new(HashMap::new()) })
    }

    async fn build_model(&self, ctx: &GpuContext, handle: &ModelHandle) -> Result<GpuModel> {
        let device = &ctx.device;
        let source = handle.shader.as_deref().unwrap_or(DEFAULT_SHADER);
        let weights = handle.weights_f32();
        // Zero-sized bindings are invalid; an empty model still gets one padding element.
        let contents: &[f32] = if weights.is_empty() { &[0.0] } else { &weights };

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&handle.id),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&handle.id),
            layout: None,
            module: &module,
            entry_point: "main",
            compilation_options: Default::default(),
            cache: None,
        });
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("weights"),
            contents: bytemuck::cast_slice(contents),
            usage: wgpu::BufferUsages::STORAGE,
        });
        if let Some(error) = device.pop_error_scope().await {
            buffer.destroy();
            return Err(EngineError::model_load(ENGINE_NAME, error));
        }

        Ok(GpuModel {
            pipeline,
            weights: buffer,
            weight_count: weights.len() as u32,
            output_size: handle.output_size,
        })
    }
}

fn power_preference(preference: PowerPreference) -> wgpu::PowerPreference {
    match preference {
        PowerPreference::None => wgpu::PowerPreference::None,
        PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
        PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
    }
}

// Accepts wgpu flag names in any case, with `-` or `_` separators.
pub fn parse_features(names: &[String]) -> Result<wgpu::Features> {
    names.iter().try_fold(wgpu::Features::empty(), |acc, name| {
        let flag = name.trim().to_uppercase().replace('-', "_");
        wgpu::Features::from_name(&flag)
            .map(|f| acc | f)
            .ok_or_else(|| EngineError::config(format!("unknown gpu feature: {}", name)))
    })
}

// One invocation per input element, widened when the output is longer.
pub fn workgroup_count(input_len: usize, output_len: usize) -> u32 {
    let invocations = input_len.max(output_len).max(1) as u32;
    invocations.div_ceil(WORKGROUP_SIZE)
}

fn dispatch(ctx: &GpuContext, model: &GpuModel, input: &[f32], temperature: f32) -> std::result::Result<Vec<f32>, String> {
    let output_len = model.output_size;
    if output_len == 0 {
        return Ok(Vec::new());
    }
    let device = &ctx.device;
    let input_size = (input.len().max(1) * 4) as u64;
    let output_size = (output_len * 4) as u64;

    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let input_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("input"),
        size: input_size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    if !input.is_empty() {
        ctx.queue.write_buffer(&input_buffer, 0, bytemuck::cast_slice(input));
    }
    let output_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("output"),
        size: output_size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging"),
        size: output_size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let params: [u32; 4] = [
        output_len as u32,
        model.weight_count,
        input.len() as u32,
        crate::kernel::effective_temperature(temperature).to_bits(),
    ];
    let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("params"),
        contents: bytemuck::cast_slice(&params),
        usage: wgpu::BufferUsages::UNIFORM,
    });

    let layout = model.pipeline.get_bind_group_layout(0);
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("inference"),
        layout: &layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: input_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: output_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: model.weights.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: params_buffer.as_entire_binding() },
        ],
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("inference"),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("inference"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&model.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(workgroup_count(input.len(), output_len), 1, 1);
    }
    encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging, 0, output_size);
    let commands = encoder.finish();

    let buffers = [&input_buffer, &output_buffer, &staging, &params_buffer];
    let release = || buffers.iter().for_each(|b| b.destroy());

    if let Some(error) = futures::executor::block_on(device.pop_error_scope()) {
        release();
        return Err(error.to_string());
    }

    ctx.queue.submit(Some(commands));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    let _ = device.poll(wgpu::Maintain::Wait);

    let mapped = match rx.recv() {
        Ok(Ok(())) => {
            let view = slice.get_mapped_range();
            let data: Vec<f32> = view
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            drop(view);
            staging.unmap();
            Ok(data)
        }
        Ok(Err(e)) => Err(format!("buffer map failed: {}", e)),
        Err(_) => Err("device lost before readback".to_string()),
    };
    release();
    mapped
}

#[async_trait]
impl Engine for GpuEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn capabilities(&self) -> CapabilitySet {
        self.core.capabilities()
    }

    fn probe_support(&self) -> bool {
        !Self::instance().enumerate_adapters(wgpu::Backends::all()).is_empty()
    }

    fn is_initialized(&self) -> bool {
        self.core.is_initialized()
    }

    async fn initialize(&self) -> Result<()> {
        self.core
            .initialize_with(|| async {
                let context = self.open_device().await?;
                *self.context.lock() = Some(Arc::new(context));
                Ok(())
            })
            .await
    }

    async fn load_model(&self, handle: ModelHandle) -> Result<ModelRef> {
        self.core.validate_handle(&handle)?;
        let start = Instant::now();

        let result = match self.context() {
            Ok(ctx) => self.build_model(&ctx, &handle).await.map(|model| (ctx, model)),
            Err(e) => Err(e),
        };
        match result {
            Ok((ctx, model)) => {
                if let Some(previous) = ctx.models.lock().insert(handle.id.clone(), Arc::new(model)) {
                    previous.weights.destroy();
                }
                Ok(self.core.model_loaded(&handle, start.elapsed()))
            }
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
            .track(model, input.len(), async {
                self.core.ensure_owned(model)?;
                let ctx = self.context()?;
                let gpu_model = ctx
                    .models
                    .lock()
                    .get(&model.id)
                    .cloned()
                    .ok_or_else(|| EngineError::model_not_found(ENGINE_NAME, &model.id))?;
                let input = input.to_vec();
                let temperature = options.temperature;

                let data = tokio::task::spawn_blocking(move || dispatch(&ctx, &gpu_model, &input, temperature))
                    .await
                    .map_err(|e| EngineError::inference(ENGINE_NAME, e))?
                    .map_err(|e| EngineError::inference(ENGINE_NAME, e))?;
                Ok(InferenceOutput::new(ENGINE_NAME, data))
            })
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
                if let Some(ctx) = self.context.lock().take() {
                    for (_, model) in ctx.models.lock().drain() {
                        model.weights.destroy();
                    }
                    ctx.device.destroy();
                    tracing::debug!("gpu device {} destroyed", ctx.adapter_info.name);
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> GpuEngine {
        GpuEngine::new(GpuConfig::default(), EventBus::shared())
    }

    fn model_ref() -> ModelRef {
        ModelRef {
            id: "m".into(),
            name: "m".into(),
            output_size: 4,
            engine: ENGINE_NAME.into(),
            load_time: std::time::Duration::ZERO,
        }
    }

    #[test]
    fn test_workgroup_count() {
        assert_eq!(workgroup_count(0, 0), 1);
        assert_eq!(workgroup_count(64, 1), 1);
        assert_eq!(workgroup_count(65, 1), 2);
        assert_eq!(workgroup_count(10, 200), 4);
    }

    #[test]
    fn test_parse_features() {
        let features = parse_features(&["shader-f16".into(), "TIMESTAMP_QUERY".into()]).unwrap();
        assert!(features.contains(wgpu::Features::SHADER_F16));
        assert!(features.contains(wgpu::Features::TIMESTAMP_QUERY));
        assert!(parse_features(&[]).unwrap().is_empty());
        assert!(matches!(
            parse_features(&["warp-drive".into()]),
            Err(EngineError::Config { .. })
        ));
    }

    #[test]
    fn test_stream_is_rejected_synchronously() {
        let engine = engine();
        let err = engine.stream(&model_ref(), &[1.0], &ExecuteOptions::default()).err().unwrap();
        assert!(matches!(err, EngineError::UnsupportedCapability { .. }));
        assert_eq!(engine.metrics().total_inferences, 0);
    }

    #[tokio::test]
    async fn test_execute_without_device_fails_cleanly() {
        let engine = engine();
        let err = engine.execute(&model_ref(), &[1.0], &ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotInitialized { .. }));
        assert!(engine.adapter_info().is_none());
    }

    #[tokio::test]
    async fn test_roundtrip_when_adapter_present() {
        let engine = engine();
        if let Err(e) = engine.initialize().await {
            assert!(matches!(e, EngineError::Initialization { .. }));
            return;
        }
        let weights = crate::kernel::synthesize_weights(5, 48);
        let model = engine
            .load_model(ModelHandle::from_f32("proj", &weights, 100))
            .await
            .unwrap();
        let input = [1.0, -0.5, 0.25];
        let output = engine.execute(&model, &input, &ExecuteOptions::default()).await.unwrap();
        let expected = crate::kernel::forward(&weights, &input, 100, 1.0);
        assert_eq!(output.len(), 100);
        for (a, b) in output.data.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-3);
        }

        engine.cleanup().await.unwrap();
        let err = engine.execute(&model, &input, &ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotInitialized { .. }));
        assert_eq!(engine.capabilities(), CAPABILITIES);
    }

    #[tokio::test]
    async fn test_invalid_shader_is_a_load_error() {
        let engine = engine();
        if engine.initialize().await.is_err() {
            return;
        }
        let handle = ModelHandle::from_f32("broken", &[1.0], 1).with_shader("fn main( {");
        let err = engine.load_model(handle).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelLoad { .. }));
        engine.cleanup().await.unwrap();
    }
}
