use anyhow::{Context, Result};
use engine_router::discover::{self, format_bytes};
use engine_router::kernel;
use engine_router::{
    Engine, EngineSelector, EventBus, ExecuteOptions, LoggingHandler, ModelHandle, RuntimeConfig,
    SelectionCriteria,
};
use std::path::Path;
use std::sync::Arc;

pub struct RunArgs {
    pub engine: String,
    pub input: Vec<f32>,
    pub output_size: usize,
    pub temperature: f32,
    pub stream: bool,
    pub max_tokens: usize,
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(RuntimeConfig::from_env()?),
    }
}

fn selector(config: RuntimeConfig) -> EngineSelector {
    let events = EventBus::shared();
    events.subscribe(LoggingHandler);
    EngineSelector::with_defaults(config, events)
}

pub async fn engines(config: Option<&Path>) -> Result<()> {
    let selector = selector(load_config(config)?);

    println!("{:<10} {:>8} {:<10} CAPABILITIES", "NAME", "PRIORITY", "SUPPORTED");
    for descriptor in selector.descriptors() {
        println!(
            "{:<10} {:>8} {:<10} {}",
            descriptor.name,
            descriptor.priority,
            if descriptor.supported { "yes" } else { "no" },
            descriptor.capabilities.names().join(",")
        );
    }
    Ok(())
}

pub async fn hardware() -> Result<()> {
    let info = discover::host_info();
    println!("CPU: {}", info.cpu_model.as_deref().unwrap_or("unknown"));
    println!("  cores:  {}", info.cores);
    println!(
        "  memory: {} total, {} available",
        format_bytes(info.memory.total),
        format_bytes(info.memory.available)
    );

    if info.adapters.is_empty() {
        println!("GPU: no adapters");
    }
    for adapter in &info.adapters {
        println!("GPU: {} ({}, {})", adapter.name, adapter.backend, adapter.device_type);
        println!("  vendor: {:#06x}", adapter.vendor_id);
        if let Some(driver) = &adapter.driver {
            println!("  driver: {}", driver);
        }
    }
    Ok(())
}

pub async fn run(config: Option<&Path>, args: RunArgs) -> Result<()> {
    let selector = selector(load_config(config)?);

    let engine: Arc<dyn Engine> = if args.engine == "best" {
        let mut criteria = SelectionCriteria::any();
        criteria.require.streaming = args.stream;
        selector.get_best(&criteria)?
    } else {
        selector.get_by_name(&args.engine)?
    };
    println!("Using engine {}", engine.name());

    engine
        .initialize()
        .await
        .with_context(|| format!("initializing {}", engine.name()))?;

    let weights = kernel::synthesize_weights(42, args.input.len().max(1) * args.output_size.max(1));
    let model = engine
        .load_model(ModelHandle::from_f32("demo", &weights, args.output_size))
        .await?;

    let options = ExecuteOptions::default()
        .temperature(args.temperature)
        .max_tokens(args.max_tokens);

    if args.stream {
        let mut stream = engine.stream(&model, &args.input, &options)?;
        let mut ids = Vec::new();
        while let Some(token) = stream.next_token().await {
            let token = token?;
            println!("  token {:>3}: id={} logit={:.4}", token.index, token.id, token.logit);
            ids.push(token.id);
        }
        println!("Streamed {} tokens", ids.len());
    } else {
        let output = engine.execute(&model, &args.input, &options).await?;
        println!("Output ({} values, {:?}, cached={}):", output.len(), output.latency, output.cached);
        println!("  {:?}", output.data);
    }

    let metrics = engine.metrics();
    println!(
        "Metrics: {} inferences, {} errors, avg latency {:?}, status {:?}",
        metrics.total_inferences,
        metrics.total_errors,
        metrics.avg_latency,
        engine.status()
    );

    selector.cleanup_all().await?;
    Ok(())
}

pub async fn version() -> Result<()> {
    println!("engine-router version {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
