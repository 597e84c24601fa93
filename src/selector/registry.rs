use crate::app::events::EventBus;
use crate::core::Engine;
use crate::engines::edge::{EdgeEngine, PlatformBindings};
use crate::engines::gpu::GpuEngine;
use crate::engines::sandbox::SandboxEngine;
use crate::engines::worker::WorkerEngine;
use crate::envconfig::RuntimeConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub type EngineFactory = Arc<dyn Fn(&RuntimeConfig, &Arc<EventBus>) -> Arc<dyn Engine> + Send + Sync>;

#[derive(Clone)]
pub struct EngineCandidate {
    pub name: String,
    pub priority: i32,
    pub factory: EngineFactory,
}

pub struct EngineRegistry {
    candidates: RwLock<HashMap<String, EngineCandidate>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            candidates: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
        }
    }

    // Built-in engines in discovery order: gpu, native, sandbox, worker, edge.
    pub fn with_defaults(bindings: PlatformBindings) -> Self {
        let registry = Self::new();
        registry.register("gpu", 100, |config, events| {
            Arc::new(GpuEngine::new(config.gpu.clone(), Arc::clone(events)))
        });
        registry.register("native", 90, |config, events| {
            Arc::new(WorkerEngine::native(config.native.clone(), Arc::clone(events)))
        });
        registry.register("sandbox", 80, |config, events| {
            Arc::new(SandboxEngine::new(config.sandbox.clone(), Arc::clone(events)))
        });
        registry.register("worker", 70, |config, events| {
            Arc::new(WorkerEngine::worker(config.worker.clone(), Arc::clone(events)))
        });
        registry.register("edge", 10, move |config, events| {
            Arc::new(EdgeEngine::new(config.edge.clone(), bindings.clone(), Arc::clone(events)))
        });

        registry.register_alias("webgpu", "gpu");
        registry.register_alias("threads", "native");
        registry.register_alias("wasm", "sandbox");
        registry.register_alias("pool", "worker");
        registry
    }

    pub fn register<N, F>(&self, name: N, priority: i32, factory: F)
    where
        N: Into<String>,
        F: Fn(&RuntimeConfig, &Arc<EventBus>) -> Arc<dyn Engine> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory = Arc::new(factory) as EngineFactory;
        self.candidates
            .write()
            .insert(name.clone(), EngineCandidate { name, priority, factory });
    }

    pub fn register_alias<A, T>(&self, alias: A, target: T)
    where
        A: Into<String>,
        T: Into<String>,
    {
        self.aliases.write().insert(alias.into(), target.into());
    }

    // Canonical name for `name`, following one alias hop.
    pub fn resolve(&self, name: &str) -> Option<String> {
        if self.candidates.read().contains_key(name) {
            return Some(name.to_string());
        }
        let target = self.aliases.read().get(name).cloned()?;
        self.candidates.read().contains_key(&target).then_some(target)
    }

    pub fn get(&self, name: &str) -> Option<EngineCandidate> {
        let name = self.resolve(name)?;
        self.candidates.read().get(&name).cloned()
    }

    // Highest priority first; equal priorities fall back to name order.
    pub fn candidates(&self) -> Vec<EngineCandidate> {
        let mut all: Vec<EngineCandidate> = self.candidates.read().values().cloned().collect();
        all.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        all
    }

    pub fn names(&self) -> Vec<String> {
        self.candidates().into_iter().map(|c| c.name).collect()
    }

    pub fn clear(&self) {
        self.candidates.write().clear();
        self.aliases.write().clear();
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_defaults(PlatformBindings::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_order() {
        let registry = EngineRegistry::default();
        assert_eq!(registry.names(), vec!["gpu", "native", "sandbox", "worker", "edge"]);
    }

    #[test]
    fn test_aliases() {
        let registry = EngineRegistry::default();
        assert_eq!(registry.resolve("wasm").as_deref(), Some("sandbox"));
        assert_eq!(registry.get("webgpu").map(|c| c.priority), Some(100));
        assert!(registry.resolve("cuda").is_none());

        registry.register_alias("dangling", "missing");
        assert!(registry.resolve("dangling").is_none());
    }

    #[test]
    fn test_factory_builds_named_engine() {
        let registry = EngineRegistry::default();
        let events = EventBus::shared();
        let candidate = registry.get("sandbox").unwrap();
        let engine = (candidate.factory)(&RuntimeConfig::default(), &events);
        assert_eq!(engine.name(), "sandbox");
        assert!(!engine.is_initialized());
    }

    #[test]
    fn test_clear() {
        let registry = EngineRegistry::default();
        registry.clear();
        assert!(registry.names().is_empty());
        assert!(registry.resolve("wasm").is_none());
    }
}
