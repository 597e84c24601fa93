pub mod registry;
pub mod scoring;

pub use registry::{EngineCandidate, EngineFactory, EngineRegistry};
pub use scoring::{best_model, rank_models, FnScorer, ModelCandidate, ModelScorer, WeightedScorer};

use crate::app::events::EventBus;
use crate::core::{CapabilitySet, Engine, EngineDescriptor, EngineError, Result};
use crate::envconfig::{RuntimeConfig, SelectorProfile};
use once_cell::sync::OnceCell;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionCriteria {
    pub require: CapabilitySet,
}

impl SelectionCriteria {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn requiring(require: CapabilitySet) -> Self {
        Self { require }
    }
}

#[derive(Clone)]
pub struct DiscoveredEngine {
    pub descriptor: EngineDescriptor,
    pub engine: Arc<dyn Engine>,
}

// Owns one instance per candidate engine. Discovery runs once, on first use.
pub struct EngineSelector {
    registry: EngineRegistry,
    config: RuntimeConfig,
    events: Arc<EventBus>,
    discovered: OnceCell<Vec<DiscoveredEngine>>,
}

impl EngineSelector {
    pub fn new(registry: EngineRegistry, config: RuntimeConfig, events: Arc<EventBus>) -> Self {
        Self { registry, config, events, discovered: OnceCell::new() }
    }

    pub fn with_defaults(config: RuntimeConfig, events: Arc<EventBus>) -> Self {
        Self::new(EngineRegistry::default(), config, events)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn candidates(&self) -> Vec<EngineCandidate> {
        match &self.config.selector.profile {
            SelectorProfile::Full => self.registry.candidates(),
            SelectorProfile::Constrained(names) => {
                let mut picked: Vec<EngineCandidate> = Vec::new();
                for name in names {
                    match self.registry.get(name) {
                        Some(candidate) if !picked.iter().any(|c| c.name == candidate.name) => {
                            picked.push(candidate)
                        }
                        Some(_) => {}
                        None => tracing::warn!("constrained profile names unknown engine {}", name),
                    }
                }
                picked.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
                picked
            }
        }
    }

    pub fn discover(&self) -> &[DiscoveredEngine] {
        self.discovered.get_or_init(|| {
            self.candidates()
                .into_iter()
                .map(|candidate| {
                    let engine = (candidate.factory)(&self.config, &self.events);
                    let supported = engine.probe_support();
                    tracing::debug!(
                        "discovered {} (priority {}, supported={})",
                        candidate.name,
                        candidate.priority,
                        supported
                    );
                    DiscoveredEngine {
                        descriptor: EngineDescriptor {
                            name: candidate.name,
                            priority: candidate.priority,
                            supported,
                            capabilities: engine.capabilities(),
                        },
                        engine,
                    }
                })
                .collect()
        })
    }

    pub fn descriptors(&self) -> Vec<EngineDescriptor> {
        self.discover().iter().map(|d| d.descriptor.clone()).collect()
    }

    pub fn list_available(&self) -> Vec<String> {
        self.discover()
            .iter()
            .filter(|d| d.descriptor.supported)
            .map(|d| d.descriptor.name.clone())
            .collect()
    }

    // Highest-priority supported engine meeting the criteria. Unsupported engines are never returned.
    pub fn get_best(&self, criteria: &SelectionCriteria) -> Result<Arc<dyn Engine>> {
        self.discover()
            .iter()
            .find(|d| d.descriptor.supported && d.descriptor.capabilities.satisfies(&criteria.require))
            .map(|d| Arc::clone(&d.engine))
            .ok_or_else(|| {
                let required = criteria.require.names();
                let message = if required.is_empty() {
                    format!("none of {} candidate engines is supported", self.discover().len())
                } else {
                    format!("no supported engine provides {}", required.join(", "))
                };
                EngineError::NoEngineAvailable { message }
            })
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn Engine>> {
        let canonical = self.registry.resolve(name).unwrap_or_else(|| name.to_string());
        self.discover()
            .iter()
            .find(|d| d.descriptor.name == canonical && d.descriptor.supported)
            .map(|d| Arc::clone(&d.engine))
            .ok_or_else(|| EngineError::EngineNotSupported { name: name.to_string() })
    }

    // Engines that were never initialized are skipped; failures are logged and the first is returned.
    pub async fn cleanup_all(&self) -> Result<()> {
        let mut first_error = None;
        for discovered in self.discover() {
            if !discovered.engine.is_initialized() {
                continue;
            }
            if let Err(e) = discovered.engine.cleanup().await {
                tracing::warn!("cleanup of {} failed: {}", discovered.descriptor.name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
