use crate::core::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub sandbox: SandboxConfig,
    pub gpu: GpuConfig,
    pub native: WorkerConfig,
    pub worker: WorkerConfig,
    pub edge: EdgeConfig,
    pub selector: SelectorConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            gpu: GpuConfig::default(),
            native: WorkerConfig::native(),
            worker: WorkerConfig::default(),
            edge: EdgeConfig::default(),
            selector: SelectorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub initial_pages: u32,
    pub maximum_pages: u32,
    pub fuel_per_call: Option<u64>,
    pub runtime_module: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            initial_pages: 16,
            maximum_pages: 256,
            fuel_per_call: None,
            runtime_module: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    None,
    LowPower,
    HighPerformance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitsPreset {
    Default,
    Downlevel,
    DownlevelWebgl2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub power_preference: PowerPreference,
    pub required_features: Vec<String>,
    pub limits: LimitsPreset,
    pub max_storage_buffer_binding_size: Option<u32>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            power_preference: PowerPreference::HighPerformance,
            required_features: Vec::new(),
            limits: LimitsPreset::Default,
            max_storage_buffer_binding_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    RoundRobin,
    LeastUsed,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_workers: usize,
    pub policy: LoadBalancing,
    pub task_timeout_ms: u64,
    pub retry_budget: u32,
    pub share_weights: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            policy: LoadBalancing::RoundRobin,
            task_timeout_ms: 30_000,
            retry_budget: 2,
            share_weights: false,
        }
    }
}

impl WorkerConfig {
    pub fn native() -> Self {
        Self {
            max_workers: usize::MAX,
            policy: LoadBalancing::LeastUsed,
            share_weights: true,
            ..Self::default()
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    Disabled,
    Memory,
    Platform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub cache_strategy: CacheStrategy,
    pub cache_ttl_secs: u64,
    pub region: Option<String>,
    pub max_memory_bytes: u64,
    pub max_execution_ms: u64,
    pub max_payload_bytes: usize,
    pub tiny_model_params: usize,
    pub persist_models: bool,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            cache_strategy: CacheStrategy::Platform,
            cache_ttl_secs: 300,
            region: None,
            max_memory_bytes: 128 * 1024 * 1024,
            max_execution_ms: 10_000,
            max_payload_bytes: 1024 * 1024,
            tiny_model_params: 4096,
            persist_models: true,
        }
    }
}

impl EdgeConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn max_execution(&self) -> Duration {
        Duration::from_millis(self.max_execution_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorProfile {
    #[default]
    Full,
    Constrained(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    // `profile: full` or `profile: {constrained: [..]}` in YAML, without enum tags.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub profile: SelectorProfile,
}

impl RuntimeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("{}: {}", path.display(), e)))?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content).map_err(EngineError::config)?,
            _ => serde_yaml::from_str(&content).map_err(EngineError::config)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let mut config = match env::var("ENGINE_ROUTER_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(path)?,
                None => Self::default(),
            },
        };

        if let Ok(profile) = env::var("ENGINE_ROUTER_PROFILE") {
            let candidates: Vec<String> = profile
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !candidates.is_empty() {
                config.selector.profile = SelectorProfile::Constrained(candidates);
            }
        }

        if let Ok(workers) = env::var("ENGINE_ROUTER_MAX_WORKERS") {
            if let Ok(n) = workers.parse() {
                config.worker.max_workers = n;
            }
        }

        if let Ok(timeout) = env::var("ENGINE_ROUTER_TASK_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                config.worker.task_timeout_ms = ms;
                config.native.task_timeout_ms = ms;
            }
        }

        if let Ok(pref) = env::var("ENGINE_ROUTER_POWER_PREFERENCE") {
            config.gpu.power_preference = serde_yaml::from_str(&pref).map_err(EngineError::config)?;
        }

        if let Ok(region) = env::var("ENGINE_ROUTER_EDGE_REGION") {
            config.edge.region = Some(region);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sandbox.initial_pages == 0 || self.sandbox.initial_pages > self.sandbox.maximum_pages {
            return Err(EngineError::config(format!(
                "sandbox pages: initial {} must be in 1..={}",
                self.sandbox.initial_pages, self.sandbox.maximum_pages
            )));
        }
        for (name, worker) in [("native", &self.native), ("worker", &self.worker)] {
            if worker.max_workers == 0 {
                return Err(EngineError::config(format!("{}: max_workers must be > 0", name)));
            }
            if worker.task_timeout_ms == 0 {
                return Err(EngineError::config(format!("{}: task_timeout_ms must be > 0", name)));
            }
        }
        if self.edge.max_execution_ms == 0 {
            return Err(EngineError::config("edge: max_execution_ms must be > 0"));
        }
        if let SelectorProfile::Constrained(candidates) = &self.selector.profile {
            if candidates.is_empty() {
                return Err(EngineError::config("selector: constrained profile needs candidates"));
            }
        }
        Ok(())
    }

    // Deterministic setup for CI: no GPU detection, small pools, short timeouts.
    pub fn constrained(candidates: &[&str]) -> Self {
        let mut config = Self::default();
        config.selector.profile =
            SelectorProfile::Constrained(candidates.iter().map(|s| s.to_string()).collect());
        config.native.max_workers = 2;
        config.worker.max_workers = 2;
        config.native.task_timeout_ms = 5_000;
        config.worker.task_timeout_ms = 5_000;
        config
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("engine-router").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.edge.max_memory_bytes, 128 * 1024 * 1024);
        assert_eq!(config.edge.max_execution(), Duration::from_secs(10));
        assert_eq!(config.selector.profile, SelectorProfile::Full);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
sandbox:
  initial_pages: 2
  maximum_pages: 8
worker:
  max_workers: 3
  policy: least_used
gpu:
  power_preference: low-power
selector:
  profile:
    constrained: [sandbox, edge]
"#;
        let config: RuntimeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sandbox.maximum_pages, 8);
        assert_eq!(config.worker.policy, LoadBalancing::LeastUsed);
        assert_eq!(config.worker.retry_budget, 2);
        assert_eq!(config.gpu.power_preference, PowerPreference::LowPower);
        assert_eq!(
            config.selector.profile,
            SelectorProfile::Constrained(vec!["sandbox".into(), "edge".into()])
        );
    }

    #[test]
    fn test_profile_forms() {
        let config: RuntimeConfig = serde_yaml::from_str("selector:\n  profile: full\n").unwrap();
        assert_eq!(config.selector.profile, SelectorProfile::Full);

        let config: RuntimeConfig =
            serde_json::from_str(r#"{"selector": {"profile": {"constrained": ["edge"]}}}"#).unwrap();
        assert_eq!(config.selector.profile, SelectorProfile::Constrained(vec!["edge".into()]));

        let written = serde_yaml::to_string(&RuntimeConfig::constrained(&["worker"])).unwrap();
        let reread: RuntimeConfig = serde_yaml::from_str(&written).unwrap();
        assert_eq!(reread.selector.profile, SelectorProfile::Constrained(vec!["worker".into()]));
    }

    #[test]
    fn test_validation_rejects_bad_pages() {
        let mut config = RuntimeConfig::default();
        config.sandbox.initial_pages = 300;
        assert!(matches!(config.validate(), Err(EngineError::Config { .. })));

        let mut config = RuntimeConfig::default();
        config.worker.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_json() {
        let dir = std::env::temp_dir().join(format!("engine-router-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"edge": {"cache_strategy": "memory", "region": "eu-west"}}"#).unwrap();

        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.edge.cache_strategy, CacheStrategy::Memory);
        assert_eq!(config.edge.region.as_deref(), Some("eu-west"));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
