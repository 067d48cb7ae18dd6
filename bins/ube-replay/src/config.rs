use serde::Deserialize;
use ube_engine::{EngineError, PipelineConfig};
use ube_memory::MemoryBlobConfig;

use crate::model::{Product, Store};

/// Replay configuration, parsed from TOML.
///
/// ```toml
/// batch_size = 10
/// max_rounds = 5
///
/// [blob]
/// bucket = "catalogue"
///
/// [[stores]]
/// id = "s1"
/// city = "Lyon"
///
/// [pipeline.republish]
/// max_attempts = 3
///
/// [pipeline.actions.persister]
/// mandate = "stop_and_retry"
///
/// [faults]
/// save_calls = [1]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// Inbound messages handed to one pipeline invocation.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Redelivery rounds fed back from the retry queue after the first pass.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    #[serde(default)]
    pub blob: MemoryBlobConfig,

    /// Stores available to sub-entity enrichment.
    #[serde(default)]
    pub stores: Vec<Store>,

    /// Products already persisted before the replay starts.
    #[serde(default)]
    pub products: Vec<Product>,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub faults: FaultConfig,
}

fn default_batch_size() -> usize {
    10
}

fn default_max_rounds() -> usize {
    5
}

/// Calls (numbered from 1) of the in-memory adapters that fail.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FaultConfig {
    #[serde(default)]
    pub save_calls: Vec<usize>,
    #[serde(default)]
    pub publish_calls: Vec<usize>,
    #[serde(default)]
    pub upload_keys: Vec<String>,
}

impl ReplayConfig {
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))?;
        if config.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be at least 1".into()));
        }
        config.pipeline.validate()?;
        Ok(config)
    }
}
