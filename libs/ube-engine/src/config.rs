use std::collections::HashMap;

use serde::Deserialize;
use ube_api::Mandate;

use crate::action::ActionOption;
use crate::error::EngineError;

/// Pipeline configuration, parsed from TOML.
///
/// ```toml
/// [republish]
/// max_attempts = 3
///
/// [actions.persister]
/// batch_size = 2
/// mandate = "stop_and_retry"
/// skip = ["DeleteProduct"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// Per-action overrides keyed by lower-cased action name.
    #[serde(default)]
    pub actions: HashMap<String, ActionSettings>,

    /// Retry protocol; absent means no republishing.
    #[serde(default)]
    pub republish: Option<RepublishConfig>,
}

/// Overrides of one action's defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ActionSettings {
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub mandate: Option<Mandate>,
    #[serde(default)]
    pub skip: Vec<String>,
}

impl ActionSettings {
    pub fn options(&self) -> Vec<ActionOption> {
        let mut options = Vec::new();
        if let Some(n) = self.batch_size {
            options.push(ActionOption::BatchSize(n));
        }
        if self.is_async {
            options.push(ActionOption::Async);
        }
        if self.critical {
            options.push(ActionOption::Critical);
        }
        if let Some(m) = self.mandate {
            options.push(ActionOption::FailureMandate(m));
        }
        if !self.skip.is_empty() {
            options.push(ActionOption::Skip(self.skip.clone()));
        }
        options
    }
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RepublishConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RepublishConfig {
    fn default() -> Self {
        Self { max_attempts: default_max_attempts() }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot reject on its own.
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(republish) = &self.republish {
            if republish.max_attempts == 0 {
                return Err(EngineError::Config("republish.max_attempts must be at least 1".into()));
            }
        }
        Ok(())
    }

    /// Options for the action called `name` (case-insensitive).
    pub fn options_for(&self, name: &str) -> Vec<ActionOption> {
        self.actions
            .get(&name.to_lowercase())
            .map(ActionSettings::options)
            .unwrap_or_default()
    }
}
