//! Configuration
//!
//! Layered configuration in priority order: environment variables, then the
//! TOML config file, then built-in defaults. The file lives at
//! `$XDG_CONFIG_HOME/chorus/chorus.toml`; a missing file just means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::registry::RegistrySettings;
use crate::worker::WorkerSettings;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file exists but could not be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Config file is not valid TOML
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config parsed but the values are unusable
    #[error("invalid configuration: {0}")]
    Validation(String),
}

// ============================================================================
// TOML Shapes
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChorusToml {
    system_prompt: Option<String>,
    default_model: Option<String>,
    bot_name: Option<String>,
    data_dir: Option<PathBuf>,
    backends: Vec<BackendToml>,
    pool: PoolToml,
    context: ContextToml,
    registry: RegistryToml,
}

#[derive(Debug, Deserialize)]
struct BackendToml {
    id: String,
    base_url: String,
    model: Option<String>,
    slots: Option<usize>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PoolToml {
    retry_interval_ms: Option<u64>,
    lease_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContextToml {
    window: Option<u32>,
    summarise_idle_pct: Option<f64>,
    summarise_always_pct: Option<f64>,
    hard_clear_pct: Option<f64>,
    buried_tool_depth: Option<usize>,
    max_steps: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegistryToml {
    idle_timeout_secs: Option<u64>,
}

// ============================================================================
// Resolved Configuration
// ============================================================================

/// One configured backend
#[derive(Clone, Debug)]
pub struct BackendSettings {
    /// Unique backend ID
    pub id: String,
    /// Base URL of the OpenAI-compatible server
    pub base_url: String,
    /// Model served there
    pub model: String,
    /// Concurrent generation slots
    pub slots: usize,
    /// Bearer token, if the server wants one
    pub api_key: Option<String>,
}

/// Fully resolved configuration
#[derive(Clone, Debug)]
pub struct ChorusConfig {
    /// Deployed system prompt for new conversations
    pub system_prompt: String,
    /// Model requested when leasing backend capacity
    pub default_model: String,
    /// Name whose mention raises engagement chances
    pub bot_name: String,
    /// Where transcripts are persisted
    pub data_dir: PathBuf,
    /// Backend fleet, in preference order
    pub backends: Vec<BackendSettings>,
    /// Pause between slot-acquisition passes
    pub retry_interval: Duration,
    /// How long a generation waits for a free slot
    pub lease_timeout: Duration,
    /// Worker loop tuning
    pub worker: WorkerSettings,
    /// Registry tuning
    pub registry: RegistrySettings,
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are chorus, a concise assistant in a shared chat room. \
                Keep replies short and useful."
                .to_string(),
            default_model: "llama3".to_string(),
            bot_name: "chorus".to_string(),
            data_dir: dirs::data_dir()
                .map_or_else(|| PathBuf::from("chorus-data"), |d| d.join("chorus")),
            backends: Vec::new(),
            retry_interval: Duration::from_millis(250), // pause between acquisition passes
            lease_timeout: Duration::from_secs(30),     // wait this long for a slot
            worker: WorkerSettings::default(),
            registry: RegistrySettings::default(),
        }
    }
}

impl ChorusConfig {
    /// Standard config file location, if a config dir exists
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chorus").join("chorus.toml"))
    }

    /// Load configuration from `path` (or the standard location), apply
    /// environment overrides, and validate
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(Self::default_path, |p| Some(p.to_path_buf()));

        let toml = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
                tracing::info!(path = %path.display(), "loaded config file");
                toml::from_str(&raw)?
            }
            _ => ChorusToml::default(),
        };

        let mut config = Self::from_toml(toml);
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string directly (tests, embedding)
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let toml: ChorusToml = toml::from_str(raw)?;
        let config = Self::from_toml(toml);
        config.validate()?;
        Ok(config)
    }

    fn from_toml(toml: ChorusToml) -> Self {
        let defaults = Self::default();
        let default_model = toml.default_model.unwrap_or(defaults.default_model);

        let backends = toml
            .backends
            .into_iter()
            .map(|b| BackendSettings {
                id: b.id,
                base_url: b.base_url,
                model: b.model.clone().unwrap_or_else(|| default_model.clone()),
                slots: b.slots.unwrap_or(1),
                api_key: b.api_key,
            })
            .collect();

        let worker_defaults = WorkerSettings::default();
        let worker = WorkerSettings {
            context_window: toml.context.window.unwrap_or(worker_defaults.context_window),
            summarise_idle_pct: toml
                .context
                .summarise_idle_pct
                .unwrap_or(worker_defaults.summarise_idle_pct),
            summarise_always_pct: toml
                .context
                .summarise_always_pct
                .unwrap_or(worker_defaults.summarise_always_pct),
            hard_clear_pct: toml
                .context
                .hard_clear_pct
                .unwrap_or(worker_defaults.hard_clear_pct),
            buried_tool_depth: toml
                .context
                .buried_tool_depth
                .unwrap_or(worker_defaults.buried_tool_depth),
            max_steps: toml.context.max_steps.unwrap_or(worker_defaults.max_steps),
        };

        Self {
            system_prompt: toml.system_prompt.unwrap_or(defaults.system_prompt),
            default_model,
            bot_name: toml.bot_name.unwrap_or(defaults.bot_name),
            data_dir: toml.data_dir.unwrap_or(defaults.data_dir),
            backends,
            retry_interval: toml
                .pool
                .retry_interval_ms
                .map_or(defaults.retry_interval, Duration::from_millis),
            lease_timeout: toml
                .pool
                .lease_timeout_ms
                .map_or(defaults.lease_timeout, Duration::from_millis),
            worker,
            registry: RegistrySettings {
                idle_timeout: toml
                    .registry
                    .idle_timeout_secs
                    .map_or(defaults.registry.idle_timeout, Duration::from_secs),
            },
        }
    }

    fn apply_env(&mut self) {
        if let Ok(prompt) = std::env::var("CHORUS_SYSTEM_PROMPT") {
            self.system_prompt = prompt;
        }
        if let Ok(model) = std::env::var("CHORUS_DEFAULT_MODEL") {
            self.default_model = model;
        }
        if let Ok(dir) = std::env::var("CHORUS_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.context_window == 0 {
            return Err(ConfigError::Validation(
                "context window must be positive".to_string(),
            ));
        }

        let w = &self.worker;
        let ordered = 0.0 < w.summarise_idle_pct
            && w.summarise_idle_pct <= w.summarise_always_pct
            && w.summarise_always_pct <= w.hard_clear_pct
            && w.hard_clear_pct <= 1.0;
        if !ordered {
            return Err(ConfigError::Validation(format!(
                "context thresholds must satisfy 0 < idle <= always <= hard-clear <= 1 \
                 (got {} / {} / {})",
                w.summarise_idle_pct, w.summarise_always_pct, w.hard_clear_pct
            )));
        }

        for backend in &self.backends {
            if backend.slots == 0 {
                return Err(ConfigError::Validation(format!(
                    "backend '{}' must have at least one slot",
                    backend.id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = ChorusConfig::from_toml_str("").unwrap();
        assert_eq!(config.bot_name, "chorus");
        assert_eq!(config.worker.context_window, 8192);
        assert_eq!(config.worker.summarise_idle_pct, 0.5);
        assert!(config.backends.is_empty());
    }

    #[test]
    fn full_toml_is_honored() {
        let raw = r#"
            system_prompt = "be terse"
            default_model = "mistral"
            bot_name = "robo"

            [[backends]]
            id = "local"
            base_url = "http://localhost:8080"
            slots = 3

            [[backends]]
            id = "remote"
            base_url = "https://llm.example.com"
            model = "qwen"
            api_key = "secret"

            [pool]
            retry_interval_ms = 100
            lease_timeout_ms = 5000

            [context]
            window = 4096
            summarise_idle_pct = 0.4
            summarise_always_pct = 0.6
            hard_clear_pct = 0.8
            max_steps = 6

            [registry]
            idle_timeout_secs = 600
        "#;
        let config = ChorusConfig::from_toml_str(raw).unwrap();

        assert_eq!(config.system_prompt, "be terse");
        assert_eq!(config.backends.len(), 2);
        // Backend without an explicit model inherits the default.
        assert_eq!(config.backends[0].model, "mistral");
        assert_eq!(config.backends[0].slots, 3);
        assert_eq!(config.backends[1].model, "qwen");
        assert_eq!(config.backends[1].slots, 1);
        assert_eq!(config.lease_timeout, Duration::from_secs(5));
        assert_eq!(config.worker.context_window, 4096);
        assert_eq!(config.worker.max_steps, 6);
        assert_eq!(config.registry.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn misordered_thresholds_are_rejected() {
        let raw = r#"
            [context]
            summarise_idle_pct = 0.8
            summarise_always_pct = 0.6
        "#;
        let err = ChorusConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn zero_slot_backend_is_rejected() {
        let raw = r#"
            [[backends]]
            id = "bad"
            base_url = "http://localhost:8080"
            slots = 0
        "#;
        let err = ChorusConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn broken_toml_is_a_parse_error() {
        let err = ChorusConfig::from_toml_str("backends = 7").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChorusConfig::load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(config.bot_name, "chorus");
    }

    #[test]
    fn config_file_is_loaded_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chorus.toml");
        std::fs::write(&path, "bot_name = \"from-file\"").unwrap();

        let config = ChorusConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bot_name, "from-file");
    }
}
