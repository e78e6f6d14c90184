//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.hyphae/config.toml` (user)
//! 3. `/etc/hyphae/config.toml` (system)
//!
//! Every section is optional; missing sections and fields take their
//! defaults. API keys are never stored in the file, only the name of the
//! environment variable holding them.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionConfig;
use crate::alerts::AlertsConfig;
use crate::cache::{CacheConfig, CachePolicy};
use crate::dedup::DedupConfig;
use crate::fallback::FallbackConfig;
use crate::health::HealthConfig;
use crate::registry::PricingConfig;
use crate::resilience::{CircuitConfig, RetryPolicies};
use crate::usage::AccountingConfig;
use crate::{HyphaeError, Result};

/// Full orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub admission: AdmissionConfig,
    pub cache: CacheConfig,
    pub cache_policy: CachePolicy,
    pub dedup: DedupConfig,
    pub health: HealthConfig,
    pub retry: RetryPolicies,
    pub circuit: CircuitConfig,
    pub fallback: FallbackConfig,
    pub pricing: PricingConfig,
    pub accounting: AccountingConfig,
    pub alerts: AlertsConfig,
    /// OpenAI-compatible endpoints, matched by model-id prefix.
    pub providers: Vec<ProviderEntry>,
}

/// Shared state backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `memory` or `redis` (needs the `redis` feature).
    pub backend: String,
    /// Connection URL for networked backends.
    pub url: Option<String>,
    /// Capacity of the in-process store.
    pub max_entries: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            url: None,
            max_entries: 100_000,
        }
    }
}

/// One OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Model-id prefix routed here (`openai` for `openai/gpt-4o`), or `*`
    /// for the default provider.
    pub prefix: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Send full catalog ids upstream (OpenRouter and similar gateways).
    #[serde(default)]
    pub keep_model_prefix: bool,
}

impl ProviderEntry {
    /// The API key from the configured environment variable, or empty.
    pub fn api_key(&self) -> String {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_default()
    }
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// An explicit path must exist. Without one, the first existing file
    /// among the user and system locations is used, and if neither exists
    /// the defaults are returned.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            HyphaeError::Configuration(format!("failed to read config file {path:?}: {e}"))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            HyphaeError::Configuration(msg) => {
                HyphaeError::Configuration(format!("{path:?}: {msg}"))
            }
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| HyphaeError::Configuration(format!("failed to parse config: {e}")))
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(HyphaeError::Configuration(format!(
                "config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".hyphae").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        let system_config = PathBuf::from("/etc/hyphae/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }
}
