//! Layered configuration: built-in defaults, user-global TOML, project
//! TOML, then environment variables (highest precedence). Read-only after
//! load.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::TaskLimits;
use crate::policy::PolicyConfig;

/// Credentials and model selection for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Top-level default selections.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub verbose: bool,
}

/// Control-loop limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    pub max_retries: u32,
    pub timeout_minutes: u64,
    pub max_tokens: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_minutes: 30,
            max_tokens: 100_000,
        }
    }
}

/// The fully-resolved configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ForgeConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// A partially-specified layer as read from one TOML file.
#[derive(Debug, Default, Deserialize)]
struct Layer {
    providers: Option<BTreeMap<String, ProviderConfig>>,
    defaults: Option<LayerDefaults>,
    orchestrator: Option<LayerOrchestrator>,
    policy: Option<PolicyConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct LayerDefaults {
    provider: Option<String>,
    model: Option<String>,
    verbose: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LayerOrchestrator {
    max_retries: Option<u32>,
    timeout_minutes: Option<u64>,
    max_tokens: Option<u64>,
}

/// Environment variables recognized at the highest precedence layer.
const ENV_PROVIDERS: &[(&str, &str, &str)] = &[
    ("openai", "OPENAI_API_KEY", "OPENAI_MODEL"),
    ("anthropic", "ANTHROPIC_API_KEY", "ANTHROPIC_MODEL"),
];

impl ForgeConfig {
    /// Load the layered configuration for a project directory:
    /// defaults -> `~/.autoforge/config.toml` -> `<project>/.autoforge.toml`
    /// -> environment.
    pub fn load(project_dir: &Path) -> Self {
        let global = dirs::home_dir().map(|home| home.join(".autoforge").join("config.toml"));
        let mut config = Self::load_files(global.as_deref(), project_dir);
        config.apply_env_from(|key| std::env::var(key).ok());
        config
    }

    /// File layers only, no environment. Exposed for tests.
    pub fn load_files(global: Option<&Path>, project_dir: &Path) -> Self {
        let mut config = Self::default();

        if let Some(global) = global {
            config.merge_file(global);
        }
        config.merge_file(&project_dir.join(".autoforge.toml"));
        config
    }

    fn merge_file(&mut self, path: &Path) {
        if !path.exists() {
            return;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<Layer>(&content) {
                Ok(layer) => {
                    debug!("loaded config layer from {}", path.display());
                    self.apply_layer(layer);
                }
                Err(e) => warn!("ignoring malformed config {}: {e}", path.display()),
            },
            Err(e) => warn!("failed to read config {}: {e}", path.display()),
        }
    }

    fn apply_layer(&mut self, layer: Layer) {
        if let Some(providers) = layer.providers {
            for (name, provider) in providers {
                let entry = self.providers.entry(name).or_default();
                if provider.api_key.is_some() {
                    entry.api_key = provider.api_key;
                }
                if provider.model.is_some() {
                    entry.model = provider.model;
                }
                if provider.base_url.is_some() {
                    entry.base_url = provider.base_url;
                }
            }
        }
        if let Some(defaults) = layer.defaults {
            if defaults.provider.is_some() {
                self.defaults.provider = defaults.provider;
            }
            if defaults.model.is_some() {
                self.defaults.model = defaults.model;
            }
            if let Some(verbose) = defaults.verbose {
                self.defaults.verbose = verbose;
            }
        }
        if let Some(orchestrator) = layer.orchestrator {
            if let Some(max_retries) = orchestrator.max_retries {
                self.orchestrator.max_retries = max_retries;
            }
            if let Some(timeout_minutes) = orchestrator.timeout_minutes {
                self.orchestrator.timeout_minutes = timeout_minutes;
            }
            if let Some(max_tokens) = orchestrator.max_tokens {
                self.orchestrator.max_tokens = max_tokens;
            }
        }
        if let Some(policy) = layer.policy {
            self.policy = policy;
        }
    }

    /// Apply environment overrides through an injectable lookup.
    pub fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        for (provider, key_var, model_var) in ENV_PROVIDERS {
            if let Some(api_key) = get(key_var) {
                let entry = self.providers.entry(provider.to_string()).or_default();
                entry.api_key = Some(api_key);
                if let Some(model) = get(model_var) {
                    entry.model = Some(model);
                }
            }
        }

        if let Some(provider) = get("AUTOFORGE_PROVIDER") {
            self.defaults.provider = Some(provider);
        }
        if let Some(model) = get("AUTOFORGE_MODEL") {
            self.defaults.model = Some(model);
        }
        if matches!(
            get("AUTOFORGE_VERBOSE").as_deref(),
            Some("1") | Some("true") | Some("True")
        ) {
            self.defaults.verbose = true;
        }
    }

    /// Providers that actually carry an API key.
    pub fn available_providers(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|(_, p)| p.api_key.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The explicit default provider, or the first available preferred one.
    pub fn default_provider(&self) -> Option<String> {
        if let Some(provider) = &self.defaults.provider {
            return Some(provider.clone());
        }
        let available = self.available_providers();
        for preferred in ["openai", "anthropic"] {
            if available.iter().any(|a| a == preferred) {
                return Some(preferred.to_string());
            }
        }
        available.into_iter().next()
    }

    /// API key and model for a provider, when configured.
    pub fn provider_credentials(&self, name: &str) -> Option<(String, Option<String>)> {
        let provider = self.providers.get(name)?;
        let api_key = provider.api_key.clone()?;
        let model = provider
            .model
            .clone()
            .or_else(|| self.defaults.model.clone());
        Some((api_key, model))
    }

    pub fn has_any_api_key(&self) -> bool {
        !self.available_providers().is_empty()
    }

    /// Orchestrator limits as task limits.
    pub fn task_limits(&self) -> TaskLimits {
        TaskLimits {
            max_retries: self.orchestrator.max_retries,
            max_duration: Duration::from_secs(self.orchestrator.timeout_minutes * 60),
            max_tokens: self.orchestrator.max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_any_files() {
        let dir = tempdir().unwrap();
        let config = ForgeConfig::load_files(None, dir.path());
        assert_eq!(config.orchestrator.max_retries, 3);
        assert_eq!(config.orchestrator.max_tokens, 100_000);
        assert!(!config.has_any_api_key());
        assert!(config.default_provider().is_none());
    }

    #[test]
    fn test_project_layer_overrides_global() {
        let home = tempdir().unwrap();
        let project = tempdir().unwrap();

        let global = home.path().join("config.toml");
        fs::write(
            &global,
            "[orchestrator]\nmax_retries = 5\nmax_tokens = 50000\n\n[defaults]\nprovider = \"openai\"\n",
        )
        .unwrap();
        fs::write(
            project.path().join(".autoforge.toml"),
            "[orchestrator]\nmax_retries = 2\n",
        )
        .unwrap();

        let config = ForgeConfig::load_files(Some(&global), project.path());
        assert_eq!(config.orchestrator.max_retries, 2, "project wins");
        assert_eq!(config.orchestrator.max_tokens, 50_000, "global survives");
        assert_eq!(config.defaults.provider.as_deref(), Some("openai"));
    }

    #[test]
    fn test_env_layer_has_highest_precedence() {
        let project = tempdir().unwrap();
        fs::write(
            project.path().join(".autoforge.toml"),
            "[defaults]\nprovider = \"anthropic\"\n",
        )
        .unwrap();

        let mut config = ForgeConfig::load_files(None, project.path());
        config.apply_env_from(|key| match key {
            "AUTOFORGE_PROVIDER" => Some("openai".to_string()),
            "OPENAI_API_KEY" => Some("sk-test".to_string()),
            "OPENAI_MODEL" => Some("gpt-test".to_string()),
            "AUTOFORGE_VERBOSE" => Some("1".to_string()),
            _ => None,
        });

        assert_eq!(config.defaults.provider.as_deref(), Some("openai"));
        assert!(config.defaults.verbose);
        let (key, model) = config.provider_credentials("openai").unwrap();
        assert_eq!(key, "sk-test");
        assert_eq!(model.as_deref(), Some("gpt-test"));
    }

    #[test]
    fn test_default_provider_prefers_openai_when_unset() {
        let mut config = ForgeConfig::default();
        config.apply_env_from(|key| match key {
            "ANTHROPIC_API_KEY" => Some("sk-ant".to_string()),
            "OPENAI_API_KEY" => Some("sk-oai".to_string()),
            _ => None,
        });
        assert_eq!(config.default_provider().as_deref(), Some("openai"));
    }

    #[test]
    fn test_malformed_file_is_ignored() {
        let project = tempdir().unwrap();
        fs::write(project.path().join(".autoforge.toml"), "not [valid toml").unwrap();
        let config = ForgeConfig::load_files(None, project.path());
        assert_eq!(config, ForgeConfig::default());
    }

    #[test]
    fn test_task_limits_conversion() {
        let mut config = ForgeConfig::default();
        config.orchestrator.timeout_minutes = 2;
        let limits = config.task_limits();
        assert_eq!(limits.max_duration, Duration::from_secs(120));
        assert_eq!(limits.max_retries, 3);
    }

    #[test]
    fn test_policy_section_roundtrip() {
        let project = tempdir().unwrap();
        fs::write(
            project.path().join(".autoforge.toml"),
            "[policy]\nallowed_paths = []\ndenied_paths = [\"vendor/**\"]\nforbidden_patterns = []\nrequired_patterns = []\nallowed_dependencies = []\nforbidden_dependencies = []\nmax_file_size = 1000000\nmax_diff_size = 10000\nmax_files_changed = 50\nforbid_credentials = true\nforbid_telemetry = true\nforbid_license_changes = true\n",
        )
        .unwrap();
        let config = ForgeConfig::load_files(None, project.path());
        assert_eq!(config.policy.denied_paths, vec!["vendor/**".to_string()]);
    }
}
