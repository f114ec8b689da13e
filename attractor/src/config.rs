//! Run configuration file loading and validation.
//!
//! JSON or YAML, autodetected by extension. Deprecated `litellm_catalog_*`
//! keys are accepted and backfilled into their `openrouter_model_info_*`
//! successors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse json {path}: {source}")]
    ParseJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("parse yaml {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("unsupported config extension: {0}")]
    UnsupportedExtension(PathBuf),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// LLM backend kind for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Api,
    Cli,
}

/// CLI launch profile: real provider executables or the test shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliProfile {
    #[default]
    Real,
    TestShim,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub backend: BackendKind,
    /// Executable override; only honored under `cli_profile = test_shim`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub cli_profile: CliProfile,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutostartUi {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutostartConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub ui: AutostartUi,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CxdbConfig {
    #[serde(default)]
    pub binary_addr: Option<String>,
    #[serde(default)]
    pub http_base_url: Option<String>,
    #[serde(default)]
    pub autostart: AutostartConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogUpdatePolicy {
    #[default]
    Pinned,
    Fetch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDbConfig {
    /// Path to the pinned OpenRouter model-info JSON document.
    #[serde(default, alias = "litellm_catalog_path")]
    pub openrouter_model_info_path: Option<PathBuf>,
    #[serde(default, alias = "litellm_catalog_update_policy")]
    pub openrouter_model_info_update_policy: CatalogUpdatePolicy,
    #[serde(default)]
    pub openrouter_model_info_url: Option<String>,
    #[serde(default)]
    pub openrouter_model_info_fetch_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_run_branch_prefix")]
    pub run_branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        GitConfig {
            run_branch_prefix: default_run_branch_prefix(),
        }
    }
}

fn default_run_branch_prefix() -> String {
    "attractor".to_string()
}

/// The run configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub cxdb: CxdbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub modeldb: ModelDbConfig,
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(default)]
    pub git: GitConfig,
}

impl RunConfig {
    /// Loads a config file, autodetecting JSON vs YAML by extension.
    pub fn load(path: &Path) -> Result<RunConfig, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw).map_err(|source| ConfigError::ParseJson {
                path: path.to_path_buf(),
                source,
            }),
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&raw).map_err(|source| ConfigError::ParseYaml {
                    path: path.to_path_buf(),
                    source,
                })
            }
            _ => Err(ConfigError::UnsupportedExtension(path.to_path_buf())),
        }
    }

    /// Structural validation beyond what serde enforces.
    ///
    /// `allow_test_shim` comes from run options; executable overrides are a
    /// test-only affordance and refuse to load without both gates.
    pub fn validate(&self, allow_test_shim: bool) -> Result<(), ConfigError> {
        for (provider, cfg) in &self.llm.providers {
            if cfg.executable.is_some() {
                if self.llm.cli_profile != CliProfile::TestShim {
                    return Err(ConfigError::Invalid(format!(
                        "provider {provider} sets executable but llm.cli_profile is not test_shim"
                    )));
                }
                if !allow_test_shim {
                    return Err(ConfigError::Invalid(format!(
                        "provider {provider} sets executable but run options do not allow the test shim"
                    )));
                }
            }
        }

        let autostart = &self.cxdb.autostart;
        if autostart.enabled && autostart.command.is_empty() && !autostart.ui.enabled {
            return Err(ConfigError::Invalid(
                "cxdb.autostart.enabled requires a non-empty command".into(),
            ));
        }
        Ok(())
    }

    /// Backend kind for a normalized provider key, if configured.
    pub fn backend_for(&self, provider: &str) -> Option<BackendKind> {
        self.llm.providers.get(provider).map(|p| p.backend)
    }

    /// Providers configured with the given backend.
    pub fn providers_with_backend(&self, backend: BackendKind) -> Vec<String> {
        self.llm
            .providers
            .iter()
            .filter(|(_, cfg)| cfg.backend == backend)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: JSON and YAML configs load by extension; unknown extensions are rejected.
    #[test]
    fn loads_json_and_yaml() {
        let tmp = tempfile::tempdir().unwrap();

        let json_path = tmp.path().join("run.json");
        std::fs::write(
            &json_path,
            r#"{"version":1,"llm":{"providers":{"openai":{"backend":"cli"}}}}"#,
        )
        .unwrap();
        let cfg = RunConfig::load(&json_path).unwrap();
        assert_eq!(cfg.version, Some(1));
        assert_eq!(cfg.backend_for("openai"), Some(BackendKind::Cli));

        let yaml_path = tmp.path().join("run.yaml");
        std::fs::write(
            &yaml_path,
            "version: 2\nllm:\n  providers:\n    anthropic:\n      backend: api\n",
        )
        .unwrap();
        let cfg = RunConfig::load(&yaml_path).unwrap();
        assert_eq!(cfg.version, Some(2));
        assert_eq!(cfg.backend_for("anthropic"), Some(BackendKind::Api));

        let txt_path = tmp.path().join("run.txt");
        std::fs::write(&txt_path, "x").unwrap();
        assert!(matches!(
            RunConfig::load(&txt_path),
            Err(ConfigError::UnsupportedExtension(_))
        ));
    }

    /// **Scenario**: Deprecated litellm_catalog_* keys backfill the openrouter fields.
    #[test]
    fn deprecated_catalog_keys_backfill() {
        let cfg: RunConfig = serde_json::from_str(
            r#"{"modeldb":{"litellm_catalog_path":"/tmp/models.json","litellm_catalog_update_policy":"fetch"}}"#,
        )
        .unwrap();
        assert_eq!(
            cfg.modeldb.openrouter_model_info_path.as_deref(),
            Some(Path::new("/tmp/models.json"))
        );
        assert_eq!(
            cfg.modeldb.openrouter_model_info_update_policy,
            CatalogUpdatePolicy::Fetch
        );
    }

    /// **Scenario**: Executable overrides require test_shim profile and the run-option gate.
    #[test]
    fn executable_override_gating() {
        let mut cfg = RunConfig::default();
        cfg.llm.providers.insert(
            "openai".into(),
            ProviderConfig {
                backend: BackendKind::Cli,
                executable: Some("/tmp/shim".into()),
            },
        );
        assert!(cfg.validate(true).is_err(), "profile real rejects overrides");

        cfg.llm.cli_profile = CliProfile::TestShim;
        assert!(cfg.validate(false).is_err(), "run options must opt in");
        cfg.validate(true).unwrap();
    }

    /// **Scenario**: Autostart with no command is invalid unless it is a UI autodiscovery block.
    #[test]
    fn autostart_validation() {
        let mut cfg = RunConfig::default();
        cfg.cxdb.autostart.enabled = true;
        assert!(cfg.validate(false).is_err());

        cfg.cxdb.autostart.ui.enabled = true;
        cfg.validate(false).unwrap();

        cfg.cxdb.autostart.ui.enabled = false;
        cfg.cxdb.autostart.command = vec!["cxdb".into(), "serve".into()];
        cfg.validate(false).unwrap();
    }
}
