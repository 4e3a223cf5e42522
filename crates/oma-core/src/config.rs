use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::adapter::DEFAULT_SERVER_NAME;
use crate::error::OmaError;
use crate::runner::{BackendKind, ClaudeCliConfig};
use crate::security::{SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "oma.toml";
const CONFIG_PATH_ENV: &str = "OMA_CONFIG";
const BACKEND_ENV: &str = "OMA_BACKEND";

/// Top-level settings. Every section is optional in the file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm: LlmSettings,
    pub tools: ToolSettings,
    pub backend: BackendSettings,
    pub coding_agent: CodingAgentSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Resolve the configured LLM secret value (from environment only).
    pub fn llm_api_key(&self) -> Result<SecretValue, OmaError> {
        require_env(&self.llm.api_key_env)
    }

    pub fn backend_kind(&self) -> Result<BackendKind, OmaError> {
        self.backend.kind.parse()
    }

    pub fn claude_cli_config(&self) -> ClaudeCliConfig {
        let mut config = ClaudeCliConfig {
            mcp_endpoint: Some(self.tools.endpoint.clone()),
            server_name: self.tools.server_name.clone(),
            ..ClaudeCliConfig::default()
        };
        if let Some(path) = &self.coding_agent.cli_path {
            config.cli_path = path.clone();
        }
        config
    }
}

/// Loads `Settings` from TOML.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `OMA_CONFIG` environment variable.
    /// 3. `oma.toml` in the current working directory, if present.
    ///
    /// Without any file the defaults apply. `OMA_BACKEND` overrides `backend.kind`.
    pub fn load(path: Option<PathBuf>) -> Result<Settings, OmaError> {
        let mut settings = match resolve_path(path) {
            Some(candidate) => Self::from_file(&candidate)?,
            None => Settings::default(),
        };

        if let Ok(kind) = env::var(BACKEND_ENV) {
            if !kind.trim().is_empty() {
                settings.backend.kind = kind;
            }
        }

        Self::validate(&settings)?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Settings, OmaError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| OmaError::config_io(path.to_path_buf(), err))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Settings, OmaError> {
        toml::from_str(raw).map_err(|err| OmaError::InvalidConfiguration(err.to_string()))
    }

    fn validate(settings: &Settings) -> Result<(), OmaError> {
        if settings.llm.api_key_env.trim().is_empty() {
            return Err(OmaError::InvalidConfiguration(
                "llm.api_key_env must reference an environment variable".into(),
            ));
        }
        if settings.tools.server_name.trim().is_empty() {
            return Err(OmaError::InvalidConfiguration(
                "tools.server_name must not be empty".into(),
            ));
        }
        settings.backend_kind()?;
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(path);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return Some(PathBuf::from(from_env));
        }
    }

    let default = Path::new(DEFAULT_CONFIG_PATH);
    default.exists().then(|| default.to_path_buf())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: String,
    pub default_model: String,
    pub api_key_env: String,
    pub base_url: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "openrouter".into(),
            default_model: "openrouter/openai/gpt-4o-mini".into(),
            api_key_env: "OPENROUTER_API_KEY".into(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub endpoint: String,
    pub server_name: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000/mcp".into(),
            server_name: DEFAULT_SERVER_NAME.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Crew.as_str().into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CodingAgentSettings {
    pub cli_path: Option<String>,
    pub allow_web_search: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub run_log: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            run_log: false,
        }
    }
}
