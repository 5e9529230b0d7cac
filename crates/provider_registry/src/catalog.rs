use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RegistryError;

pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const CONFIG_DIR_ENV_VAR: &str = "ZAGENT_CONFIG_DIR";
const CONFIG_DIR_NAME: &str = "zagent";

/// Request/response JSON shape and streaming convention of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WireVariant {
    /// Classic `/chat/completions`, one JSON body per response.
    #[default]
    ChatCompletions,
    /// Streaming `/responses` server-sent events.
    Responses,
    /// `/codex/responses` behind an OAuth account token.
    OauthResponses,
}

impl WireVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Responses => "responses",
            Self::OauthResponses => "oauth_responses",
        }
    }

    pub fn is_streaming(&self) -> bool {
        !matches!(self, Self::ChatCompletions)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    ApiKey,
    Oauth,
    None,
}

/// Connection metadata for one provider. Read-only for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub env_vars: Vec<String>,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_endpoint: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub wire: WireVariant,
    #[serde(default)]
    pub auth: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
}

impl ProviderConfig {
    #[must_use]
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, wire: WireVariant) -> Self {
        Self {
            id: id.into(),
            env_vars: Vec::new(),
            endpoint: endpoint.into(),
            models_endpoint: None,
            models: Vec::new(),
            default_model: None,
            wire,
            auth: AuthMode::ApiKey,
            oauth_token_file: None,
            token_url: None,
            client_id: None,
            referer: None,
            title: None,
            user_agent: None,
            timeout_sec: None,
        }
    }

    /// Model ids; the first one is used when no default model is set.
    #[must_use]
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    /// Environment variables checked for an API key, in order.
    #[must_use]
    pub fn with_env_vars(mut self, env_vars: Vec<String>) -> Self {
        self.env_vars = env_vars;
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_oauth_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.oauth_token_file = Some(path.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_sec
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
    }

    /// Picks the model to use: the requested one, the declared default, or the first listed.
    pub fn resolve_model(&self, requested: Option<&str>) -> Result<String, RegistryError> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        if let Some(model) = requested {
            if self.models.is_empty() || self.models.iter().any(|listed| listed == model) {
                return Ok(model.to_string());
            }
            return Err(RegistryError::UnknownModel {
                provider: self.id.clone(),
                model: model.to_string(),
            });
        }

        self.default_model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or_else(|| self.models.first().map(String::as_str))
            .map(ToString::to_string)
            .ok_or_else(|| RegistryError::NoModels {
                provider: self.id.clone(),
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    providers: Vec<ProviderConfig>,
    #[serde(default)]
    default_provider: Option<String>,
}

/// Loaded provider settings catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    providers: Vec<ProviderConfig>,
    default_provider: Option<String>,
}

impl Catalog {
    #[must_use]
    pub fn from_providers(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers,
            default_provider: None,
        }
    }

    /// Loads `settings.json`. A missing file yields an empty catalog.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        if !path.exists() {
            debug!(path = %path.display(), "provider settings not found; using empty catalog");
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .map_err(|source| RegistryError::io("reading provider settings", path, source))?;
        Self::parse(path, &raw)
    }

    pub fn parse(path: &Path, raw: &str) -> Result<Self, RegistryError> {
        let document: SettingsDocument =
            serde_json::from_str(raw).map_err(|source| RegistryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut seen = HashSet::new();
        for provider in &document.providers {
            if !seen.insert(provider.id.clone()) {
                return Err(RegistryError::DuplicateProvider {
                    path: path.to_path_buf(),
                    id: provider.id.clone(),
                });
            }
            if provider.endpoint.trim().is_empty() {
                return Err(RegistryError::MissingEndpoint {
                    id: provider.id.clone(),
                });
            }
        }

        Ok(Self {
            providers: document.providers,
            default_provider: document.default_provider,
        })
    }

    pub fn providers(&self) -> &[ProviderConfig] {
        &self.providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Looks up a provider by id.
    pub fn get(&self, id: &str) -> Result<&ProviderConfig, RegistryError> {
        self.providers
            .iter()
            .find(|provider| provider.id == id)
            .ok_or_else(|| RegistryError::UnknownProvider {
                id: id.to_string(),
                available: self.available_ids(),
            })
    }

    /// The declared default provider, else the first listed one.
    pub fn default_provider(&self) -> Option<&ProviderConfig> {
        self.default_provider
            .as_deref()
            .and_then(|id| self.providers.iter().find(|provider| provider.id == id))
            .or_else(|| self.providers.first())
    }

    fn available_ids(&self) -> String {
        if self.providers.is_empty() {
            return "(none)".to_string();
        }
        self.providers
            .iter()
            .map(|provider| provider.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Parses a `provider/model` reference. The model part may itself contain `/`.
pub fn parse_model_ref(value: &str) -> Result<(String, String), RegistryError> {
    let trimmed = value.trim();
    let Some((provider, model)) = trimmed.split_once('/') else {
        return Err(RegistryError::InvalidModelRef(trimmed.to_string()));
    };
    let (provider, model) = (provider.trim(), model.trim());
    if provider.is_empty() || model.is_empty() {
        return Err(RegistryError::InvalidModelRef(trimmed.to_string()));
    }
    Ok((provider.to_string(), model.to_string()))
}

/// Resolves the configuration directory (`$ZAGENT_CONFIG_DIR`, else `<config dir>/zagent`).
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(explicit) = std::env::var_os(CONFIG_DIR_ENV_VAR).filter(|value| !value.is_empty())
    {
        return PathBuf::from(explicit);
    }

    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}
