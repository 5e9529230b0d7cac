//! Provider selection: the offline mock or a catalog entry behind a [`Bridge`].

use std::path::Path;
use std::sync::Arc;

use agent_provider::ChatBackend;
use agent_provider_mock::{MockProvider, MOCK_PROVIDER_ID};
use provider_bridge::{Bridge, BridgeError};
use provider_registry::{
    parse_model_ref, AuthResolver, Catalog, EnvOverrides, RegistryError, PROVIDER_ENV_FILE_NAME,
    SETTINGS_FILE_NAME,
};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to initialize provider '{provider}': {source}")]
    Bridge {
        provider: String,
        #[source]
        source: BridgeError,
    },
}

/// Catalog plus the process-wide credential resolver shared by every bridge.
#[derive(Debug)]
pub struct Providers {
    catalog: Catalog,
    auth: Arc<AuthResolver>,
}

impl Providers {
    pub fn new(catalog: Catalog, auth: Arc<AuthResolver>) -> Self {
        Self { catalog, auth }
    }

    /// Loads `settings.json` and `provider.env` from `config_dir`.
    pub fn load(config_dir: &Path) -> Result<Self, SelectionError> {
        let catalog = Catalog::load(&config_dir.join(SETTINGS_FILE_NAME))?;
        let env = EnvOverrides::load(&config_dir.join(PROVIDER_ENV_FILE_NAME));
        let auth = Arc::new(AuthResolver::new(config_dir, env));
        info!(providers = catalog.providers().len(), "provider catalog loaded");
        Ok(Self::new(catalog, auth))
    }

    /// Loaded provider catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Picks the backend for `provider`/`model`. Without a provider the
    /// catalog default is used, and `mock` when the catalog is empty.
    pub fn select(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<Arc<dyn ChatBackend>, SelectionError> {
        let provider_id = match provider.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => match self.catalog.default_provider() {
                Some(default) => default.id.clone(),
                None => MOCK_PROVIDER_ID.to_string(),
            },
        };

        if provider_id == MOCK_PROVIDER_ID && self.catalog.get(MOCK_PROVIDER_ID).is_err() {
            return Ok(Arc::new(MockProvider::new(model.unwrap_or_default())));
        }

        let config = self.catalog.get(&provider_id)?.clone();
        let model = config.resolve_model(model)?;
        let bridge = Bridge::new(config, model, Arc::clone(&self.auth)).map_err(|source| {
            SelectionError::Bridge {
                provider: provider_id.clone(),
                source,
            }
        })?;
        info!(provider = %provider_id, model = bridge.model(), endpoint = bridge.endpoint(), "provider selected");
        Ok(Arc::new(bridge))
    }

    /// Resolves a `/model provider/model` reference.
    pub fn select_ref(&self, reference: &str) -> Result<Arc<dyn ChatBackend>, SelectionError> {
        let (provider, model) = parse_model_ref(reference)?;
        self.select(Some(&provider), Some(&model))
    }
}
