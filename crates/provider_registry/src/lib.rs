//! Provider settings catalog and credential resolution.
//!
//! The catalog is loaded once from `settings.json` and treated as read-only.
//! [`AuthResolver`] is the only owner of credentials; transports borrow a clone
//! per request and hand stale ones back through [`AuthResolver::invalidate`].

mod auth;
mod catalog;
mod env;
mod error;
pub mod jwt;

pub use auth::{
    AuthResolver, Credential, CredentialSource, HttpTokenSource, RefreshedToken, TokenSource,
    DEFAULT_EXPIRY_SKEW,
};
pub use catalog::{
    config_dir, parse_model_ref, AuthMode, Catalog, ProviderConfig, WireVariant,
    CONFIG_DIR_ENV_VAR, SETTINGS_FILE_NAME,
};
pub use env::{EnvOverrides, PROVIDER_ENV_FILE_NAME};
pub use error::{AuthError, RegistryError};
