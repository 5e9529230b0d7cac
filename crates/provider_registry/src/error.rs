use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse provider settings at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("provider '{id}' is declared more than once in {path}")]
    DuplicateProvider { path: PathBuf, id: String },

    #[error("provider '{id}' has an empty endpoint")]
    MissingEndpoint { id: String },

    #[error("unknown provider '{id}'; available providers: {available}")]
    UnknownProvider { id: String, available: String },

    #[error("provider '{provider}' does not list model '{model}'")]
    UnknownModel { provider: String, model: String },

    #[error("provider '{provider}' has no models configured")]
    NoModels { provider: String },

    #[error("invalid model reference '{0}'; expected <provider>/<model>")]
    InvalidModelRef(String),
}

impl RegistryError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential found for provider '{provider}' (checked env vars [{env_vars}] and token file {token_file})")]
    MissingCredential {
        provider: String,
        env_vars: String,
        token_file: String,
    },

    #[error("failed to read token file {path}: {source}")]
    TokenFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("token file {path} is malformed: {source}")]
    TokenFileParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("credential for provider '{provider}' expired and cannot be refreshed: {reason}")]
    NotRefreshable { provider: String, reason: String },

    #[error("token refresh for provider '{provider}' failed: {message}")]
    RefreshFailed { provider: String, message: String },
}
