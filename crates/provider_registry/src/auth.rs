use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::catalog::{AuthMode, ProviderConfig};
use crate::env::EnvOverrides;
use crate::error::AuthError;
use crate::jwt;

/// Tokens expiring within this window are treated as already expired.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(60);
const OAUTH_DIR_NAME: &str = "oauth";
const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Environment { variable: String },
    TokenFile { path: PathBuf },
    Refreshed,
    Unauthenticated,
}

/// Usable credential for one provider. Owned by the resolver; callers receive clones.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub provider_id: String,
    pub token: String,
    pub expiry: Option<SystemTime>,
    pub account_id: Option<String>,
    pub source: CredentialSource,
    refresh_token: Option<String>,
}

impl Credential {
    #[must_use]
    pub fn new(provider_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            token: token.into(),
            expiry: None,
            account_id: None,
            source: CredentialSource::Unauthenticated,
            refresh_token: None,
        }
    }

    pub fn is_expired(&self, skew: Duration) -> bool {
        self.is_expired_at(SystemTime::now(), skew)
    }

    pub fn is_expired_at(&self, now: SystemTime, skew: Duration) -> bool {
        self.expiry
            .is_some_and(|expiry| expiry <= now.checked_add(skew).unwrap_or(now))
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token.is_some()
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.source == CredentialSource::Unauthenticated
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider_id", &self.provider_id)
            .field("token", &"<redacted>")
            .field("expiry", &self.expiry)
            .field("account_id", &self.account_id)
            .field("source", &self.source)
            .finish()
    }
}

/// Token material returned by a refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshedToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Exchanges a refresh token for a new access token.
pub trait TokenSource: Send + Sync {
    fn refresh(
        &self,
        provider: &ProviderConfig,
        refresh_token: &str,
    ) -> Result<RefreshedToken, AuthError>;
}

/// Posts `grant_type=refresh_token` to the provider's `token_url`.
#[derive(Debug, Clone)]
pub struct HttpTokenSource {
    timeout: Duration,
}

impl Default for HttpTokenSource {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }
}

impl HttpTokenSource {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl TokenSource for HttpTokenSource {
    fn refresh(
        &self,
        provider: &ProviderConfig,
        refresh_token: &str,
    ) -> Result<RefreshedToken, AuthError> {
        let failed = |message: String| AuthError::RefreshFailed {
            provider: provider.id.clone(),
            message,
        };
        let token_url = provider
            .token_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| AuthError::NotRefreshable {
                provider: provider.id.clone(),
                reason: "no token_url configured".to_string(),
            })?;

        let mut body = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });
        if let Some(client_id) = provider.client_id.as_deref() {
            body["client_id"] = Value::String(client_id.to_string());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| failed(format!("failed to start runtime: {error}")))?;
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|error| failed(error.to_string()))?;

        runtime.block_on(async {
            let response = client
                .post(token_url.trim())
                .json(&body)
                .send()
                .await
                .map_err(|error| failed(error.to_string()))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|error| failed(error.to_string()))?;
            if !status.is_success() {
                return Err(failed(format!("token endpoint returned {status}: {text}")));
            }
            serde_json::from_str::<RefreshedToken>(&text)
                .map_err(|error| failed(format!("invalid token response: {error}")))
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct StoredToken {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<u64>,
    #[serde(default)]
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenFile {
    Nested { tokens: StoredToken },
    Flat(StoredToken),
}

impl TokenFile {
    fn into_stored(self) -> StoredToken {
        match self {
            Self::Nested { tokens } | Self::Flat(tokens) => tokens,
        }
    }
}

/// Resolves credentials in precedence order: environment override, OAuth
/// token file, then tokens previously exchanged by this resolver.
///
/// Safe to share between threads. Refreshes are serialized per provider and
/// coalesced: callers presenting the same stale token share one exchange.
pub struct AuthResolver {
    env: EnvOverrides,
    config_dir: PathBuf,
    token_source: Arc<dyn TokenSource>,
    skew: Duration,
    cache: RwLock<HashMap<String, Credential>>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl fmt::Debug for AuthResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResolver")
            .field("config_dir", &self.config_dir)
            .field("skew", &self.skew)
            .finish_non_exhaustive()
    }
}

impl AuthResolver {
    #[must_use]
    pub fn new(config_dir: impl Into<PathBuf>, env: EnvOverrides) -> Self {
        Self {
            env,
            config_dir: config_dir.into(),
            token_source: Arc::new(HttpTokenSource::default()),
            skew: DEFAULT_EXPIRY_SKEW,
            cache: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Source used to exchange refresh tokens.
    #[must_use]
    pub fn with_token_source(mut self, token_source: Arc<dyn TokenSource>) -> Self {
        self.token_source = token_source;
        self
    }

    /// Treats credentials expiring within `skew` as already expired.
    #[must_use]
    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Configured token file, or `<config>/oauth/<provider>.json`.
    pub fn token_file_path(&self, provider: &ProviderConfig) -> PathBuf {
        match provider.oauth_token_file.as_deref() {
            Some(path) => expand_path(path, &self.config_dir),
            None => self
                .config_dir
                .join(OAUTH_DIR_NAME)
                .join(format!("{}.json", provider.id)),
        }
    }

    /// Returns a usable credential, refreshing an expired OAuth token if possible.
    pub fn resolve(&self, provider: &ProviderConfig) -> Result<Credential, AuthError> {
        if provider.auth == AuthMode::None {
            return Ok(Credential::new(&provider.id, ""));
        }

        if let Some((variable, token)) = self.env.first_of(&provider.env_vars) {
            debug!(provider = %provider.id, %variable, "using environment credential");
            let hints = jwt::inspect(&token);
            return Ok(Credential {
                provider_id: provider.id.clone(),
                token,
                expiry: None,
                account_id: hints.account_id,
                source: CredentialSource::Environment { variable },
                refresh_token: None,
            });
        }

        let token_path = self.token_file_path(provider);
        if let Some(credential) = self.read_token_file(provider, &token_path)? {
            if !credential.is_expired(self.skew) {
                return Ok(credential);
            }
            debug!(provider = %provider.id, "token file credential expired; refreshing");
            return self.refresh_coalesced(provider, &credential);
        }

        if let Some(cached) = self.cached(&provider.id) {
            if !cached.is_expired(self.skew) {
                return Ok(cached);
            }
            return self.refresh_coalesced(provider, &cached);
        }

        Err(AuthError::MissingCredential {
            provider: provider.id.clone(),
            env_vars: provider.env_vars.join(", "),
            token_file: token_path.display().to_string(),
        })
    }

    /// Drops `stale` after the server rejected it and obtains a replacement.
    ///
    /// Environment credentials cannot be replaced and yield `NotRefreshable`.
    pub fn invalidate(
        &self,
        provider: &ProviderConfig,
        stale: &Credential,
    ) -> Result<Credential, AuthError> {
        if let CredentialSource::Environment { variable } = &stale.source {
            return Err(AuthError::NotRefreshable {
                provider: provider.id.clone(),
                reason: format!("credential comes from environment variable {variable}"),
            });
        }
        self.refresh_coalesced(provider, stale)
    }

    fn refresh_coalesced(
        &self,
        provider: &ProviderConfig,
        stale: &Credential,
    ) -> Result<Credential, AuthError> {
        let lock = self.refresh_lock(&provider.id);
        let _guard = lock_unpoisoned(&lock);

        if let Some(current) = self.cached(&provider.id) {
            if current.token != stale.token && !current.is_expired(self.skew) {
                debug!(provider = %provider.id, "reusing credential refreshed by a concurrent caller");
                return Ok(current);
            }
        }

        let Some(refresh_token) = stale.refresh_token.as_deref() else {
            return Err(AuthError::NotRefreshable {
                provider: provider.id.clone(),
                reason: "no refresh token available".to_string(),
            });
        };

        info!(provider = %provider.id, "refreshing OAuth credential");
        let refreshed = self.token_source.refresh(provider, refresh_token)?;
        let hints = jwt::inspect(&refreshed.access_token);
        let expiry = refreshed
            .expires_in
            .map(|seconds| SystemTime::now() + Duration::from_secs(seconds))
            .or(hints.expires_at);
        let credential = Credential {
            provider_id: provider.id.clone(),
            token: refreshed.access_token.clone(),
            expiry,
            account_id: hints.account_id.or_else(|| stale.account_id.clone()),
            source: CredentialSource::Refreshed,
            refresh_token: refreshed
                .refresh_token
                .clone()
                .or_else(|| stale.refresh_token.clone()),
        };

        write_lock(&self.cache).insert(provider.id.clone(), credential.clone());

        let token_path = self.token_file_path(provider);
        if let Err(error) = write_back(&token_path, &credential) {
            warn!(provider = %provider.id, path = %token_path.display(), %error, "failed to persist refreshed token");
        }

        Ok(credential)
    }

    fn read_token_file(
        &self,
        provider: &ProviderConfig,
        path: &Path,
    ) -> Result<Option<Credential>, AuthError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(AuthError::TokenFileIo {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let stored = serde_json::from_str::<TokenFile>(&raw)
            .map_err(|source| AuthError::TokenFileParse {
                path: path.to_path_buf(),
                source,
            })?
            .into_stored();
        if stored.access_token.trim().is_empty() {
            return Ok(None);
        }

        let hints = jwt::inspect(&stored.access_token);
        Ok(Some(Credential {
            provider_id: provider.id.clone(),
            token: stored.access_token.trim().to_owned(),
            expiry: stored.expires_at.map(jwt::unix_seconds).or(hints.expires_at),
            account_id: stored
                .account_id
                .filter(|id| !id.trim().is_empty())
                .or(hints.account_id),
            source: CredentialSource::TokenFile {
                path: path.to_path_buf(),
            },
            refresh_token: stored.refresh_token.filter(|token| !token.trim().is_empty()),
        }))
    }

    fn cached(&self, provider_id: &str) -> Option<Credential> {
        read_lock(&self.cache).get(provider_id).cloned()
    }

    fn refresh_lock(&self, provider_id: &str) -> Arc<Mutex<()>> {
        lock_unpoisoned(&self.refresh_locks)
            .entry(provider_id.to_owned())
            .or_default()
            .clone()
    }
}

/// Rewrites the token file in place, keeping unknown fields and its nesting.
fn write_back(path: &Path, credential: &Credential) -> std::io::Result<()> {
    let mut document = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({}));

    let target = match document.get_mut("tokens") {
        Some(tokens) if tokens.is_object() => tokens,
        _ => &mut document,
    };
    if let Some(fields) = target.as_object_mut() {
        fields.insert(
            "access_token".to_string(),
            Value::String(credential.token.clone()),
        );
        if let Some(refresh_token) = &credential.refresh_token {
            fields.insert(
                "refresh_token".to_string(),
                Value::String(refresh_token.clone()),
            );
        }
        if let Some(expires_at) = credential
            .expiry
            .and_then(|expiry| expiry.duration_since(UNIX_EPOCH).ok())
        {
            fields.insert("expires_at".to_string(), json!(expires_at.as_secs()));
        }
        if let Some(account_id) = &credential.account_id {
            fields.insert("account_id".to_string(), Value::String(account_id.clone()));
        }
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    let bytes = serde_json::to_vec_pretty(&document).map_err(std::io::Error::other)?;
    temp.write_all(&bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|error| error.error)?;
    Ok(())
}

fn expand_path(path: &Path, config_dir: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path.is_relative() {
        return config_dir.join(path);
    }
    path.to_path_buf()
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
