use std::fmt;

use agent_provider::{ProviderError, ProviderErrorKind};
use provider_registry::AuthError;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::retry::is_transient_error_text;

#[derive(Debug)]
pub enum BridgeError {
    Credential(AuthError),
    MissingAccountId,
    InvalidHeader(String),
    Request(reqwest::Error),
    Status(StatusCode, String),
    UsageLimit {
        message: String,
    },
    RetryExhausted {
        status: Option<StatusCode>,
        last_error: Option<String>,
    },
    StreamFailed {
        code: Option<String>,
        message: String,
    },
    Protocol(String),
    Runtime(String),
    Cancelled,
}

impl BridgeError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Failure class surfaced to the model loop.
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Credential(_) | Self::MissingAccountId => ProviderErrorKind::Auth,
            Self::Status(status, _) if is_auth_status(*status) => ProviderErrorKind::Auth,
            Self::Status(status, _) if *status == StatusCode::TOO_MANY_REQUESTS => {
                ProviderErrorKind::RateLimited
            }
            Self::Status(status, _) if status.is_server_error() => ProviderErrorKind::Transport,
            Self::Status(_, _) => ProviderErrorKind::Protocol,
            Self::UsageLimit { .. } => ProviderErrorKind::RateLimited,
            Self::RetryExhausted {
                status: Some(StatusCode::TOO_MANY_REQUESTS),
                ..
            } => ProviderErrorKind::RateLimited,
            Self::RetryExhausted { .. } | Self::Request(_) | Self::Runtime(_) => {
                ProviderErrorKind::Transport
            }
            Self::StreamFailed { code, message } => {
                let text = format!("{} {message}", code.as_deref().unwrap_or_default());
                if is_transient_error_text(&text) {
                    ProviderErrorKind::Transport
                } else {
                    ProviderErrorKind::Protocol
                }
            }
            Self::InvalidHeader(_) | Self::Protocol(_) => ProviderErrorKind::Protocol,
            Self::Cancelled => ProviderErrorKind::Cancelled,
        }
    }

    /// Rejected credential: eligible for one refresh-and-retry.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::Status(status, _) if is_auth_status(*status))
    }

    pub fn into_provider_error(self, provider_id: &str) -> ProviderError {
        ProviderError::new(self.kind(), provider_id, self.to_string())
    }
}

pub(crate) fn is_auth_status(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credential(error) => write!(f, "{error}"),
            Self::MissingAccountId => write!(f, "OAuth credential carries no account id"),
            Self::InvalidHeader(message) => write!(f, "invalid header: {message}"),
            Self::Request(error) => write!(f, "request error: {error}"),
            Self::Status(status, message) => write!(f, "HTTP {status} {message}"),
            Self::UsageLimit { message } => write!(f, "{message}"),
            Self::RetryExhausted { status, last_error } => {
                let status = status
                    .map(|status| status.as_u16().to_string())
                    .unwrap_or_else(|| "n/a".to_owned());
                let last_error = last_error.as_deref().unwrap_or("none");
                write!(
                    f,
                    "retry exhausted after max attempts (status: {status}, last error: {last_error})"
                )
            }
            Self::StreamFailed { code, message } => match code {
                Some(code) if !code.trim().is_empty() => {
                    write!(f, "stream failed ({code}): {message}")
                }
                _ => write!(f, "stream failed: {message}"),
            },
            Self::Protocol(message) => write!(f, "{message}"),
            Self::Runtime(message) => write!(f, "runtime error: {message}"),
            Self::Cancelled => write!(f, "request was cancelled"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<reqwest::Error> for BridgeError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error)
    }
}

impl From<AuthError> for BridgeError {
    fn from(error: AuthError) -> Self {
        Self::Credential(error)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(rename = "error")]
    value: Option<ErrorPayloadFields>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayloadFields {
    message: Option<String>,
    code: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    plan_type: Option<String>,
    resets_at: Option<u64>,
}

impl ErrorPayloadFields {
    fn usage_limit_message(&self) -> Option<String> {
        let code = self
            .code
            .as_deref()
            .filter(|value| !value.is_empty())
            .or_else(|| self.type_.as_deref().filter(|value| !value.is_empty()))?;
        if !code.eq_ignore_ascii_case("usage_limit_reached")
            && !code.eq_ignore_ascii_case("usage_not_included")
        {
            return None;
        }

        let plan = self
            .plan_type
            .as_deref()
            .filter(|value| !value.is_empty())
            .map(|value| format!(" ({} plan)", value.to_ascii_lowercase()))
            .unwrap_or_default();
        let retry_hint = self
            .resets_at
            .filter(|value| *value > 0)
            .and_then(|reset_sec| i64::try_from(reset_sec).ok())
            .and_then(|reset_sec| reset_sec.checked_mul(1000))
            .and_then(|reset_millis| reset_millis.checked_sub(current_epoch_ms()))
            .map(|delta| (delta.max(0) as f64 / 60_000f64).round() as i64)
            .map(|mins| format!(" Try again in ~{mins} min."))
            .unwrap_or_default();

        Some(format!("You have hit your usage limit{plan}.{retry_hint}"))
    }
}

/// Human-readable text for a failed response body.
pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    let fallback = || {
        if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            body.trim().to_string()
        }
    };

    let Ok(parsed) = serde_json::from_str::<ErrorPayload>(body) else {
        return fallback();
    };

    if let Some(error) = parsed.value {
        if let Some(message) = error.usage_limit_message() {
            return message;
        }
        if let Some(message) = error.message.filter(|message| !message.is_empty()) {
            return message;
        }
    }

    fallback()
}

pub(crate) fn is_usage_limit_message(message: &str) -> bool {
    message.contains("usage limit")
}

fn current_epoch_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}
