use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use agent_provider::{
    CancelSignal, ChatBackend, ChatRequest, ChatResult, ProviderError, ProviderProfile,
};
use futures_util::StreamExt;
use provider_registry::{AuthResolver, Credential, ProviderConfig};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec::{codec_for, WireCodec};
use crate::error::{is_usage_limit_message, parse_error_message, BridgeError};
use crate::headers::build_headers;
use crate::retry::{is_retryable_status, RetryPolicy};
use crate::url::normalize_endpoint;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Provider bridge for one provider/model pair.
///
/// Each [`ChatBackend::complete`] call runs on a private current-thread
/// runtime, so the bridge can be driven from any worker thread.
pub struct Bridge {
    provider: ProviderConfig,
    model: String,
    codec: &'static dyn WireCodec,
    endpoint: String,
    auth: Arc<AuthResolver>,
    retry: RetryPolicy,
    http: Client,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("provider", &self.provider.id)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Bridge {
    pub fn new(
        provider: ProviderConfig,
        model: impl Into<String>,
        auth: Arc<AuthResolver>,
    ) -> Result<Self, BridgeError> {
        let http = Client::builder().build().map_err(BridgeError::from)?;
        let codec = codec_for(provider.wire);
        let endpoint = normalize_endpoint(provider.wire, &provider.endpoint);
        Ok(Self {
            provider,
            model: model.into(),
            codec,
            endpoint,
            auth,
            retry: RetryPolicy::default(),
            http,
        })
    }

    /// Replaces the default backoff schedule.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Catalog entry this bridge was built from.
    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    /// Model id sent in every request body.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Normalized request URL for the provider's wire variant.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Runs one model call: resolve credential, send with retry, decode.
    ///
    /// A rejected credential (401/403) is handed back to the resolver once;
    /// the call is repeated with the replacement before the failure surfaces.
    pub fn execute(
        &self,
        request: &ChatRequest,
        cancel: &CancelSignal,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<ChatResult, BridgeError> {
        let body = self.codec.build_request(&self.model, request);
        let credential = self.auth.resolve(&self.provider)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| {
                BridgeError::Runtime(format!("failed to initialize tokio runtime: {error}"))
            })?;

        match runtime.block_on(self.exchange(&body, &credential, cancel, on_text)) {
            Err(error) if error.is_auth_rejection() => {
                let refreshed = match self.auth.invalidate(&self.provider, &credential) {
                    Ok(refreshed) => refreshed,
                    Err(refresh_error) => {
                        warn!(provider = %self.provider.id, error = %refresh_error, "credential rejected and could not be refreshed");
                        return Err(error);
                    }
                };
                info!(provider = %self.provider.id, "retrying request with refreshed credential");
                runtime.block_on(self.exchange(&body, &refreshed, cancel, on_text))
            }
            other => other,
        }
    }

    async fn exchange(
        &self,
        body: &Value,
        credential: &Credential,
        cancel: &CancelSignal,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<ChatResult, BridgeError> {
        let response = self.send_with_retry(body, credential, cancel).await?;
        let mut bytes = response.bytes_stream();
        let mut decoder = self.codec.decoder();

        while let Some(chunk) = await_or_cancel(bytes.next(), cancel).await? {
            let chunk = chunk.map_err(BridgeError::from)?;
            decoder.feed(&chunk, on_text)?;
        }
        if is_cancelled(cancel) {
            return Err(BridgeError::Cancelled);
        }

        decoder.finish()
    }

    fn build_request(
        &self,
        body: &Value,
        credential: &Credential,
    ) -> Result<reqwest::RequestBuilder, BridgeError> {
        let headers = header_map(build_headers(&self.provider, credential)?)?;
        let mut builder = self.http.post(&self.endpoint).headers(headers).json(body);
        if let Some(timeout) = self.provider.timeout() {
            builder = builder.timeout(timeout);
        }
        Ok(builder)
    }

    /// Sends the request, retrying transient failures within the policy budget.
    pub async fn send_with_retry(
        &self,
        body: &Value,
        credential: &Credential,
        cancel: &CancelSignal,
    ) -> Result<Response, BridgeError> {
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;

        for attempt in 1..=self.retry.max_attempts {
            if is_cancelled(cancel) {
                return Err(BridgeError::Cancelled);
            }

            let sent = self.build_request(body, credential)?.send();
            match await_or_cancel(sent, cancel).await? {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    last_status = Some(status);
                    let body = await_or_cancel(response.text(), cancel)
                        .await?
                        .unwrap_or_default();
                    let message = parse_error_message(status, &body);
                    if is_usage_limit_message(&message) {
                        return Err(BridgeError::UsageLimit { message });
                    }
                    if !is_retryable_status(status.as_u16()) {
                        return Err(BridgeError::Status(status, message));
                    }
                    last_error = Some(message);
                }
                Err(error) => {
                    last_error = Some(error.to_string());
                }
            }

            if self.retry.has_attempts_left(attempt) {
                let delay = self.retry.delay_after(attempt);
                warn!(
                    provider = %self.provider.id,
                    attempt,
                    status = last_status.map(|status| status.as_u16()),
                    error = last_error.as_deref().unwrap_or_default(),
                    delay_ms = delay.as_millis() as u64,
                    "transient provider failure; retrying"
                );
                await_or_cancel(tokio::time::sleep(delay), cancel).await?;
            }
        }

        debug!(provider = %self.provider.id, "retry budget exhausted");
        Err(BridgeError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }
}

impl ChatBackend for Bridge {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: self.provider.id.clone(),
            model_id: self.model.clone(),
        }
    }

    fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancelSignal,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<ChatResult, ProviderError> {
        self.execute(request, cancel, on_text)
            .map_err(|error| error.into_provider_error(&self.provider.id))
    }
}

fn header_map(headers: std::collections::BTreeMap<String, String>) -> Result<HeaderMap, BridgeError> {
    let mut out = HeaderMap::new();
    for (key, value) in headers {
        out.insert(
            HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| BridgeError::InvalidHeader(format!("invalid header key: {key}")))?,
            HeaderValue::from_str(&value)
                .map_err(|_| BridgeError::InvalidHeader(format!("invalid header value for {key}")))?,
        );
    }
    Ok(out)
}

fn is_cancelled(cancel: &CancelSignal) -> bool {
    cancel.load(Ordering::Acquire)
}

async fn await_or_cancel<F>(future: F, cancel: &CancelSignal) -> Result<F::Output, BridgeError>
where
    F: Future,
{
    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancel) {
            return Err(BridgeError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancel) {
                return Err(BridgeError::Cancelled);
            }
            return Ok(output);
        }
    }
}
