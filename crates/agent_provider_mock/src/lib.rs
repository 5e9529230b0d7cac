//! Deterministic backends implementing the shared `agent_provider` contract.
//!
//! [`MockProvider`] streams canned text for offline runs. [`ScriptedBackend`]
//! replays a queue of results and records every request, for loop tests.
//! Neither contains transport or protocol logic.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use agent_provider::{
    CancelSignal, ChatBackend, ChatRequest, ChatResult, Message, ProviderError,
    ProviderErrorKind, ProviderProfile, Role,
};

/// Stable provider identifier used for explicit startup selection.
pub const MOCK_PROVIDER_ID: &str = "mock";
pub const MOCK_MODEL_ID: &str = "mock";

/// Offline backend that answers every request with streamed canned text.
#[derive(Debug)]
pub struct MockProvider {
    model_id: String,
    token_delay: Duration,
}

impl MockProvider {
    const TOKEN_DELAY_MS: u64 = 20;

    #[must_use]
    pub fn new(model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        let model_id = if model_id.trim().is_empty() {
            MOCK_MODEL_ID.to_string()
        } else {
            model_id.trim().to_string()
        };
        Self {
            model_id,
            token_delay: Duration::from_millis(Self::TOKEN_DELAY_MS),
        }
    }

    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    fn reply_for(request: &ChatRequest) -> String {
        let prompt = last_user_text(&request.messages).unwrap_or_default();
        let prompt = prompt.lines().next().unwrap_or_default().trim();
        if prompt.is_empty() {
            "Mock provider ready. No request text was received.".to_string()
        } else {
            format!(
                "Mock provider received: \"{prompt}\". No model is attached, so no work was performed."
            )
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new(MOCK_MODEL_ID)
    }
}

impl ChatBackend for MockProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: MOCK_PROVIDER_ID.to_string(),
            model_id: self.model_id.clone(),
        }
    }

    fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancelSignal,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<ChatResult, ProviderError> {
        let reply = Self::reply_for(request);
        let mut pending_token = String::new();

        for ch in reply.chars() {
            pending_token.push(ch);
            if ch == ' ' {
                if cancel.load(Ordering::SeqCst) {
                    return Err(ProviderError::cancelled(MOCK_PROVIDER_ID));
                }
                on_text(&std::mem::take(&mut pending_token));
                thread::sleep(self.token_delay);
            }
        }

        if cancel.load(Ordering::SeqCst) {
            return Err(ProviderError::cancelled(MOCK_PROVIDER_ID));
        }
        if !pending_token.is_empty() {
            on_text(&pending_token);
        }

        Ok(ChatResult::text(reply))
    }
}

/// One scripted backend reply.
pub type ScriptedReply = Result<ChatResult, ProviderError>;

/// Backend replaying queued replies in order and recording each request.
///
/// Running past the end of the script is a protocol error, so tests notice
/// an unexpected extra model call.
#[derive(Debug)]
pub struct ScriptedBackend {
    profile: ProviderProfile,
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ChatRequest>>,
    delay: Duration,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            profile: ProviderProfile {
                provider_id: "scripted".to_string(),
                model_id: "scripted".to_string(),
            },
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Convenience for scripts made only of successful results.
    #[must_use]
    pub fn from_results(results: impl IntoIterator<Item = ChatResult>) -> Self {
        Self::new(results.into_iter().map(Ok))
    }

    #[must_use]
    pub fn with_profile(mut self, provider_id: &str, model_id: &str) -> Self {
        self.profile = ProviderProfile {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
        };
        self
    }

    /// Sleeps before each reply while still honouring cancellation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        lock_unpoisoned(&self.replies).push_back(reply);
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock_unpoisoned(&self.requests).len()
    }

    pub fn remaining(&self) -> usize {
        lock_unpoisoned(&self.replies).len()
    }

    fn wait(&self, cancel: &CancelSignal) -> bool {
        const POLL: Duration = Duration::from_millis(5);
        let mut waited = Duration::ZERO;
        while waited < self.delay {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
            thread::sleep(POLL);
            waited += POLL;
        }
        !cancel.load(Ordering::SeqCst)
    }
}

impl ChatBackend for ScriptedBackend {
    fn profile(&self) -> ProviderProfile {
        self.profile.clone()
    }

    fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancelSignal,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<ChatResult, ProviderError> {
        lock_unpoisoned(&self.requests).push(request.clone());
        if !self.wait(cancel) {
            return Err(ProviderError::cancelled(&self.profile.provider_id));
        }

        let reply = lock_unpoisoned(&self.replies).pop_front();
        match reply {
            Some(Ok(result)) => {
                if !result.text.is_empty() {
                    on_text(&result.text);
                }
                Ok(result)
            }
            Some(Err(error)) => Err(error),
            None => Err(ProviderError::new(
                ProviderErrorKind::Protocol,
                &self.profile.provider_id,
                "scripted backend has no reply left",
            )),
        }
    }
}

fn last_user_text(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map(|message| message.content.as_str())
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use agent_provider::{cancel_signal, ToolCallRequest};
    use serde_json::json;

    use super::*;

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            instructions: String::new(),
            messages: vec![Message::user(text)],
            tools: Vec::new(),
        }
    }

    #[test]
    fn profile_exposes_explicit_mock_provider_identity() {
        let profile = MockProvider::new("  ").profile();

        assert_eq!(profile.provider_id, MOCK_PROVIDER_ID);
        assert_eq!(profile.model_id, MOCK_MODEL_ID);
    }

    #[test]
    fn mock_streams_chunks_that_join_to_the_final_text() {
        let provider = MockProvider::default().with_token_delay(Duration::ZERO);
        let mut streamed = String::new();

        let result = provider
            .complete(&request("hello there"), &cancel_signal(), &mut |delta| {
                streamed.push_str(delta)
            })
            .expect("mock run should succeed");

        assert_eq!(streamed, result.text);
        assert!(result.text.contains("hello there"));
        assert!(result.tool_calls.is_empty());
    }

    #[test]
    fn mock_returns_cancelled_when_cancel_is_set() {
        let provider = MockProvider::default().with_token_delay(Duration::ZERO);
        let cancel = cancel_signal();
        cancel.store(true, Ordering::SeqCst);

        let error = provider
            .complete(&request("ignored"), &cancel, &mut |_| {})
            .expect_err("cancelled run must fail");
        assert!(error.is_cancelled());
    }

    #[test]
    fn scripted_backend_replays_in_order_and_records_requests() {
        let call = ToolCallRequest::new("c1", "write_file", json!({"path": "a"}));
        let backend = ScriptedBackend::from_results([
            ChatResult::tool_calls("", vec![call.clone()]),
            ChatResult::text("done"),
        ]);

        let first = backend
            .complete(&request("one"), &cancel_signal(), &mut |_| {})
            .expect("first reply");
        let second = backend
            .complete(&request("two"), &cancel_signal(), &mut |_| {})
            .expect("second reply");

        assert_eq!(first.tool_calls, vec![call]);
        assert_eq!(second.text, "done");
        assert_eq!(backend.call_count(), 2);
        assert_eq!(backend.requests()[1].messages[0].content, "two");

        let exhausted = backend
            .complete(&request("three"), &cancel_signal(), &mut |_| {})
            .expect_err("script is exhausted");
        assert_eq!(exhausted.kind, ProviderErrorKind::Protocol);
    }

    #[test]
    fn scripted_backend_delay_observes_cancellation() {
        let backend = ScriptedBackend::from_results([ChatResult::text("late")])
            .with_delay(Duration::from_secs(5));
        let cancel = cancel_signal();
        let flag = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            flag.store(true, Ordering::SeqCst);
        });

        let started = std::time::Instant::now();
        let error = backend
            .complete(&request("x"), &cancel, &mut |_| {})
            .expect_err("cancel wins");
        canceller.join().expect("canceller thread");

        assert!(error.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(backend.remaining(), 1);
    }
}
