//! Wire codecs: one request builder and response decoder per wire variant.

mod chat_completions;
mod responses;

use agent_provider::{ChatRequest, ChatResult};
use provider_registry::WireVariant;
use serde_json::Value;

use crate::error::BridgeError;

pub use chat_completions::ChatCompletionsCodec;
pub use responses::{OauthResponsesCodec, ResponsesCodec};

/// Request/response shape of one wire variant.
pub trait WireCodec: Send + Sync {
    fn variant(&self) -> WireVariant;

    /// Builds the JSON request body for `model`.
    fn build_request(&self, model: &str, request: &ChatRequest) -> Value;

    /// Starts decoding one response body.
    fn decoder(&self) -> Box<dyn ResponseDecoder>;

    /// Decodes a complete response body in one pass.
    fn parse(&self, body: &[u8]) -> Result<ChatResult, BridgeError> {
        let mut decoder = self.decoder();
        decoder.feed(body, &mut |_| {})?;
        decoder.finish()
    }
}

/// Incremental response decoder. Streaming decoders forward text deltas to
/// `on_text` as they arrive; buffered decoders only parse in `finish`.
pub trait ResponseDecoder: Send {
    fn feed(&mut self, chunk: &[u8], on_text: &mut dyn FnMut(&str)) -> Result<(), BridgeError>;

    fn finish(self: Box<Self>) -> Result<ChatResult, BridgeError>;
}

static CHAT_COMPLETIONS: ChatCompletionsCodec = ChatCompletionsCodec;
static RESPONSES: ResponsesCodec = ResponsesCodec;
static OAUTH_RESPONSES: OauthResponsesCodec = OauthResponsesCodec;

/// Selects the codec for a wire variant.
pub fn codec_for(variant: WireVariant) -> &'static dyn WireCodec {
    match variant {
        WireVariant::ChatCompletions => &CHAT_COMPLETIONS,
        WireVariant::Responses => &RESPONSES,
        WireVariant::OauthResponses => &OAUTH_RESPONSES,
    }
}

pub(crate) fn tool_arguments_text(arguments: &Value) -> String {
    match arguments {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
