//! Provider bridge: one internal request/response contract over several
//! incompatible model wire protocols.
//!
//! Each wire variant is a [`WireCodec`] that builds the request body and
//! decodes the response (buffered JSON or server-sent events) into a
//! normalized [`agent_provider::ChatResult`]. [`Bridge`] owns the transport:
//! headers, retry with backoff, cancellation, and one refresh-and-retry when a
//! credential is rejected.

pub mod client;
pub mod codec;
pub mod error;
pub mod events;
pub mod headers;
pub mod recovery;
pub mod retry;
pub mod sse;
pub mod url;

pub use client::Bridge;
pub use codec::{codec_for, ResponseDecoder, WireCodec};
pub use error::{parse_error_message, BridgeError};
pub use recovery::{recover_arguments, ArgumentSource, StepLog};
pub use retry::RetryPolicy;
pub use sse::{SseDecoder, SseFrame};
pub use url::normalize_endpoint;
