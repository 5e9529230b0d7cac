//! `zagent` front end: environment configuration, logging, provider
//! selection and the line-oriented session driver.
//!
//! The agent itself lives in the workspace crates:
//! - `provider_registry`: settings catalog and credential resolution.
//! - `provider_bridge`: wire codecs, SSE, retry, argument recovery.
//! - `context_window`: durable per-project conversation history.
//! - `coding_agent`: model loop, reliability checks, tools and subagents.

pub mod config;
pub mod logging;
pub mod providers;
pub mod session;

pub use config::EnvConfig;
pub use providers::{Providers, SelectionError};
pub use session::{unescape_newlines, Flow, Session, SessionOptions};
