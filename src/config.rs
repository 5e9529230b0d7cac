//! Environment configuration, read once at startup.

use std::env;
use std::path::PathBuf;

use coding_agent::model_loop::{DEFAULT_MAX_CORRECTIONS, DEFAULT_MAX_STEPS};
use coding_agent::{system_instructions_or_default, LoopConfig};
use tracing::warn;

pub const PROVIDER_ENV_VAR: &str = "ZAGENT_PROVIDER";
pub const MODEL_ENV_VAR: &str = "ZAGENT_MODEL";
pub const SYSTEM_INSTRUCTIONS_ENV_VAR: &str = "ZAGENT_SYSTEM_INSTRUCTIONS";
pub const MAX_STEPS_ENV_VAR: &str = "ZAGENT_MAX_STEPS";
pub const MAX_CORRECTIONS_ENV_VAR: &str = "ZAGENT_MAX_CORRECTIONS";
pub const WINDOW_BUDGET_ENV_VAR: &str = "ZAGENT_WINDOW_BUDGET_BYTES";

/// Default context budget for the top-level window.
pub const DEFAULT_WINDOW_BUDGET_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub config_dir: PathBuf,
    pub system_instructions: String,
    pub max_steps: usize,
    pub max_corrections: usize,
    pub window_budget_bytes: usize,
}

impl EnvConfig {
    /// Reads every `ZAGENT_*` setting, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            provider: env_string_opt(PROVIDER_ENV_VAR),
            model: env_string_opt(MODEL_ENV_VAR),
            config_dir: provider_registry::config_dir(),
            system_instructions: system_instructions_or_default(
                env_string_opt(SYSTEM_INSTRUCTIONS_ENV_VAR).as_deref(),
            ),
            max_steps: env_usize(MAX_STEPS_ENV_VAR).unwrap_or(DEFAULT_MAX_STEPS),
            max_corrections: env_usize(MAX_CORRECTIONS_ENV_VAR).unwrap_or(DEFAULT_MAX_CORRECTIONS),
            window_budget_bytes: env_usize(WINDOW_BUDGET_ENV_VAR)
                .unwrap_or(DEFAULT_WINDOW_BUDGET_BYTES),
        }
    }

    /// Loop limits and instructions for the top-level agent.
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig::default()
            .with_instructions(self.system_instructions.clone())
            .with_max_steps(self.max_steps)
            .with_max_corrections(self.max_corrections)
    }

    /// Directory holding persisted context windows.
    pub fn contexts_dir(&self) -> PathBuf {
        context_window::context_root(&self.config_dir)
    }
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    })
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = env_string_opt(key)?;
    match raw.parse::<usize>() {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(key, value = %raw, %error, "ignoring non-numeric setting");
            None
        }
    }
}
