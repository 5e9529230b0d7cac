use std::io;

use anyhow::{Context, Result};
use zagent::{logging, EnvConfig, Providers, Session, SessionOptions};

fn main() -> Result<()> {
    logging::init();
    let config = EnvConfig::from_env();

    let providers = Providers::load(&config.config_dir).with_context(|| {
        format!(
            "failed to load provider settings from {}",
            config.config_dir.display()
        )
    })?;
    let backend = providers
        .select(config.provider.as_deref(), config.model.as_deref())
        .context("failed to select a provider")?;

    let workspace_root = std::env::current_dir().context("failed to resolve working directory")?;
    let options = SessionOptions {
        workspace_root,
        contexts_dir: config.contexts_dir(),
        loop_config: config.loop_config(),
        window_budget_bytes: config.window_budget_bytes,
    };

    let stdout = io::stdout();
    let mut session = Session::new(options, providers, backend, stdout.lock())
        .context("failed to start session")?;
    session.run(io::stdin().lock())?;
    Ok(())
}
