// Pipeline entry point for CI
pub mod pipeline;

// Single-stage operator commands
pub mod check;
pub mod deploy;
pub mod provision;
pub mod state;

use anyhow::{Context as _, Result};
use ::provision::{CommandProvider, ReconcileOptions, StateBackend, StateId, VarMap};
use remote::transport::ssh::SshTransport;

use crate::Context;
use crate::config::PipelineConfig;
use crate::orchestrator::KeySource;
use crate::ui;
use crate::vars;

/// Configuration plus the state store it names
pub struct Setup {
    pub config: PipelineConfig,
    pub backend: Box<dyn StateBackend>,
    pub state_id: StateId,
}

impl Setup {
    pub fn load(ctx: &Context) -> Result<Self> {
        let config = PipelineConfig::load(&ctx.config)?;
        let backend = config.state.open()?;
        let state_id = config.state.state_id()?;
        log::debug!("Loaded {} (state key {state_id})", ctx.config.display());
        Ok(Self {
            config,
            backend,
            state_id,
        })
    }

    /// Declared variables, read from the environment
    pub fn vars(&self) -> Result<VarMap> {
        vars::from_env(&self.config.variables).context("Failed to read declared variables")
    }

    pub fn provider(&self) -> Result<CommandProvider> {
        self.config.provider.open()
    }

    /// `--jobs` wins over `[provider] jobs`
    pub fn reconcile_options(&self, jobs: Option<usize>) -> ReconcileOptions {
        let defaults = ReconcileOptions::default();
        ReconcileOptions {
            jobs: jobs.or(self.config.provider.jobs).unwrap_or(defaults.jobs).max(1),
        }
    }

    pub fn deploy_jobs(&self, jobs: Option<usize>) -> usize {
        jobs.unwrap_or(self.config.deploy.jobs).max(1)
    }

    pub fn transport(&self) -> SshTransport {
        SshTransport::new(self.config.deploy.ssh.clone())
    }

    /// SSH key: configured key file, then key material from the environment
    pub fn key_source(&self) -> KeySource {
        if let Some(path) = &self.config.connection.key_file {
            return KeySource::File(path.clone());
        }
        let env = &self.config.deploy.private_key_env;
        match std::env::var(env) {
            Ok(text) if !text.trim().is_empty() => KeySource::Material {
                text,
                path: self
                    .config
                    .deploy
                    .key_path
                    .as_deref()
                    .map(crate::config::expand_path),
            },
            _ => {
                log::warn!("{env} is not set; ssh will use its own key configuration");
                KeySource::Agent
            }
        }
    }
}

/// Ask before doing something destructive
///
/// Unattended sessions (CI) must pass `--yes` instead.
pub fn confirm(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if !console::user_attended() {
        ui::error("Refusing to continue without confirmation in an unattended session");
        ui::dim("Pass --yes to proceed");
        return Ok(false);
    }
    let confirmed = dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmed)
}
