//! Pipeline configuration (`deckhand.toml`)

use crate::extract::OutputSchema;
use crate::inventory::ConnectionDefaults;
use crate::vars::VariableDecl;
use anyhow::{Context, Result, bail};
use provision::{CommandProvider, HttpBackend, LocalBackend, ResourceSpec, StateBackend, StateId};
use remote::TaskStep;
use remote::transport::ssh::SshOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: &str = "deckhand.toml";

/// Expand `~` and environment variables in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).map_or_else(
        |_| shellexpand::tilde(path).into_owned(),
        std::borrow::Cow::into_owned,
    );
    PathBuf::from(expanded)
}

/// Default root for local state files
pub fn default_state_dir() -> Result<PathBuf> {
    let data = dirs::data_local_dir().context("Could not determine local data directory")?;
    Ok(data.join("deckhand").join("state"))
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Http,
}

/// `[state]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: BackendKind,
    /// Logical key of the state object and its lock
    pub key: String,
    /// Local backend directory
    pub path: Option<String>,
    /// HTTP backend base address
    pub address: Option<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            key: "deckhand".to_string(),
            path: None,
            address: None,
        }
    }
}

impl StateConfig {
    pub fn state_id(&self) -> Result<StateId> {
        StateId::new(&self.key).with_context(|| format!("Invalid state key '{}'", self.key))
    }

    pub fn open(&self) -> Result<Box<dyn StateBackend>> {
        match self.backend {
            BackendKind::Local => {
                let root = match &self.path {
                    Some(path) => expand_path(path),
                    None => default_state_dir()?,
                };
                log::debug!("Using local state under {}", root.display());
                Ok(Box::new(LocalBackend::new(root)))
            }
            BackendKind::Http => {
                let Some(address) = &self.address else {
                    bail!("[state] backend = \"http\" requires an address");
                };
                log::debug!("Using HTTP state at {address}");
                Ok(Box::new(HttpBackend::new(address.as_str())))
            }
        }
    }
}

/// `[provider]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Plugin executable
    pub program: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Concurrent resource operations per stage
    pub jobs: Option<usize>,
}

impl ProviderConfig {
    pub fn open(&self) -> Result<CommandProvider> {
        let Some(program) = &self.program else {
            bail!("No provider configured; set [provider] program");
        };
        let mut provider = CommandProvider::new(expand_path(program)).with_args(self.args.clone());
        for (key, value) in &self.env {
            provider = provider.with_env(key, value);
        }
        Ok(provider)
    }
}

/// `[deploy]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub steps: Vec<TaskStep>,
    /// Targets configured in parallel
    pub jobs: usize,
    /// Environment variable holding the SSH private key
    pub private_key_env: String,
    /// Where to write the key; a temporary file when unset
    pub key_path: Option<String>,
    pub ssh: SshOptions,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            jobs: 4,
            private_key_env: "SSH_PRIVATE_KEY".to_string(),
            key_path: None,
            ssh: SshOptions::default(),
        }
    }
}

/// `[trigger]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Ref or event names that select the destroy branch
    pub destroy: Vec<String>,
    /// Require a successful verification before destroying too
    pub gate_destroy: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            destroy: vec!["destroy".to_string()],
            gate_destroy: false,
        }
    }
}

// ============================================================================
// Pipeline Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub state: StateConfig,
    pub provider: ProviderConfig,
    pub variables: BTreeMap<String, VariableDecl>,
    pub resources: Vec<ResourceSpec>,
    pub outputs: OutputSchema,
    pub connection: ConnectionDefaults,
    pub deploy: DeployConfig,
    pub trigger: TriggerConfig,
    /// Where outputs.json and inventory.ini are written
    pub artifacts_dir: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state: StateConfig::default(),
            provider: ProviderConfig::default(),
            variables: BTreeMap::new(),
            resources: Vec::new(),
            outputs: OutputSchema::default(),
            connection: ConnectionDefaults::default(),
            deploy: DeployConfig::default(),
            trigger: TriggerConfig::default(),
            artifacts_dir: ".deckhand".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.deploy.jobs == 0 {
            bail!("deploy.jobs must be at least 1");
        }
        if config.provider.jobs == Some(0) {
            bail!("provider.jobs must be at least 1");
        }
        Ok(config)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        expand_path(&self.artifacts_dir)
    }

    pub fn outputs_path(&self) -> PathBuf {
        self.artifacts_dir().join("outputs.json")
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.artifacts_dir().join("inventory.ini")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::VarKind;
    use provision::OutputKind;
    use remote::PackageManager;
    use remote::transport::ssh::HostKeyPolicy;
    use serde_json::json;

    const EXAMPLE: &str = r#"
artifacts_dir = "build/deckhand"

[state]
backend = "http"
key = "webapp/prod"
address = "https://state.example.com/v1"

[provider]
program = "deckhand-aws"
args = ["--region", "us-east-1"]
jobs = 2

[variables.vpc_id]
env = "VPC_ID"

[variables.subnet_ids]
env = "SUBNET_IDS"
kind = "list"

[[resources]]
type = "aws_security_group"
name = "web"
attributes = { vpc_id = "${var.vpc_id}" }

[[resources]]
type = "aws_instance"
name = "web_1"
attributes = { ami = "ami-0abc", security_groups = ["${aws_security_group.web.id}"] }
outputs = [{ name = "ec2_public_ips", attribute = "public_ip", list = true }]

[outputs]
targets = "ec2_public_ips"
required = { rds_endpoint = "scalar" }

[connection]
user = "ubuntu"

[deploy]
jobs = 8
ssh = { host_key_policy = "off", connect_timeout = 5 }

[[deploy.steps]]
kind = "packages"
manager = "apt"
names = ["python3-venv"]
sudo = true

[[deploy.steps]]
kind = "restart"
name = "app"
command = "venv/bin/python app.py"

[trigger]
destroy = ["destroy", "teardown"]
gate_destroy = true
"#;

    #[test]
    fn test_parse_full_config() {
        let config = PipelineConfig::parse(EXAMPLE).unwrap();

        assert_eq!(config.state.backend, BackendKind::Http);
        assert_eq!(config.state.state_id().unwrap().as_str(), "webapp/prod");
        assert_eq!(config.provider.jobs, Some(2));
        assert_eq!(config.variables["subnet_ids"].kind, VarKind::List);
        assert_eq!(config.variables["vpc_id"].kind, VarKind::String);

        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[0].attributes["vpc_id"], json!("${var.vpc_id}"));
        assert!(config.resources[1].outputs[0].list);

        assert_eq!(config.outputs.required["rds_endpoint"], OutputKind::Scalar);
        assert_eq!(config.connection.user, "ubuntu");
        assert_eq!(config.connection.group, "web");

        assert_eq!(config.deploy.jobs, 8);
        assert_eq!(config.deploy.private_key_env, "SSH_PRIVATE_KEY");
        assert_eq!(config.deploy.ssh.host_key_policy, HostKeyPolicy::Off);
        assert_eq!(config.deploy.ssh.program, "ssh");
        assert!(matches!(
            config.deploy.steps[0],
            TaskStep::Packages {
                manager: PackageManager::Apt,
                sudo: true,
                ..
            }
        ));
        assert!(matches!(
            config.deploy.steps[1],
            TaskStep::Restart { grace_secs: 3, .. }
        ));

        assert!(config.trigger.gate_destroy);
        assert_eq!(config.outputs_path(), PathBuf::from("build/deckhand/outputs.json"));
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::parse("").unwrap();
        assert_eq!(config.state.key, "deckhand");
        assert_eq!(config.trigger.destroy, vec!["destroy"]);
        assert!(!config.trigger.gate_destroy);
        assert_eq!(config.outputs.targets, "ec2_public_ips");
        assert_eq!(config.connection.user, "ec2-user");
        assert_eq!(config.inventory_path(), PathBuf::from(".deckhand/inventory.ini"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(PipelineConfig::parse("[deploy]\njobs = 0\n").is_err());
        assert!(PipelineConfig::parse("[state]\nbackend = \"s3\"\n").is_err());
        assert!(PipelineConfig::parse("[[deploy.steps]]\nkind = \"reboot\"\n").is_err());
    }

    #[test]
    fn test_http_backend_requires_address() {
        let config = PipelineConfig::parse("[state]\nbackend = \"http\"\n").unwrap();
        assert!(config.state.open().is_err());
        assert!(config.provider.open().is_err());
    }

    #[test]
    fn test_local_backend_path_is_expanded() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = PipelineConfig::parse(&format!(
            "[state]\npath = \"{}\"\n",
            dir.path().display()
        ))
        .unwrap();
        let backend = config.state.open().unwrap();
        let id = config.state.state_id().unwrap();
        assert!(backend.read(&id).unwrap().is_none());
    }
}
