//! Provider backed by an external plugin executable
//!
//! For each operation the plugin is run as `<program> [args...] <operation>`
//! with a JSON request on stdin:
//!
//! ```json
//! {"operation": "create", "type": "aws_instance", "name": "web",
//!  "attributes": {...}, "live": {...}}
//! ```
//!
//! and answers on stdout with `{"attributes": {...}}`. Empty stdout means no
//! computed attributes. A non-zero exit status is a failure and stderr is
//! reported verbatim.

use super::{Provider, ResourceRequest};
use crate::error::ProviderError;
use crate::types::{Address, Attributes};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

#[derive(Serialize)]
struct Request<'a> {
    operation: &'a str,
    #[serde(rename = "type")]
    resource_type: &'a str,
    name: &'a str,
    attributes: &'a Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    live: Option<&'a Attributes>,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    attributes: Attributes,
}

/// Runs a plugin command per operation
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandProvider {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Extra environment for the plugin process
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn invoke(
        &self,
        operation: &str,
        address: &Address,
        attributes: &Attributes,
        live: Option<&Attributes>,
    ) -> Result<Attributes, ProviderError> {
        let request = serde_json::to_vec(&Request {
            operation,
            resource_type: &address.resource_type,
            name: &address.name,
            attributes,
            live,
        })
        .map_err(|e| ProviderError::Other(format!("failed to encode request: {e}")))?;

        log::debug!("{} {operation} {address}", self.program.display());

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(operation)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&request)?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(ProviderError::Failed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Attributes::new());
        }

        let response: Response = serde_json::from_str(&stdout)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(response.attributes)
    }
}

impl Provider for CommandProvider {
    fn create(&self, request: &ResourceRequest) -> Result<Attributes, ProviderError> {
        self.invoke("create", &request.address, &request.attributes, None)
    }

    fn update(&self, request: &ResourceRequest, live: &Attributes) -> Result<Attributes, ProviderError> {
        self.invoke("update", &request.address, &request.attributes, Some(live))
    }

    fn delete(&self, address: &Address, live: &Attributes) -> Result<(), ProviderError> {
        self.invoke("delete", address, &Attributes::new(), Some(live))
            .map(|_| ())
    }
}
