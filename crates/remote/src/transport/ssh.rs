//! Transport over the system `ssh` client

use super::{CommandOutput, Transport};
use crate::error::{Error, Result};
use crate::step::shell_quote;
use crate::types::InventoryRecord;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// ssh reserves this exit status for its own errors
const SSH_ERROR_STATUS: i32 = 255;

/// `StrictHostKeyChecking` policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Trust unknown hosts on first contact, reject changed keys
    #[default]
    AcceptNew,
    /// Only connect to hosts already in known_hosts
    Strict,
    /// Never check host keys
    Off,
}

impl HostKeyPolicy {
    fn option(self) -> &'static str {
        match self {
            Self::AcceptNew => "StrictHostKeyChecking=accept-new",
            Self::Strict => "StrictHostKeyChecking=yes",
            Self::Off => "StrictHostKeyChecking=no",
        }
    }
}

/// Connection options for [`SshTransport`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshOptions {
    /// ssh binary
    pub program: String,
    pub host_key_policy: HostKeyPolicy,
    /// Seconds
    pub connect_timeout: u64,
    /// Extra `-o` options, e.g. `ServerAliveInterval=30`
    pub options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            host_key_policy: HostKeyPolicy::default(),
            connect_timeout: 10,
            options: Vec::new(),
        }
    }
}

/// Runs scripts through `ssh <host> sh -c '<script>'`
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    options: SshOptions,
    identity: Option<PathBuf>,
}

impl SshTransport {
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            identity: None,
        }
    }

    /// Key file used for every target, overriding the record's `key_file`
    #[must_use]
    pub fn with_identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity = Some(path.into());
        self
    }

    /// Full argument list for one invocation
    pub fn args(&self, target: &InventoryRecord, script: &str, sudo: bool) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            self.options.host_key_policy.option().to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout),
        ];
        for option in &self.options.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }

        args.push("-p".to_string());
        args.push(target.port.to_string());

        if let Some(key) = self.identity.as_ref().or(target.key_file.as_ref()) {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }

        args.push("-l".to_string());
        args.push(target.user.clone());
        args.push(target.host.clone());
        args.push("--".to_string());

        let shell = if sudo { "sudo -n sh -c" } else { "sh -c" };
        args.push(format!("{shell} {}", shell_quote(script)));
        args
    }
}

impl Transport for SshTransport {
    fn run(
        &self,
        target: &InventoryRecord,
        script: &str,
        stdin: Option<&[u8]>,
        sudo: bool,
    ) -> Result<CommandOutput> {
        let mut child = Command::new(&self.options.program)
            .args(self.args(target, script, sudo))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Connection {
                host: target.host.clone(),
                message: format!("failed to execute {}: {e}", self.options.program),
            })?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes)?;
        }
        let output = child.wait_with_output()?;

        let status = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if status == Some(SSH_ERROR_STATUS) {
            return Err(Error::Connection {
                host: target.host.clone(),
                message: stderr,
            });
        }

        Ok(CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> InventoryRecord {
        InventoryRecord::new("1.2.3.4", "ec2-user", "web").with_key_file("/keys/deploy.pem")
    }

    #[test]
    fn test_args_use_record_key_and_batch_mode() {
        let transport = SshTransport::default();
        let args = transport.args(&target(), "echo hi", false);

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));

        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/keys/deploy.pem");
        let l = args.iter().position(|a| a == "-l").unwrap();
        assert_eq!(args[l + 1], "ec2-user");
        assert_eq!(args[l + 2], "1.2.3.4");
        assert_eq!(args.last().unwrap(), "sh -c 'echo hi'");
    }

    #[test]
    fn test_identity_overrides_record_and_sudo_wraps() {
        let transport = SshTransport::new(SshOptions {
            host_key_policy: HostKeyPolicy::Strict,
            ..SshOptions::default()
        })
        .with_identity("/run/key");
        let args = transport.args(&target().with_port(2222), "it's", true);

        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/run/key");
        assert!(args.contains(&"StrictHostKeyChecking=yes".to_string()));
        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "2222");
        assert_eq!(args.last().unwrap(), r"sudo -n sh -c 'it'\''s'");
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_255_is_connection_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let fake = dir.path().join("fake-ssh");
        std::fs::write(&fake, "#!/bin/sh\necho 'Connection refused' >&2\nexit 255\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let transport = SshTransport::new(SshOptions {
            program: fake.display().to_string(),
            ..SshOptions::default()
        });
        match transport.run(&target(), "true", None, false) {
            Err(Error::Connection { host, message }) => {
                assert_eq!(host, "1.2.3.4");
                assert_eq!(message, "Connection refused");
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }
}
