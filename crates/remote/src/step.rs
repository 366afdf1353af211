//! Task steps and the shell scripts that implement them
//!
//! Every step is compiled to one or more POSIX `sh` phases. A phase prints
//! [`CHANGED_MARKER`] on stdout when it modified the host; a phase without
//! the marker left the host as it was.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Printed by a phase that changed the host
pub const CHANGED_MARKER: &str = "__deckhand_changed__";

/// Package manager used by a `packages` step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Pip,
}

impl PackageManager {
    fn label(self) -> &'static str {
        match self {
            Self::Apt => "apt",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Pip => "pip",
        }
    }
}

/// One idempotent unit of remote work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskStep {
    /// Install whatever is missing from `names`
    Packages {
        manager: PackageManager,
        names: Vec<String>,
        /// For pip: install into this environment instead of the system
        #[serde(default)]
        virtualenv: Option<String>,
        #[serde(default)]
        sudo: bool,
    },
    /// Python runtime environment, created only if absent
    Virtualenv {
        path: String,
        #[serde(default = "default_python")]
        python: String,
        #[serde(default)]
        sudo: bool,
    },
    /// File with exact content, mode and ownership
    File {
        path: String,
        content: String,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        owner: Option<String>,
        #[serde(default)]
        group: Option<String>,
        #[serde(default)]
        sudo: bool,
    },
    /// Arbitrary command, skipped when `creates` exists
    Shell {
        name: String,
        command: String,
        #[serde(default)]
        creates: Option<String>,
        #[serde(default)]
        sudo: bool,
    },
    /// One-time data initialization; failure is tolerated
    Initialize {
        name: String,
        command: String,
        #[serde(default)]
        sudo: bool,
    },
    /// Stop the previous instance, start detached, verify it runs
    Restart {
        name: String,
        command: String,
        #[serde(default)]
        workdir: Option<String>,
        /// Defaults to `/tmp/<name>.log`
        #[serde(default)]
        log: Option<String>,
        /// Defaults to `/tmp/<name>.pid`
        #[serde(default)]
        pid_file: Option<String>,
        /// Process pattern for stopping; defaults to the command
        #[serde(default)]
        pattern: Option<String>,
        /// Seconds to wait before checking the process is alive
        #[serde(default = "default_grace")]
        grace_secs: u64,
        #[serde(default)]
        sudo: bool,
    },
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_grace() -> u64 {
    3
}

/// How the executor treats a phase's exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// Non-zero exit fails the step
    Required,
    /// Non-zero exit is recorded and the step continues
    Tolerated,
    /// Non-zero exit fails the step's postcondition
    Verify,
}

/// One remote script invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub kind: PhaseKind,
    pub script: String,
    /// Bytes fed to the script's stdin
    pub stdin: Option<Vec<u8>>,
}

impl Phase {
    fn required(script: String) -> Self {
        Self {
            kind: PhaseKind::Required,
            script,
            stdin: None,
        }
    }
}

impl TaskStep {
    /// Human readable label
    pub fn label(&self) -> String {
        match self {
            Self::Packages { manager, names, .. } => {
                format!("packages ({}): {}", manager.label(), names.join(" "))
            }
            Self::Virtualenv { path, .. } => format!("virtualenv {path}"),
            Self::File { path, .. } => format!("file {path}"),
            Self::Shell { name, .. } => format!("shell {name}"),
            Self::Initialize { name, .. } => format!("initialize {name}"),
            Self::Restart { name, .. } => format!("restart {name}"),
        }
    }

    /// Whether the step runs with `sudo`
    pub fn sudo(&self) -> bool {
        match self {
            Self::Packages { sudo, .. }
            | Self::Virtualenv { sudo, .. }
            | Self::File { sudo, .. }
            | Self::Shell { sudo, .. }
            | Self::Initialize { sudo, .. }
            | Self::Restart { sudo, .. } => *sudo,
        }
    }

    /// Rewrite every free-text field, e.g. to render templates
    pub fn try_map_text<E>(&self, mut f: impl FnMut(&str) -> Result<String, E>) -> Result<Self, E> {
        Ok(match self {
            Self::Packages {
                manager,
                names,
                virtualenv,
                sudo,
            } => Self::Packages {
                manager: *manager,
                names: names.clone(),
                virtualenv: map_optional(virtualenv, &mut f)?,
                sudo: *sudo,
            },
            Self::Virtualenv { path, python, sudo } => Self::Virtualenv {
                path: f(path)?,
                python: python.clone(),
                sudo: *sudo,
            },
            Self::File {
                path,
                content,
                mode,
                owner,
                group,
                sudo,
            } => Self::File {
                path: f(path)?,
                content: f(content)?,
                mode: mode.clone(),
                owner: owner.clone(),
                group: group.clone(),
                sudo: *sudo,
            },
            Self::Shell {
                name,
                command,
                creates,
                sudo,
            } => Self::Shell {
                name: name.clone(),
                command: f(command)?,
                creates: map_optional(creates, &mut f)?,
                sudo: *sudo,
            },
            Self::Initialize { name, command, sudo } => Self::Initialize {
                name: name.clone(),
                command: f(command)?,
                sudo: *sudo,
            },
            Self::Restart {
                name,
                command,
                workdir,
                log,
                pid_file,
                pattern,
                grace_secs,
                sudo,
            } => Self::Restart {
                name: name.clone(),
                command: f(command)?,
                workdir: map_optional(workdir, &mut f)?,
                log: map_optional(log, &mut f)?,
                pid_file: map_optional(pid_file, &mut f)?,
                pattern: map_optional(pattern, &mut f)?,
                grace_secs: *grace_secs,
                sudo: *sudo,
            },
        })
    }

    /// Compile the step to the scripts the executor runs, in order
    pub fn phases(&self) -> Vec<Phase> {
        match self {
            Self::Packages {
                manager,
                names,
                virtualenv,
                ..
            } => vec![Phase::required(packages_script(*manager, names, virtualenv.as_deref()))],
            Self::Virtualenv { path, python, .. } => {
                vec![Phase::required(virtualenv_script(path, python))]
            }
            Self::File {
                path,
                content,
                mode,
                owner,
                group,
                ..
            } => vec![Phase {
                kind: PhaseKind::Required,
                script: file_script(path, mode.as_deref(), owner.as_deref(), group.as_deref()),
                stdin: Some(content.as_bytes().to_vec()),
            }],
            Self::Shell { command, creates, .. } => {
                vec![Phase::required(shell_script(command, creates.as_deref()))]
            }
            Self::Initialize { command, .. } => vec![Phase {
                kind: PhaseKind::Tolerated,
                script: format!("set -e\n{command}\necho {CHANGED_MARKER}\n"),
                stdin: None,
            }],
            Self::Restart {
                name,
                command,
                workdir,
                log,
                pid_file,
                pattern,
                grace_secs,
                ..
            } => {
                let log = log.clone().unwrap_or_else(|| format!("/tmp/{name}.log"));
                let pid_file = pid_file.clone().unwrap_or_else(|| format!("/tmp/{name}.pid"));
                let pattern = pattern.as_deref().unwrap_or(command);

                vec![
                    Phase {
                        kind: PhaseKind::Tolerated,
                        script: stop_script(&pid_file, pattern),
                        stdin: None,
                    },
                    Phase::required(start_script(command, workdir.as_deref(), &log, &pid_file)),
                    Phase {
                        kind: PhaseKind::Verify,
                        script: verify_script(&log, &pid_file, *grace_secs),
                        stdin: None,
                    },
                ]
            }
        }
    }
}

fn map_optional<E>(
    value: &Option<String>,
    f: &mut impl FnMut(&str) -> Result<String, E>,
) -> Result<Option<String>, E> {
    value.as_deref().map(f).transpose()
}

/// Quote a string for POSIX `sh`
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Package name without version specifier or extras, for pip probes
fn pip_probe_name(spec: &str) -> &str {
    spec.split(['=', '<', '>', '!', '~', '[', ';', ' '])
        .next()
        .unwrap_or(spec)
}

fn packages_script(manager: PackageManager, names: &[String], virtualenv: Option<&str>) -> String {
    let mut script = String::from("set -e\nmissing=\"\"\n");

    match manager {
        PackageManager::Apt | PackageManager::Dnf | PackageManager::Yum => {
            let probe = if manager == PackageManager::Apt {
                "dpkg -s"
            } else {
                "rpm -q"
            };
            for name in names {
                let quoted = shell_quote(name);
                let _ = writeln!(
                    script,
                    "{probe} {quoted} >/dev/null 2>&1 || missing=\"$missing {quoted}\""
                );
            }
            let install = match manager {
                PackageManager::Apt => {
                    "export DEBIAN_FRONTEND=noninteractive\n  apt-get update -qq\n  eval \"apt-get install -y -qq $missing\""
                }
                PackageManager::Dnf => "eval \"dnf install -y -q $missing\"",
                _ => "eval \"yum install -y -q $missing\"",
            };
            let _ = write!(
                script,
                "if [ -n \"$missing\" ]; then\n  {install}\n  echo {CHANGED_MARKER}\nfi\n"
            );
        }
        PackageManager::Pip => {
            let pip = virtualenv.map_or_else(|| "pip3".to_string(), |v| shell_quote(&format!("{v}/bin/pip")));
            for name in names {
                let _ = writeln!(
                    script,
                    "{pip} show {} >/dev/null 2>&1 || missing=\"$missing {}\"",
                    shell_quote(pip_probe_name(name)),
                    shell_quote(name)
                );
            }
            let _ = write!(
                script,
                "if [ -n \"$missing\" ]; then\n  eval \"{pip} install -q $missing\"\n  echo {CHANGED_MARKER}\nfi\n"
            );
        }
    }

    script
}

fn virtualenv_script(path: &str, python: &str) -> String {
    let interpreter = shell_quote(&format!("{path}/bin/python"));
    format!(
        "set -e\nif [ -x {interpreter} ]; then exit 0; fi\n{python} -m venv {}\necho {CHANGED_MARKER}\n",
        shell_quote(path)
    )
}

fn file_script(path: &str, mode: Option<&str>, owner: Option<&str>, group: Option<&str>) -> String {
    let mut script = format!(
        "set -e\ntarget={}\ntmp=\"$target.deckhand.$$\"\nmkdir -p \"$(dirname \"$target\")\"\ncat > \"$tmp\"\n\
         if [ -f \"$target\" ] && cmp -s \"$tmp\" \"$target\"; then\n  rm -f \"$tmp\"\nelse\n  mv -f \"$tmp\" \"$target\"\n  echo {CHANGED_MARKER}\nfi\n",
        shell_quote(path)
    );
    if let Some(mode) = mode {
        let _ = writeln!(script, "chmod {} \"$target\"", shell_quote(mode));
    }
    if let Some(owner) = owner {
        let _ = writeln!(script, "chown {} \"$target\"", shell_quote(owner));
    }
    if let Some(group) = group {
        let _ = writeln!(script, "chgrp {} \"$target\"", shell_quote(group));
    }
    script
}

fn shell_script(command: &str, creates: Option<&str>) -> String {
    let guard = creates
        .map(|path| format!("if [ -e {} ]; then exit 0; fi\n", shell_quote(path)))
        .unwrap_or_default();
    format!("set -e\n{guard}{command}\necho {CHANGED_MARKER}\n")
}

/// `pkill -f` pattern that cannot match the shell running it: the first
/// letter or digit is bracketed, so `app.py` becomes `[a]pp.py` and
/// `/opt/app` becomes `/[o]pt/app`
fn self_excluding(pattern: &str) -> String {
    match pattern.char_indices().find(|(_, c)| c.is_ascii_alphanumeric()) {
        Some((at, c)) => {
            let rest = &pattern[at + c.len_utf8()..];
            format!("{}[{c}]{rest}", &pattern[..at])
        }
        None => pattern.to_string(),
    }
}

fn stop_script(pid_file: &str, pattern: &str) -> String {
    let pid = shell_quote(pid_file);
    format!(
        "stopped=\"\"\n\
         if [ -f {pid} ] && kill \"$(cat {pid})\" 2>/dev/null; then stopped=1; fi\n\
         rm -f {pid}\n\
         if pkill -f -- {} 2>/dev/null; then stopped=1; fi\n\
         if [ -z \"$stopped\" ]; then echo 'no running instance found' >&2; exit 1; fi\n\
         sleep 1\n",
        shell_quote(&self_excluding(pattern))
    )
}

fn start_script(command: &str, workdir: Option<&str>, log: &str, pid_file: &str) -> String {
    let cd = workdir
        .map(|dir| format!("cd {}\n", shell_quote(dir)))
        .unwrap_or_default();
    let log = shell_quote(log);
    let pid = shell_quote(pid_file);
    format!(
        "set -e\n{cd}mkdir -p \"$(dirname {log})\" \"$(dirname {pid})\"\n\
         nohup setsid sh -c {} > {log} 2>&1 < /dev/null &\n\
         echo $! > {pid}\n\
         echo {CHANGED_MARKER}\n",
        shell_quote(command)
    )
}

fn verify_script(log: &str, pid_file: &str, grace_secs: u64) -> String {
    let log = shell_quote(log);
    let pid = shell_quote(pid_file);
    format!(
        "sleep {grace_secs}\n\
         if [ -f {pid} ] && kill -0 \"$(cat {pid})\" 2>/dev/null; then exit 0; fi\n\
         echo 'process is not running; last log lines:' >&2\n\
         tail -n 20 {log} >&2 2>/dev/null\n\
         exit 1\n"
    )
}
