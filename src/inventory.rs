//! Inventory building - deployment targets from extracted outputs
//!
//! The inventory file is grouped INI:
//!
//! ```text
//! [web]
//! 1.2.3.4 ansible_user=ec2-user ansible_ssh_private_key_file=/run/key.pem
//! ```

use crate::extract::ExtractedValues;
use remote::InventoryRecord;
use remote::types::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

const USER_KEY: &str = "ansible_user";
const KEY_FILE_KEY: &str = "ansible_ssh_private_key_file";
const PORT_KEY: &str = "ansible_port";

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("target {index} has a blank address")]
    BlankAddress { index: usize },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("failed to access inventory file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// `[connection]` settings shared by every target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionDefaults {
    /// Login identity
    pub user: String,
    /// Private key file; the deploy stage fills this in when the key comes
    /// from the environment
    pub key_file: Option<PathBuf>,
    pub group: String,
    pub port: u16,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            user: "ec2-user".to_string(),
            key_file: None,
            group: "web".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// One record per target address, in output order
///
/// Duplicate addresses collapse to their first occurrence.
pub fn build(
    values: &ExtractedValues,
    defaults: &ConnectionDefaults,
) -> Result<Vec<InventoryRecord>, InventoryError> {
    let mut seen = BTreeSet::new();
    let mut records = Vec::with_capacity(values.targets.len());

    for (index, address) in values.targets.iter().enumerate() {
        let host = address.trim();
        if host.is_empty() {
            return Err(InventoryError::BlankAddress { index: index + 1 });
        }
        if !seen.insert(host) {
            log::warn!("Duplicate target address {host} ignored");
            continue;
        }

        let mut record = InventoryRecord::new(host, &defaults.user, &defaults.group)
            .with_port(defaults.port);
        if let Some(key) = &defaults.key_file {
            record = record.with_key_file(key);
        }
        records.push(record);
    }

    Ok(records)
}

/// Render records grouped by group, groups in first-seen order
pub fn render(records: &[InventoryRecord]) -> String {
    let mut groups: Vec<&str> = Vec::new();
    for record in records {
        if !groups.contains(&record.group.as_str()) {
            groups.push(&record.group);
        }
    }

    let mut out = String::new();
    for (i, group) in groups.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format!("[{group}]\n"));
        for record in records.iter().filter(|r| r.group == *group) {
            out.push_str(&record.host);
            out.push_str(&format!(" {USER_KEY}={}", quote_value(&record.user)));
            if let Some(key) = &record.key_file {
                let key = key.display().to_string();
                out.push_str(&format!(" {KEY_FILE_KEY}={}", quote_value(&key)));
            }
            if record.port != DEFAULT_PORT {
                out.push_str(&format!(" {PORT_KEY}={}", record.port));
            }
            out.push('\n');
        }
    }
    out
}

/// Double-quote a host variable value when it would not survive
/// whitespace splitting
fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.contains(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'));
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Split a host line on whitespace outside quotes, unquoting values
///
/// Double quotes honor `\` escapes; single quotes are literal.
fn split_fields(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_field = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_field {
                    fields.push(std::mem::take(&mut current));
                    in_field = false;
                }
            }
            '"' => {
                in_field = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err("unterminated escape".into()),
                        },
                        Some(other) => current.push(other),
                        None => return Err("unterminated double quote".into()),
                    }
                }
            }
            '\'' => {
                in_field = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(other) => current.push(other),
                        None => return Err("unterminated single quote".into()),
                    }
                }
            }
            other => {
                in_field = true;
                current.push(other);
            }
        }
    }
    if in_field {
        fields.push(current);
    }
    Ok(fields)
}

/// Parse an inventory file written by [`render`]
///
/// Unknown host variables are ignored; hosts outside a group are rejected.
pub fn parse(text: &str) -> Result<Vec<InventoryRecord>, InventoryError> {
    let mut group: Option<String> = None;
    let mut records = Vec::new();

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            group = Some(name.trim().to_string());
            continue;
        }

        let Some(group) = &group else {
            return Err(InventoryError::Parse {
                line: line_no,
                message: "host outside of a [group]".into(),
            });
        };

        let fields = split_fields(line).map_err(|message| InventoryError::Parse {
            line: line_no,
            message,
        })?;
        let mut fields = fields.iter();
        let host = fields.next().map(String::as_str).unwrap_or_default();
        let mut record = InventoryRecord::new(host, "", group.as_str());

        for field in fields {
            let Some((key, value)) = field.split_once('=') else {
                return Err(InventoryError::Parse {
                    line: line_no,
                    message: format!("expected key=value, got '{field}'"),
                });
            };
            match key {
                USER_KEY => record.user = value.to_string(),
                KEY_FILE_KEY => record.key_file = Some(PathBuf::from(value)),
                PORT_KEY => {
                    record.port = value.parse().map_err(|_| InventoryError::Parse {
                        line: line_no,
                        message: format!("invalid port '{value}'"),
                    })?;
                }
                _ => log::debug!("Ignoring host variable {key} on line {line_no}"),
            }
        }
        records.push(record);
    }

    Ok(records)
}

pub fn write(path: &Path, records: &[InventoryRecord]) -> Result<(), InventoryError> {
    let io_error = |source| InventoryError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    fs::write(path, render(records)).map_err(io_error)
}

pub fn read(path: &Path) -> Result<Vec<InventoryRecord>, InventoryError> {
    let text = fs::read_to_string(path).map_err(|source| InventoryError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn values(targets: &[&str]) -> ExtractedValues {
        ExtractedValues {
            targets: targets.iter().map(ToString::to_string).collect(),
            ..ExtractedValues::default()
        }
    }

    fn defaults() -> ConnectionDefaults {
        ConnectionDefaults {
            key_file: Some(PathBuf::from("/run/deckhand/key.pem")),
            ..ConnectionDefaults::default()
        }
    }

    #[test]
    fn test_two_addresses_two_records_same_login() {
        let records = build(&values(&["1.2.3.4", "5.6.7.8"]), &defaults()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].host, "1.2.3.4");
        assert_eq!(records[1].host, "5.6.7.8");
        for record in &records {
            assert_eq!(record.user, "ec2-user");
            assert_eq!(record.group, "web");
            assert_eq!(record.key_file.as_deref(), Some(Path::new("/run/deckhand/key.pem")));
        }
    }

    #[test]
    fn test_empty_list_is_empty_inventory() {
        assert!(build(&values(&[]), &defaults()).unwrap().is_empty());
    }

    #[test]
    fn test_blank_address_rejected() {
        let err = build(&values(&["1.2.3.4", "  "]), &defaults()).unwrap_err();
        assert!(matches!(err, InventoryError::BlankAddress { index: 2 }));
    }

    #[test]
    fn test_duplicates_collapse_to_first() {
        let records = build(&values(&["1.2.3.4", "5.6.7.8", "1.2.3.4"]), &defaults()).unwrap();
        let hosts: Vec<_> = records.iter().map(|r| r.host.as_str()).collect();
        assert_eq!(hosts, vec!["1.2.3.4", "5.6.7.8"]);
    }

    #[test]
    fn test_render_format() {
        let mut records = build(&values(&["1.2.3.4"]), &defaults()).unwrap();
        records.push(InventoryRecord::new("10.0.0.9", "admin", "db").with_port(2222));

        assert_eq!(
            render(&records),
            "[web]\n\
             1.2.3.4 ansible_user=ec2-user ansible_ssh_private_key_file=/run/deckhand/key.pem\n\
             \n\
             [db]\n\
             10.0.0.9 ansible_user=admin ansible_port=2222\n"
        );
    }

    #[test]
    fn test_parse_reads_what_render_writes() {
        let mut records = build(&values(&["1.2.3.4", "5.6.7.8"]), &defaults()).unwrap();
        records.push(InventoryRecord::new("10.0.0.9", "admin", "db").with_port(2222));
        assert_eq!(parse(&render(&records)).unwrap(), records);
    }

    #[test]
    fn test_key_file_with_spaces_is_quoted() {
        let defaults = ConnectionDefaults {
            key_file: Some(PathBuf::from("/home/ci/my keys/deploy \"prod\".pem")),
            ..ConnectionDefaults::default()
        };
        let records = build(&values(&["1.2.3.4"]), &defaults).unwrap();

        let text = render(&records);
        assert!(text.contains(
            r#"ansible_ssh_private_key_file="/home/ci/my keys/deploy \"prod\".pem""#
        ));
        assert_eq!(parse(&text).unwrap(), records);

        let parsed = parse("[web]\n1.2.3.4 ansible_ssh_private_key_file='/tmp/a b.pem'\n").unwrap();
        assert_eq!(parsed[0].key_file.as_deref(), Some(Path::new("/tmp/a b.pem")));
        assert!(matches!(
            parse("[web]\n1.2.3.4 ansible_user=\"ec2-user\n"),
            Err(InventoryError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_parse_errors_and_comments() {
        let parsed = parse("# generated\n[web]\n1.2.3.4 ansible_user=ubuntu ansible_python_interpreter=/usr/bin/python3\n").unwrap();
        assert_eq!(parsed, vec![InventoryRecord::new("1.2.3.4", "ubuntu", "web")]);

        assert!(matches!(
            parse("1.2.3.4 ansible_user=ubuntu\n"),
            Err(InventoryError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            parse("[web]\n1.2.3.4 ansible_port=ssh\n"),
            Err(InventoryError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".deckhand/inventory.ini");
        let records = build(&values(&["1.2.3.4"]), &defaults()).unwrap();
        write(&path, &records).unwrap();
        assert_eq!(read(&path).unwrap(), records);
    }
}
