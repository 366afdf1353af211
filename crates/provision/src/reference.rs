//! `${...}` references inside attribute values
//!
//! Two forms are understood:
//! - `${var.NAME}` - a declared variable
//! - `${TYPE.NAME.ATTR}` - a live attribute of another resource
//!
//! A string that is exactly one reference resolves to the referenced JSON
//! value unchanged, so list variables stay lists. References embedded in a
//! longer string are substituted as text.
//!
//! `$${...}` is an escape: it resolves to the literal text `${...}`, so shell
//! scripts in attributes such as `user_data` can still use `${HOME}`.

use crate::types::{Address, Attributes, is_identifier, json_text};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(\$)?\{\s*([^}]*?)\s*\}").expect("reference pattern is a valid regex")
});

/// A parsed reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Var(String),
    Attribute { address: Address, attribute: String },
}

impl Reference {
    /// Parse the text between `${` and `}`
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split('.').collect();
        match parts.as_slice() {
            ["var", name] if is_identifier(name) => Some(Self::Var((*name).to_string())),
            [resource_type, name, attribute]
                if *resource_type != "var"
                    && is_identifier(resource_type)
                    && is_identifier(name)
                    && is_identifier(attribute) =>
            {
                Some(Self::Attribute {
                    address: Address::new(*resource_type, *name),
                    attribute: (*attribute).to_string(),
                })
            }
            _ => None,
        }
    }
}

/// Source of values for resolution
pub trait Lookup {
    fn var(&self, name: &str) -> Option<&Value>;
    fn attribute(&self, address: &Address, attribute: &str) -> Option<&Value>;

    fn lookup(&self, reference: &Reference) -> Option<&Value> {
        match reference {
            Reference::Var(name) => self.var(name),
            Reference::Attribute { address, attribute } => self.attribute(address, attribute),
        }
    }
}

/// Outcome of resolving a value
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Every reference had a value
    Known(Value),
    /// The named reference has no value yet (resource not created)
    Pending(String),
}

/// Collect every reference in a value, recursing into arrays and objects.
///
/// Returns the raw text of the first malformed reference as the error.
pub fn scan(value: &Value) -> Result<Vec<Reference>, String> {
    let mut found = Vec::new();
    scan_into(value, &mut found)?;
    Ok(found)
}

fn scan_into(value: &Value, found: &mut Vec<Reference>) -> Result<(), String> {
    match value {
        Value::String(s) => {
            for caps in REFERENCE.captures_iter(s).filter(|caps| !is_escaped(caps)) {
                let raw = &caps[2];
                found.push(Reference::parse(raw).ok_or_else(|| raw.to_string())?);
            }
        }
        Value::Array(items) => {
            for item in items {
                scan_into(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                scan_into(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Resolve every reference in a value
pub fn resolve(value: &Value, lookup: &dyn Lookup) -> Resolution {
    match value {
        Value::String(s) => resolve_str(s, lookup),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                match resolve(item, lookup) {
                    Resolution::Known(v) => resolved.push(v),
                    pending @ Resolution::Pending(_) => return pending,
                }
            }
            Resolution::Known(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                match resolve(item, lookup) {
                    Resolution::Known(v) => {
                        resolved.insert(key.clone(), v);
                    }
                    pending @ Resolution::Pending(_) => return pending,
                }
            }
            Resolution::Known(Value::Object(resolved))
        }
        other => Resolution::Known(other.clone()),
    }
}

/// Resolve a whole attribute map, stopping at the first pending reference
pub fn resolve_all(attributes: &Attributes, lookup: &dyn Lookup) -> Result<Attributes, String> {
    let mut resolved = Attributes::new();
    for (key, value) in attributes {
        match resolve(value, lookup) {
            Resolution::Known(v) => {
                resolved.insert(key.clone(), v);
            }
            Resolution::Pending(raw) => return Err(raw),
        }
    }
    Ok(resolved)
}

fn is_escaped(caps: &regex::Captures<'_>) -> bool {
    caps.get(1).is_some()
}

fn resolve_str(s: &str, lookup: &dyn Lookup) -> Resolution {
    if let Some(caps) = REFERENCE.captures(s)
        && !is_escaped(&caps)
        && caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len())
    {
        let raw = &caps[2];
        return match Reference::parse(raw).as_ref().and_then(|r| lookup.lookup(r)) {
            Some(v) => Resolution::Known(v.clone()),
            None => Resolution::Pending(raw.to_string()),
        };
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in REFERENCE.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&s[last..whole.start()]);
        last = whole.end();
        if is_escaped(&caps) {
            // drop the escaping `$`
            out.push_str(&whole.as_str()[1..]);
            continue;
        }
        let raw = &caps[2];
        match Reference::parse(raw).as_ref().and_then(|r| lookup.lookup(r)) {
            Some(v) => out.push_str(&json_text(v)),
            None => return Resolution::Pending(raw.to_string()),
        }
    }
    out.push_str(&s[last..]);
    Resolution::Known(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Fixture {
        vars: BTreeMap<String, Value>,
        live: BTreeMap<Address, Attributes>,
    }

    impl Lookup for Fixture {
        fn var(&self, name: &str) -> Option<&Value> {
            self.vars.get(name)
        }

        fn attribute(&self, address: &Address, attribute: &str) -> Option<&Value> {
            self.live.get(address).and_then(|attrs| attrs.get(attribute))
        }
    }

    fn fixture() -> Fixture {
        let mut vars = BTreeMap::new();
        vars.insert("subnet_ids".to_string(), json!(["subnet-a", "subnet-b"]));
        vars.insert("ami_id".to_string(), json!("ami-123"));

        let mut vpc = Attributes::new();
        vpc.insert("id".to_string(), json!("vpc-9"));
        let mut live = BTreeMap::new();
        live.insert(Address::new("aws_vpc", "main"), vpc);

        Fixture { vars, live }
    }

    #[test]
    fn test_parse_reference_forms() {
        assert_eq!(
            Reference::parse("var.ami_id"),
            Some(Reference::Var("ami_id".into()))
        );
        assert_eq!(
            Reference::parse("aws_vpc.main.id"),
            Some(Reference::Attribute {
                address: Address::new("aws_vpc", "main"),
                attribute: "id".into(),
            })
        );
        assert_eq!(Reference::parse("aws_vpc.main"), None);
        assert_eq!(Reference::parse("var.a.b"), None);
        assert_eq!(Reference::parse(""), None);
    }

    #[test]
    fn test_scan_finds_nested_references() {
        let value = json!({
            "tags": { "Name": "web-${var.ami_id}" },
            "subnets": ["${var.subnet_ids}", "${aws_vpc.main.id}"]
        });
        let refs = scan(&value).unwrap();
        assert_eq!(refs.len(), 3);
        assert!(refs.contains(&Reference::Var("subnet_ids".into())));
    }

    #[test]
    fn test_scan_reports_malformed() {
        assert_eq!(scan(&json!("${not valid}")), Err("not valid".to_string()));
    }

    #[test]
    fn test_whole_reference_keeps_json_type() {
        let fx = fixture();
        assert_eq!(
            resolve(&json!("${var.subnet_ids}"), &fx),
            Resolution::Known(json!(["subnet-a", "subnet-b"]))
        );
    }

    #[test]
    fn test_embedded_reference_is_textual() {
        let fx = fixture();
        assert_eq!(
            resolve(&json!("in ${aws_vpc.main.id} with ${var.ami_id}"), &fx),
            Resolution::Known(json!("in vpc-9 with ami-123"))
        );
    }

    #[test]
    fn test_escaped_reference_is_literal() {
        let fx = fixture();
        let script = json!("#!/bin/sh\necho $${HOME} > /tmp/home\nami=${var.ami_id}\n");

        let refs = scan(&script).unwrap();
        assert_eq!(refs, vec![Reference::Var("ami_id".into())]);
        assert_eq!(
            resolve(&script, &fx),
            Resolution::Known(json!("#!/bin/sh\necho ${HOME} > /tmp/home\nami=ami-123\n"))
        );

        assert!(scan(&json!("$${not a reference}")).unwrap().is_empty());
        assert_eq!(resolve(&json!("$${HOME}"), &fx), Resolution::Known(json!("${HOME}")));
    }

    #[test]
    fn test_missing_attribute_is_pending() {
        let fx = fixture();
        assert_eq!(
            resolve(&json!(["ok", "${aws_instance.web.public_ip}"]), &fx),
            Resolution::Pending("aws_instance.web.public_ip".into())
        );
    }

    #[test]
    fn test_resolve_all_stops_on_pending() {
        let fx = fixture();
        let mut attrs = Attributes::new();
        attrs.insert("vpc".into(), json!("${aws_vpc.main.id}"));
        assert_eq!(resolve_all(&attrs, &fx).unwrap()["vpc"], json!("vpc-9"));

        attrs.insert("sg".into(), json!("${aws_security_group.web.id}"));
        assert_eq!(
            resolve_all(&attrs, &fx),
            Err("aws_security_group.web.id".to_string())
        );
    }
}
