//! `{{ ... }}` placeholders in deploy steps
//!
//! `{{ name }}` is replaced by the extracted output `name`, `{{ var.NAME }}`
//! by the declared variable `NAME`. Lists render comma-separated.

use crate::extract::ExtractedValues;
use provision::{OutputValue, VarMap};
use provision::types::json_text;
use regex::Regex;
use remote::TaskStep;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?)\s*\}\}")
        .expect("placeholder pattern is valid")
});

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder '{{{{ {0} }}}}'")]
    Unknown(String),

    #[error("step {index} ({step}): {source}")]
    Step {
        index: usize,
        step: String,
        source: Box<TemplateError>,
    },
}

/// Values placeholders may refer to
pub struct TemplateContext<'a> {
    pub outputs: &'a ExtractedValues,
    pub vars: &'a VarMap,
}

impl TemplateContext<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(var) = name.strip_prefix("var.") {
            return self.vars.get(var).map(json_text);
        }
        self.outputs.get(name).map(|value| match value {
            OutputValue::Scalar(s) => s.clone(),
            OutputValue::List(items) => items.join(","),
        })
    }

    /// Replace every placeholder in `text`
    pub fn render(&self, text: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(text) {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            let name = &caps[1];
            let value = self
                .lookup(name)
                .ok_or_else(|| TemplateError::Unknown(name.to_string()))?;
            out.push_str(&text[last..whole.start]);
            out.push_str(&value);
            last = whole.end;
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    /// Render every text field of every step
    pub fn render_steps(&self, steps: &[TaskStep]) -> Result<Vec<TaskStep>, TemplateError> {
        steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                step.try_map_text(|text| self.render(text))
                    .map_err(|source| TemplateError::Step {
                        index: i + 1,
                        step: step.label(),
                        source: Box::new(source),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn outputs() -> ExtractedValues {
        ExtractedValues {
            targets: vec!["1.2.3.4".into(), "5.6.7.8".into()],
            values: BTreeMap::from([
                (
                    "ec2_public_ips".to_string(),
                    OutputValue::List(vec!["1.2.3.4".into(), "5.6.7.8".into()]),
                ),
                (
                    "rds_endpoint".to_string(),
                    OutputValue::Scalar("db.example.com".into()),
                ),
            ]),
        }
    }

    fn vars() -> VarMap {
        VarMap::from([("db_password".to_string(), json!("s3cret"))])
    }

    #[test]
    fn test_render_outputs_and_vars() {
        let outputs = outputs();
        let vars = vars();
        let ctx = TemplateContext {
            outputs: &outputs,
            vars: &vars,
        };

        assert_eq!(
            ctx.render("RDS_HOST={{ rds_endpoint }}\nRDS_PASSWORD={{var.db_password}}\n")
                .unwrap(),
            "RDS_HOST=db.example.com\nRDS_PASSWORD=s3cret\n"
        );
        assert_eq!(ctx.render("{{ ec2_public_ips }}").unwrap(), "1.2.3.4,5.6.7.8");
        assert_eq!(ctx.render("no placeholders").unwrap(), "no placeholders");
    }

    #[test]
    fn test_unknown_placeholder() {
        let outputs = outputs();
        let vars = vars();
        let ctx = TemplateContext {
            outputs: &outputs,
            vars: &vars,
        };
        assert_eq!(
            ctx.render("{{ rds_port }}"),
            Err(TemplateError::Unknown("rds_port".into()))
        );
        assert_eq!(
            ctx.render("{{ var.missing }}"),
            Err(TemplateError::Unknown("var.missing".into()))
        );
    }

    #[test]
    fn test_render_steps_names_failing_step() {
        let outputs = outputs();
        let vars = vars();
        let ctx = TemplateContext {
            outputs: &outputs,
            vars: &vars,
        };
        let steps = vec![
            TaskStep::File {
                path: "/opt/app/.env".into(),
                content: "RDS_HOST={{ rds_endpoint }}\n".into(),
                mode: Some("0600".into()),
                owner: None,
                group: None,
                sudo: false,
            },
            TaskStep::Shell {
                name: "migrate".into(),
                command: "migrate --host {{ nope }}".into(),
                creates: None,
                sudo: false,
            },
        ];

        let err = ctx.render_steps(&steps).unwrap_err();
        assert!(matches!(err, TemplateError::Step { index: 2, .. }));

        let rendered = ctx.render_steps(&steps[..1]).unwrap();
        match &rendered[0] {
            TaskStep::File { content, mode, .. } => {
                assert_eq!(content, "RDS_HOST=db.example.com\n");
                assert_eq!(mode.as_deref(), Some("0600"));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }
}
