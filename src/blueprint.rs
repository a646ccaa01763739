//! Blueprint templating.
//!
//! The blueprint pushed to the compose service is rendered from a TOML
//! template with `{{name}}` placeholders. Every placeholder must be known;
//! a typo would otherwise be shipped to the service verbatim.

use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

use crate::error::{ComposeError, IoContext, Result};

/// A rendered blueprint, ready to push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blueprint {
    /// The blueprint's `name`; composes are requested by this name.
    pub name: String,
    pub text: String,
}

/// Values available to `{{...}}` placeholders.
#[derive(Debug, Clone)]
pub struct TemplateVars<'a> {
    pub version: &'a str,
    /// HEAD of the source checkout; `None` when no source is configured.
    pub commit: Option<&'a str>,
    pub debug: bool,
}

impl TemplateVars<'_> {
    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "version" => Some(self.version.to_string()),
            "commit" => self.commit.map(str::to_string),
            "debug" => Some(self.debug.to_string()),
            _ => None,
        }
    }
}

/// Read the template at `path` and render it.
pub fn load_blueprint(path: &Path, vars: &TemplateVars<'_>) -> Result<Blueprint> {
    let template = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ComposeError::NotFound(format!(
                "blueprint template '{}'",
                path.display()
            )))
        }
        Err(e) => {
            return Err(e).io_context(|| format!("reading blueprint template '{}'", path.display()))
        }
    };
    let text = render_template(&template, vars, path)?;
    let name = blueprint_name(&text, path)?;
    debug!(name = %name, template = %path.display(), "blueprint rendered");
    Ok(Blueprint { name, text })
}

/// Substitute every `{{key}}` in `template`. `origin` names the template in errors.
pub fn render_template(template: &str, vars: &TemplateVars<'_>, origin: &Path) -> Result<String> {
    let invalid = |message: String| ComposeError::Config {
        path: origin.to_path_buf(),
        message,
    };

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| invalid("unterminated '{{' in blueprint template".to_string()))?;
        let key = after[..end].trim();
        let value = vars.lookup(key).ok_or_else(|| {
            if key == "commit" {
                invalid("placeholder '{{commit}}' needs [source].url to be set".to_string())
            } else {
                invalid(format!("unknown placeholder '{{{{{key}}}}}'"))
            }
        })?;
        out.push_str(&value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn blueprint_name(text: &str, origin: &Path) -> Result<String> {
    let invalid = |message: String| ComposeError::Config {
        path: origin.to_path_buf(),
        message,
    };
    let table: toml::Table = toml::from_str(text)
        .map_err(|e| invalid(format!("rendered blueprint is not valid TOML: {e}")))?;
    match table.get("name") {
        Some(toml::Value::String(name)) if !name.trim().is_empty() => Ok(name.clone()),
        Some(_) => Err(invalid("blueprint 'name' must be a non-empty string".to_string())),
        None => Err(invalid("blueprint has no 'name'".to_string())),
    }
}
