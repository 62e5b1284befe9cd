// Control-file rewriting for the fan-out tools (codeml.ctl / hyphy.ctl).

use std::fs;
use std::path::Path;

use regex::{NoExpand, Regex};

use crate::config::defs::PipelineError;
use crate::utils::file::write_atomic;

/// Where a substitution lands in the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// Literal marker; every occurrence is replaced.
    Anchor(String),
    /// `field = value` line; the first such line is replaced.
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub placeholder: Placeholder,
    pub replacement: String,
}

impl Substitution {
    pub fn anchor(anchor: &str, replacement: impl Into<String>) -> Self {
        Self {
            placeholder: Placeholder::Anchor(anchor.to_string()),
            replacement: replacement.into(),
        }
    }

    pub fn field(field: &str, value: impl Into<String>) -> Self {
        Self {
            placeholder: Placeholder::Field(field.to_string()),
            replacement: value.into(),
        }
    }
}

fn field_regex(field: &str) -> Result<Regex, PipelineError> {
    Regex::new(&format!(r"(?m)^([ \t]*){}[ \t]*=.*$", regex::escape(field)))
        .map_err(|e| PipelineError::Other(e.into()))
}

fn describe(placeholder: &Placeholder) -> String {
    match placeholder {
        Placeholder::Anchor(anchor) => format!("anchor '{}'", anchor),
        Placeholder::Field(field) => format!("field '{}'", field),
    }
}

/// Applies `substitutions` to `template`. Every placeholder must be present
/// before anything is replaced; the first missing one is reported.
///
/// # Arguments
///
/// * `name` - Template name used in the error message.
/// * `template` - Control file text.
/// * `substitutions` - Anchors and fields to replace, applied in order.
///
/// # Returns
/// Rewritten text or `PipelineError::TemplateMismatch`.
pub fn rewrite(name: &str, template: &str, substitutions: &[Substitution]) -> Result<String, PipelineError> {
    for sub in substitutions {
        let present = match &sub.placeholder {
            Placeholder::Anchor(anchor) => template.contains(anchor.as_str()),
            Placeholder::Field(field) => field_regex(field)?.is_match(template),
        };
        if !present {
            return Err(PipelineError::TemplateMismatch {
                template: name.to_string(),
                placeholder: describe(&sub.placeholder),
            });
        }
    }

    let mut text = template.to_string();
    for sub in substitutions {
        text = match &sub.placeholder {
            Placeholder::Anchor(anchor) => text.replace(anchor.as_str(), &sub.replacement),
            Placeholder::Field(field) => {
                let re = field_regex(field)?;
                let Some(caps) = re.captures(&text) else {
                    // an earlier substitution consumed the field line
                    return Err(PipelineError::TemplateMismatch {
                        template: name.to_string(),
                        placeholder: describe(&sub.placeholder),
                    });
                };
                let line = format!("{}{} = {}", &caps[1], field, sub.replacement);
                re.replacen(&text, 1, NoExpand(&line)).into_owned()
            }
        };
    }
    Ok(text)
}

/// Reads `template_path`, rewrites it and writes the result to `dest`.
/// Nothing is written when the template does not match.
pub fn render_control_file(
    template_path: &Path,
    dest: &Path,
    substitutions: &[Substitution],
) -> Result<(), PipelineError> {
    let template = fs::read_to_string(template_path).map_err(|e| {
        PipelineError::IOError(format!("Cannot read template {}: {}", template_path.display(), e))
    })?;
    let rendered = rewrite(&template_path.display().to_string(), &template, substitutions)?;
    write_atomic(dest, rendered.as_bytes())
        .map_err(|e| PipelineError::IOError(format!("Cannot write {}: {}", dest.display(), e)))
}
