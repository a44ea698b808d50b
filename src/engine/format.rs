//! Output formats for query results.

use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::HostValue;

/// Requested representation of a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// The host value itself, no serialized form.
    #[default]
    Dict,
    Json,
    Yaml,
    /// Nested bullet outline. Display only, there is no parser back.
    Markdown,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dict" => Ok(Self::Dict),
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            "markdown" | "md" => Ok(Self::Markdown),
            _ => Err(Error::UnsupportedFormat(s.to_string())),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Dict => "dict",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Markdown => "markdown",
        })
    }
}

/// Serialize `value` for `format`. `Dict` has no serialized form.
pub fn render(value: &HostValue, format: OutputFormat) -> Result<Option<String>> {
    Ok(match format {
        OutputFormat::Dict => None,
        OutputFormat::Json => Some(serde_json::to_string(value)?),
        OutputFormat::Yaml => Some(serde_yaml::to_string(value)?),
        OutputFormat::Markdown => Some(to_markdown(value)),
    })
}

/// Render a value as a Markdown outline.
///
/// Mapping entries become `- **key**: value` lines, nested mappings indent
/// one level, sequences become a flat bullet sub-list. Non-mapping roots
/// render as a plain bullet list or a bare scalar.
pub fn to_markdown(value: &HostValue) -> String {
    let mut out = String::new();
    match value {
        HostValue::Mapping(_) => write_mapping(&mut out, value, 0),
        HostValue::Sequence(items) => write_items(&mut out, items, 0),
        scalar => {
            let _ = writeln!(out, "{}", scalar.display_inline());
        }
    }
    out
}

fn write_mapping(out: &mut String, value: &HostValue, level: usize) {
    let Some(map) = value.as_mapping() else {
        return;
    };
    let indent = "  ".repeat(level);
    for (key, item) in map {
        let _ = write!(out, "{indent}- **{key}**:");
        match item {
            HostValue::Mapping(_) => {
                out.push('\n');
                write_mapping(out, item, level + 1);
            }
            HostValue::Sequence(items) => {
                out.push('\n');
                write_items(out, items, level + 1);
            }
            scalar => {
                let _ = writeln!(out, " {}", scalar.display_inline());
            }
        }
    }
}

fn write_items(out: &mut String, items: &[HostValue], level: usize) {
    let indent = "  ".repeat(level);
    for item in items {
        let _ = writeln!(out, "{indent}- {}", item.display_inline());
    }
}
