//! JSON loader for generator definitions.
//!
//! Problems in one entry never stop the others from being read: each entry
//! yields its own [`ParseOutcome`] and the outcomes are merged in document
//! order. Only an unreadable file, or a document whose shape is wrong, is
//! rejected as a whole.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, FileError};

use super::definition::{GeneratorCategory, GeneratorDefinition, Param, ParamType, ParseOutcome};

/// Reads and parses a definitions file.
///
/// # Errors
///
/// Returns a `FileError` if the file is missing or unreadable; no
/// definitions are produced in that case.
pub fn load_definitions(path: impl AsRef<Path>) -> Result<ParseOutcome, FileError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => FileError::NotFound {
            path: path.to_path_buf(),
        },
        _ => FileError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        },
    })?;

    let outcome = parse_definitions(&text);
    info!(
        target: "perception::config",
        path = %path.display(),
        definitions = outcome.definitions.len(),
        errors = outcome.errors.len(),
        "generator definitions loaded"
    );
    Ok(outcome)
}

/// Parses a definitions document.
#[must_use]
pub fn parse_definitions(text: &str) -> ParseOutcome {
    let root: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return structural(format!("invalid JSON: {e}"));
        }
    };
    let Some(root) = root.as_object() else {
        return structural("root is not an object".to_string());
    };

    let mut sections = Vec::with_capacity(GeneratorCategory::ALL.len());
    for category in GeneratorCategory::ALL {
        match section(root, category) {
            Ok(entries) => sections.push((category, entries)),
            Err(err) => return ParseOutcome::failed(err),
        }
    }

    let mut names = HashSet::new();
    let outcome = sections
        .into_iter()
        .flat_map(|(category, entries)| {
            entries
                .iter()
                .enumerate()
                .map(move |(index, entry)| (category, index, entry))
        })
        .fold(ParseOutcome::default(), |acc, (category, index, entry)| {
            acc.merge(parse_entry(category, index, entry, &mut names))
        });

    for err in &outcome.errors {
        warn!(target: "perception::config", error = %err, "definition rejected");
    }
    outcome
}

fn structural(reason: String) -> ParseOutcome {
    ParseOutcome::failed(ConfigError::InvalidStructure { reason })
}

fn section(
    root: &Map<String, Value>,
    category: GeneratorCategory,
) -> Result<&[Value], ConfigError> {
    match root.get(category.section()) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(entries)) => {
            if let Some(i) = entries.iter().position(|e| !e.is_object()) {
                return Err(ConfigError::InvalidStructure {
                    reason: format!("{}[{i}] is not an object", category.section()),
                });
            }
            Ok(entries)
        }
        Some(_) => Err(ConfigError::InvalidStructure {
            reason: format!("'{}' is not an array", category.section()),
        }),
    }
}

fn is_enabled(entry: &Map<String, Value>) -> bool {
    match entry.get("enabled") {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().is_empty() || s.trim().eq_ignore_ascii_case("true"),
        Some(_) => false,
    }
}

fn text_field<'a>(entry: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_entry(
    category: GeneratorCategory,
    index: usize,
    entry: &Value,
    names: &mut HashSet<String>,
) -> ParseOutcome {
    let Some(entry) = entry.as_object() else {
        return ParseOutcome::default();
    };
    if !is_enabled(entry) {
        debug!(target: "perception::config", %category, index, "skipping disabled definition");
        return ParseOutcome::default();
    }

    let mut errors = Vec::new();
    let name = text_field(entry, "name");
    if name.is_none() {
        errors.push(ConfigError::MissingName { category, index });
    }
    let type_name = text_field(entry, "type");
    if type_name.is_none() {
        errors.push(ConfigError::MissingType { category, index });
    }

    let runtime_ms = if category == GeneratorCategory::Primitive {
        match parse_runtime(entry.get("runtime")) {
            Ok(ms) => Some(ms),
            Err(reason) => {
                errors.push(ConfigError::InvalidRuntime { index, reason });
                None
            }
        }
    } else {
        None
    };

    let params = if category == GeneratorCategory::Primitive {
        Some(Vec::new())
    } else {
        parse_params(category, index, entry.get("params"), &mut errors)
    };

    let (Some(name), Some(type_name), Some(params)) = (name, type_name, params) else {
        return ParseOutcome {
            definitions: Vec::new(),
            errors,
        };
    };
    if category == GeneratorCategory::Primitive && runtime_ms.is_none() {
        return ParseOutcome {
            definitions: Vec::new(),
            errors,
        };
    }

    if !names.insert(name.to_string()) {
        errors.push(ConfigError::DuplicateName {
            category,
            name: name.to_string(),
        });
        return ParseOutcome {
            definitions: Vec::new(),
            errors,
        };
    }

    ParseOutcome {
        definitions: vec![GeneratorDefinition {
            name: name.to_string(),
            category,
            type_name: type_name.to_string(),
            runtime_ms,
            enabled: true,
            params,
        }],
        errors,
    }
}

fn parse_runtime(raw: Option<&Value>) -> Result<u64, String> {
    let value = match raw {
        None | Some(Value::Null) => return Err("missing".to_string()),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .ok_or_else(|| format!("{n} is out of range"))?,
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
                .ok_or_else(|| format!("'{s}' is not a number"))?
        }
        Some(other) => return Err(format!("{other} is not a number")),
    };
    u64::try_from(value)
        .ok()
        .filter(|ms| *ms > 0)
        .ok_or_else(|| format!("must be positive, got {value}"))
}

fn parse_params(
    category: GeneratorCategory,
    index: usize,
    raw: Option<&Value>,
    errors: &mut Vec<ConfigError>,
) -> Option<Vec<Param>> {
    let entries = match raw {
        None | Some(Value::Null) => return Some(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            errors.push(ConfigError::InvalidParams {
                category,
                index,
                reason: "'params' is not an array".to_string(),
            });
            return None;
        }
    };

    let mut params = Vec::with_capacity(entries.len());
    for (position, param) in entries.iter().enumerate() {
        let Some(param) = param.as_object() else {
            errors.push(ConfigError::InvalidParams {
                category,
                index,
                reason: format!("parameter #{position} is not an object"),
            });
            continue;
        };
        let Some(declared) = text_field(param, "type") else {
            errors.push(ConfigError::MissingParamType { category, index });
            continue;
        };
        let param_type = match declared.parse::<ParamType>() {
            Ok(t) => t,
            Err(reason) => {
                errors.push(ConfigError::InvalidParams { category, index, reason });
                continue;
            }
        };
        let value = match param.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            None | Some(Value::Null) => String::new(),
            Some(other) => {
                errors.push(ConfigError::InvalidParams {
                    category,
                    index,
                    reason: format!("parameter #{position} has a non-scalar value {other}"),
                });
                continue;
            }
        };
        params.push(Param { param_type, value });
    }
    Some(params)
}
