//! Typed parameter schema for schedule inputs.
//!
//! A [`ParamSchema`] is an ordered list of [`OptionSpec`] descriptors. It is
//! resolved once, when the schedule is built, against the caller's raw
//! inputs. Job bodies read the resulting [`Params`]; the scheduler itself
//! never looks at them.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{slog_warn, Error, Result};

/// Literal used by schedule authors to mean "no value".
pub const NULL_LITERAL: &str = "null";

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Str,
    Int,
    Bool,
    List,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKind::Str => write!(f, "str"),
            ValueKind::Int => write!(f, "int"),
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::List => write!(f, "list"),
        }
    }
}

/// Descriptor for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub key: String,
    #[serde(default, rename = "type")]
    pub kind: ValueKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub choices: Vec<String>,
}

impl OptionSpec {
    pub fn required(key: &str) -> Self {
        Self {
            key: key.to_string(),
            kind: ValueKind::Str,
            required: true,
            default: None,
            tags: Vec::new(),
            choices: Vec::new(),
        }
    }

    pub fn optional(key: &str) -> Self {
        Self {
            required: false,
            ..Self::required(key)
        }
    }

    pub fn kind(mut self, kind: ValueKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| c.to_string()).collect();
        self
    }

    fn coerce(&self, raw: &Value) -> Result<Option<Value>> {
        if is_unset(raw) {
            return Ok(None);
        }
        let bad = || {
            Error::Parameter(format!(
                "{}: cannot read {} as {}",
                self.key, raw, self.kind
            ))
        };
        let value = match self.kind {
            ValueKind::Str => match raw {
                Value::String(s) => Value::String(s.clone()),
                Value::Number(n) => Value::String(n.to_string()),
                Value::Bool(b) => Value::String(b.to_string()),
                _ => return Err(bad()),
            },
            ValueKind::Int => match raw {
                Value::Number(n) if n.is_i64() => Value::Number(n.clone()),
                Value::String(s) => s.trim().parse::<i64>().map_err(|_| bad())?.into(),
                _ => return Err(bad()),
            },
            ValueKind::Bool => match raw {
                Value::Bool(b) => Value::Bool(*b),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "1" | "yes" => Value::Bool(true),
                    "false" | "0" | "no" => Value::Bool(false),
                    _ => return Err(bad()),
                },
                _ => return Err(bad()),
            },
            ValueKind::List => match raw {
                Value::Array(items) => {
                    let items = items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => Ok(Value::String(s.clone())),
                            Value::Number(n) => Ok(Value::String(n.to_string())),
                            _ => Err(bad()),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Value::Array(items)
                }
                Value::String(s) => Value::Array(
                    s.split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(|part| Value::String(part.to_string()))
                        .collect(),
                ),
                _ => return Err(bad()),
            },
        };

        if !self.choices.is_empty() {
            let text = match &value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !self.choices.contains(&text) {
                return Err(Error::Parameter(format!(
                    "{}: {:?} is not one of {:?}",
                    self.key, text, self.choices
                )));
            }
        }
        Ok(Some(value))
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s == NULL_LITERAL,
        _ => false,
    }
}

/// Ordered collection of parameter descriptors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSchema {
    options: Vec<OptionSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor. Keys must be unique.
    pub fn add(&mut self, spec: OptionSpec) -> Result<()> {
        if spec.key.trim().is_empty() {
            return Err(Error::Parameter("parameter key must not be empty".into()));
        }
        if self.options.iter().any(|o| o.key == spec.key) {
            return Err(Error::Parameter(format!(
                "parameter {} declared twice",
                spec.key
            )));
        }
        self.options.push(spec);
        Ok(())
    }

    pub fn options(&self) -> &[OptionSpec] {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Validate `inputs` against the schema and produce typed values.
    ///
    /// Unknown input keys are dropped with a warning.
    pub fn resolve(&self, inputs: &BTreeMap<String, Value>) -> Result<Params> {
        let known: HashSet<&str> = self.options.iter().map(|o| o.key.as_str()).collect();
        for key in inputs.keys() {
            if !known.contains(key.as_str()) {
                slog_warn!("ignoring undeclared parameter {}", key);
            }
        }

        let mut entries = Vec::with_capacity(self.options.len());
        for spec in &self.options {
            let raw = inputs.get(&spec.key).or(spec.default.as_ref());
            let value = match raw {
                Some(raw) => spec.coerce(raw)?,
                None => None,
            };
            if spec.required && value.is_none() {
                return Err(Error::Parameter(format!(
                    "required parameter {} has no value",
                    spec.key
                )));
            }
            entries.push(ParamEntry {
                key: spec.key.clone(),
                value,
                tags: spec.tags.clone(),
            });
        }
        Ok(Params { entries })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ParamEntry {
    key: String,
    value: Option<Value>,
    tags: Vec<String>,
}

/// Resolved, typed parameter values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Params {
    entries: Vec<ParamEntry>,
}

impl Params {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .and_then(|e| e.value.as_ref())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the value is present and truthy.
    pub fn is_set(&self, key: &str) -> bool {
        match self.get(key) {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(_) => true,
        }
    }

    /// All set values carrying `tag`, keyed by parameter name.
    pub fn tagged(&self, tag: &str) -> Map<String, Value> {
        self.entries
            .iter()
            .filter(|e| e.tags.iter().any(|t| t == tag))
            .filter_map(|e| e.value.clone().map(|v| (e.key.clone(), v)))
            .collect()
    }

    /// Iterate over `(key, value)` pairs that have a value, in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .filter_map(|e| e.value.as_ref().map(|v| (e.key.as_str(), v)))
    }
}
