use std::collections::HashMap;

use thiserror::Error;

use crate::config::{ConfigError, FieldRule, ID_FIELD};
use crate::extract::{RawFields, RawValue};

/// Field rules of one source, indexed by name once at configuration time.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<FieldRule>,
    by_name: HashMap<String, usize>,
}

impl RuleSet {
    pub fn new(rules: Vec<FieldRule>) -> Result<Self, ConfigError> {
        let mut by_name = HashMap::with_capacity(rules.len());
        for (i, rule) in rules.iter().enumerate() {
            if by_name.insert(rule.name.clone(), i).is_some() {
                return Err(ConfigError::DuplicateField(rule.name.clone()));
            }
        }
        Ok(RuleSet { rules, by_name })
    }

    pub fn get(&self, name: &str) -> Option<&FieldRule> {
        self.by_name.get(name).map(|&i| &self.rules[i])
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldRule> {
        self.rules.iter()
    }
}

/// A validated record: every value normalized to a string, declared fields
/// first in declaration order, `id` guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, String)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn id(&self) -> &str {
        self.get(ID_FIELD).unwrap_or_default()
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(_, v)| v.as_str())
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>()
            .into()
    }

    #[cfg(test)]
    pub fn from_pairs<const N: usize>(pairs: [(&str, &str); N]) -> Self {
        Record {
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Why a candidate was excluded. Only used for diagnostics.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("field `{field}` value `{value}` does not satisfy its patterns")]
    Pattern { field: String, value: String },
    #[error("required field `{0}` is empty")]
    RequiredEmpty(String),
    #[error("record has an empty id")]
    EmptyId,
}

/// Normalize a raw field map against `rules`, or reject the whole record.
///
/// Undeclared fields pass through as strings. Declared fields absent from the
/// map are treated as empty scalars.
pub fn validate(raw: RawFields, rules: &RuleSet) -> Result<Record, Rejection> {
    let passthrough = FieldRule::default();
    let mut fields: Vec<(String, String)> = Vec::with_capacity(raw.len());

    for (name, value) in raw {
        let rule = rules.get(&name).unwrap_or(&passthrough);
        let normalized = normalize(&name, value, rule)?;
        fields.push((name, normalized));
    }

    for rule in rules.iter() {
        if !fields.iter().any(|(n, _)| *n == rule.name) {
            let normalized = normalize(&rule.name, RawValue::One(String::new()), rule)?;
            fields.push((rule.name.clone(), normalized));
        }
    }

    // stable: undeclared fields keep their relative order at the end
    fields.sort_by_key(|(n, _)| rules.position(n).unwrap_or(usize::MAX));

    let record = Record { fields };
    if record.id().is_empty() {
        return Err(Rejection::EmptyId);
    }
    Ok(record)
}

fn normalize(name: &str, value: RawValue, rule: &FieldRule) -> Result<String, Rejection> {
    let normalized = match value {
        RawValue::Many(items) => {
            if let Some(bad) = items.iter().find(|v| !rule.accepts(v)) {
                return Err(Rejection::Pattern {
                    field: name.to_string(),
                    value: bad.clone(),
                });
            }
            items.join(&rule.separator)
        }
        RawValue::One(value) => {
            if !rule.accepts(&value) {
                return Err(Rejection::Pattern {
                    field: name.to_string(),
                    value,
                });
            }
            value
        }
    };
    if rule.required && normalized.is_empty() {
        return Err(Rejection::RequiredEmpty(name.to_string()));
    }
    Ok(normalized)
}
