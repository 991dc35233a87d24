use std::path::Path;

use anyhow::{Context, Result};
use scraper::Selector;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::extract::{self, FieldQuery};
use crate::template::{FormatConfig, Template};
use crate::validate::RuleSet;

/// Name of the field every source must declare; it keys novelty tracking.
pub const ID_FIELD: &str = "id";

/// One run's input: who to notify and what to scrape.
///
/// Sources stay as raw JSON until [`compile_sources`], so a malformed entry
/// only costs that source.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    #[serde(alias = "notify_email")]
    pub notify_address: String,
    #[serde(default, alias = "scrapers")]
    pub sources: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(alias = "element_selector")]
    pub element_query: String,
    #[serde(alias = "attributes")]
    pub field_rules: Vec<FieldRule>,
    #[serde(default, alias = "min_num_elements")]
    pub min_count: Option<usize>,
    #[serde(default, alias = "max_num_elements")]
    pub max_count: Option<usize>,
    #[serde(default, alias = "email_format")]
    pub format: Option<FormatConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FieldRule {
    pub name: String,
    #[serde(default, alias = "selector")]
    pub query: String,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
}

fn default_separator() -> String {
    " ".to_string()
}

impl Default for FieldRule {
    fn default() -> Self {
        Self {
            name: String::new(),
            query: String::new(),
            separator: default_separator(),
            required: false,
            patterns: Vec::new(),
        }
    }
}

impl FieldRule {
    /// True when `value` satisfies every pattern (vacuously true with none).
    pub fn accepts(&self, value: &str) -> bool {
        self.patterns.iter().all(|p| p.is_satisfied_by(value))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Pattern {
    pub pattern: String,
    #[serde(default)]
    pub exclude: bool,
}

impl Pattern {
    pub fn is_satisfied_by(&self, value: &str) -> bool {
        value.contains(self.pattern.as_str()) != self.exclude
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("malformed source: {0}")]
    Invalid(String),
    #[error("no `id` field rule")]
    MissingId,
    #[error("duplicate field rule `{0}`")]
    DuplicateField(String),
    #[error("min_count {min} exceeds max_count {max}")]
    InvertedBounds { min: usize, max: usize },
    #[error("invalid selector `{query}`: {reason}")]
    Selector { query: String, reason: String },
    #[error("format references undeclared field `{0}`")]
    UnknownTemplateField(String),
    #[error("invalid format template: {0}")]
    Template(String),
}

/// A source compiled for one run: selectors parsed and rules indexed once.
#[derive(Debug)]
pub struct Source {
    pub url: String,
    pub element: Selector,
    pub fields: Vec<FieldQuery>,
    pub rules: RuleSet,
    pub min_count: Option<usize>,
    pub max_count: Option<usize>,
    pub template: Option<Template>,
}

impl Source {
    /// Decode one raw job entry and compile it.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let config =
            SourceConfig::deserialize(value).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::compile(&config)
    }

    pub fn compile(config: &SourceConfig) -> Result<Self, ConfigError> {
        if !config.field_rules.iter().any(|r| r.name == ID_FIELD) {
            return Err(ConfigError::MissingId);
        }
        if let (Some(min), Some(max)) = (config.min_count, config.max_count) {
            if min > max {
                return Err(ConfigError::InvertedBounds { min, max });
            }
        }

        let rules = RuleSet::new(config.field_rules.clone())?;
        let element = extract::parse_selector(&config.element_query)?;
        let fields = config
            .field_rules
            .iter()
            .map(|r| FieldQuery::parse(&r.name, &r.query))
            .collect::<Result<Vec<_>, _>>()?;

        let template = match &config.format {
            Some(format) => {
                let template = Template::from_config(format)?;
                if let Some(unknown) = template.fields().find(|f| rules.get(f).is_none()) {
                    return Err(ConfigError::UnknownTemplateField(unknown.to_string()));
                }
                Some(template)
            }
            None => None,
        };

        Ok(Source {
            url: config.url.clone(),
            element,
            fields,
            rules,
            min_count: config.min_count,
            max_count: config.max_count,
            template,
        })
    }
}

/// The `url` of a raw source entry, for log lines about entries that may not decode.
pub fn source_label(value: &Value) -> &str {
    value.get("url").and_then(Value::as_str).unwrap_or("<no url>")
}

/// Compile every source, dropping (and logging) the ones that are misconfigured.
pub fn compile_sources(entries: &[Value]) -> Vec<Source> {
    let sources: Vec<Source> = entries
        .iter()
        .filter_map(|entry| match Source::from_value(entry) {
            Ok(source) => Some(source),
            Err(e) => {
                warn!("Skipping source {}: {}", source_label(entry), e);
                None
            }
        })
        .collect();
    info!("{} of {} sources are valid", sources.len(), entries.len());
    sources
}

pub fn load_job(path: &Path) -> Result<Job> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    parse_job(&raw).with_context(|| format!("Invalid job file {}", path.display()))
}

pub fn parse_job(raw: &str) -> Result<Job> {
    Ok(serde_json::from_str(raw)?)
}
