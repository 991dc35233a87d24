use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::config::ConfigError;
use crate::validate::Record;

static FIELD_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_-]+)\}").unwrap());

/// Digest line format as written in a job file.
///
/// Either a list (`["New: ", {"name": "title"}]`) or a shorthand string
/// (`"New: {title}"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FormatConfig {
    Shorthand(String),
    Segments(Vec<SegmentConfig>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SegmentConfig {
    Literal(String),
    Field { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn from_config(config: &FormatConfig) -> Result<Self, ConfigError> {
        let segments = match config {
            FormatConfig::Shorthand(s) => parse_shorthand(s),
            FormatConfig::Segments(parts) => parts
                .iter()
                .map(|p| match p {
                    SegmentConfig::Literal(text) => Segment::Literal(text.clone()),
                    SegmentConfig::Field { name } => Segment::Field(name.clone()),
                })
                .collect(),
        };
        if segments.is_empty() {
            return Err(ConfigError::Template("format is empty".into()));
        }
        Ok(Template { segments })
    }

    /// Field names referenced by the template, in order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Missing fields render as empty strings.
    pub fn render(&self, record: &Record) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(text) => text.as_str(),
                Segment::Field(name) => record.get(name).unwrap_or(""),
            })
            .collect()
    }
}

fn parse_shorthand(s: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut last = 0;
    for caps in FIELD_REF_RE.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        if whole.start() > last {
            segments.push(Segment::Literal(s[last..whole.start()].to_string()));
        }
        segments.push(Segment::Field(caps[1].to_string()));
        last = whole.end();
    }
    if last < s.len() {
        segments.push(Segment::Literal(s[last..].to_string()));
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Record {
        Record::from_pairs([("id", "42"), ("artist", "Artist 1"), ("title", "Song")])
    }

    #[test]
    fn shorthand_splits_literals_and_fields() {
        let t = Template::from_config(&FormatConfig::Shorthand("{artist} - {title}!".into())).unwrap();
        assert_eq!(
            t.segments,
            vec![
                Segment::Field("artist".into()),
                Segment::Literal(" - ".into()),
                Segment::Field("title".into()),
                Segment::Literal("!".into()),
            ]
        );
        assert_eq!(t.render(&record()), "Artist 1 - Song!");
    }

    #[test]
    fn list_form_from_json() {
        let config: FormatConfig =
            serde_json::from_str(r#"["New: ", {"name": "title"}, " by ", {"name": "artist"}]"#).unwrap();
        let t = Template::from_config(&config).unwrap();
        assert_eq!(t.fields().collect::<Vec<_>>(), vec!["title", "artist"]);
        assert_eq!(t.render(&record()), "New: Song by Artist 1");
    }

    #[test]
    fn missing_field_renders_empty() {
        let t = Template::from_config(&FormatConfig::Shorthand("[{label}]".into())).unwrap();
        assert_eq!(t.render(&record()), "[]");
    }

    #[test]
    fn empty_format_is_rejected() {
        assert!(Template::from_config(&FormatConfig::Segments(vec![])).is_err());
        assert!(Template::from_config(&FormatConfig::Shorthand(String::new())).is_err());
    }
}
