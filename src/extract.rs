use scraper::{ElementRef, Html, Selector};

use crate::config::ConfigError;

/// Unprocessed result of one field query on one candidate node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::One(s.to_string())
    }
}

impl From<Vec<&str>> for RawValue {
    fn from(v: Vec<&str>) -> Self {
        RawValue::Many(v.into_iter().map(String::from).collect())
    }
}

/// Field name → raw value, in field-declaration order.
pub type RawFields = Vec<(String, RawValue)>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Text,
    Attr(String),
}

/// A compiled field query.
///
/// `"a.title"` selects the text of every matching descendant, `"a@href"` an
/// attribute of every match. Without a selector (`"@data-id"`, `"."`, `""`)
/// the candidate node itself is read and the value is scalar.
#[derive(Debug)]
pub struct FieldQuery {
    pub name: String,
    selector: Option<Selector>,
    target: Target,
}

impl FieldQuery {
    pub fn parse(name: &str, query: &str) -> Result<Self, ConfigError> {
        let query = query.trim();
        let (selector_part, target) = match query.rsplit_once('@') {
            Some((sel, attr)) if is_attr_name(attr) => (sel.trim(), Target::Attr(attr.to_string())),
            _ => (query, Target::Text),
        };
        let selector = match selector_part {
            "" | "." => None,
            s => Some(parse_selector(s)?),
        };
        Ok(FieldQuery {
            name: name.to_string(),
            selector,
            target,
        })
    }

    pub fn evaluate(&self, node: ElementRef) -> RawValue {
        match &self.selector {
            None => RawValue::One(self.read(node).unwrap_or_default()),
            Some(selector) => RawValue::Many(node.select(selector).filter_map(|n| self.read(n)).collect()),
        }
    }

    fn read(&self, node: ElementRef) -> Option<String> {
        match &self.target {
            Target::Text => Some(node_text(node)),
            Target::Attr(attr) => node.value().attr(attr).map(|v| v.trim().to_string()),
        }
    }
}

fn is_attr_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
}

/// Text content with runs of whitespace collapsed to single spaces.
fn node_text(node: ElementRef) -> String {
    node.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn parse_selector(query: &str) -> Result<Selector, ConfigError> {
    Selector::parse(query).map_err(|e| ConfigError::Selector {
        query: query.to_string(),
        reason: format!("{:?}", e),
    })
}

/// One raw field map per node matched by `element`, in document order.
pub fn extract(document: &Html, element: &Selector, fields: &[FieldQuery]) -> Vec<RawFields> {
    document
        .select(element)
        .map(|node| {
            fields
                .iter()
                .map(|f| (f.name.clone(), f.evaluate(node)))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTML: &str = r#"
        <ul class="items">
          <li data-id="1"><a class="title" href="/r/1">First
              release</a><span class="artist">A</span><span class="artist">B</span></li>
          <li data-id="2"><a class="title" href="/r/2">Second</a></li>
          <li><span class="artist">C</span></li>
        </ul>"#;

    fn run(queries: &[(&str, &str)]) -> Vec<RawFields> {
        let doc = Html::parse_document(HTML);
        let element = parse_selector("ul.items > li").unwrap();
        let fields: Vec<_> = queries
            .iter()
            .map(|(n, q)| FieldQuery::parse(n, q).unwrap())
            .collect();
        extract(&doc, &element, &fields)
    }

    #[test]
    fn one_map_per_candidate_in_order() {
        let rows = run(&[("id", "@data-id"), ("artist", "span.artist")]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0], ("id".to_string(), RawValue::from("1")));
        assert_eq!(rows[0][1], ("artist".to_string(), RawValue::from(vec!["A", "B"])));
        assert_eq!(rows[1][1].1, RawValue::Many(vec![]));
        // missing attribute on the node itself is an empty scalar
        assert_eq!(rows[2][0].1, RawValue::from(""));
    }

    #[test]
    fn text_is_whitespace_collapsed() {
        let rows = run(&[("title", "a.title")]);
        assert_eq!(rows[0][0].1, RawValue::from(vec!["First release"]));
    }

    #[test]
    fn attribute_of_descendants() {
        let rows = run(&[("link", "a.title@href")]);
        assert_eq!(rows[0][0].1, RawValue::from(vec!["/r/1"]));
        assert_eq!(rows[2][0].1, RawValue::Many(vec![]));
    }

    #[test]
    fn self_text() {
        let rows = run(&[("all", ".")]);
        assert_eq!(rows[1][0].1, RawValue::from("Second"));
    }

    #[test]
    fn no_candidates_is_empty() {
        let doc = Html::parse_document(HTML);
        let element = parse_selector("table tr").unwrap();
        assert!(extract(&doc, &element, &[]).is_empty());
    }

    #[test]
    fn invalid_field_selector() {
        assert!(FieldQuery::parse("x", "a[").is_err());
    }
}
