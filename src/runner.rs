use anyhow::{Context, Result};
use scraper::Html;
use tracing::{debug, info, warn};

use crate::config::Source;
use crate::extract::extract;
use crate::fetch::Fetcher;
use crate::validate::{validate, Record};

/// Fetch, extract and validate one source, then apply its count bounds.
pub async fn run_source(fetcher: &dyn Fetcher, source: &Source) -> Result<Vec<Record>> {
    let body = fetcher
        .fetch(&source.url)
        .await
        .with_context(|| format!("Failed to fetch {}", source.url))?;
    let records = scrape_document(source, &body);
    info!("Found {} valid elements at {}", records.len(), source.url);
    Ok(apply_bounds(source, records))
}

/// Parse `body` and return the validated records in document order.
pub fn scrape_document(source: &Source, body: &str) -> Vec<Record> {
    let document = Html::parse_document(body);
    extract(&document, &source.element, &source.fields)
        .into_iter()
        .filter_map(|raw| match validate(raw, &source.rules) {
            Ok(record) => Some(record),
            Err(rejection) => {
                debug!("Excluded element at {}: {}", source.url, rejection);
                None
            }
        })
        .collect()
}

/// Drop the whole result set when its size falls outside the configured bounds.
pub fn apply_bounds(source: &Source, records: Vec<Record>) -> Vec<Record> {
    let count = records.len();
    if let Some(min) = source.min_count.filter(|&min| count < min) {
        warn!(
            "Number of elements {} at {} is less than minimum expected {}",
            count, source.url, min
        );
        return Vec::new();
    }
    if let Some(max) = source.max_count.filter(|&max| count > max) {
        warn!(
            "Number of elements {} at {} is greater than maximum expected {}",
            count, source.url, max
        );
        return Vec::new();
    }
    records
}
