use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Source;
use crate::pipeline::SourceReport;
use crate::validate::Record;

pub const DISPLAY_LIMIT: usize = 10;
pub const SUBJECT: &str = "New elements found by scraper 🤖";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub confirmed: usize,
    pub pending: usize,
}

/// Delivery channel for digests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscription_status(&self) -> Result<SubscriptionStatus>;
    async fn subscribe(&self, address: &str) -> Result<()>;
    async fn publish(&self, subject: &str, body: &str) -> Result<()>;
}

/// Pre-run gate. Returns true when at least one confirmed subscriber exists;
/// otherwise subscribes `address` (unless a subscription is already pending)
/// and returns false.
pub async fn ensure_subscriber(transport: &dyn Transport, address: &str) -> Result<bool> {
    let status = transport.subscription_status().await?;
    info!(
        "Subscriptions: {} confirmed, {} pending",
        status.confirmed, status.pending
    );
    if status.confirmed > 0 {
        return Ok(true);
    }
    if status.pending == 0 {
        info!("Subscribing '{}'", address);
        transport.subscribe(address).await?;
    }
    warn!("No confirmed subscriptions, quitting");
    Ok(false)
}

/// One line per record: the source's template, or every value joined by " - ".
pub fn render_record(source: &Source, record: &Record) -> String {
    match &source.template {
        Some(template) => template.render(record),
        None => record.values().collect::<Vec<_>>().join(" - "),
    }
}

/// Digest of every source that produced new records. Empty when none did.
pub fn build_digest(reports: &[SourceReport], limit: usize) -> String {
    reports
        .iter()
        .filter(|r| !r.new_records.is_empty())
        .map(|r| {
            let mut block = format!(
                "Found {} new elements at {}!\n",
                r.new_records.len(),
                r.source.url
            );
            let lines: Vec<String> = r
                .new_records
                .iter()
                .take(limit)
                .map(|record| render_record(&r.source, record))
                .collect();
            block.push_str(&lines.join("\n"));
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Publish `digest` unless it is empty. Returns whether anything was sent.
pub async fn publish_digest(transport: &dyn Transport, digest: &str) -> Result<bool> {
    if digest.is_empty() {
        info!("No messages to publish");
        return Ok(false);
    }
    info!("Publishing message '{}'", digest);
    transport.publish(SUBJECT, digest).await?;
    Ok(true)
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::fake::RecordingTransport;
    use super::*;
    use crate::config::SourceConfig;
    use crate::pipeline::SourceStatus;
    use serde_json::json;

    fn source(url: &str, format: Option<&str>) -> Arc<Source> {
        let mut config = json!({
            "url": url,
            "element_query": "li",
            "field_rules": [{"name": "id"}, {"name": "artist"}, {"name": "title"}]
        });
        if let Some(f) = format {
            config["format"] = json!(f);
        }
        let config: SourceConfig = serde_json::from_value(config).unwrap();
        Arc::new(Source::compile(&config).unwrap())
    }

    fn report(source: Arc<Source>, n: usize) -> SourceReport {
        let new_records = (0..n)
            .map(|i| {
                let id = i.to_string();
                Record::from_pairs([("id", id.as_str()), ("artist", "A"), ("title", "T")])
            })
            .collect();
        SourceReport {
            source,
            new_records,
            status: SourceStatus::Ok,
        }
    }

    #[test]
    fn default_rendering_joins_values() {
        let digest = build_digest(&[report(source("https://a.example", None), 1)], DISPLAY_LIMIT);
        assert_eq!(digest, "Found 1 new elements at https://a.example!\n0 - A - T");
    }

    #[test]
    fn template_rendering() {
        let s = source("https://a.example", Some("{title} by {artist}"));
        let digest = build_digest(&[report(s, 2)], DISPLAY_LIMIT);
        assert_eq!(digest, "Found 2 new elements at https://a.example!\nT by A\nT by A");
    }

    #[test]
    fn blocks_separated_and_empty_sources_skipped() {
        let reports = [
            report(source("https://a.example", Some("{id}")), 1),
            report(source("https://b.example", None), 0),
            report(source("https://c.example", Some("{id}")), 1),
        ];
        let digest = build_digest(&reports, DISPLAY_LIMIT);
        assert_eq!(
            digest,
            "Found 1 new elements at https://a.example!\n0\n\nFound 1 new elements at https://c.example!\n0"
        );
    }

    #[test]
    fn display_limit_truncates_lines_not_count() {
        let digest = build_digest(&[report(source("https://a.example", Some("{id}")), 15)], DISPLAY_LIMIT);
        let mut lines = digest.lines();
        assert_eq!(lines.next(), Some("Found 15 new elements at https://a.example!"));
        assert_eq!(lines.count(), 10);
    }

    #[test]
    fn nothing_new_means_empty_digest() {
        let reports = [report(source("https://a.example", None), 0)];
        assert!(build_digest(&reports, DISPLAY_LIMIT).is_empty());
        assert!(build_digest(&[], DISPLAY_LIMIT).is_empty());
    }

    #[tokio::test]
    async fn empty_digest_is_not_published() {
        let transport = RecordingTransport::default();
        assert!(!publish_digest(&transport, "").await.unwrap());
        assert!(transport.published.lock().unwrap().is_empty());

        assert!(publish_digest(&transport, "body").await.unwrap());
        let published = transport.published.lock().unwrap();
        assert_eq!(published.as_slice(), &[(SUBJECT.to_string(), "body".to_string())]);
    }

    #[tokio::test]
    async fn gate_passes_with_confirmed_subscriber() {
        let transport = RecordingTransport::with_status(1, 0);
        assert!(ensure_subscriber(&transport, "me@example.com").await.unwrap());
        assert!(transport.subscribed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn gate_subscribes_when_nobody_is_subscribed() {
        let transport = RecordingTransport::with_status(0, 0);
        assert!(!ensure_subscriber(&transport, "me@example.com").await.unwrap());
        assert_eq!(*transport.subscribed.lock().unwrap(), vec!["me@example.com".to_string()]);
    }

    #[tokio::test]
    async fn gate_waits_for_pending_confirmation() {
        let transport = RecordingTransport::with_status(0, 1);
        assert!(!ensure_subscriber(&transport, "me@example.com").await.unwrap());
        assert!(transport.subscribed.lock().unwrap().is_empty());
    }
}
