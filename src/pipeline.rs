use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::config::{self, Job, Source};
use crate::fetch::Fetcher;
use crate::notify::{self, Transport};
use crate::novelty::{self, IdentityStore, PartialFailure};
use crate::runner;
use crate::validate::Record;

pub const CONCURRENCY: usize = 4;

/// Everything a run needs, passed explicitly through the pipeline.
pub struct RunContext {
    pub timestamp: String,
    pub fetcher: Arc<dyn Fetcher>,
    pub store: Arc<dyn IdentityStore>,
    pub transport: Arc<dyn Transport>,
    pub concurrency: usize,
    pub display_limit: usize,
}

impl RunContext {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn IdentityStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        RunContext {
            timestamp: Utc::now().to_rfc3339(),
            fetcher,
            store,
            transport,
            concurrency: CONCURRENCY,
            display_limit: notify::DISPLAY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Ok,
    FetchFailed(String),
    StoreFailed(String),
}

#[derive(Debug)]
pub struct SourceReport {
    pub source: Arc<Source>,
    pub new_records: Vec<Record>,
    pub status: SourceStatus,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Nobody can receive a digest; nothing was scraped.
    NoSubscribers,
    Completed {
        reports: Vec<SourceReport>,
        published: bool,
    },
}

/// Gate on subscribers, scrape every valid source, publish the digest.
pub async fn execute(ctx: &RunContext, job: &Job) -> Result<RunOutcome> {
    if !notify::ensure_subscriber(ctx.transport.as_ref(), &job.notify_address).await? {
        return Ok(RunOutcome::NoSubscribers);
    }

    let sources = config::compile_sources(&job.sources)
        .into_iter()
        .map(Arc::new)
        .collect();
    let reports = run(ctx, sources).await;

    let digest = notify::build_digest(&reports, ctx.display_limit);
    let published = notify::publish_digest(ctx.transport.as_ref(), &digest).await?;
    Ok(RunOutcome::Completed { reports, published })
}

/// Run every source on a bounded pool. One report per source, in input order.
pub async fn run(ctx: &RunContext, sources: Vec<Arc<Source>>) -> Vec<SourceReport> {
    let total = sources.len();
    let semaphore = Arc::new(Semaphore::new(ctx.concurrency.max(1)));

    let pb = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} sources") {
        pb.set_style(style.progress_chars("=> "));
    }

    let (tx, mut rx) = mpsc::channel::<(usize, SourceReport)>(total.max(1));

    for (idx, source) in sources.into_iter().enumerate() {
        let sem = Arc::clone(&semaphore);
        let fetcher = Arc::clone(&ctx.fetcher);
        let store = Arc::clone(&ctx.store);
        let timestamp = ctx.timestamp.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return;
            };
            let report = process_source(fetcher.as_ref(), store.as_ref(), &timestamp, source).await;
            let _ = tx.send((idx, report)).await;
        });
    }

    // rx closes once every task has reported
    drop(tx);

    let mut reports = Vec::with_capacity(total);
    while let Some(entry) = rx.recv().await {
        reports.push(entry);
        pb.inc(1);
    }
    pb.finish_and_clear();

    if reports.len() < total {
        warn!("{} source task(s) ended without a report", total - reports.len());
    }
    reports.sort_by_key(|(idx, _)| *idx);
    reports.into_iter().map(|(_, report)| report).collect()
}

async fn process_source(
    fetcher: &dyn Fetcher,
    store: &dyn IdentityStore,
    timestamp: &str,
    source: Arc<Source>,
) -> SourceReport {
    let records = match runner::run_source(fetcher, &source).await {
        Ok(records) => records,
        Err(e) => {
            warn!("Source {} failed: {:#}", source.url, e);
            return SourceReport {
                source,
                new_records: Vec::new(),
                status: SourceStatus::FetchFailed(format!("{:#}", e)),
            };
        }
    };

    match novelty::filter_new(&source, records, timestamp, store).await {
        Ok(new_records) => SourceReport {
            source,
            new_records,
            status: SourceStatus::Ok,
        },
        Err(PartialFailure { inserted, cause }) => {
            warn!(
                "Identity store failed for {} after {} new element(s): {:#}",
                source.url,
                inserted.len(),
                cause
            );
            SourceReport {
                source,
                new_records: inserted,
                status: SourceStatus::StoreFailed(format!("{:#}", cause)),
            }
        }
    }
}

/// One-line summary of a finished run.
pub fn summarize(reports: &[SourceReport]) -> String {
    let new: usize = reports.iter().map(|r| r.new_records.len()).sum();
    let failed = reports
        .iter()
        .filter(|r| r.status != SourceStatus::Ok)
        .count();
    info!("Run finished: {} sources, {} new elements, {} failed", reports.len(), new, failed);
    format!("{} sources, {} new elements, {} failed", reports.len(), new, failed)
}
