mod config;
mod db;
mod extract;
mod fetch;
mod notify;
mod novelty;
mod pipeline;
mod runner;
mod template;
mod validate;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use crate::config::Source;
use crate::pipeline::{RunContext, RunOutcome};

const USER_AGENT: &str = concat!("page_watch/", env!("CARGO_PKG_VERSION"));

#[derive(Parser)]
#[command(name = "page_watch", about = "Scrape pages and notify about newly listed elements")]
struct Cli {
    /// SQLite database holding seen elements, subscriptions and the outbox
    #[arg(long, env = "PAGE_WATCH_DB", default_value = db::DEFAULT_DB_PATH, global = true)]
    db: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape every source in a job file and publish a digest of new elements
    Run {
        /// Job descriptor (JSON)
        #[arg(short, long, env = "PAGE_WATCH_JOB")]
        job: PathBuf,
        /// Sources scraped in parallel
        #[arg(short, long, default_value_t = pipeline::CONCURRENCY)]
        concurrency: usize,
        /// Max elements listed per source in the digest
        #[arg(long, default_value_t = notify::DISPLAY_LIMIT)]
        display_limit: usize,
        /// HTTP timeout per page
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
        #[arg(long, default_value = USER_AGENT)]
        user_agent: String,
    },
    /// Validate a job file without scraping
    Check {
        #[arg(short, long, env = "PAGE_WATCH_JOB")]
        job: PathBuf,
    },
    /// Add a pending subscription
    Subscribe { address: String },
    /// Confirm a pending subscription
    Confirm { address: String },
    /// Show the most recently published digests
    Outbox {
        #[arg(short = 'n', long, default_value = "5")]
        limit: usize,
    },
    /// Show seen-element and subscription counts
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            job,
            concurrency,
            display_limit,
            timeout_secs,
            user_agent,
        } => {
            let job = config::load_job(&job)?;
            let store = Arc::new(db::SqliteStore::open(&cli.db)?);
            let fetcher = Arc::new(fetch::HttpFetcher::new(
                Duration::from_secs(timeout_secs),
                &user_agent,
            )?);

            let mut ctx = RunContext::new(fetcher, store.clone(), store);
            ctx.concurrency = concurrency;
            ctx.display_limit = display_limit;

            match pipeline::execute(&ctx, &job).await? {
                RunOutcome::NoSubscribers => {
                    println!("No confirmed subscribers for {}; nothing scraped.", job.notify_address);
                }
                RunOutcome::Completed { reports, published } => {
                    println!("Done: {}.", pipeline::summarize(&reports));
                    for r in reports.iter().filter(|r| r.status != pipeline::SourceStatus::Ok) {
                        println!("  {}: {:?}", r.source.url, r.status);
                    }
                    if published {
                        println!("Digest published.");
                    }
                }
            }
            Ok(())
        }
        Commands::Check { job } => {
            let job = config::load_job(&job)?;
            let mut valid = 0;
            for entry in &job.sources {
                let label = config::source_label(entry);
                match Source::from_value(entry) {
                    Ok(_) => {
                        valid += 1;
                        println!("ok      {}", label);
                    }
                    Err(e) => println!("skipped {} ({})", label, e),
                }
            }
            println!("{} of {} sources valid.", valid, job.sources.len());
            Ok(())
        }
        Commands::Subscribe { address } => {
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            if db::subscribe(&conn, &address)? {
                println!("Subscribed {} (pending confirmation).", address);
            } else {
                println!("{} is already subscribed.", address);
            }
            Ok(())
        }
        Commands::Confirm { address } => {
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            if db::confirm(&conn, &address)? {
                println!("Confirmed {}.", address);
            } else {
                println!("No subscription for {}.", address);
            }
            Ok(())
        }
        Commands::Outbox { limit } => {
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            let rows = db::recent_outbox(&conn, limit)?;
            if rows.is_empty() {
                println!("Outbox is empty.");
                return Ok(());
            }
            for row in rows {
                println!("── #{} {} | {}", row.id, row.created_at, row.subject);
                println!("{}\n", row.body);
            }
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Seen:      {}", s.seen);
            for (url, count) in &s.per_source {
                println!("  {:>6}  {}", count, url);
            }
            println!("Confirmed: {}", s.subscriptions.confirmed);
            println!("Pending:   {}", s.subscriptions.pending);
            println!("Published: {}", s.published);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {:.1}s", elapsed.as_secs_f64());
    }

    result
}
