use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use tracing::info;

use crate::notify::{SubscriptionStatus, Transport};
use crate::novelty::{IdentityKey, IdentityStore, InsertOutcome};
use crate::validate::Record;

pub const DEFAULT_DB_PATH: &str = "data/page_watch.sqlite";

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- One row per identity key ever recorded as new
        CREATE TABLE IF NOT EXISTS seen (
            url        TEXT NOT NULL,
            id         TEXT NOT NULL,
            fields     TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (url, id)
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            address    TEXT PRIMARY KEY,
            confirmed  BOOLEAN NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS outbox (
            id         INTEGER PRIMARY KEY,
            subject    TEXT NOT NULL,
            body       TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

// ── Identity ──

/// Conditional insert on the composite key; zero changed rows means the key
/// was already present.
pub fn insert_seen(
    conn: &Connection,
    key: &IdentityKey,
    fields: &str,
    created_at: &str,
) -> Result<InsertOutcome> {
    let changed = conn.execute(
        "INSERT INTO seen (url, id, fields, created_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (url, id) DO NOTHING",
        params![key.url, key.id, fields, created_at],
    )?;
    Ok(if changed == 1 {
        InsertOutcome::Created
    } else {
        InsertOutcome::AlreadyExists
    })
}

// ── Subscriptions ──

pub fn subscription_status(conn: &Connection) -> Result<SubscriptionStatus> {
    let (confirmed, pending): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(confirmed = 1), 0), COALESCE(SUM(confirmed = 0), 0) FROM subscriptions",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(SubscriptionStatus {
        confirmed: confirmed as usize,
        pending: pending as usize,
    })
}

/// Add a pending subscription. Returns false when the address is already known.
pub fn subscribe(conn: &Connection, address: &str) -> Result<bool> {
    let changed = conn.execute(
        "INSERT INTO subscriptions (address) VALUES (?1) ON CONFLICT (address) DO NOTHING",
        params![address],
    )?;
    Ok(changed == 1)
}

/// Mark a subscription confirmed. Returns false when the address is unknown.
pub fn confirm(conn: &Connection, address: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE subscriptions SET confirmed = 1 WHERE address = ?1",
        params![address],
    )?;
    Ok(changed == 1)
}

// ── Outbox ──

pub struct OutboxRow {
    pub id: i64,
    pub subject: String,
    pub body: String,
    pub created_at: String,
}

pub fn push_outbox(conn: &Connection, subject: &str, body: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO outbox (subject, body) VALUES (?1, ?2)",
        params![subject, body],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn recent_outbox(conn: &Connection, limit: usize) -> Result<Vec<OutboxRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, subject, body, created_at FROM outbox ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(OutboxRow {
                id: row.get(0)?,
                subject: row.get(1)?,
                body: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub seen: i64,
    pub per_source: Vec<(String, i64)>,
    pub subscriptions: SubscriptionStatus,
    pub published: i64,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let seen: i64 = conn.query_row("SELECT COUNT(*) FROM seen", [], |r| r.get(0))?;
    let published: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |r| r.get(0))?;
    let mut stmt = conn.prepare("SELECT url, COUNT(*) FROM seen GROUP BY url ORDER BY url")?;
    let per_source = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stats {
        seen,
        per_source,
        subscriptions: subscription_status(conn)?,
        published,
    })
}

// ── Async store ──

/// Shared SQLite handle used as both identity store and notification outbox.
/// Every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        Self::new(connect(path)?)
    }

    pub async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow!("SQLite connection lock poisoned"))?;
            f(&guard)
        })
        .await?
    }
}

#[async_trait]
impl IdentityStore for SqliteStore {
    async fn try_insert(
        &self,
        key: &IdentityKey,
        record: &Record,
        created_at: &str,
    ) -> Result<InsertOutcome> {
        let key = key.clone();
        let fields = record.to_json().to_string();
        let created_at = created_at.to_string();
        self.with_conn(move |conn| insert_seen(conn, &key, &fields, &created_at))
            .await
    }
}

#[async_trait]
impl Transport for SqliteStore {
    async fn subscription_status(&self) -> Result<SubscriptionStatus> {
        self.with_conn(subscription_status).await
    }

    async fn subscribe(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.with_conn(move |conn| subscribe(conn, &address).map(|_| ()))
            .await
    }

    async fn publish(&self, subject: &str, body: &str) -> Result<()> {
        let subject = subject.to_string();
        let body = body.to_string();
        let id = self
            .with_conn(move |conn| push_outbox(conn, &subject, &body))
            .await?;
        info!("Queued digest #{} in outbox", id);
        Ok(())
    }
}
