use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Source;
use crate::validate::Record;

/// Composite identity of a record across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub url: String,
    pub id: String,
}

impl IdentityKey {
    pub fn of(source: &Source, record: &Record) -> Self {
        IdentityKey {
            url: source.url.clone(),
            id: record.id().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    AlreadyExists,
}

/// Durable record of every identity key ever seen.
///
/// `try_insert` must be a single atomic conditional write on the exact key:
/// of any number of concurrent callers with the same key, exactly one gets
/// `Created`.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn try_insert(
        &self,
        key: &IdentityKey,
        record: &Record,
        created_at: &str,
    ) -> Result<InsertOutcome>;
}

/// The store failed mid-source. `inserted` holds the records that were
/// durably recorded as new before the failure.
#[derive(Debug, Error)]
#[error("identity store failed after {} new record(s): {cause:#}", .inserted.len())]
pub struct PartialFailure {
    pub inserted: Vec<Record>,
    pub cause: anyhow::Error,
}

/// Return the records of `source` that have never been seen before,
/// recording each of them. Writes are issued sequentially in record order.
pub async fn filter_new(
    source: &Source,
    records: Vec<Record>,
    run_timestamp: &str,
    store: &dyn IdentityStore,
) -> Result<Vec<Record>, PartialFailure> {
    let mut new_records = Vec::new();
    for record in records {
        let key = IdentityKey::of(source, &record);
        match store.try_insert(&key, &record, run_timestamp).await {
            Ok(InsertOutcome::Created) => new_records.push(record),
            Ok(InsertOutcome::AlreadyExists) => {
                debug!("Item with url '{}' and id '{}' already exists", key.url, key.id);
            }
            Err(cause) => {
                return Err(PartialFailure {
                    inserted: new_records,
                    cause,
                })
            }
        }
    }
    info!("{} new elements found at {}", new_records.len(), source.url);
    Ok(new_records)
}

#[cfg(test)]
pub mod fake {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    /// In-memory store; optionally starts failing after `fail_after` inserts.
    #[derive(Default)]
    pub struct MemoryStore {
        seen: Mutex<HashSet<IdentityKey>>,
        fail_after: Option<usize>,
    }

    impl MemoryStore {
        pub fn failing_after(inserts: usize) -> Self {
            MemoryStore {
                fail_after: Some(inserts),
                ..Default::default()
            }
        }

        pub fn len(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl IdentityStore for MemoryStore {
        async fn try_insert(
            &self,
            key: &IdentityKey,
            _record: &Record,
            _created_at: &str,
        ) -> Result<InsertOutcome> {
            let mut seen = self.seen.lock().unwrap();
            if self.fail_after.is_some_and(|n| seen.len() >= n) {
                anyhow::bail!("throughput exceeded");
            }
            Ok(if seen.insert(key.clone()) {
                InsertOutcome::Created
            } else {
                InsertOutcome::AlreadyExists
            })
        }
    }
}
