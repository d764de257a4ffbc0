//! Per-site, per-day intercept counters.
//!
//! Rows are keyed by `(site_id, local date)`. Counts only grow; rows leave
//! only through retention cleanup.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::store::{InterceptIncrement, InterceptStore};

/// Aggregated intercepts for one site on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptStat {
    /// Rule id, or the blocked domain for simple blocklist entries.
    pub site_id: String,
    /// Normalized host of the most recent intercept.
    pub domain: String,
    /// Local calendar date.
    pub date: NaiveDate,
    /// Number of intercepts.
    pub count: u64,
    /// Time of the most recent intercept.
    pub last_intercept_at: DateTime<Utc>,
}

/// A single intercept waiting to be counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptRecord {
    pub site_id: String,
    pub domain: String,
    pub when: DateTime<Utc>,
}

impl InterceptRecord {
    /// Creates a record.
    pub fn new(site_id: impl Into<String>, domain: impl Into<String>, when: DateTime<Utc>) -> Self {
        Self {
            site_id: site_id.into(),
            domain: domain.into(),
            when,
        }
    }
}

/// Returns the local calendar date of an instant.
pub fn local_date(when: DateTime<Utc>) -> NaiveDate {
    when.with_timezone(&Local).date_naive()
}

type StatKey = (String, NaiveDate);

/// In-memory intercept counters with optional write-through to a store.
pub struct InterceptRecorder {
    stats: Mutex<HashMap<StatKey, InterceptStat>>,
    store: Option<Arc<dyn InterceptStore>>,
}

impl std::fmt::Debug for InterceptRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptRecorder")
            .field("rows", &self.stats.lock().len())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

impl Default for InterceptRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptRecorder {
    /// Creates an empty recorder without persistence.
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Attaches a store that receives every increment.
    pub fn with_store(mut self, store: Arc<dyn InterceptStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Loads previously persisted rows, replacing matching keys.
    pub fn seed(&self, rows: impl IntoIterator<Item = InterceptStat>) {
        let mut stats = self.stats.lock();
        for row in rows {
            stats.insert((row.site_id.clone(), row.date), row);
        }
    }

    /// Counts one intercept and returns the updated row.
    pub fn record_intercept(&self, site_id: &str, domain: &str, when: DateTime<Utc>) -> InterceptStat {
        let record = InterceptRecord::new(site_id, domain, when);
        let date = local_date(when);
        self.record_batch(std::slice::from_ref(&record));

        self.get(site_id, date).unwrap_or(InterceptStat {
            site_id: record.site_id,
            domain: record.domain,
            date,
            count: 1,
            last_intercept_at: when,
        })
    }

    /// Counts a batch of intercepts under one lock and persists the deltas in
    /// one store call. Returns the number of distinct rows touched.
    ///
    /// In-memory counts are committed before the store is written. When the
    /// store fails, memory stays ahead of it until restart, and the lost
    /// deltas are not replayed by a later `seed`.
    pub fn record_batch(&self, records: &[InterceptRecord]) -> usize {
        if records.is_empty() {
            return 0;
        }

        let mut deltas: HashMap<StatKey, InterceptIncrement> = HashMap::new();
        {
            let mut stats = self.stats.lock();
            for record in records {
                let date = local_date(record.when);
                let key = (record.site_id.clone(), date);

                let row = stats.entry(key.clone()).or_insert_with(|| InterceptStat {
                    site_id: record.site_id.clone(),
                    domain: record.domain.clone(),
                    date,
                    count: 0,
                    last_intercept_at: record.when,
                });
                row.count += 1;
                row.domain.clone_from(&record.domain);
                if record.when > row.last_intercept_at {
                    row.last_intercept_at = record.when;
                }

                let delta = deltas.entry(key).or_insert_with(|| InterceptIncrement {
                    site_id: record.site_id.clone(),
                    domain: record.domain.clone(),
                    date,
                    count: 0,
                    last_intercept_at: record.when,
                });
                delta.count += 1;
                delta.domain.clone_from(&record.domain);
                if record.when > delta.last_intercept_at {
                    delta.last_intercept_at = record.when;
                }
            }
        }

        let touched = deltas.len();
        debug!(records = records.len(), rows = touched, "Recorded intercepts");

        if let Some(store) = &self.store {
            let increments: Vec<InterceptIncrement> = deltas.into_values().collect();
            if let Err(e) = store.persist_increments(&increments) {
                error!(
                    rows = increments.len(),
                    records = records.len(),
                    error = %e,
                    "Failed to persist intercept counts; in-memory counts are ahead of the store"
                );
            }
        }

        touched
    }

    /// Deletes rows older than `retention_days` before today (local date).
    pub fn cleanup_older_than(&self, retention_days: u32) -> usize {
        self.cleanup_older_than_at(Local::now().date_naive(), retention_days)
    }

    /// Deletes rows dated before `today - retention_days`.
    ///
    /// Returns the store's count when a store is attached, otherwise the
    /// number of in-memory rows removed.
    pub fn cleanup_older_than_at(&self, today: NaiveDate, retention_days: u32) -> usize {
        let cutoff = today
            .checked_sub_days(Days::new(u64::from(retention_days)))
            .unwrap_or(NaiveDate::MIN);

        let removed = {
            let mut stats = self.stats.lock();
            let before = stats.len();
            stats.retain(|(_, date), _| *date >= cutoff);
            before - stats.len()
        };

        let removed = match &self.store {
            Some(store) => match store.delete_before(cutoff) {
                Ok(count) => count,
                Err(e) => {
                    warn!(%cutoff, error = %e, "Failed to delete old intercept rows from store");
                    removed
                }
            },
            None => removed,
        };

        debug!(%cutoff, removed, "Intercept retention cleanup");
        removed
    }

    /// Returns the row for a site on a date.
    pub fn get(&self, site_id: &str, date: NaiveDate) -> Option<InterceptStat> {
        self.stats.lock().get(&(site_id.to_string(), date)).cloned()
    }

    /// Returns all rows for a date, highest count first.
    pub fn stats_for_date(&self, date: NaiveDate) -> Vec<InterceptStat> {
        let mut rows: Vec<InterceptStat> = self
            .stats
            .lock()
            .values()
            .filter(|s| s.date == date)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.site_id.cmp(&b.site_id)));
        rows
    }

    /// Returns every row, newest date first.
    pub fn all_stats(&self) -> Vec<InterceptStat> {
        let mut rows: Vec<InterceptStat> = self.stats.lock().values().cloned().collect();
        rows.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.site_id.cmp(&b.site_id)));
        rows
    }

    /// Sums a site's counts across all days.
    pub fn total_for_site(&self, site_id: &str) -> u64 {
        self.stats
            .lock()
            .values()
            .filter(|s| s.site_id == site_id)
            .map(|s| s.count)
            .sum()
    }

    /// Number of rows held.
    pub fn len(&self) -> usize {
        self.stats.lock().len()
    }

    /// Returns true if no rows are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
