//! Persistence collaborator traits.
//!
//! The engine and recorder own the authoritative in-memory state and push
//! changes out through these traits after each successful mutation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::rules::{BlockRule, BlockedDomain, UserGroup};
use crate::schedule::Schedule;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Mirrors rule-engine mutations into durable storage.
pub trait RuleStore: Send + Sync {
    /// Inserts or replaces a rule.
    fn save_rule(&self, rule: &BlockRule) -> StoreResult<()>;
    /// Deletes a rule.
    fn delete_rule(&self, id: &str) -> StoreResult<()>;
    /// Inserts or replaces a group.
    fn save_group(&self, group: &UserGroup) -> StoreResult<()>;
    /// Deletes a group.
    fn delete_group(&self, id: &str) -> StoreResult<()>;
    /// Inserts or replaces a schedule.
    fn save_schedule(&self, schedule: &Schedule) -> StoreResult<()>;
    /// Deletes a schedule.
    fn delete_schedule(&self, id: &str) -> StoreResult<()>;
    /// Replaces the whole blocked-domain list.
    fn replace_blocked_domains(&self, domains: &[BlockedDomain]) -> StoreResult<()>;
}

/// One count delta for a `(site_id, date)` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptIncrement {
    pub site_id: String,
    pub domain: String,
    pub date: NaiveDate,
    pub count: u64,
    pub last_intercept_at: DateTime<Utc>,
}

/// Durable storage for intercept counters.
pub trait InterceptStore: Send + Sync {
    /// Adds every increment in a single transaction.
    fn persist_increments(&self, increments: &[InterceptIncrement]) -> StoreResult<()>;
    /// Deletes rows dated strictly before `cutoff`, returning how many.
    fn delete_before(&self, cutoff: NaiveDate) -> StoreResult<usize>;
}
