//! High-level database interface.

use std::path::PathBuf;

use chrono::NaiveDate;
use directories::ProjectDirs;
use sitegate_core::{
    BlockRule, BlockedDomain, InterceptIncrement, InterceptStat, InterceptStore, RuleSet,
    RuleStore, Schedule, StoreResult, UserGroup,
};
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::models::SiteTotal;
use crate::pool::ConnectionPool;
use crate::repository::{DomainsRepo, GroupsRepo, InterceptsRepo, RulesRepo, SchedulesRepo};

/// High-level database interface for SiteGate.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "sitegate", "sitegate")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join("sitegate.db"))
    }

    // === Rule configuration ===

    /// Insert or update a rule.
    pub fn save_rule(&self, rule: &BlockRule) -> Result<()> {
        let conn = self.pool.get()?;
        RulesRepo::upsert(&conn, rule)
    }

    /// Get a rule by id.
    pub fn get_rule(&self, id: &str) -> Result<Option<BlockRule>> {
        let conn = self.pool.get()?;
        RulesRepo::get(&conn, id)
    }

    /// Get all rules in insertion order.
    pub fn get_rules(&self) -> Result<Vec<BlockRule>> {
        let conn = self.pool.get()?;
        RulesRepo::get_all(&conn)
    }

    /// Delete a rule.
    pub fn delete_rule(&self, id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        RulesRepo::delete(&conn, id)
    }

    /// Insert or update a group.
    pub fn save_group(&self, group: &UserGroup) -> Result<()> {
        let conn = self.pool.get()?;
        GroupsRepo::upsert(&conn, group)
    }

    /// Get all groups.
    pub fn get_groups(&self) -> Result<Vec<UserGroup>> {
        let conn = self.pool.get()?;
        GroupsRepo::get_all(&conn)
    }

    /// Delete a group.
    pub fn delete_group(&self, id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        GroupsRepo::delete(&conn, id)
    }

    /// Insert or update a schedule.
    pub fn save_schedule(&self, schedule: &Schedule) -> Result<()> {
        let conn = self.pool.get()?;
        SchedulesRepo::upsert(&conn, schedule)
    }

    /// Get all schedules.
    pub fn get_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.pool.get()?;
        SchedulesRepo::get_all(&conn)
    }

    /// Delete a schedule.
    pub fn delete_schedule(&self, id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        SchedulesRepo::delete(&conn, id)
    }

    /// Replace the simple blocklist.
    pub fn replace_blocked_domains(&self, domains: &[BlockedDomain]) -> Result<()> {
        let conn = self.pool.get()?;
        DomainsRepo::replace_all(&conn, domains)
    }

    /// Get the simple blocklist.
    pub fn get_blocked_domains(&self) -> Result<Vec<BlockedDomain>> {
        let conn = self.pool.get()?;
        DomainsRepo::get_all(&conn)
    }

    /// Load everything needed to rebuild a rule engine.
    pub fn load_ruleset(&self) -> Result<RuleSet> {
        let conn = self.pool.get()?;
        let set = RuleSet {
            schedules: SchedulesRepo::get_all(&conn)?,
            groups: GroupsRepo::get_all(&conn)?,
            rules: RulesRepo::get_all(&conn)?,
            blocked_domains: DomainsRepo::get_all(&conn)?,
        };
        debug!(
            rules = set.rules.len(),
            groups = set.groups.len(),
            schedules = set.schedules.len(),
            blocked_domains = set.blocked_domains.len(),
            "Loaded rule set from database"
        );
        Ok(set)
    }

    /// Store a whole rule set in one transaction, replacing the blocklist.
    pub fn save_ruleset(&self, set: &RuleSet) -> Result<()> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        for schedule in &set.schedules {
            SchedulesRepo::upsert(&tx, schedule)?;
        }
        for group in &set.groups {
            GroupsRepo::upsert(&tx, group)?;
        }
        for rule in &set.rules {
            RulesRepo::upsert(&tx, rule)?;
        }
        tx.commit()?;
        DomainsRepo::replace_all(&conn, &set.blocked_domains)
    }

    // === Intercept stats ===

    /// Add count deltas in one transaction.
    pub fn add_intercept_increments(&self, increments: &[InterceptIncrement]) -> Result<()> {
        let conn = self.pool.get()?;
        InterceptsRepo::add_increments(&conn, increments)
    }

    /// Get a site's row for a date.
    pub fn get_intercept_stat(&self, site_id: &str, date: NaiveDate) -> Result<Option<InterceptStat>> {
        let conn = self.pool.get()?;
        InterceptsRepo::get(&conn, site_id, date)
    }

    /// Get rows between two dates inclusive.
    pub fn get_intercept_stats_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<InterceptStat>> {
        let conn = self.pool.get()?;
        InterceptsRepo::get_range(&conn, start, end)
    }

    /// Get every row.
    pub fn get_all_intercept_stats(&self) -> Result<Vec<InterceptStat>> {
        let conn = self.pool.get()?;
        InterceptsRepo::get_all(&conn)
    }

    /// Per-site totals since a date.
    pub fn get_site_totals(&self, since: NaiveDate) -> Result<Vec<SiteTotal>> {
        let conn = self.pool.get()?;
        InterceptsRepo::site_totals(&conn, since)
    }

    /// Delete rows dated before `cutoff`.
    pub fn delete_intercepts_before(&self, cutoff: NaiveDate) -> Result<usize> {
        let conn = self.pool.get()?;
        InterceptsRepo::delete_before(&conn, cutoff)
    }
}

impl RuleStore for Database {
    fn save_rule(&self, rule: &BlockRule) -> StoreResult<()> {
        Ok(Database::save_rule(self, rule)?)
    }

    fn delete_rule(&self, id: &str) -> StoreResult<()> {
        Ok(Database::delete_rule(self, id)?)
    }

    fn save_group(&self, group: &UserGroup) -> StoreResult<()> {
        Ok(Database::save_group(self, group)?)
    }

    fn delete_group(&self, id: &str) -> StoreResult<()> {
        Ok(Database::delete_group(self, id)?)
    }

    fn save_schedule(&self, schedule: &Schedule) -> StoreResult<()> {
        Ok(Database::save_schedule(self, schedule)?)
    }

    fn delete_schedule(&self, id: &str) -> StoreResult<()> {
        Ok(Database::delete_schedule(self, id)?)
    }

    fn replace_blocked_domains(&self, domains: &[BlockedDomain]) -> StoreResult<()> {
        Ok(Database::replace_blocked_domains(self, domains)?)
    }
}

impl InterceptStore for Database {
    fn persist_increments(&self, increments: &[InterceptIncrement]) -> StoreResult<()> {
        Ok(self.add_intercept_increments(increments)?)
    }

    fn delete_before(&self, cutoff: NaiveDate) -> StoreResult<usize> {
        Ok(self.delete_intercepts_before(cutoff)?)
    }
}
