//! Blocked domains repository.

use rusqlite::{params, Connection};
use sitegate_core::BlockedDomain;

use crate::error::Result;

/// Repository for the simple blocklist.
pub struct DomainsRepo;

impl DomainsRepo {
    /// Replaces the whole list in one transaction.
    pub fn replace_all(conn: &Connection, domains: &[BlockedDomain]) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM blocked_domains", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO blocked_domains (domain, enabled) VALUES (?1, ?2)",
            )?;
            for entry in domains {
                stmt.execute(params![entry.domain, entry.enabled as i32])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Get the list in insertion order.
    pub fn get_all(conn: &Connection) -> Result<Vec<BlockedDomain>> {
        let mut stmt =
            conn.prepare("SELECT domain, enabled FROM blocked_domains ORDER BY rowid ASC")?;
        let domains = stmt
            .query_map([], |row| {
                Ok(BlockedDomain {
                    domain: row.get(0)?,
                    enabled: row.get::<_, i32>(1)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(domains)
    }
}
