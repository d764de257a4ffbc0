//! Schedules repository.

use rusqlite::{params, Connection, Row};
use sitegate_core::Schedule;

use super::json_column;
use crate::error::{Result, StorageError};

/// Repository for schedule operations.
pub struct SchedulesRepo;

impl SchedulesRepo {
    /// Inserts or replaces a schedule. Days and ranges are stored as JSON.
    pub fn upsert(conn: &Connection, schedule: &Schedule) -> Result<()> {
        let days = serde_json::to_string(&schedule.days)?;
        let ranges = serde_json::to_string(&schedule.ranges)?;

        conn.execute(
            "INSERT INTO schedules (id, name, days, ranges)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                days = excluded.days,
                ranges = excluded.ranges",
            params![schedule.id, schedule.name, days, ranges],
        )?;

        Ok(())
    }

    /// Get all schedules in insertion order.
    pub fn get_all(conn: &Connection) -> Result<Vec<Schedule>> {
        let mut stmt =
            conn.prepare("SELECT id, name, days, ranges FROM schedules ORDER BY rowid ASC")?;
        let schedules = stmt
            .query_map([], map_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(schedules)
    }

    /// Delete a schedule.
    pub fn delete(conn: &Connection, id: &str) -> Result<()> {
        let deleted = conn.execute("DELETE FROM schedules WHERE id = ?1", [id])?;

        if deleted == 0 {
            return Err(StorageError::NotFound(format!("Schedule with id {}", id)));
        }

        Ok(())
    }
}

fn map_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let days: String = row.get(2)?;
    let ranges: String = row.get(3)?;

    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        days: json_column(2, &days)?,
        ranges: json_column(3, &ranges)?,
    })
}
