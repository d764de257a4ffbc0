//! Intercept statistics repository.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sitegate_core::{InterceptIncrement, InterceptStat};

use super::{format_date, parse_date, parse_datetime};
use crate::error::Result;
use crate::models::SiteTotal;

/// Repository for per-site daily intercept counters.
pub struct InterceptsRepo;

const COLUMNS: &str = "site_id, domain, date, count, last_intercept_at";

/// Fixed-width UTC timestamps compare correctly as text.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl InterceptsRepo {
    /// Adds every increment to its `(site_id, date)` row in one transaction.
    pub fn add_increments(conn: &Connection, increments: &[InterceptIncrement]) -> Result<()> {
        if increments.is_empty() {
            return Ok(());
        }

        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO intercept_stats (site_id, date, domain, count, last_intercept_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(site_id, date) DO UPDATE SET
                    count = count + excluded.count,
                    domain = excluded.domain,
                    last_intercept_at = MAX(last_intercept_at, excluded.last_intercept_at)",
            )?;

            for inc in increments {
                stmt.execute(params![
                    inc.site_id,
                    format_date(inc.date),
                    inc.domain,
                    inc.count as i64,
                    format_timestamp(inc.last_intercept_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Get the row for a site on a date.
    pub fn get(conn: &Connection, site_id: &str, date: NaiveDate) -> Result<Option<InterceptStat>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM intercept_stats WHERE site_id = ?1 AND date = ?2",
            COLUMNS
        ))?;
        let stat = stmt
            .query_row(params![site_id, format_date(date)], map_stat)
            .optional()?;
        Ok(stat)
    }

    /// Get rows between two dates inclusive, newest first.
    pub fn get_range(conn: &Connection, start: NaiveDate, end: NaiveDate) -> Result<Vec<InterceptStat>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM intercept_stats WHERE date >= ?1 AND date <= ?2
             ORDER BY date DESC, count DESC, site_id ASC",
            COLUMNS
        ))?;
        let stats = stmt
            .query_map(params![format_date(start), format_date(end)], map_stat)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    /// Get every row.
    pub fn get_all(conn: &Connection) -> Result<Vec<InterceptStat>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM intercept_stats ORDER BY date DESC, site_id ASC",
            COLUMNS
        ))?;
        let stats = stmt
            .query_map([], map_stat)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    /// Totals per site for rows dated on or after `since`, highest first.
    pub fn site_totals(conn: &Connection, since: NaiveDate) -> Result<Vec<SiteTotal>> {
        let mut stmt = conn.prepare(
            "SELECT site_id, MAX(domain), SUM(count), COUNT(*), MAX(last_intercept_at)
             FROM intercept_stats WHERE date >= ?1
             GROUP BY site_id ORDER BY SUM(count) DESC, site_id ASC",
        )?;
        let totals = stmt
            .query_map([format_date(since)], |row| {
                Ok(SiteTotal {
                    site_id: row.get(0)?,
                    domain: row.get(1)?,
                    total: row.get::<_, i64>(2)? as u64,
                    days: row.get::<_, i64>(3)? as u32,
                    last_intercept_at: parse_datetime(&row.get::<_, String>(4)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(totals)
    }

    /// Delete rows dated strictly before `cutoff`.
    pub fn delete_before(conn: &Connection, cutoff: NaiveDate) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM intercept_stats WHERE date < ?1",
            [format_date(cutoff)],
        )?;
        Ok(deleted)
    }
}

fn map_stat(row: &Row<'_>) -> rusqlite::Result<InterceptStat> {
    Ok(InterceptStat {
        site_id: row.get(0)?,
        domain: row.get(1)?,
        date: parse_date(2, &row.get::<_, String>(2)?)?,
        count: row.get::<_, i64>(3)? as u64,
        last_intercept_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;
    use chrono::{Duration, TimeZone};

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn inc(site: &str, date: NaiveDate, count: u64, hour: u32) -> InterceptIncrement {
        InterceptIncrement {
            site_id: site.to_string(),
            domain: format!("{}.test", site),
            date,
            count,
            last_intercept_at: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn increments_accumulate() {
        let conn = setup_db();
        InterceptsRepo::add_increments(&conn, &[inc("r1", day(1), 2, 10)]).unwrap();
        InterceptsRepo::add_increments(&conn, &[inc("r1", day(1), 1, 9)]).unwrap();

        let row = InterceptsRepo::get(&conn, "r1", day(1)).unwrap().unwrap();
        assert_eq!(row.count, 3);
        // An older delta does not move the timestamp back.
        assert_eq!(row.last_intercept_at, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn new_day_new_row() {
        let conn = setup_db();
        InterceptsRepo::add_increments(
            &conn,
            &[inc("r1", day(1), 3, 10), inc("r1", day(2), 1, 11)],
        )
        .unwrap();

        assert_eq!(InterceptsRepo::get_all(&conn).unwrap().len(), 2);
        assert_eq!(InterceptsRepo::get(&conn, "r1", day(2)).unwrap().unwrap().count, 1);
        assert!(InterceptsRepo::get(&conn, "r1", day(3)).unwrap().is_none());
    }

    #[test]
    fn range_and_totals() {
        let conn = setup_db();
        InterceptsRepo::add_increments(
            &conn,
            &[
                inc("r1", day(1), 3, 10),
                inc("r1", day(3), 4, 10),
                inc("r2", day(3), 10, 12),
                inc("r2", day(5), 1, 12),
            ],
        )
        .unwrap();

        let range = InterceptsRepo::get_range(&conn, day(2), day(4)).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].site_id, "r2");

        let totals = InterceptsRepo::site_totals(&conn, day(1)).unwrap();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].site_id, "r2");
        assert_eq!(totals[0].total, 11);
        assert_eq!(totals[1].total, 7);
        assert_eq!(totals[1].days, 2);
    }

    #[test]
    fn delete_before_cutoff() {
        let conn = setup_db();
        let today = day(20);
        InterceptsRepo::add_increments(
            &conn,
            &[
                inc("r1", today - Duration::days(10), 1, 1),
                inc("r1", today - Duration::days(8), 1, 1),
                inc("r1", today - Duration::days(7), 1, 1),
                inc("r1", today, 1, 1),
            ],
        )
        .unwrap();

        let cutoff = today - Duration::days(7);
        assert_eq!(InterceptsRepo::delete_before(&conn, cutoff).unwrap(), 2);
        assert_eq!(InterceptsRepo::delete_before(&conn, cutoff).unwrap(), 0);
        assert_eq!(InterceptsRepo::get_all(&conn).unwrap().len(), 2);
    }

    #[test]
    fn empty_increment_list_is_a_no_op() {
        let conn = setup_db();
        InterceptsRepo::add_increments(&conn, &[]).unwrap();
        assert!(InterceptsRepo::get_all(&conn).unwrap().is_empty());
    }
}
