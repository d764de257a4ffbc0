//! Database schema and migrations.

use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StorageError};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StorageError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    if current_version < SCHEMA_VERSION {
        info!(
            "Running migrations from version {} to {}",
            current_version, SCHEMA_VERSION
        );

        let tx = conn.unchecked_transaction()?;

        if current_version < 1 {
            migrate_v1(&tx)?;
        }

        if current_version < 2 {
            migrate_v2(&tx)?;
        }

        set_schema_version(&tx, SCHEMA_VERSION)?;
        tx.commit()?;
        info!("Migrations complete");
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration to version 1: rule configuration.
fn migrate_v1(conn: &Connection) -> Result<()> {
    info!("Applying migration v1: rule tables");

    // Rows keep their rowid on upsert, so rowid order is insertion order.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS rules (
            id TEXT PRIMARY KEY,
            pattern TEXT NOT NULL,
            match_type TEXT NOT NULL,
            case_sensitive INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            action TEXT NOT NULL,
            redirect_target TEXT,
            user_group_ids TEXT NOT NULL DEFAULT '[]',
            schedule_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedules (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            days TEXT NOT NULL,
            ranges TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_groups (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            members TEXT NOT NULL DEFAULT '[]',
            permissions TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS blocked_domains (
            domain TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    Ok(())
}

/// Migration to version 2: per-site daily intercept counters.
fn migrate_v2(conn: &Connection) -> Result<()> {
    info!("Applying migration v2: intercept stats");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS intercept_stats (
            site_id TEXT NOT NULL,
            date TEXT NOT NULL,
            domain TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            last_intercept_at TEXT NOT NULL,
            PRIMARY KEY (site_id, date)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_intercept_stats_date ON intercept_stats (date)",
        [],
    )?;

    Ok(())
}
