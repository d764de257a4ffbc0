//! Rules repository.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension, Row};
use sitegate_core::{BlockRule, MatchType, RuleAction};

use super::{json_column, parse_datetime, unknown_value};
use crate::error::{Result, StorageError};

/// Repository for rule operations.
pub struct RulesRepo;

const COLUMNS: &str = "id, pattern, match_type, case_sensitive, enabled, priority, action,
     redirect_target, user_group_ids, schedule_id, created_at, updated_at";

impl RulesRepo {
    /// Inserts a rule, or updates it in place keeping its position.
    pub fn upsert(conn: &Connection, rule: &BlockRule) -> Result<()> {
        let groups: Vec<&String> = rule.user_group_ids.iter().collect();
        let groups_json = serde_json::to_string(&groups)?;

        conn.execute(
            "INSERT INTO rules (id, pattern, match_type, case_sensitive, enabled, priority, action,
                                redirect_target, user_group_ids, schedule_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                pattern = excluded.pattern,
                match_type = excluded.match_type,
                case_sensitive = excluded.case_sensitive,
                enabled = excluded.enabled,
                priority = excluded.priority,
                action = excluded.action,
                redirect_target = excluded.redirect_target,
                user_group_ids = excluded.user_group_ids,
                schedule_id = excluded.schedule_id,
                updated_at = excluded.updated_at",
            params![
                rule.id,
                rule.pattern,
                rule.match_type.as_str(),
                rule.case_sensitive as i32,
                rule.enabled as i32,
                rule.priority,
                rule.action.as_str(),
                rule.redirect_target,
                groups_json,
                rule.schedule_id,
                rule.created_at.to_rfc3339(),
                rule.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Get a rule by id.
    pub fn get(conn: &Connection, id: &str) -> Result<Option<BlockRule>> {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM rules WHERE id = ?1", COLUMNS))?;
        let rule = stmt.query_row([id], map_rule).optional()?;
        Ok(rule)
    }

    /// Get all rules in insertion order.
    pub fn get_all(conn: &Connection) -> Result<Vec<BlockRule>> {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM rules ORDER BY rowid ASC", COLUMNS))?;
        let rules = stmt
            .query_map([], map_rule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    /// Delete a rule.
    pub fn delete(conn: &Connection, id: &str) -> Result<()> {
        let deleted = conn.execute("DELETE FROM rules WHERE id = ?1", [id])?;

        if deleted == 0 {
            return Err(StorageError::NotFound(format!("Rule with id {}", id)));
        }

        Ok(())
    }

    /// Count rules.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn map_rule(row: &Row<'_>) -> rusqlite::Result<BlockRule> {
    let match_type: String = row.get(2)?;
    let action: String = row.get(6)?;
    let groups: String = row.get(8)?;

    Ok(BlockRule {
        id: row.get(0)?,
        pattern: row.get(1)?,
        match_type: MatchType::parse(&match_type)
            .ok_or_else(|| unknown_value(2, "match type", match_type.clone()))?,
        case_sensitive: row.get::<_, i32>(3)? != 0,
        enabled: row.get::<_, i32>(4)? != 0,
        priority: row.get(5)?,
        action: RuleAction::parse(&action).ok_or_else(|| unknown_value(6, "action", action.clone()))?,
        redirect_target: row.get(7)?,
        user_group_ids: json_column::<BTreeSet<String>>(8, &groups)?,
        schedule_id: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?),
        updated_at: parse_datetime(&row.get::<_, String>(11)?),
    })
}
