//! User groups repository.

use rusqlite::{params, Connection, Row};
use sitegate_core::UserGroup;

use super::json_column;
use crate::error::{Result, StorageError};

/// Repository for user group operations.
pub struct GroupsRepo;

impl GroupsRepo {
    /// Inserts or replaces a group.
    pub fn upsert(conn: &Connection, group: &UserGroup) -> Result<()> {
        let members = serde_json::to_string(&group.members)?;
        let permissions = serde_json::to_string(&group.permissions)?;

        conn.execute(
            "INSERT INTO user_groups (id, name, members, permissions)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                members = excluded.members,
                permissions = excluded.permissions",
            params![group.id, group.name, members, permissions],
        )?;

        Ok(())
    }

    /// Get all groups in insertion order.
    pub fn get_all(conn: &Connection) -> Result<Vec<UserGroup>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, members, permissions FROM user_groups ORDER BY rowid ASC",
        )?;
        let groups = stmt
            .query_map([], map_group)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    /// Delete a group.
    pub fn delete(conn: &Connection, id: &str) -> Result<()> {
        let deleted = conn.execute("DELETE FROM user_groups WHERE id = ?1", [id])?;

        if deleted == 0 {
            return Err(StorageError::NotFound(format!("Group with id {}", id)));
        }

        Ok(())
    }
}

fn map_group(row: &Row<'_>) -> rusqlite::Result<UserGroup> {
    let members: String = row.get(2)?;
    let permissions: String = row.get(3)?;

    Ok(UserGroup {
        id: row.get(0)?,
        name: row.get(1)?,
        members: json_column(2, &members)?,
        permissions: json_column(3, &permissions)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn group_crud() {
        let conn = setup_db();
        let group = UserGroup::new("staff", "Staff", ["alice", "bob"]).with_permission("admin");

        GroupsRepo::upsert(&conn, &group).unwrap();
        GroupsRepo::upsert(&conn, &UserGroup::new("kids", "Kids", ["carol"])).unwrap();

        let all = GroupsRepo::get_all(&conn).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], group);
        assert_eq!(all[1].id, "kids");

        GroupsRepo::delete(&conn, "staff").unwrap();
        assert_eq!(GroupsRepo::get_all(&conn).unwrap().len(), 1);
        assert!(GroupsRepo::delete(&conn, "staff").is_err());
    }
}
