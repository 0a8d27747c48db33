//! `vault_entries` table access. Only ever sees sealed blobs.

use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

use crate::errors::VaultError;

pub fn put(conn: &Connection, name: &str, blob: &str) -> Result<(), VaultError> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO vault_entries (name, blob, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
        params![name, blob, now],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, name: &str) -> Result<Option<String>, VaultError> {
    let blob = conn
        .query_row(
            "SELECT blob FROM vault_entries WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(blob)
}

/// Returns true when a row was removed.
pub fn delete(conn: &Connection, name: &str) -> Result<bool, VaultError> {
    let removed = conn.execute("DELETE FROM vault_entries WHERE name = ?1", params![name])?;
    Ok(removed > 0)
}

pub fn names(conn: &Connection) -> Result<Vec<String>, VaultError> {
    let mut stmt = conn.prepare("SELECT name FROM vault_entries ORDER BY name")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().expect("memory db");
        conn.execute_batch(include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../migrations/0002_vault.sql"
        )))
        .expect("migrate");
        conn
    }

    #[test]
    fn put_overwrites_and_delete_reports_presence() {
        let conn = conn();
        put(&conn, "gemini_api_key", "blob-1").expect("put");
        put(&conn, "gemini_api_key", "blob-2").expect("put");
        assert_eq!(get(&conn, "gemini_api_key").expect("get").as_deref(), Some("blob-2"));
        assert_eq!(names(&conn).expect("names"), vec!["gemini_api_key".to_string()]);
        assert!(delete(&conn, "gemini_api_key").expect("delete"));
        assert!(!delete(&conn, "gemini_api_key").expect("delete"));
        assert_eq!(get(&conn, "gemini_api_key").expect("get"), None);
    }
}
