//! Structured diagnostics persisted to the `event_log` table, plus the
//! redaction helpers every log call site uses before touching user data.

use r2d2_sqlite::rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::DbPool;

pub fn log_event(
    conn: &Connection,
    level: &str,
    code: Option<&str>,
    module: &str,
    message: &str,
    explain: Option<&str>,
    data: Option<Value>,
) -> rusqlite::Result<()> {
    let id = Uuid::new_v4().to_string();
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    let data_str = data.map(|v| v.to_string());
    conn.execute(
        "INSERT INTO event_log (id, ts, level, code, module, message, explain, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, ts, level, code, module, message, explain, data_str],
    )?;
    Ok(())
}

/// Fire-and-forget variant for async call sites; failures only reach `log`.
pub fn spawn_log_event(
    pool: &DbPool,
    level: &'static str,
    code: &'static str,
    module: &'static str,
    message: &'static str,
    data: Value,
) {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let result = pool
            .get()
            .map_err(|err| err.to_string())
            .and_then(|conn| {
                log_event(&conn, level, Some(code), module, message, None, Some(data))
                    .map_err(|err| err.to_string())
            });
        if let Err(err) = result {
            log::warn!("failed to persist {code} to event log: {err}");
        }
    });
}

#[derive(Debug, Clone, Serialize)]
pub struct EventLogEntry {
    pub id: String,
    pub ts: i64,
    pub level: String,
    pub code: Option<String>,
    pub module: String,
    pub message: String,
    pub explain: Option<String>,
    pub data: Option<Value>,
}

/// Newest first.
pub fn recent_events(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<EventLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, ts, level, code, module, message, explain, data FROM event_log ORDER BY ts DESC, rowid DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        let data: Option<String> = row.get(7)?;
        Ok(EventLogEntry {
            id: row.get(0)?,
            ts: row.get(1)?,
            level: row.get(2)?,
            code: row.get(3)?,
            module: row.get(4)?,
            message: row.get(5)?,
            explain: row.get(6)?,
            data: data.and_then(|raw| serde_json::from_str(&raw).ok()),
        })
    })?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

/// First `max_chars` characters of `text`, with an ellipsis when truncated.
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push('…');
    }
    out
}

/// Describe a secret without revealing it: short prefix plus length.
pub fn mask_secret(value: &str) -> String {
    let len = value.chars().count();
    if len <= 8 {
        return format!("<{len} chars>");
    }
    let prefix: String = value.chars().take(4).collect();
    format!("{prefix}… <{len} chars>")
}
