//! Durable queue of pending mutations, stored in `sync_queue`.

use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::error::AppError;
use crate::models::{Action, QueueEntry, Table};

const IDEMPOTENCY_KEY_LEN: usize = 32;

const SELECT_ENTRY: &str =
  "SELECT id, tbl, record_id, action, payload, idempotency_key, timestamp, attempts, last_error, last_attempt_at FROM sync_queue";

pub fn append(conn: &Connection, table: Table, record_id: i64, action: Action, payload: &Value) -> Result<QueueEntry, AppError> {
  let payload_json = serde_json::to_string(payload)?;
  let key = generate_idempotency_key();
  let timestamp = Utc::now().to_rfc3339();
  conn.execute(
    "INSERT INTO sync_queue (tbl, record_id, action, payload, idempotency_key, timestamp, attempts) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
    params![table.as_str(), record_id, action.as_str(), payload_json, key, timestamp],
  )?;

  Ok(QueueEntry {
    id: conn.last_insert_rowid(),
    table,
    record_id,
    action,
    payload: payload.clone(),
    idempotency_key: key,
    timestamp,
    attempts: 0,
    last_error: None,
    last_attempt_at: None,
  })
}

/// All queued entries in insertion order.
pub fn list(conn: &Connection) -> Result<Vec<QueueEntry>, AppError> {
  select(conn, &format!("{SELECT_ENTRY} ORDER BY id ASC"), params![])
}

pub fn entries_for_record(conn: &Connection, table: Table, record_id: i64) -> Result<Vec<QueueEntry>, AppError> {
  select(
    conn,
    &format!("{SELECT_ENTRY} WHERE tbl = ?1 AND record_id = ?2 ORDER BY id ASC"),
    params![table.as_str(), record_id],
  )
}

pub fn remove(conn: &Connection, id: i64) -> Result<(), AppError> {
  let removed = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
  if removed == 0 {
    return Err(AppError::not_found("sync_queue", id));
  }
  Ok(())
}

pub fn remove_for_record(conn: &Connection, table: Table, record_id: i64) -> Result<usize, AppError> {
  let removed = conn.execute(
    "DELETE FROM sync_queue WHERE tbl = ?1 AND record_id = ?2",
    params![table.as_str(), record_id],
  )?;
  Ok(removed)
}

/// Failure bookkeeping: the only mutation a queued entry ever sees.
pub fn record_failure(conn: &Connection, id: i64, error: &str) -> Result<(), AppError> {
  conn.execute(
    "UPDATE sync_queue SET attempts = attempts + 1, last_error = ?2, last_attempt_at = ?3 WHERE id = ?1",
    params![id, error, Utc::now().to_rfc3339()],
  )?;
  Ok(())
}

pub fn count(conn: &Connection) -> Result<i64, AppError> {
  Ok(conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?)
}

/// Entries that failed at least once and are still waiting for a retry.
pub fn failed_count(conn: &Connection) -> Result<i64, AppError> {
  Ok(conn.query_row("SELECT COUNT(*) FROM sync_queue WHERE attempts > 0", [], |row| row.get(0))?)
}

fn select(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<QueueEntry>, AppError> {
  let mut stmt = conn.prepare(sql)?;
  let rows = stmt.query_map(args, |row| {
    Ok((
      row.get::<_, i64>(0)?,
      row.get::<_, String>(1)?,
      row.get::<_, i64>(2)?,
      row.get::<_, String>(3)?,
      row.get::<_, String>(4)?,
      row.get::<_, String>(5)?,
      row.get::<_, String>(6)?,
      row.get::<_, i64>(7)?,
      row.get::<_, Option<String>>(8)?,
      row.get::<_, Option<String>>(9)?,
    ))
  })?;

  let mut entries = Vec::new();
  for row in rows {
    let (id, table, record_id, action, payload, idempotency_key, timestamp, attempts, last_error, last_attempt_at) = row?;
    entries.push(QueueEntry {
      id,
      table: table.parse()?,
      record_id,
      action: action.parse()?,
      payload: serde_json::from_str(&payload)?,
      idempotency_key,
      timestamp,
      attempts,
      last_error,
      last_attempt_at,
    });
  }
  Ok(entries)
}

fn generate_idempotency_key() -> String {
  rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(IDEMPOTENCY_KEY_LEN)
    .map(char::from)
    .collect()
}
