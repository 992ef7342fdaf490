//! Local entity store.
//!
//! Every syncable table shares one row layout: the entity payload as a JSON object in `data`,
//! a denormalized `date` column for range queries and ordering, a lowercased `search_text`
//! for substring search, and the entity's `sync_status`. The store knows nothing about the
//! queue or the network; the recorder composes it with the queue inside one transaction.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::db::{self, Db};
use crate::error::AppError;
use crate::models::{Record, SyncStatus, Table};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
  pub id: Option<i64>,
  pub data: Value,
  pub sync_status: SyncStatus,
  pub updated_at: Option<String>,
}

impl Entity {
  pub fn new(data: Value) -> Self {
    Entity::with_status(data, SyncStatus::Pending)
  }

  pub fn with_status(data: Value, sync_status: SyncStatus) -> Self {
    Entity {
      id: None,
      data,
      sync_status,
      updated_at: None,
    }
  }

  pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AppError> {
    serde_json::from_value(self.data.clone())
      .map_err(|err| AppError::storage("DECODE", format!("stored entity does not match its type: {err}")))
  }

  pub fn into_record<T: DeserializeOwned>(self) -> Result<Record<T>, AppError> {
    let item = self.decode()?;
    let id = self
      .id
      .ok_or_else(|| AppError::storage("DECODE", "entity was never persisted"))?;
    Ok(Record {
      id,
      sync_status: self.sync_status,
      item,
    })
  }
}

/// Predicate for [`query`]. All conditions are combined with AND.
#[derive(Debug, Clone, Default)]
pub struct Query {
  pub equals: Vec<(String, Value)>,
  pub date_from: Option<String>,
  pub date_to: Option<String>,
  pub text: Option<String>,
  pub limit: Option<usize>,
}

impl Query {
  pub fn new() -> Self {
    Query::default()
  }

  pub fn field_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
    self.equals.push((field.to_string(), value.into()));
    self
  }

  pub fn date_from(mut self, date: impl Into<String>) -> Self {
    self.date_from = Some(date.into());
    self
  }

  pub fn date_to(mut self, date: impl Into<String>) -> Self {
    self.date_to = Some(date.into());
    self
  }

  pub fn containing(mut self, text: impl Into<String>) -> Self {
    self.text = Some(text.into());
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }
}

/// Handle used by callers outside a transaction.
#[derive(Clone)]
pub struct LocalStore {
  db: Arc<Db>,
}

impl LocalStore {
  pub fn new(db: Arc<Db>) -> Self {
    LocalStore { db }
  }

  pub fn db(&self) -> &Arc<Db> {
    &self.db
  }

  pub fn put(&self, table: Table, entity: &Entity) -> Result<i64, AppError> {
    db::with_conn(&self.db, |conn| put(conn, table, entity))
  }

  pub fn get(&self, table: Table, id: i64) -> Result<Option<Entity>, AppError> {
    db::with_conn(&self.db, |conn| get(conn, table, id))
  }

  pub fn query(&self, table: Table, query: &Query) -> Result<Vec<Entity>, AppError> {
    db::with_conn(&self.db, |conn| self::query(conn, table, query))
  }

  pub fn delete(&self, table: Table, id: i64) -> Result<(), AppError> {
    db::with_conn(&self.db, |conn| delete(conn, table, id))
  }

  pub fn count(&self, table: Table) -> Result<i64, AppError> {
    db::with_conn(&self.db, |conn| count(conn, table))
  }
}

pub fn put(conn: &Connection, table: Table, entity: &Entity) -> Result<i64, AppError> {
  if !entity.data.is_object() {
    return Err(AppError::new("INVALID_ENTITY", "entity payload must be a JSON object"));
  }
  let data = serde_json::to_string(&entity.data)?;
  let date = entity.data.get("date").and_then(Value::as_str).map(str::to_string);
  let search = search_text(&entity.data);
  let now = Utc::now().to_rfc3339();

  match entity.id {
    Some(id) => {
      conn.execute(
        &format!(
          "INSERT INTO {} (id, date, data, search_text, sync_status, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
           ON CONFLICT(id) DO UPDATE SET date = excluded.date, data = excluded.data,
             search_text = excluded.search_text, sync_status = excluded.sync_status, updated_at = excluded.updated_at",
          table.as_str()
        ),
        params![id, date, data, search, entity.sync_status.as_str(), now],
      )?;
      Ok(id)
    }
    None => {
      conn.execute(
        &format!(
          "INSERT INTO {} (date, data, search_text, sync_status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
          table.as_str()
        ),
        params![date, data, search, entity.sync_status.as_str(), now],
      )?;
      Ok(conn.last_insert_rowid())
    }
  }
}

pub fn get(conn: &Connection, table: Table, id: i64) -> Result<Option<Entity>, AppError> {
  let row = conn
    .query_row(
      &format!("SELECT id, data, sync_status, updated_at FROM {} WHERE id = ?1", table.as_str()),
      params![id],
      |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
        ))
      },
    )
    .optional()?;

  row.map(decode_row).transpose()
}

pub fn query(conn: &Connection, table: Table, query: &Query) -> Result<Vec<Entity>, AppError> {
  let mut items = Vec::new();
  for_each(conn, table, query, |entity| {
    items.push(entity);
    Ok(())
  })?;
  Ok(items)
}

/// Streams matching entities, newest date first, without materializing the result set.
pub fn for_each(
  conn: &Connection,
  table: Table,
  query: &Query,
  mut f: impl FnMut(Entity) -> Result<(), AppError>,
) -> Result<(), AppError> {
  let mut sql = format!("SELECT id, data, sync_status, updated_at FROM {} WHERE 1 = 1", table.as_str());
  let mut args: Vec<SqlValue> = Vec::new();

  for (field, value) in &query.equals {
    ensure_field_name(field)?;
    args.push(SqlValue::Text(format!("$.{field}")));
    args.push(to_sql_value(value)?);
    sql.push_str(&format!(" AND json_extract(data, ?{}) IS ?{}", args.len() - 1, args.len()));
  }
  if let Some(from) = &query.date_from {
    args.push(SqlValue::Text(from.clone()));
    sql.push_str(&format!(" AND date >= ?{}", args.len()));
  }
  if let Some(to) = &query.date_to {
    args.push(SqlValue::Text(to.clone()));
    sql.push_str(&format!(" AND date <= ?{}", args.len()));
  }
  if let Some(text) = query.text.as_deref().map(str::trim).filter(|text| !text.is_empty()) {
    args.push(SqlValue::Text(format!("%{}%", escape_like(&text.to_lowercase()))));
    sql.push_str(&format!(" AND search_text LIKE ?{} ESCAPE '\\'", args.len()));
  }
  sql.push_str(" ORDER BY date DESC, id DESC");
  if let Some(limit) = query.limit {
    args.push(SqlValue::Integer(limit as i64));
    sql.push_str(&format!(" LIMIT ?{}", args.len()));
  }

  let mut stmt = conn.prepare(&sql)?;
  let mut rows = stmt.query(params_from_iter(args.iter()))?;
  while let Some(row) = rows.next()? {
    let raw = (
      row.get::<_, i64>(0)?,
      row.get::<_, String>(1)?,
      row.get::<_, String>(2)?,
      row.get::<_, String>(3)?,
    );
    f(decode_row(raw)?)?;
  }
  Ok(())
}

pub fn delete(conn: &Connection, table: Table, id: i64) -> Result<(), AppError> {
  let removed = conn.execute(&format!("DELETE FROM {} WHERE id = ?1", table.as_str()), params![id])?;
  if removed == 0 {
    return Err(AppError::not_found(table.as_str(), id));
  }
  Ok(())
}

pub fn count(conn: &Connection, table: Table) -> Result<i64, AppError> {
  let total = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.as_str()), [], |row| row.get(0))?;
  Ok(total)
}

/// Returns false when the entity no longer exists (deleted while its entries were queued).
pub fn set_sync_status(conn: &Connection, table: Table, id: i64, status: SyncStatus) -> Result<bool, AppError> {
  let changed = conn.execute(
    &format!("UPDATE {} SET sync_status = ?2 WHERE id = ?1", table.as_str()),
    params![id, status.as_str()],
  )?;
  Ok(changed > 0)
}

fn decode_row((id, data, status, updated_at): (i64, String, String, String)) -> Result<Entity, AppError> {
  Ok(Entity {
    id: Some(id),
    data: serde_json::from_str(&data)?,
    sync_status: status.parse()?,
    updated_at: Some(updated_at),
  })
}

fn ensure_field_name(field: &str) -> Result<(), AppError> {
  let valid = !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
  if valid {
    Ok(())
  } else {
    Err(AppError::new("INVALID_FIELD", format!("invalid field name '{field}'")))
  }
}

fn to_sql_value(value: &Value) -> Result<SqlValue, AppError> {
  match value {
    Value::Null => Ok(SqlValue::Null),
    Value::Bool(flag) => Ok(SqlValue::Integer(i64::from(*flag))),
    Value::Number(number) => match number.as_i64() {
      Some(int) => Ok(SqlValue::Integer(int)),
      None => Ok(SqlValue::Real(number.as_f64().unwrap_or_default())),
    },
    Value::String(text) => Ok(SqlValue::Text(text.clone())),
    Value::Array(_) | Value::Object(_) => Err(AppError::new("INVALID_FILTER", "only scalar values can be compared")),
  }
}

fn escape_like(value: &str) -> String {
  value.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn search_text(data: &Value) -> String {
  fn collect(value: &Value, out: &mut Vec<String>) {
    match value {
      Value::String(text) => out.push(text.to_lowercase()),
      Value::Array(items) => items.iter().for_each(|item| collect(item, out)),
      Value::Object(map) => map.values().for_each(|item| collect(item, out)),
      _ => {}
    }
  }

  let mut parts = Vec::new();
  collect(data, &mut parts);
  parts.join(" ")
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store() -> LocalStore {
    LocalStore::new(Arc::new(Db::open_in_memory().unwrap()))
  }

  fn tx(date: &str, enterprise: &str, description: &str) -> Entity {
    Entity::new(json!({
      "date": date,
      "type": "expense",
      "amount": 120.5,
      "enterprise": enterprise,
      "description": description,
    }))
  }

  #[test]
  fn put_assigns_ids_and_get_reads_back() {
    let store = store();
    let id = store.put(Table::Transactions, &tx("2024-01-05", "Dairy", "Feed")).unwrap();
    let entity = store.get(Table::Transactions, id).unwrap().unwrap();
    assert_eq!(entity.id, Some(id));
    assert_eq!(entity.data["enterprise"], "Dairy");
    assert_eq!(entity.sync_status, SyncStatus::Pending);
    assert!(store.get(Table::Transactions, id + 100).unwrap().is_none());
  }

  #[test]
  fn put_with_existing_id_replaces_payload() {
    let store = store();
    let id = store.put(Table::Transactions, &tx("2024-01-05", "Dairy", "Feed")).unwrap();
    let mut updated = tx("2024-01-06", "Poultry", "Layers mash");
    updated.id = Some(id);
    assert_eq!(store.put(Table::Transactions, &updated).unwrap(), id);

    let entity = store.get(Table::Transactions, id).unwrap().unwrap();
    assert_eq!(entity.data["enterprise"], "Poultry");
    assert_eq!(store.count(Table::Transactions).unwrap(), 1);
  }

  #[test]
  fn rejects_non_object_payloads() {
    let err = store().put(Table::Enterprises, &Entity::new(json!(["Dairy"]))).unwrap_err();
    assert_eq!(err.code(), "INVALID_ENTITY");
  }

  #[test]
  fn query_filters_and_orders_by_date_descending() {
    let store = store();
    store.put(Table::Transactions, &tx("2024-01-05", "Dairy", "Feed")).unwrap();
    store.put(Table::Transactions, &tx("2024-03-01", "Dairy", "Vet call-out")).unwrap();
    store.put(Table::Transactions, &tx("2024-02-10", "Poultry", "Feed")).unwrap();

    let dairy = store
      .query(Table::Transactions, &Query::new().field_eq("enterprise", "Dairy"))
      .unwrap();
    let dates: Vec<_> = dairy.iter().map(|e| e.data["date"].as_str().unwrap().to_string()).collect();
    assert_eq!(dates, vec!["2024-03-01", "2024-01-05"]);

    let february = store
      .query(Table::Transactions, &Query::new().date_from("2024-02-01").date_to("2024-02-29"))
      .unwrap();
    assert_eq!(february.len(), 1);
    assert_eq!(february[0].data["enterprise"], "Poultry");

    let vet = store.query(Table::Transactions, &Query::new().containing("VET")).unwrap();
    assert_eq!(vet.len(), 1);

    let limited = store.query(Table::Transactions, &Query::new().limit(2)).unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].data["date"], "2024-03-01");
  }

  #[test]
  fn query_matches_numbers_and_rejects_bad_fields() {
    let store = store();
    store.put(Table::Transactions, &tx("2024-01-05", "Dairy", "Feed")).unwrap();
    let hits = store
      .query(Table::Transactions, &Query::new().field_eq("amount", 120.5))
      .unwrap();
    assert_eq!(hits.len(), 1);

    let err = store
      .query(Table::Transactions, &Query::new().field_eq("amount') OR 1=1 --", 1))
      .unwrap_err();
    assert_eq!(err.code(), "INVALID_FIELD");
  }

  #[test]
  fn search_treats_wildcards_literally() {
    let store = store();
    store.put(Table::Transactions, &tx("2024-01-05", "Dairy", "Feed")).unwrap();
    assert!(store.query(Table::Transactions, &Query::new().containing("%")).unwrap().is_empty());
  }

  #[test]
  fn delete_missing_entity_is_not_found() {
    let store = store();
    let id = store.put(Table::Enterprises, &Entity::new(json!({ "name": "Dairy" }))).unwrap();
    store.delete(Table::Enterprises, id).unwrap();
    let err = store.delete(Table::Enterprises, id).unwrap_err();
    assert!(err.is_not_found());
  }
}
