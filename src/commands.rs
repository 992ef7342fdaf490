use serde::Serialize;
use serde_json::{json, Value};

use crate::db;
use crate::domain::validation;
use crate::error::AppError;
use crate::models::*;
use crate::store::{self, Query};
use crate::sync::{queue, DrainOutcome};
use crate::AppState;

pub fn get_setting(state: &AppState, key: &str) -> Result<Option<String>, AppError> {
  Ok(find_setting(state, key)?.map(|record| record.item.value))
}

pub fn list_settings(state: &AppState) -> Result<Vec<Record<SettingRecord>>, AppError> {
  decode_all(state.store.query(Table::Settings, &Query::new())?)
}

pub fn set_setting(state: &AppState, key: &str, value: &str) -> Result<Record<SettingRecord>, AppError> {
  validation::ensure_name("Setting key", key)?;
  let id = match find_setting(state, key)? {
    Some(existing) if existing.item.value == value => return Ok(existing),
    Some(existing) => {
      state
        .recorder
        .record_update(Table::Settings, existing.id, json!({ "value": value }))?;
      existing.id
    }
    None => {
      let record = SettingRecord {
        key: key.to_string(),
        value: value.to_string(),
      };
      state.recorder.record_create(Table::Settings, serde_json::to_value(&record)?)?
    }
  };
  fetch(state, Table::Settings, id)
}

pub fn list_enterprises(state: &AppState) -> Result<Vec<Record<Enterprise>>, AppError> {
  let mut items: Vec<Record<Enterprise>> = decode_all(state.store.query(Table::Enterprises, &Query::new())?)?;
  items.sort_by(|a, b| a.item.name.to_lowercase().cmp(&b.item.name.to_lowercase()));
  Ok(items)
}

pub fn create_enterprise(state: &AppState, input: Enterprise) -> Result<Record<Enterprise>, AppError> {
  validation::ensure_name("Enterprise name", &input.name)?;
  let input = Enterprise {
    name: input.name.trim().to_string(),
    ..input
  };
  if find_enterprise(state, &input.name)?.is_some() {
    return Err(AppError::new(
      "DUPLICATE_ENTERPRISE",
      format!("Enterprise '{}' already exists", input.name),
    ));
  }
  let id = state
    .recorder
    .record_create(Table::Enterprises, serde_json::to_value(&input)?)?;
  fetch(state, Table::Enterprises, id)
}

pub fn update_enterprise(state: &AppState, id: i64, patch: EnterprisePatch) -> Result<Record<Enterprise>, AppError> {
  let current: Record<Enterprise> = fetch(state, Table::Enterprises, id)?;
  let mut updated = current.item.clone();
  if let Some(name) = patch.name {
    validation::ensure_name("Enterprise name", &name)?;
    let name = name.trim().to_string();
    if name != current.item.name {
      if find_enterprise(state, &name)?.is_some() {
        return Err(AppError::new("DUPLICATE_ENTERPRISE", format!("Enterprise '{name}' already exists")));
      }
      if count_transactions_for(state, &current.item.name)? > 0 {
        return Err(AppError::new(
          "ENTERPRISE_IN_USE",
          "Enterprise has transactions and cannot be renamed",
        ));
      }
    }
    updated.name = name;
  }
  if patch.kind.is_some() {
    updated.kind = clean(patch.kind);
  }
  if patch.description.is_some() {
    updated.description = clean(patch.description);
  }
  if let Some(active) = patch.active {
    updated.active = active;
  }

  let body = patch_body(&updated, &["kind", "description"])?;
  state.recorder.record_update(Table::Enterprises, id, body)?;
  fetch(state, Table::Enterprises, id)
}

pub fn delete_enterprise(state: &AppState, id: i64) -> Result<(), AppError> {
  let current: Record<Enterprise> = fetch(state, Table::Enterprises, id)?;
  if count_transactions_for(state, &current.item.name)? > 0 {
    return Err(AppError::new(
      "ENTERPRISE_IN_USE",
      "Enterprise has transactions; deactivate it instead",
    ));
  }
  state.recorder.record_delete(Table::Enterprises, id)
}

pub fn list_categories(state: &AppState, kind: Option<TxKind>) -> Result<Vec<Record<Category>>, AppError> {
  let mut query = Query::new();
  if let Some(kind) = kind {
    query = query.field_eq("type", kind.as_str());
  }
  let mut items: Vec<Record<Category>> = decode_all(state.store.query(Table::Categories, &query)?)?;
  items.sort_by(|a, b| a.item.name.cmp(&b.item.name));
  Ok(items)
}

pub fn create_category(state: &AppState, input: Category) -> Result<Record<Category>, AppError> {
  validation::ensure_name("Category name", &input.name)?;
  let input = Category {
    name: input.name.trim().to_string(),
    ..input
  };
  let existing = state
    .store
    .query(Table::Categories, &Query::new().field_eq("name", input.name.as_str()).limit(1))?;
  if !existing.is_empty() {
    return Err(AppError::new(
      "DUPLICATE_CATEGORY",
      format!("Category '{}' already exists", input.name),
    ));
  }
  let id = state
    .recorder
    .record_create(Table::Categories, serde_json::to_value(&input)?)?;
  fetch(state, Table::Categories, id)
}

pub fn delete_category(state: &AppState, id: i64) -> Result<(), AppError> {
  let current: Record<Category> = fetch(state, Table::Categories, id)?;
  let in_use = state.store.query(
    Table::Transactions,
    &Query::new().field_eq("category", current.item.name.as_str()).limit(1),
  )?;
  if !in_use.is_empty() {
    return Err(AppError::new(
      "CATEGORY_IN_USE",
      format!("Category '{}' is used by transactions", current.item.name),
    ));
  }
  state.recorder.record_delete(Table::Categories, id)
}

pub fn create_transaction(state: &AppState, input: Transaction) -> Result<Record<Transaction>, AppError> {
  let input = normalize_transaction(input);
  validate_transaction(state, &input)?;
  let id = state
    .recorder
    .record_create(Table::Transactions, serde_json::to_value(&input)?)?;
  fetch(state, Table::Transactions, id)
}

pub fn update_transaction(state: &AppState, id: i64, patch: TransactionPatch) -> Result<Record<Transaction>, AppError> {
  let current: Record<Transaction> = fetch(state, Table::Transactions, id)?;
  let mut updated = current.item;
  if let Some(date) = patch.date {
    updated.date = date;
  }
  if let Some(kind) = patch.kind {
    updated.kind = kind;
  }
  if let Some(amount) = patch.amount {
    updated.amount = amount;
  }
  if let Some(enterprise) = patch.enterprise {
    updated.enterprise = enterprise;
  }
  if patch.category.is_some() {
    updated.category = patch.category;
  }
  if patch.description.is_some() {
    updated.description = patch.description;
  }
  if patch.payment_method.is_some() {
    updated.payment_method = patch.payment_method;
  }
  if patch.notes.is_some() {
    updated.notes = patch.notes;
  }

  let updated = normalize_transaction(updated);
  validate_transaction(state, &updated)?;
  let body = patch_body(&updated, &["category", "description", "paymentMethod", "notes"])?;
  state.recorder.record_update(Table::Transactions, id, body)?;
  fetch(state, Table::Transactions, id)
}

pub fn delete_transaction(state: &AppState, id: i64) -> Result<(), AppError> {
  state.recorder.record_delete(Table::Transactions, id)
}

pub fn get_transaction(state: &AppState, id: i64) -> Result<Record<Transaction>, AppError> {
  fetch(state, Table::Transactions, id)
}

pub fn list_transactions(state: &AppState, filter: &TransactionFilter) -> Result<Vec<Record<Transaction>>, AppError> {
  validation::ensure_date_range(filter.date_from.as_deref(), filter.date_to.as_deref())?;
  decode_all(state.store.query(Table::Transactions, &transaction_query(filter))?)
}

pub fn get_sync_status(state: &AppState) -> Result<SyncStatusView, AppError> {
  state.engine.status()
}

pub fn list_pending(state: &AppState) -> Result<Vec<QueueEntry>, AppError> {
  db::with_conn(state.store.db(), |conn| queue::list(conn))
}

/// Manual trigger. Shares the engine's single-drain guard with the other triggers.
pub async fn sync_now(state: &AppState) -> Result<DrainOutcome, AppError> {
  state.engine.drain().await
}

pub(crate) fn transaction_query(filter: &TransactionFilter) -> Query {
  let mut query = Query::new();
  if let Some(enterprise) = &filter.enterprise {
    query = query.field_eq("enterprise", enterprise.as_str());
  }
  if let Some(kind) = filter.kind {
    query = query.field_eq("type", kind.as_str());
  }
  if let Some(category) = &filter.category {
    query = query.field_eq("category", category.as_str());
  }
  if let Some(from) = &filter.date_from {
    query = query.date_from(from.as_str());
  }
  if let Some(to) = &filter.date_to {
    query = query.date_to(to.as_str());
  }
  if let Some(search) = &filter.search {
    query = query.containing(search.as_str());
  }
  if let Some(limit) = filter.limit {
    query = query.limit(limit);
  }
  query
}

/// Blank strings clear an optional field.
fn clean(value: Option<String>) -> Option<String> {
  value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// Cleared optionals are skipped by serde; send them as null so the merge drops the stored value.
fn patch_body<T: Serialize>(item: &T, optional: &[&str]) -> Result<Value, AppError> {
  let mut body = serde_json::to_value(item)?;
  if let Value::Object(fields) = &mut body {
    for key in optional {
      fields.entry(*key).or_insert(Value::Null);
    }
  }
  Ok(body)
}

fn normalize_transaction(tx: Transaction) -> Transaction {
  Transaction {
    date: tx.date.trim().to_string(),
    enterprise: tx.enterprise.trim().to_string(),
    category: clean(tx.category),
    description: clean(tx.description),
    payment_method: clean(tx.payment_method),
    notes: clean(tx.notes),
    ..tx
  }
}

fn validate_transaction(state: &AppState, tx: &Transaction) -> Result<(), AppError> {
  validation::parse_date(&tx.date)?;
  validation::ensure_amount_positive(tx.amount)?;
  validation::ensure_name("Enterprise", &tx.enterprise)?;
  if find_enterprise(state, &tx.enterprise)?.is_none() {
    return Err(AppError::new(
      "UNKNOWN_ENTERPRISE",
      format!("Enterprise '{}' does not exist", tx.enterprise),
    ));
  }
  if let Some(category) = &tx.category {
    let matches = state.store.query(
      Table::Categories,
      &Query::new()
        .field_eq("name", category.as_str())
        .field_eq("type", tx.kind.as_str())
        .limit(1),
    )?;
    if matches.is_empty() {
      return Err(AppError::new(
        "UNKNOWN_CATEGORY",
        format!("No {} category named '{}'", tx.kind.as_str(), category),
      ));
    }
  }
  Ok(())
}

fn find_enterprise(state: &AppState, name: &str) -> Result<Option<Record<Enterprise>>, AppError> {
  let found = state
    .store
    .query(Table::Enterprises, &Query::new().field_eq("name", name).limit(1))?;
  found.into_iter().next().map(|entity| entity.into_record()).transpose()
}

fn find_setting(state: &AppState, key: &str) -> Result<Option<Record<SettingRecord>>, AppError> {
  let found = state
    .store
    .query(Table::Settings, &Query::new().field_eq("key", key).limit(1))?;
  found.into_iter().next().map(|entity| entity.into_record()).transpose()
}

fn count_transactions_for(state: &AppState, enterprise: &str) -> Result<usize, AppError> {
  Ok(
    state
      .store
      .query(Table::Transactions, &Query::new().field_eq("enterprise", enterprise).limit(1))?
      .len(),
  )
}

fn fetch<T: serde::de::DeserializeOwned>(state: &AppState, table: Table, id: i64) -> Result<Record<T>, AppError> {
  state
    .store
    .get(table, id)?
    .ok_or_else(|| AppError::not_found(table.as_str(), id))?
    .into_record()
}

fn decode_all<T: serde::de::DeserializeOwned>(entities: Vec<store::Entity>) -> Result<Vec<Record<T>>, AppError> {
  entities.into_iter().map(|entity| entity.into_record()).collect()
}
