//! Write path for syncable tables: each entity write and its queue entry commit together.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::db::{self, Db};
use crate::error::AppError;
use crate::models::{Action, ChangeEvent, SyncStatus, Table};
use crate::store::{self, Entity};
use crate::sync::queue;

pub type ChangeObserver = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// What to queue when a record that the remote has never seen gets deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
  /// Queue the delete after the pending create; the remote receives both in order.
  #[default]
  Replay,
  /// Drop every queued entry of the record and queue nothing; the remote never hears of it.
  CollapseUnsynced,
}

pub struct MutationRecorder {
  db: Arc<Db>,
  policy: DeletePolicy,
  observers: Mutex<Vec<ChangeObserver>>,
}

impl MutationRecorder {
  pub fn new(db: Arc<Db>) -> Self {
    MutationRecorder {
      db,
      policy: DeletePolicy::default(),
      observers: Mutex::new(Vec::new()),
    }
  }

  pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn delete_policy(&self) -> DeletePolicy {
    self.policy
  }

  pub fn subscribe(&self, observer: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Result<(), AppError> {
    self.observers.lock()?.push(Arc::new(observer));
    Ok(())
  }

  pub fn record_create(&self, table: Table, data: Value) -> Result<i64, AppError> {
    let id = db::with_conn(&self.db, |conn| {
      let tx = conn.transaction()?;
      let id = store::put(&tx, table, &Entity::new(data.clone()))?;
      queue::append(&tx, table, id, Action::Create, &data)?;
      tx.commit()?;
      Ok(id)
    })?;

    debug!(%table, id, "recorded create");
    self.notify(ChangeEvent {
      table,
      action: Action::Create,
      id,
    });
    Ok(id)
  }

  /// Shallow-merges `patch` into the stored payload. A `null` value removes the field.
  pub fn record_update(&self, table: Table, id: i64, patch: Value) -> Result<(), AppError> {
    let Value::Object(patch) = patch else {
      return Err(AppError::new("INVALID_ENTITY", "patch must be a JSON object"));
    };

    db::with_conn(&self.db, |conn| {
      let tx = conn.transaction()?;
      let existing = store::get(&tx, table, id)?.ok_or_else(|| AppError::not_found(table.as_str(), id))?;
      let merged = merge(existing.data, patch);
      let entity = Entity {
        id: Some(id),
        data: merged.clone(),
        sync_status: SyncStatus::Pending,
        updated_at: None,
      };
      store::put(&tx, table, &entity)?;
      queue::append(&tx, table, id, Action::Update, &merged)?;
      tx.commit()?;
      Ok(())
    })?;

    debug!(%table, id, "recorded update");
    self.notify(ChangeEvent {
      table,
      action: Action::Update,
      id,
    });
    Ok(())
  }

  pub fn record_delete(&self, table: Table, id: i64) -> Result<(), AppError> {
    let policy = self.policy;
    let collapsed = db::with_conn(&self.db, |conn| {
      let tx = conn.transaction()?;
      let existing = store::get(&tx, table, id)?.ok_or_else(|| AppError::not_found(table.as_str(), id))?;
      store::delete(&tx, table, id)?;

      let never_synced = queue::entries_for_record(&tx, table, id)?
        .iter()
        .any(|entry| entry.action == Action::Create);
      let collapsed = if policy == DeletePolicy::CollapseUnsynced && never_synced {
        queue::remove_for_record(&tx, table, id)?;
        true
      } else {
        queue::append(&tx, table, id, Action::Delete, &existing.data)?;
        false
      };
      tx.commit()?;
      Ok(collapsed)
    })?;

    if collapsed {
      debug!(%table, id, "delete of unsynced record collapsed its queued entries");
    } else {
      debug!(%table, id, "recorded delete");
    }
    self.notify(ChangeEvent {
      table,
      action: Action::Delete,
      id,
    });
    Ok(())
  }

  fn notify(&self, event: ChangeEvent) {
    let observers = match self.observers.lock() {
      Ok(observers) => observers.clone(),
      Err(_) => {
        warn!("change observers unavailable, skipping notification");
        return;
      }
    };
    for observer in observers {
      observer(&event);
    }
  }
}

fn merge(current: Value, patch: Map<String, Value>) -> Value {
  let mut fields = match current {
    Value::Object(fields) => fields,
    _ => Map::new(),
  };
  for (key, value) in patch {
    if value.is_null() {
      fields.remove(&key);
    } else {
      fields.insert(key, value);
    }
  }
  Value::Object(fields)
}
