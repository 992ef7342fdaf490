//! Drains the mutation queue against the remote endpoint.
//!
//! At most one drain runs at a time. Triggers that arrive while a pass is in flight are
//! no-ops; whatever is left over gets picked up by the next reconnect, tick or manual request.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::db::{self, Db};
use crate::error::AppError;
use crate::models::{Action, QueueEntry, SyncEvent, SyncStatus, SyncStatusView, Table};
use crate::store;
use crate::sync::queue;
use crate::sync::remote::{RemoteEndpoint, RemoteRequest};

pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

pub type StatusObserver = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Process-wide sync flags. Not persisted.
#[derive(Debug, Default)]
pub struct SyncState {
  online: AtomicBool,
  in_progress: AtomicBool,
}

impl SyncState {
  pub fn new(online: bool) -> Self {
    SyncState {
      online: AtomicBool::new(online),
      in_progress: AtomicBool::new(false),
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::Acquire)
  }

  pub fn is_in_progress(&self) -> bool {
    self.in_progress.load(Ordering::Acquire)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  Offline,
  AlreadyRunning,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub applied: usize,
  pub failed: usize,
  /// Entries left untouched because an earlier entry of the same record failed in this pass.
  pub deferred: usize,
  pub remaining: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  Completed(DrainReport),
  Skipped(SkipReason),
}

impl DrainOutcome {
  pub fn report(&self) -> Option<&DrainReport> {
    match self {
      DrainOutcome::Completed(report) => Some(report),
      DrainOutcome::Skipped(_) => None,
    }
  }
}

pub struct SyncEngine {
  db: Arc<Db>,
  remote: Arc<dyn RemoteEndpoint>,
  state: SyncState,
  timeout: Duration,
  observers: Mutex<Vec<StatusObserver>>,
  wake: Notify,
}

struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl SyncEngine {
  pub fn new(db: Arc<Db>, remote: Arc<dyn RemoteEndpoint>, online: bool) -> Self {
    SyncEngine {
      db,
      remote,
      state: SyncState::new(online),
      timeout: DEFAULT_REMOTE_TIMEOUT,
      observers: Mutex::new(Vec::new()),
      wake: Notify::new(),
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn state(&self) -> &SyncState {
    &self.state
  }

  pub fn is_online(&self) -> bool {
    self.state.is_online()
  }

  /// Returns the previous value.
  pub(crate) fn set_online(&self, online: bool) -> bool {
    self.state.online.swap(online, Ordering::AcqRel)
  }

  pub fn subscribe(&self, observer: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Result<(), AppError> {
    self.observers.lock()?.push(Arc::new(observer));
    Ok(())
  }

  pub(crate) fn emit(&self, event: SyncEvent) {
    let observers = match self.observers.lock() {
      Ok(observers) => observers.clone(),
      Err(_) => {
        warn!("status observers unavailable, dropping {:?}", event);
        return;
      }
    };
    for observer in observers {
      observer(&event);
    }
  }

  pub(crate) async fn probe(&self) -> bool {
    self.remote.probe().await
  }

  /// Wakes the background worker started with [`SyncEngine::run`].
  pub fn request_drain(&self) {
    self.wake.notify_one();
  }

  /// Background worker: one drain per wake-up.
  pub async fn run(self: Arc<Self>) {
    loop {
      self.wake.notified().await;
      if let Err(err) = self.drain().await {
        error!("drain aborted: {err}");
      }
    }
  }

  pub fn status(&self) -> Result<SyncStatusView, AppError> {
    let (pending, failed) = db::with_conn(&self.db, |conn| Ok((queue::count(conn)?, queue::failed_count(conn)?)))?;
    Ok(SyncStatusView {
      online: self.state.is_online(),
      in_progress: self.state.is_in_progress(),
      pending,
      failed,
    })
  }

  pub async fn drain(&self) -> Result<DrainOutcome, AppError> {
    if !self.state.is_online() {
      debug!("offline, drain skipped");
      return Ok(DrainOutcome::Skipped(SkipReason::Offline));
    }
    if self
      .state
      .in_progress
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("drain already in progress");
      return Ok(DrainOutcome::Skipped(SkipReason::AlreadyRunning));
    }
    let _guard = InProgressGuard(&self.state.in_progress);

    self.emit(SyncEvent::Syncing);
    match self.drain_pass().await {
      Ok(report) => {
        if report.remaining == 0 {
          self.emit(SyncEvent::Success);
        } else {
          self.emit(SyncEvent::Error {
            pending: report.remaining,
          });
        }
        Ok(DrainOutcome::Completed(report))
      }
      Err(err) => {
        let pending = db::with_conn(&self.db, |conn| queue::count(conn)).unwrap_or_default();
        self.emit(SyncEvent::Error { pending });
        Err(err)
      }
    }
  }

  async fn drain_pass(&self) -> Result<DrainReport, AppError> {
    let snapshot = db::with_conn(&self.db, |conn| queue::list(conn))?;
    if !snapshot.is_empty() {
      info!(entries = snapshot.len(), "draining sync queue");
    }

    let mut report = DrainReport::default();
    let mut blocked: HashSet<(Table, i64)> = HashSet::new();

    for entry in &snapshot {
      let record = (entry.table, entry.record_id);
      if blocked.contains(&record) {
        report.deferred += 1;
        continue;
      }

      match self.apply_with_timeout(entry).await {
        Ok(()) => {
          db::with_conn(&self.db, |conn| settle(conn, entry))?;
          report.applied += 1;
        }
        Err(err) => {
          warn!(entry = entry.id, table = %entry.table, record = entry.record_id, attempts = entry.attempts + 1, "remote apply failed: {err}");
          let message = err.to_string();
          db::with_conn(&self.db, |conn| {
            queue::record_failure(conn, entry.id, &message)?;
            store::set_sync_status(conn, entry.table, entry.record_id, SyncStatus::Failed)?;
            Ok(())
          })?;
          report.failed += 1;
          blocked.insert(record);
        }
      }
    }

    report.remaining = db::with_conn(&self.db, |conn| queue::count(conn))?;
    info!(
      applied = report.applied,
      failed = report.failed,
      deferred = report.deferred,
      remaining = report.remaining,
      "drain finished"
    );
    Ok(report)
  }

  async fn apply_with_timeout(&self, entry: &QueueEntry) -> Result<(), AppError> {
    let request = RemoteRequest::from(entry);
    match tokio::time::timeout(self.timeout, self.remote.apply(&request)).await {
      Ok(result) => result,
      Err(_) => Err(AppError::RemoteApply(format!("timed out after {:?}", self.timeout))),
    }
  }
}

/// Clears an applied entry and marks the entity synced once nothing else is queued for it.
fn settle(conn: &mut rusqlite::Connection, entry: &QueueEntry) -> Result<(), AppError> {
  let tx = conn.transaction()?;
  match queue::remove(&tx, entry.id) {
    Ok(()) => {}
    Err(err) if err.is_not_found() => {
      // The record was deleted and its entries collapsed while this one was in flight.
      // The remote already holds it, so it needs the delete after all.
      if entry.action != Action::Delete && store::get(&tx, entry.table, entry.record_id)?.is_none() {
        queue::append(&tx, entry.table, entry.record_id, Action::Delete, &entry.payload)?;
      }
    }
    Err(err) => return Err(err),
  }

  if entry.action != Action::Delete && queue::entries_for_record(&tx, entry.table, entry.record_id)?.is_empty() {
    store::set_sync_status(&tx, entry.table, entry.record_id, SyncStatus::Synced)?;
  }
  tx.commit()?;
  Ok(())
}
