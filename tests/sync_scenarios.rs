use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use farm_books::commands;
use farm_books::db::Db;
use farm_books::error::AppError;
use farm_books::models::{Action, SyncEvent, SyncStatus, Table, Transaction, TransactionPatch, TxKind};
use farm_books::settings::SyncConfig;
use farm_books::store::Entity;
use farm_books::sync::server::RemoteLedger;
use farm_books::sync::{DeletePolicy, DrainOutcome, RemoteEndpoint, RemoteRequest, SkipReason};
use farm_books::AppState;

/// In-process remote backed by the reference ledger.
#[derive(Default)]
struct LedgerRemote {
  ledger: Mutex<RemoteLedger>,
  failing: Mutex<HashSet<i64>>,
  calls: AtomicUsize,
  delay: Option<Duration>,
}

impl LedgerRemote {
  fn slow(delay: Duration) -> Self {
    LedgerRemote {
      delay: Some(delay),
      ..LedgerRemote::default()
    }
  }

  fn fail_record(&self, id: i64) {
    self.failing.lock().unwrap().insert(id);
  }

  fn recover(&self) {
    self.failing.lock().unwrap().clear();
  }

  fn applied_actions(&self) -> Vec<(i64, Action)> {
    self
      .ledger
      .lock()
      .unwrap()
      .applied()
      .iter()
      .map(|request| (request.record_id, request.action))
      .collect()
  }
}

#[async_trait]
impl RemoteEndpoint for LedgerRemote {
  async fn apply(&self, request: &RemoteRequest) -> Result<(), AppError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.failing.lock().unwrap().contains(&request.record_id) {
      return Err(AppError::RemoteApply("HTTP 503: unavailable".to_string()));
    }
    self.ledger.lock().unwrap().apply(request.clone());
    Ok(())
  }
}

fn offline_state(remote: Arc<LedgerRemote>, policy: DeletePolicy) -> AppState {
  let config = SyncConfig {
    delete_policy: policy,
    ..SyncConfig::default()
  };
  let state = AppState::new(Db::open_in_memory().unwrap(), remote, config, false).unwrap();
  // Enterprises that already exist remotely, as after a previous sync.
  for name in ["Dairy", "Poultry"] {
    state
      .store
      .put(
        Table::Enterprises,
        &Entity::with_status(json!({ "name": name, "active": true }), SyncStatus::Synced),
      )
      .unwrap();
  }
  state
}

fn income(amount: f64, enterprise: &str) -> Transaction {
  Transaction {
    date: "2024-01-05".to_string(),
    kind: TxKind::Income,
    amount,
    enterprise: enterprise.to_string(),
    category: None,
    description: None,
    payment_method: None,
    notes: None,
  }
}

fn status_of(state: &AppState, id: i64) -> SyncStatus {
  commands::get_transaction(state, id).unwrap().sync_status
}

#[tokio::test]
async fn offline_create_then_reconnect_syncs_the_entity() {
  let remote = Arc::new(LedgerRemote::default());
  let state = offline_state(remote.clone(), DeletePolicy::Replay);

  let record = commands::create_transaction(&state, income(5000.0, "Dairy")).unwrap();
  assert_eq!(record.sync_status, SyncStatus::Pending);
  assert_eq!(state.store.count(Table::Transactions).unwrap(), 1);

  let pending = commands::list_pending(&state).unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].action, Action::Create);
  assert_eq!(pending[0].table, Table::Transactions);
  assert_eq!(pending[0].record_id, record.id);

  let outcome = state.monitor.set_online(true).await.unwrap().unwrap();
  assert_eq!(outcome.report().unwrap().applied, 1);
  assert!(commands::list_pending(&state).unwrap().is_empty());
  assert_eq!(status_of(&state, record.id), SyncStatus::Synced);

  let ledger = remote.ledger.lock().unwrap();
  let stored = ledger.record(Table::Transactions, record.id).unwrap();
  assert_eq!(stored["amount"], json!(5000.0));
  assert_eq!(stored["enterprise"], "Dairy");
}

#[tokio::test]
async fn every_offline_mutation_produces_one_entry() {
  let remote = Arc::new(LedgerRemote::default());
  let state = offline_state(remote.clone(), DeletePolicy::Replay);

  let a = commands::create_transaction(&state, income(100.0, "Dairy")).unwrap();
  let b = commands::create_transaction(&state, income(200.0, "Poultry")).unwrap();
  let patch = TransactionPatch {
    amount: Some(150.0),
    ..TransactionPatch::default()
  };
  commands::update_transaction(&state, a.id, patch).unwrap();
  commands::delete_transaction(&state, b.id).unwrap();
  commands::set_setting(&state, "farm_name", "Hillside").unwrap();

  assert_eq!(commands::list_pending(&state).unwrap().len(), 5);
  assert_eq!(status_of(&state, a.id), SyncStatus::Pending);
  assert_eq!(remote.calls.load(Ordering::SeqCst), 0);

  let status = commands::get_sync_status(&state).unwrap();
  assert!(!status.online);
  assert_eq!(status.pending, 5);
  assert_eq!(status.failed, 0);
}

#[tokio::test]
async fn a_failing_entry_does_not_block_other_records() {
  let remote = Arc::new(LedgerRemote::default());
  let state = offline_state(remote.clone(), DeletePolicy::Replay);

  let first = commands::create_transaction(&state, income(1.0, "Dairy")).unwrap();
  let broken = commands::create_transaction(&state, income(2.0, "Dairy")).unwrap();
  let third = commands::create_transaction(&state, income(3.0, "Poultry")).unwrap();
  remote.fail_record(broken.id);

  let outcome = state.monitor.set_online(true).await.unwrap().unwrap();
  let report = outcome.report().unwrap();
  assert_eq!((report.applied, report.failed, report.remaining), (2, 1, 1));

  let pending = commands::list_pending(&state).unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].record_id, broken.id);
  assert_eq!(pending[0].attempts, 1);
  assert!(pending[0].last_error.as_deref().unwrap().contains("503"));
  assert_eq!(status_of(&state, first.id), SyncStatus::Synced);
  assert_eq!(status_of(&state, broken.id), SyncStatus::Failed);
  assert_eq!(status_of(&state, third.id), SyncStatus::Synced);

  remote.recover();
  let retry = state.monitor.tick().await.unwrap();
  assert_eq!(retry.report().unwrap().remaining, 0);
  assert_eq!(status_of(&state, broken.id), SyncStatus::Synced);
}

#[tokio::test]
async fn later_edits_wait_behind_a_failed_entry_of_the_same_record() {
  let remote = Arc::new(LedgerRemote::default());
  let state = offline_state(remote.clone(), DeletePolicy::Replay);

  let record = commands::create_transaction(&state, income(10.0, "Dairy")).unwrap();
  let patch = TransactionPatch {
    amount: Some(20.0),
    ..TransactionPatch::default()
  };
  commands::update_transaction(&state, record.id, patch).unwrap();
  remote.fail_record(record.id);

  let outcome = state.monitor.set_online(true).await.unwrap().unwrap();
  let report = outcome.report().unwrap();
  assert_eq!((report.failed, report.deferred, report.remaining), (1, 1, 2));
  assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn two_updates_reach_the_remote_in_order() {
  let remote = Arc::new(LedgerRemote::default());
  let state = offline_state(remote.clone(), DeletePolicy::Replay);

  let record = commands::create_transaction(&state, income(5000.0, "Dairy")).unwrap();
  for amount in [5100.0, 5200.0] {
    let patch = TransactionPatch {
      amount: Some(amount),
      ..TransactionPatch::default()
    };
    commands::update_transaction(&state, record.id, patch).unwrap();
  }

  let actions: Vec<_> = commands::list_pending(&state).unwrap().iter().map(|e| e.action).collect();
  assert_eq!(actions, vec![Action::Create, Action::Update, Action::Update]);

  state.monitor.set_online(true).await.unwrap();
  assert_eq!(
    remote.applied_actions(),
    vec![
      (record.id, Action::Create),
      (record.id, Action::Update),
      (record.id, Action::Update)
    ]
  );
  let ledger = remote.ledger.lock().unwrap();
  assert_eq!(ledger.record(Table::Transactions, record.id).unwrap()["amount"], json!(5200.0));
}

#[tokio::test]
async fn deleting_an_unsynced_record_replays_create_and_delete_by_default() {
  let remote = Arc::new(LedgerRemote::default());
  let state = offline_state(remote.clone(), DeletePolicy::Replay);

  let record = commands::create_transaction(&state, income(42.0, "Poultry")).unwrap();
  commands::delete_transaction(&state, record.id).unwrap();

  let actions: Vec<_> = commands::list_pending(&state).unwrap().iter().map(|e| e.action).collect();
  assert_eq!(actions, vec![Action::Create, Action::Delete]);

  state.monitor.set_online(true).await.unwrap();
  assert_eq!(
    remote.applied_actions(),
    vec![(record.id, Action::Create), (record.id, Action::Delete)]
  );
  assert!(remote.ledger.lock().unwrap().record(Table::Transactions, record.id).is_none());
  assert!(commands::list_pending(&state).unwrap().is_empty());
}

#[tokio::test]
async fn collapse_policy_drops_never_synced_records_entirely() {
  let remote = Arc::new(LedgerRemote::default());
  let state = offline_state(remote.clone(), DeletePolicy::CollapseUnsynced);

  let record = commands::create_transaction(&state, income(42.0, "Poultry")).unwrap();
  let patch = TransactionPatch {
    notes: Some("wrong enterprise".to_string()),
    ..TransactionPatch::default()
  };
  commands::update_transaction(&state, record.id, patch).unwrap();
  commands::delete_transaction(&state, record.id).unwrap();

  assert!(commands::list_pending(&state).unwrap().is_empty());
  state.monitor.set_online(true).await.unwrap();
  assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reconnect_and_tick_together_run_a_single_pass() {
  let remote = Arc::new(LedgerRemote::slow(Duration::from_millis(20)));
  let state = offline_state(remote.clone(), DeletePolicy::Replay);
  for amount in [1.0, 2.0, 3.0] {
    commands::create_transaction(&state, income(amount, "Dairy")).unwrap();
  }

  let events = Arc::new(Mutex::new(Vec::new()));
  let sink = events.clone();
  state.engine.subscribe(move |event| sink.lock().unwrap().push(*event)).unwrap();

  let (reconnect, tick) = tokio::join!(state.monitor.set_online(true), state.monitor.tick());
  assert!(matches!(reconnect.unwrap(), Some(DrainOutcome::Completed(_))));
  assert_eq!(tick.unwrap(), DrainOutcome::Skipped(SkipReason::AlreadyRunning));

  assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
  assert_eq!(*events.lock().unwrap(), vec![SyncEvent::Syncing, SyncEvent::Success]);
  assert!(!state.engine.state().is_in_progress());
}

#[tokio::test]
async fn going_offline_emits_offline_and_stops_drains() {
  let remote = Arc::new(LedgerRemote::default());
  let state = offline_state(remote.clone(), DeletePolicy::Replay);
  state.monitor.set_online(true).await.unwrap();

  let events = Arc::new(Mutex::new(Vec::new()));
  let sink = events.clone();
  state.engine.subscribe(move |event| sink.lock().unwrap().push(*event)).unwrap();

  assert_eq!(state.monitor.set_online(false).await.unwrap(), None);
  commands::create_transaction(&state, income(7.0, "Dairy")).unwrap();
  assert_eq!(
    commands::sync_now(&state).await.unwrap(),
    DrainOutcome::Skipped(SkipReason::Offline)
  );

  assert_eq!(*events.lock().unwrap(), vec![SyncEvent::Offline]);
  assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
  assert_eq!(commands::get_sync_status(&state).unwrap().pending, 1);
}

#[tokio::test]
async fn online_writes_wake_the_background_worker() {
  let remote = Arc::new(LedgerRemote::default());
  let state = offline_state(remote.clone(), DeletePolicy::Replay);
  state.monitor.set_online(true).await.unwrap();
  let handles = state.start();

  let record = commands::create_transaction(&state, income(900.0, "Dairy")).unwrap();
  let mut synced = false;
  for _ in 0..50 {
    if status_of(&state, record.id) == SyncStatus::Synced {
      synced = true;
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  for handle in handles {
    handle.abort();
  }

  assert!(synced);
  assert!(commands::list_pending(&state).unwrap().is_empty());
}
