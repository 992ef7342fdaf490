//! Reachability tracking and the timers that trigger drains.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::AppError;
use crate::models::SyncEvent;
use crate::sync::engine::{DrainOutcome, SyncEngine};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct ConnectivityMonitor {
  engine: Arc<SyncEngine>,
}

impl ConnectivityMonitor {
  pub fn new(engine: Arc<SyncEngine>) -> Self {
    ConnectivityMonitor { engine }
  }

  pub fn is_online(&self) -> bool {
    self.engine.is_online()
  }

  /// Applies a reachability signal. Going online drains right away; going offline only
  /// flips the flag. Repeated signals with the same value do nothing.
  pub async fn set_online(&self, online: bool) -> Result<Option<DrainOutcome>, AppError> {
    let was_online = self.engine.set_online(online);
    match (was_online, online) {
      (false, true) => {
        info!("connectivity restored, draining queue");
        self.engine.drain().await.map(Some)
      }
      (true, false) => {
        info!("connectivity lost");
        self.engine.emit(SyncEvent::Offline);
        Ok(None)
      }
      _ => Ok(None),
    }
  }

  /// One periodic retry, independent of reachability events.
  pub async fn tick(&self) -> Result<DrainOutcome, AppError> {
    self.engine.drain().await
  }

  /// Follows a host-provided online/offline signal until its sender is dropped.
  pub async fn watch(self: Arc<Self>, mut signal: watch::Receiver<bool>) {
    loop {
      let online = *signal.borrow_and_update();
      if let Err(err) = self.set_online(online).await {
        error!("drain after connectivity change failed: {err}");
      }
      if signal.changed().await.is_err() {
        debug!("connectivity signal closed");
        break;
      }
    }
  }

  pub fn spawn_periodic(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
    let monitor = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      // The first tick completes immediately; startup drains come from the reachability signal.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if let Err(err) = monitor.tick().await {
          error!("periodic drain failed: {err}");
        }
      }
    })
  }

  /// Polls the remote's ping route and feeds the result into [`ConnectivityMonitor::set_online`].
  pub fn spawn_reachability_probe(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
    let monitor = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        let reachable = monitor.engine.probe().await;
        if let Err(err) = monitor.set_online(reachable).await {
          error!("drain after probe failed: {err}");
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  use async_trait::async_trait;
  use serde_json::json;

  use crate::db::{self, Db};
  use crate::models::Table;
  use crate::sync::engine::SkipReason;
  use crate::sync::queue;
  use crate::sync::recorder::MutationRecorder;
  use crate::sync::remote::{RemoteEndpoint, RemoteRequest};

  #[derive(Default)]
  struct SlowRemote {
    calls: AtomicUsize,
  }

  #[async_trait]
  impl RemoteEndpoint for SlowRemote {
    async fn apply(&self, _request: &RemoteRequest) -> Result<(), AppError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(30)).await;
      Ok(())
    }
  }

  fn setup(online: bool) -> (Arc<Db>, MutationRecorder, Arc<SlowRemote>, Arc<ConnectivityMonitor>) {
    let db = Arc::new(Db::open_in_memory().unwrap());
    let recorder = MutationRecorder::new(db.clone());
    let remote = Arc::new(SlowRemote::default());
    let engine = Arc::new(SyncEngine::new(db.clone(), remote.clone(), online));
    (db, recorder, remote, Arc::new(ConnectivityMonitor::new(engine)))
  }

  #[tokio::test]
  async fn going_offline_never_drains() {
    let (db, recorder, remote, monitor) = setup(true);
    recorder.record_create(Table::Enterprises, json!({ "name": "Dairy" })).unwrap();

    assert_eq!(monitor.set_online(false).await.unwrap(), None);
    assert!(!monitor.is_online());
    assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    assert_eq!(monitor.tick().await.unwrap(), DrainOutcome::Skipped(SkipReason::Offline));
    assert_eq!(db::with_conn(&db, |conn| queue::count(conn)).unwrap(), 1);
  }

  #[tokio::test]
  async fn reconnect_and_tick_together_run_one_pass() {
    let (db, recorder, remote, monitor) = setup(false);
    recorder.record_create(Table::Enterprises, json!({ "name": "Dairy" })).unwrap();

    let (reconnect, tick) = tokio::join!(monitor.set_online(true), monitor.tick());
    assert!(matches!(reconnect.unwrap(), Some(DrainOutcome::Completed(_))));
    assert_eq!(tick.unwrap(), DrainOutcome::Skipped(SkipReason::AlreadyRunning));
    assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    assert_eq!(db::with_conn(&db, |conn| queue::count(conn)).unwrap(), 0);
  }

  #[tokio::test]
  async fn repeated_online_signal_does_not_redrain() {
    let (_db, recorder, remote, monitor) = setup(true);
    recorder.record_create(Table::Enterprises, json!({ "name": "Dairy" })).unwrap();
    assert_eq!(monitor.set_online(true).await.unwrap(), None);
    assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn periodic_timer_retries_without_connectivity_events() {
    let (db, recorder, _remote, monitor) = setup(true);
    recorder.record_create(Table::Enterprises, json!({ "name": "Dairy" })).unwrap();

    let handle = monitor.spawn_periodic(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.abort();
    assert_eq!(db::with_conn(&db, |conn| queue::count(conn)).unwrap(), 0);
  }

  #[tokio::test]
  async fn watch_channel_drives_transitions() {
    let (db, recorder, _remote, monitor) = setup(false);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    monitor.engine.subscribe(move |event| sink.lock().unwrap().push(*event)).unwrap();
    recorder.record_create(Table::Enterprises, json!({ "name": "Dairy" })).unwrap();

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(monitor.clone().watch(rx));
    tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(false).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(tx);
    task.await.unwrap();

    assert_eq!(db::with_conn(&db, |conn| queue::count(conn)).unwrap(), 0);
    assert_eq!(
      *events.lock().unwrap(),
      vec![SyncEvent::Syncing, SyncEvent::Success, SyncEvent::Offline]
    );
  }
}
