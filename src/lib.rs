pub mod commands;
pub mod db;
pub mod domain;
pub mod error;
pub mod export;
pub mod models;
pub mod reports;
pub mod settings;
pub mod store;
pub mod sync;

use std::sync::Arc;

use tokio::task::JoinHandle;

use db::Db;
use error::AppError;
use settings::SyncConfig;
use store::LocalStore;
use sync::{ConnectivityMonitor, MutationRecorder, RemoteEndpoint, SyncEngine};

/// Everything the commands need, wired once at startup and passed by reference.
pub struct AppState {
  pub store: LocalStore,
  pub recorder: Arc<MutationRecorder>,
  pub engine: Arc<SyncEngine>,
  pub monitor: Arc<ConnectivityMonitor>,
  pub config: SyncConfig,
}

impl AppState {
  pub fn new(db: Db, remote: Arc<dyn RemoteEndpoint>, config: SyncConfig, online: bool) -> Result<Self, AppError> {
    let db = Arc::new(db);
    let recorder = Arc::new(MutationRecorder::new(db.clone()).with_delete_policy(config.delete_policy));
    let engine = Arc::new(SyncEngine::new(db.clone(), remote, online).with_timeout(config.remote_timeout));
    let monitor = Arc::new(ConnectivityMonitor::new(engine.clone()));

    // Writes made while online go out without waiting for the next tick.
    let trigger = engine.clone();
    recorder.subscribe(move |_| {
      if trigger.is_online() {
        trigger.request_drain();
      }
    })?;

    Ok(AppState {
      store: LocalStore::new(db),
      recorder,
      engine,
      monitor,
      config,
    })
  }

  /// Spawns the drain worker and the periodic retry timer. Needs a running tokio runtime.
  pub fn start(&self) -> Vec<JoinHandle<()>> {
    vec![
      tokio::spawn(self.engine.clone().run()),
      self.monitor.spawn_periodic(self.config.sync_interval),
    ]
  }
}
