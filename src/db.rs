use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::json;

use crate::error::AppError;
use crate::models::{SyncStatus, Table};
use crate::store::{self, Entity};

const DB_FILE: &str = "farm_books.sqlite";

pub struct Db {
  pub conn: Mutex<Connection>,
  pub db_path: PathBuf,
}

impl Db {
  /// Fresh database that lives only as long as the process. Used by tests and dry runs.
  pub fn open_in_memory() -> Result<Db, AppError> {
    let mut conn = Connection::open_in_memory()?;
    prepare(&mut conn)?;
    Ok(Db {
      conn: Mutex::new(conn),
      db_path: PathBuf::from(":memory:"),
    })
  }
}

pub fn resolve_app_dir() -> Result<PathBuf, AppError> {
  if let Ok(dir) = std::env::var("FARM_BOOKS_DATA_DIR") {
    if !dir.trim().is_empty() {
      return Ok(PathBuf::from(dir));
    }
  }
  if let Some(portable) = resolve_portable_dir()? {
    return Ok(portable);
  }

  let base = dirs_next::data_local_dir()
    .ok_or_else(|| AppError::storage("PATH", "local data directory not found"))?;
  Ok(base.join("FarmBooks"))
}

pub fn init_db(app_dir: &Path) -> Result<Db, AppError> {
  fs::create_dir_all(app_dir)?;
  let db_path = app_dir.join(DB_FILE);
  let mut conn = Connection::open(&db_path)?;
  conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
  conn.busy_timeout(Duration::from_secs(5))?;
  prepare(&mut conn)?;

  Ok(Db {
    conn: Mutex::new(conn),
    db_path,
  })
}

pub fn with_conn<T>(db: &Db, f: impl FnOnce(&mut Connection) -> Result<T, AppError>) -> Result<T, AppError> {
  let mut guard = db.conn.lock()?;
  f(&mut guard)
}

fn prepare(conn: &mut Connection) -> Result<(), AppError> {
  run_migrations(conn)?;
  seed_default_categories(conn)?;
  Ok(())
}

fn run_migrations(conn: &mut Connection) -> Result<(), AppError> {
  conn.execute_batch(
    "CREATE TABLE IF NOT EXISTS schema_migrations (version TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
  )?;

  apply_migration(conn, "001_init", include_str!("../migrations/001_init.sql"))?;
  Ok(())
}

fn apply_migration(conn: &mut Connection, version: &str, sql: &str) -> Result<(), AppError> {
  let exists: i64 = conn.query_row(
    "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
    params![version],
    |row| row.get(0),
  )?;
  if exists > 0 {
    return Ok(());
  }

  let tx = conn.transaction()?;
  tx.execute_batch(sql)?;
  tx.execute(
    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
    params![version, Utc::now().to_rfc3339()],
  )?;
  tx.commit()?;
  Ok(())
}

// Defaults ship with every install, so they start out synced and never enter the queue.
fn seed_default_categories(conn: &mut Connection) -> Result<(), AppError> {
  if store::count(conn, Table::Categories)? > 0 {
    return Ok(());
  }

  let defaults = [
    ("Milk sales", "income", "Dairy and bulk milk cheques"),
    ("Livestock sales", "income", "Cattle, sheep, pigs sold"),
    ("Crop sales", "income", "Grain, hay, produce"),
    ("Subsidies", "income", "Grants and support payments"),
    ("Feed", "expense", "Purchased feed and concentrates"),
    ("Seed & fertilizer", "expense", "Seed, fertilizer, lime"),
    ("Veterinary", "expense", "Vet visits and medicine"),
    ("Fuel", "expense", "Diesel and petrol"),
    ("Repairs", "expense", "Machinery and building repairs"),
    ("Labour", "expense", "Wages and contractors"),
  ];

  let tx = conn.transaction()?;
  for (name, kind, description) in defaults {
    let entity = Entity::with_status(json!({ "name": name, "type": kind, "description": description }), SyncStatus::Synced);
    store::put(&tx, Table::Categories, &entity)?;
  }
  tx.commit()?;
  Ok(())
}

fn resolve_portable_dir() -> Result<Option<PathBuf>, AppError> {
  let env_enabled = std::env::var("FARM_BOOKS_PORTABLE")
    .ok()
    .map(|value| {
      let value = value.to_ascii_lowercase();
      value == "1" || value == "true" || value == "yes"
    })
    .unwrap_or(false);

  let exe_dir = std::env::current_exe()
    .ok()
    .and_then(|path| path.parent().map(|parent| parent.to_path_buf()));

  if let Some(exe_dir) = exe_dir {
    let flag = exe_dir.join("portable.flag");
    let data_dir = exe_dir.join("data");
    if env_enabled || flag.exists() {
      fs::create_dir_all(&data_dir)?;
      return Ok(Some(data_dir));
    }
  }

  Ok(None)
}
