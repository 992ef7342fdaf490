use std::path::PathBuf;

use chrono::{Datelike, Duration, Local, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rusqlite::Connection;
use serde_json::json;

use farm_books::db;
use farm_books::error::AppError;
use farm_books::models::{SyncStatus, Table};
use farm_books::store::{self, Entity, Query};

const ENTERPRISES: [(&str, &str); 4] = [
  ("Dairy", "livestock"),
  ("Beef", "livestock"),
  ("Poultry", "livestock"),
  ("Arable", "crops"),
];

const INCOME: [(&str, &str); 4] = [
  ("Milk sales", "Bulk milk cheque"),
  ("Livestock sales", "Mart sale"),
  ("Crop sales", "Grain merchant"),
  ("Subsidies", "Area payment"),
];

const EXPENSE: [(&str, &str); 6] = [
  ("Feed", "Concentrate delivery"),
  ("Seed & fertilizer", "Spring fertilizer"),
  ("Veterinary", "Herd health visit"),
  ("Fuel", "Red diesel"),
  ("Repairs", "Tractor service"),
  ("Labour", "Relief milker"),
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt::init();
  let count = std::env::args()
    .nth(1)
    .and_then(|value| value.parse::<usize>().ok())
    .unwrap_or(2000);

  let app_dir = match std::env::var("FARM_BOOKS_SEED_DIR") {
    Ok(path) => PathBuf::from(path),
    Err(_) => db::resolve_app_dir()?,
  };
  let db = db::init_db(&app_dir)?;
  let created = db::with_conn(&db, |conn| seed_mock_data(conn, count))?;

  println!("Seeded {} transactions in {}", created, app_dir.display());
  Ok(())
}

// Demo rows are written as already synced so they never flood the queue.
fn seed_mock_data(conn: &mut Connection, count: usize) -> Result<usize, AppError> {
  let mut rng = StdRng::from_entropy();
  let year = Local::now().year();
  let start = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(|| AppError::new("INVALID_DATE", "bad seed year"))?;

  let tx = conn.transaction()?;
  for (name, kind) in ENTERPRISES {
    let existing = store::query(&tx, Table::Enterprises, &Query::new().field_eq("name", name).limit(1))?;
    if existing.is_empty() {
      let data = json!({ "name": name, "kind": kind, "active": true });
      store::put(&tx, Table::Enterprises, &Entity::with_status(data, SyncStatus::Synced))?;
    }
  }

  for _ in 0..count {
    let date = start + Duration::days(rng.gen_range(0..365));
    let enterprise = ENTERPRISES.choose(&mut rng).map(|(name, _)| *name).unwrap_or("Dairy");
    let income = rng.gen_bool(0.4);
    let (category, description) = if income {
      INCOME.choose(&mut rng).copied().unwrap_or(INCOME[0])
    } else {
      EXPENSE.choose(&mut rng).copied().unwrap_or(EXPENSE[0])
    };
    let amount = if income {
      rng.gen_range(200.0..8000.0_f64)
    } else {
      rng.gen_range(20.0..2500.0_f64)
    };

    let data = json!({
      "date": date.format("%Y-%m-%d").to_string(),
      "type": if income { "income" } else { "expense" },
      "amount": (amount * 100.0).round() / 100.0,
      "enterprise": enterprise,
      "category": category,
      "description": description,
    });
    store::put(&tx, Table::Transactions, &Entity::with_status(data, SyncStatus::Synced))?;
  }
  tx.commit()?;

  Ok(count)
}
