use rusqlite::{params, Connection};

use crate::db;
use crate::error::AppError;
use crate::models::{CategorySplit, Dashboard, EnterpriseSplit, Kpis, MonthSeriesPoint, TxKind};
use crate::AppState;

pub fn year_bounds(year: i32) -> (String, String) {
  (format!("{year:04}-01-01"), format!("{year:04}-12-31"))
}

pub fn get_kpis(conn: &Connection, from: &str, to: &str) -> Result<Kpis, AppError> {
  let (income_total, expense_total, transaction_count) = conn.query_row(
    "SELECT
        COALESCE(SUM(CASE WHEN json_extract(data, '$.type') = 'income' THEN json_extract(data, '$.amount') END), 0),
        COALESCE(SUM(CASE WHEN json_extract(data, '$.type') = 'expense' THEN json_extract(data, '$.amount') END), 0),
        COUNT(*)
     FROM transactions WHERE date BETWEEN ?1 AND ?2",
    params![from, to],
    |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?, row.get::<_, i64>(2)?)),
  )?;

  let result = income_total - expense_total;
  let margin = if income_total > 0.0 {
    result / income_total * 100.0
  } else {
    0.0
  };

  Ok(Kpis {
    income_total,
    expense_total,
    result,
    margin,
    transaction_count,
  })
}

pub fn get_enterprise_split(conn: &Connection, from: &str, to: &str) -> Result<Vec<EnterpriseSplit>, AppError> {
  let mut stmt = conn.prepare(
    "SELECT json_extract(data, '$.enterprise') AS enterprise,
        COALESCE(SUM(CASE WHEN json_extract(data, '$.type') = 'income' THEN json_extract(data, '$.amount') END), 0),
        COALESCE(SUM(CASE WHEN json_extract(data, '$.type') = 'expense' THEN json_extract(data, '$.amount') END), 0)
     FROM transactions
     WHERE date BETWEEN ?1 AND ?2
     GROUP BY enterprise
     ORDER BY enterprise",
  )?;
  let rows = stmt.query_map(params![from, to], |row| {
    let income: f64 = row.get(1)?;
    let expense: f64 = row.get(2)?;
    Ok(EnterpriseSplit {
      enterprise: row.get::<_, Option<String>>(0)?.unwrap_or_else(|| "-".to_string()),
      income,
      expense,
      result: income - expense,
    })
  })?;

  let mut data = Vec::new();
  for row in rows {
    data.push(row?);
  }
  Ok(data)
}

/// Totals per category and direction, largest first. Uncategorized rows are grouped as "Uncategorized".
pub fn get_category_split(
  conn: &Connection,
  from: &str,
  to: &str,
  limit: Option<i64>,
) -> Result<Vec<CategorySplit>, AppError> {
  let mut stmt = conn.prepare(
    "SELECT COALESCE(json_extract(data, '$.category'), 'Uncategorized') AS category,
        json_extract(data, '$.type') AS kind,
        COALESCE(SUM(json_extract(data, '$.amount')), 0) AS total
     FROM transactions
     WHERE date BETWEEN ?1 AND ?2
     GROUP BY category, kind
     ORDER BY total DESC, category
     LIMIT ?3",
  )?;
  let rows = stmt.query_map(params![from, to, limit.unwrap_or(-1)], |row| {
    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
  })?;

  let mut data = Vec::new();
  for row in rows {
    let (category, kind, amount) = row?;
    data.push(CategorySplit {
      category,
      kind: kind.parse::<TxKind>()?,
      amount,
    });
  }
  Ok(data)
}

/// Twelve points, one per month, zero-filled where nothing was booked.
pub fn get_month_series(conn: &Connection, year: i32) -> Result<Vec<MonthSeriesPoint>, AppError> {
  let (from, to) = year_bounds(year);
  let mut stmt = conn.prepare(
    "SELECT CAST(substr(date, 6, 2) AS INTEGER) AS month,
        COALESCE(SUM(CASE WHEN json_extract(data, '$.type') = 'income' THEN json_extract(data, '$.amount') END), 0),
        COALESCE(SUM(CASE WHEN json_extract(data, '$.type') = 'expense' THEN json_extract(data, '$.amount') END), 0)
     FROM transactions
     WHERE date BETWEEN ?1 AND ?2
     GROUP BY month
     ORDER BY month",
  )?;
  let rows = stmt.query_map(params![from, to], |row| {
    Ok((row.get::<_, u32>(0)?, row.get::<_, f64>(1)?, row.get::<_, f64>(2)?))
  })?;

  let mut series: Vec<MonthSeriesPoint> = (1..=12)
    .map(|month| MonthSeriesPoint {
      month,
      income: 0.0,
      expense: 0.0,
      result: 0.0,
    })
    .collect();
  for row in rows {
    let (month, income, expense) = row?;
    // Malformed dates cast to month 0.
    if month == 0 {
      continue;
    }
    if let Some(point) = series.get_mut((month - 1) as usize) {
      point.income = income;
      point.expense = expense;
      point.result = income - expense;
    }
  }
  Ok(series)
}

pub fn dashboard(state: &AppState, year: i32) -> Result<Dashboard, AppError> {
  let (from, to) = year_bounds(year);
  let (kpis, enterprises, categories, monthly) = db::with_conn(state.store.db(), |conn| {
    Ok((
      get_kpis(conn, &from, &to)?,
      get_enterprise_split(conn, &from, &to)?,
      get_category_split(conn, &from, &to, Some(8))?,
      get_month_series(conn, year)?,
    ))
  })?;
  // Separate lock scope: status() takes the connection itself.
  let sync = state.engine.status()?;

  Ok(Dashboard {
    year,
    kpis,
    enterprises,
    categories,
    monthly,
    sync,
  })
}
