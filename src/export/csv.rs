use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use rusqlite::Connection;

use crate::error::AppError;
use crate::models::{Table, Transaction};
use crate::store::{self, Query};

const HEADER: &str = "id,date,type,amount,enterprise,category,description,payment_method,notes,sync_status";

pub fn export_transactions_csv(conn: &Connection, from: &str, to: &str, path: &Path) -> Result<usize, AppError> {
  let mut file = BufWriter::new(File::create(path)?);
  let written = write_transactions_csv(conn, from, to, &mut file)?;
  file.flush()?;
  Ok(written)
}

/// Writes the transactions booked between `from` and `to` (inclusive), newest first.
pub fn write_transactions_csv(conn: &Connection, from: &str, to: &str, out: &mut impl Write) -> Result<usize, AppError> {
  writeln!(out, "{HEADER}")?;

  let mut written = 0;
  let query = Query::new().date_from(from).date_to(to);
  store::for_each(conn, Table::Transactions, &query, |entity| {
    let tx: Transaction = entity.decode()?;
    writeln!(
      out,
      "{},{},{},{},{},{},{},{},{},{}",
      entity.id.unwrap_or_default(),
      escape_csv(&tx.date),
      tx.kind.as_str(),
      tx.amount,
      escape_csv(&tx.enterprise),
      escape_csv(tx.category.as_deref().unwrap_or("")),
      escape_csv(tx.description.as_deref().unwrap_or("")),
      escape_csv(tx.payment_method.as_deref().unwrap_or("")),
      escape_csv(tx.notes.as_deref().unwrap_or("")),
      entity.sync_status.as_str()
    )?;
    written += 1;
    Ok(())
  })?;

  Ok(written)
}

fn escape_csv(value: &str) -> String {
  if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
    format!("\"{}\"", value.replace('"', "\"\""))
  } else {
    value.to_string()
  }
}
