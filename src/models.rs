use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
  Transactions,
  Enterprises,
  Categories,
  Settings,
}

impl Table {
  pub const ALL: [Table; 4] = [Table::Transactions, Table::Enterprises, Table::Categories, Table::Settings];

  /// SQL table name. Only these fixed names are ever spliced into statements.
  pub fn as_str(self) -> &'static str {
    match self {
      Table::Transactions => "transactions",
      Table::Enterprises => "enterprises",
      Table::Categories => "categories",
      Table::Settings => "settings",
    }
  }
}

impl fmt::Display for Table {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Table {
  type Err = AppError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    Table::ALL
      .into_iter()
      .find(|table| table.as_str() == value)
      .ok_or_else(|| AppError::new("INVALID_TABLE", format!("unknown table '{value}'")))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  Pending,
  Synced,
  Failed,
}

impl SyncStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      SyncStatus::Pending => "pending",
      SyncStatus::Synced => "synced",
      SyncStatus::Failed => "failed",
    }
  }
}

impl FromStr for SyncStatus {
  type Err = AppError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value {
      "pending" => Ok(SyncStatus::Pending),
      "synced" => Ok(SyncStatus::Synced),
      "failed" => Ok(SyncStatus::Failed),
      other => Err(AppError::storage("DB_ERROR", format!("unknown sync status '{other}'"))),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  Create,
  Update,
  Delete,
}

impl Action {
  pub fn as_str(self) -> &'static str {
    match self {
      Action::Create => "create",
      Action::Update => "update",
      Action::Delete => "delete",
    }
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Action {
  type Err = AppError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value {
      "create" => Ok(Action::Create),
      "update" => Ok(Action::Update),
      "delete" => Ok(Action::Delete),
      other => Err(AppError::new("INVALID_ACTION", format!("unknown action '{other}'"))),
    }
  }
}

/// One durable pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
  pub id: i64,
  pub table: Table,
  pub record_id: i64,
  pub action: Action,
  pub payload: serde_json::Value,
  pub idempotency_key: String,
  pub timestamp: String,
  pub attempts: i64,
  pub last_error: Option<String>,
  pub last_attempt_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
  pub table: Table,
  pub action: Action,
  pub id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SyncEvent {
  Syncing,
  Success,
  Error { pending: i64 },
  Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
  Income,
  Expense,
}

impl TxKind {
  pub fn as_str(self) -> &'static str {
    match self {
      TxKind::Income => "income",
      TxKind::Expense => "expense",
    }
  }
}

impl FromStr for TxKind {
  type Err = AppError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value.to_ascii_lowercase().as_str() {
      "income" => Ok(TxKind::Income),
      "expense" => Ok(TxKind::Expense),
      _ => Err(AppError::new("INVALID_TYPE", "type must be income or expense")),
    }
  }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
  pub date: String,
  #[serde(rename = "type")]
  pub kind: TxKind,
  pub amount: f64,
  pub enterprise: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payment_method: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPatch {
  pub date: Option<String>,
  #[serde(rename = "type")]
  pub kind: Option<TxKind>,
  pub amount: Option<f64>,
  pub enterprise: Option<String>,
  pub category: Option<String>,
  pub description: Option<String>,
  pub payment_method: Option<String>,
  pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Enterprise {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub kind: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default = "default_active")]
  pub active: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EnterprisePatch {
  pub name: Option<String>,
  pub kind: Option<String>,
  pub description: Option<String>,
  pub active: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Category {
  pub name: String,
  #[serde(rename = "type")]
  pub kind: TxKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SettingRecord {
  pub key: String,
  pub value: String,
}

/// A typed entity as read back from the store.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record<T> {
  pub id: i64,
  pub sync_status: SyncStatus,
  #[serde(flatten)]
  pub item: T,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFilter {
  pub enterprise: Option<String>,
  pub kind: Option<TxKind>,
  pub category: Option<String>,
  pub date_from: Option<String>,
  pub date_to: Option<String>,
  pub search: Option<String>,
  pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusView {
  pub online: bool,
  pub in_progress: bool,
  pub pending: i64,
  pub failed: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Kpis {
  pub income_total: f64,
  pub expense_total: f64,
  pub result: f64,
  pub margin: f64,
  pub transaction_count: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnterpriseSplit {
  pub enterprise: String,
  pub income: f64,
  pub expense: f64,
  pub result: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategorySplit {
  pub category: String,
  #[serde(rename = "type")]
  pub kind: TxKind,
  pub amount: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MonthSeriesPoint {
  pub month: u32,
  pub income: f64,
  pub expense: f64,
  pub result: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
  pub year: i32,
  pub kpis: Kpis,
  pub enterprises: Vec<EnterpriseSplit>,
  pub categories: Vec<CategorySplit>,
  pub monthly: Vec<MonthSeriesPoint>,
  pub sync: SyncStatusView,
}

fn default_active() -> bool {
  true
}
