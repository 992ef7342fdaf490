use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
  #[error("{table} #{id} not found")]
  NotFound { table: String, id: i64 },

  #[error("{code}: {message}")]
  Storage { code: String, message: String },

  #[error("remote apply failed: {0}")]
  RemoteApply(String),

  #[error("concurrency conflict: {0}")]
  Conflict(String),

  #[error("{code}: {message}")]
  Invalid { code: String, message: String },
}

impl AppError {
  /// Validation error with a stable code, the same shape the commands return to callers.
  pub fn new(code: &str, message: impl Into<String>) -> Self {
    AppError::Invalid {
      code: code.to_string(),
      message: message.into(),
    }
  }

  pub fn not_found(table: impl Into<String>, id: i64) -> Self {
    AppError::NotFound {
      table: table.into(),
      id,
    }
  }

  pub fn storage(code: &str, message: impl Into<String>) -> Self {
    AppError::Storage {
      code: code.to_string(),
      message: message.into(),
    }
  }

  pub fn code(&self) -> &str {
    match self {
      AppError::NotFound { .. } => "NOT_FOUND",
      AppError::Storage { code, .. } => code,
      AppError::RemoteApply(_) => "REMOTE_APPLY",
      AppError::Conflict(_) => "CONFLICT",
      AppError::Invalid { code, .. } => code,
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, AppError::NotFound { .. })
  }
}

impl Serialize for AppError {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let message = match self {
      AppError::Storage { message, .. } | AppError::Invalid { message, .. } => message.clone(),
      other => other.to_string(),
    };
    let mut state = serializer.serialize_struct("AppError", 2)?;
    state.serialize_field("code", self.code())?;
    state.serialize_field("message", &message)?;
    state.end()
  }
}

impl From<rusqlite::Error> for AppError {
  fn from(err: rusqlite::Error) -> Self {
    AppError::storage("DB_ERROR", err.to_string())
  }
}

impl From<std::io::Error> for AppError {
  fn from(err: std::io::Error) -> Self {
    AppError::storage("IO_ERROR", err.to_string())
  }
}

impl From<serde_json::Error> for AppError {
  fn from(err: serde_json::Error) -> Self {
    AppError::storage("JSON_ERROR", err.to_string())
  }
}

impl From<reqwest::Error> for AppError {
  fn from(err: reqwest::Error) -> Self {
    AppError::RemoteApply(err.to_string())
  }
}

impl<T> From<std::sync::PoisonError<T>> for AppError {
  fn from(_: std::sync::PoisonError<T>) -> Self {
    AppError::storage("LOCK_ERROR", "Database lock failed")
  }
}
