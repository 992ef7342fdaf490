//! The remote sync endpoint as seen from the engine.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::models::{Action, QueueEntry, Table};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Body of `POST /sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
  pub action: Action,
  pub table: Table,
  pub record_id: i64,
  pub data: Value,
  pub idempotency_key: String,
}

impl From<&QueueEntry> for RemoteRequest {
  fn from(entry: &QueueEntry) -> Self {
    RemoteRequest {
      action: entry.action,
      table: entry.table,
      record_id: entry.record_id,
      data: entry.payload.clone(),
      idempotency_key: entry.idempotency_key.clone(),
    }
  }
}

#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
  /// Applies one queued mutation. Any error leaves the entry queued.
  async fn apply(&self, request: &RemoteRequest) -> Result<(), AppError>;

  /// Cheap reachability check used by the connectivity probe.
  async fn probe(&self) -> bool {
    true
  }
}

pub struct HttpRemote {
  client: reqwest::Client,
  base_url: String,
}

impl HttpRemote {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(HttpRemote {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
    })
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
  async fn apply(&self, request: &RemoteRequest) -> Result<(), AppError> {
    let response = self
      .client
      .post(self.url("/sync"))
      .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
      .json(request)
      .send()
      .await?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::CONFLICT {
      return Err(AppError::Conflict(body));
    }
    Err(AppError::RemoteApply(format!("HTTP {}: {}", status.as_u16(), body)))
  }

  async fn probe(&self) -> bool {
    match self.client.get(self.url("/sync/ping")).send().await {
      Ok(response) => response.status().is_success(),
      Err(_) => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn request_wire_format_uses_camel_case() {
    let request = RemoteRequest {
      action: Action::Create,
      table: Table::Transactions,
      record_id: 9,
      data: json!({ "amount": 5000.0 }),
      idempotency_key: "abc".to_string(),
    };
    let wire = serde_json::to_value(&request).unwrap();
    assert_eq!(
      wire,
      json!({
        "action": "create",
        "table": "transactions",
        "recordId": 9,
        "data": { "amount": 5000.0 },
        "idempotencyKey": "abc",
      })
    );
  }

  #[test]
  fn base_url_trailing_slash_is_ignored() {
    let remote = HttpRemote::new("http://127.0.0.1:48080/", Duration::from_secs(1)).unwrap();
    assert_eq!(remote.url("/sync"), "http://127.0.0.1:48080/sync");
  }
}
