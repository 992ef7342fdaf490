//! Reference implementation of the remote sync endpoint.
//!
//! Keeps the applied records in memory and deduplicates deliveries by idempotency key, so a
//! retried entry that already reached the server is acknowledged without being applied twice.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::models::{Action, Table};
use crate::sync::remote::{RemoteRequest, IDEMPOTENCY_HEADER};

#[derive(Debug, Default)]
pub struct RemoteLedger {
  records: HashMap<(Table, i64), Value>,
  applied_keys: HashSet<String>,
  applied: Vec<RemoteRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApplyResponse {
  ok: bool,
  duplicate: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
  records: usize,
  applied: usize,
}

impl RemoteLedger {
  /// Returns false when the request was already applied under the same idempotency key.
  pub fn apply(&mut self, request: RemoteRequest) -> bool {
    if !self.applied_keys.insert(request.idempotency_key.clone()) {
      return false;
    }
    let key = (request.table, request.record_id);
    match request.action {
      Action::Create | Action::Update => {
        self.records.insert(key, request.data.clone());
      }
      Action::Delete => {
        self.records.remove(&key);
      }
    }
    self.applied.push(request);
    true
  }

  pub fn record(&self, table: Table, id: i64) -> Option<&Value> {
    self.records.get(&(table, id))
  }

  pub fn record_count(&self) -> usize {
    self.records.len()
  }

  /// Every request that changed state, in arrival order.
  pub fn applied(&self) -> &[RemoteRequest] {
    &self.applied
  }
}

pub type SharedLedger = Arc<Mutex<RemoteLedger>>;

pub fn bind(addr: &str) -> Result<Server, AppError> {
  Server::http(addr).map_err(|err| AppError::storage("SYNC_SERVER", err.to_string()))
}

/// Serves requests until the server is unblocked or dropped. Blocking; run it on its own thread.
pub fn serve(server: Arc<Server>, ledger: SharedLedger) {
  if let Some(addr) = server.server_addr().to_ip() {
    info!(%addr, "sync endpoint listening");
  }
  for request in server.incoming_requests() {
    handle_sync_request(request, &ledger);
  }
}

fn handle_sync_request(mut request: Request, ledger: &SharedLedger) {
  let method = request.method().clone();
  let url = request.url().split('?').next().unwrap_or("").to_string();
  let response = match (method, url.as_str()) {
    (Method::Get, "/sync/ping") => json_response(StatusCode(200), &serde_json::json!({ "ok": true })),
    (Method::Get, "/sync/status") => handle_status(ledger),
    (Method::Post, "/sync") => handle_apply(&mut request, ledger),
    _ => json_error(StatusCode(404), "SYNC_NOT_FOUND", "route not found"),
  };
  if let Err(err) = request.respond(response) {
    warn!("failed to send sync response: {err}");
  }
}

fn handle_status(ledger: &SharedLedger) -> Response<Cursor<Vec<u8>>> {
  match ledger.lock() {
    Ok(ledger) => json_response(
      StatusCode(200),
      &StatusResponse {
        records: ledger.record_count(),
        applied: ledger.applied().len(),
      },
    ),
    Err(_) => json_error(StatusCode(500), "LOCK_ERROR", "ledger unavailable"),
  }
}

fn handle_apply(request: &mut Request, ledger: &SharedLedger) -> Response<Cursor<Vec<u8>>> {
  let mut body = Vec::new();
  if request.as_reader().read_to_end(&mut body).is_err() {
    return json_error(StatusCode(400), "SYNC_APPLY", "request body could not be read");
  }
  let payload: RemoteRequest = match serde_json::from_slice(&body) {
    Ok(payload) => payload,
    Err(err) => return json_error(StatusCode(400), "SYNC_APPLY", &format!("invalid sync request: {err}")),
  };

  if let Some(header_key) = read_header(request, IDEMPOTENCY_HEADER) {
    if header_key != payload.idempotency_key {
      return json_error(StatusCode(400), "SYNC_APPLY", "idempotency key mismatch");
    }
  }

  let mut ledger = match ledger.lock() {
    Ok(ledger) => ledger,
    Err(_) => return json_error(StatusCode(500), "LOCK_ERROR", "ledger unavailable"),
  };
  let (table, record_id, action) = (payload.table, payload.record_id, payload.action);
  let fresh = ledger.apply(payload);
  if fresh {
    debug!(%table, record_id, %action, "applied");
  } else {
    debug!(%table, record_id, %action, "duplicate delivery acknowledged");
  }
  json_response(StatusCode(200), &ApplyResponse { ok: true, duplicate: !fresh })
}

fn read_header(request: &Request, name: &str) -> Option<String> {
  request
    .headers()
    .iter()
    .find(|header| header.field.as_str().as_str().eq_ignore_ascii_case(name))
    .map(|header| header.value.to_string())
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Cursor<Vec<u8>>> {
  let body = serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
  let mut response = Response::from_data(body).with_status_code(status);
  if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
    response.add_header(header);
  }
  response
}

fn json_error(status: StatusCode, code: &str, message: &str) -> Response<Cursor<Vec<u8>>> {
  json_response(
    status,
    &serde_json::json!({
      "code": code,
      "message": message,
    }),
  )
}
