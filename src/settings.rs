use std::time::Duration;

use crate::sync::engine::DEFAULT_REMOTE_TIMEOUT;
use crate::sync::recorder::DeletePolicy;
use crate::sync::DEFAULT_SYNC_INTERVAL;

const KEY_SYNC_URL: &str = "FARM_BOOKS_SYNC_URL";
const KEY_SYNC_INTERVAL: &str = "FARM_BOOKS_SYNC_INTERVAL_SECS";
const KEY_REMOTE_TIMEOUT: &str = "FARM_BOOKS_REMOTE_TIMEOUT_SECS";
const KEY_PROBE_INTERVAL: &str = "FARM_BOOKS_PROBE_INTERVAL_SECS";
const KEY_COLLAPSE_DELETES: &str = "FARM_BOOKS_COLLAPSE_UNSYNCED_DELETES";

pub const DEFAULT_SYNC_URL: &str = "http://127.0.0.1:48080";
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
  pub endpoint_url: String,
  pub sync_interval: Duration,
  pub remote_timeout: Duration,
  pub probe_interval: Duration,
  pub delete_policy: DeletePolicy,
}

impl Default for SyncConfig {
  fn default() -> Self {
    SyncConfig {
      endpoint_url: DEFAULT_SYNC_URL.to_string(),
      sync_interval: DEFAULT_SYNC_INTERVAL,
      remote_timeout: DEFAULT_REMOTE_TIMEOUT,
      probe_interval: DEFAULT_PROBE_INTERVAL,
      delete_policy: DeletePolicy::default(),
    }
  }
}

pub fn load_config() -> SyncConfig {
  load_from(|key| std::env::var(key).ok())
}

/// Unparseable or zero values fall back to the defaults.
pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> SyncConfig {
  let mut config = SyncConfig::default();

  if let Some(url) = lookup(KEY_SYNC_URL).filter(|value| !value.trim().is_empty()) {
    config.endpoint_url = url.trim().to_string();
  }
  if let Some(secs) = parse_secs(lookup(KEY_SYNC_INTERVAL)) {
    config.sync_interval = secs;
  }
  if let Some(secs) = parse_secs(lookup(KEY_REMOTE_TIMEOUT)) {
    config.remote_timeout = secs;
  }
  if let Some(secs) = parse_secs(lookup(KEY_PROBE_INTERVAL)) {
    config.probe_interval = secs;
  }
  if let Some(value) = lookup(KEY_COLLAPSE_DELETES) {
    let value = value.to_ascii_lowercase();
    if value == "1" || value == "true" || value == "yes" {
      config.delete_policy = DeletePolicy::CollapseUnsynced;
    }
  }

  config
}

fn parse_secs(value: Option<String>) -> Option<Duration> {
  value
    .and_then(|value| value.trim().parse::<u64>().ok())
    .filter(|secs| *secs > 0)
    .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn load(pairs: &[(&str, &str)]) -> SyncConfig {
    let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    load_from(|key| env.get(key).cloned())
  }

  #[test]
  fn defaults_without_environment() {
    let config = load(&[]);
    assert_eq!(config, SyncConfig::default());
    assert_eq!(config.sync_interval, Duration::from_secs(300));
  }

  #[test]
  fn overrides_and_fallbacks() {
    let config = load(&[
      (KEY_SYNC_URL, " https://books.example.org "),
      (KEY_SYNC_INTERVAL, "60"),
      (KEY_REMOTE_TIMEOUT, "zero"),
      (KEY_PROBE_INTERVAL, "0"),
      (KEY_COLLAPSE_DELETES, "Yes"),
    ]);
    assert_eq!(config.endpoint_url, "https://books.example.org");
    assert_eq!(config.sync_interval, Duration::from_secs(60));
    assert_eq!(config.remote_timeout, DEFAULT_REMOTE_TIMEOUT);
    assert_eq!(config.probe_interval, DEFAULT_PROBE_INTERVAL);
    assert_eq!(config.delete_policy, DeletePolicy::CollapseUnsynced);
  }
}
