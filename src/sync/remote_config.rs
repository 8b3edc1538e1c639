//! HTTP-backed key/value config service

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info};
use serde_json::Value;

use super::config::KeyValueConfig;
use super::error::ConfigError;

pub const DEFAULT_MIN_FETCH_INTERVAL: Duration = Duration::from_secs(60 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Default)]
struct Snapshot {
    values: HashMap<String, String>,
    fetched_at: Option<Instant>,
}

/// Fetches a flat JSON object (`{"key": "value", ...}`) from an endpoint.
///
/// Successful fetches are throttled to one per `min_fetch_interval`; while
/// throttled, `refresh_and_activate` returns `Ok(false)` and `get` keeps
/// serving the last activated snapshot. Defaults seed the snapshot before the
/// first successful fetch.
pub struct RemoteConfig {
    endpoint: String,
    min_fetch_interval: Duration,
    client: reqwest::blocking::Client,
    snapshot: RwLock<Snapshot>,
}

impl RemoteConfig {
    pub fn new(endpoint: impl Into<String>, min_fetch_interval: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            endpoint: endpoint.into(),
            min_fetch_interval,
            client,
            snapshot: RwLock::new(Snapshot::default()),
        })
    }

    #[must_use]
    pub fn with_defaults(self, defaults: HashMap<String, String>) -> Self {
        self.snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .values = defaults;
        self
    }

    fn is_throttled(&self) -> bool {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .fetched_at
            .is_some_and(|at| at.elapsed() < self.min_fetch_interval)
    }

    fn fetch(&self) -> Result<HashMap<String, String>, ConfigError> {
        let body = self
            .client
            .get(&self.endpoint)
            .send()
            .map_err(|e| ConfigError::Unreachable(e.to_string()))?
            .error_for_status()?
            .text()?;

        parse_values(&body)
    }
}

impl KeyValueConfig for RemoteConfig {
    fn refresh_and_activate(&self) -> Result<bool, ConfigError> {
        if self.is_throttled() {
            debug!("Remote config fetch throttled");
            return Ok(false);
        }

        let fetched = self.fetch()?;

        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.fetched_at = Some(Instant::now());
        if snapshot.values == fetched {
            return Ok(false);
        }

        info!("Activated remote config ({} keys)", fetched.len());
        snapshot.values = fetched;
        Ok(true)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values
            .get(key)
            .cloned()
    }
}

fn parse_values(body: &str) -> Result<HashMap<String, String>, ConfigError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| ConfigError::Malformed(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(ConfigError::Malformed("expected a JSON object".into()));
    };

    Ok(map
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key, s)),
            Value::Number(n) => Some((key, n.to_string())),
            Value::Bool(b) => Some((key, b.to_string())),
            _ => None,
        })
        .collect())
}
