//! Resolution of the current document URL per category

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use log::{debug, info, warn};

use super::error::{ConfigError, SyncError};
use super::types::RemoteDocumentRef;
use crate::category::Category;

/// A fetch-and-get key/value configuration service.
///
/// `refresh_and_activate` fetches a new snapshot and makes it visible to
/// `get`. Implementations enforce their own minimum fetch interval and return
/// `Ok(false)` when a fetch was skipped or produced nothing new; the previously
/// activated values stay readable in that case.
pub trait KeyValueConfig: Send + Sync {
    fn refresh_and_activate(&self) -> Result<bool, ConfigError>;

    fn get(&self, key: &str) -> Option<String>;
}

/// Resolves the remote location of a category's document.
pub struct ConfigResolver<C> {
    service: C,
}

impl<C: KeyValueConfig> ConfigResolver<C> {
    pub fn new(service: C) -> Self {
        Self { service }
    }

    /// Refresh the config snapshot and read the URL for `category`.
    ///
    /// A failed refresh is not fatal as long as an earlier activated value
    /// exists. A missing or blank value is `ConfigUnavailable`.
    pub fn resolve(&self, category: Category) -> Result<RemoteDocumentRef, SyncError> {
        let refresh_error = match self.service.refresh_and_activate() {
            Ok(true) => {
                debug!("Config snapshot refreshed");
                None
            }
            Ok(false) => {
                debug!("Config fetch skipped, using activated snapshot");
                None
            }
            Err(e) => {
                warn!("Config refresh failed: {e}");
                Some(e)
            }
        };

        let key = category.config_key();
        match self.service.get(key) {
            Some(url) if !url.trim().is_empty() => {
                let url = url.trim().to_string();
                info!("Resolved {category} document: {url}");
                Ok(RemoteDocumentRef::new(category, url))
            }
            _ => Err(SyncError::ConfigUnavailable {
                category,
                detail: match refresh_error {
                    Some(e) => e.to_string(),
                    None => format!("'{key}' is missing or blank"),
                },
            }),
        }
    }
}

/// Config service backed by a fixed map, e.g. the `documents` table from settings.
#[derive(Debug, Default)]
pub struct StaticConfig {
    values: RwLock<HashMap<String, String>>,
}

impl StaticConfig {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }
}

impl KeyValueConfig for StaticConfig {
    fn refresh_and_activate(&self) -> Result<bool, ConfigError> {
        Ok(false)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl<T: KeyValueConfig + ?Sized> KeyValueConfig for std::sync::Arc<T> {
    fn refresh_and_activate(&self) -> Result<bool, ConfigError> {
        (**self).refresh_and_activate()
    }

    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }
}
