//! Read-only key/value settings.
//!
//! Keys are dotted (`scheduler.poll_interval_secs`). [`EnvSettings`] maps a
//! key to `PREFIX_SCHEDULER_POLL_INTERVAL_SECS`; [`MapSettings`] is an
//! in-memory table for tests and embedding.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

pub trait SettingsProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Settings from process environment variables.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    prefix: String,
}

impl EnvSettings {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn var_name(&self, key: &str) -> String {
        let key = key.replace(['.', '-'], "_").to_ascii_uppercase();
        if self.prefix.is_empty() {
            key
        } else {
            format!("{}_{key}", self.prefix)
        }
    }
}

impl SettingsProvider for EnvSettings {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.var_name(key)).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapSettings {
    values: HashMap<String, String>,
}

impl MapSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapSettings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl SettingsProvider for MapSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Parse a setting. Missing → `Ok(None)`; malformed → `Error::Config`.
pub fn parsed<T>(settings: &dyn SettingsProvider, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    settings
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("setting {key}={raw:?} is invalid: {e}")))
        })
        .transpose()
}

/// Parse a duration given in (possibly fractional) seconds.
pub fn seconds(settings: &dyn SettingsProvider, key: &str) -> Result<Option<Duration>> {
    parsed::<f64>(settings, key)?
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|e| Error::Config(format!("setting {key}={secs} is invalid: {e}")))
        })
        .transpose()
}
