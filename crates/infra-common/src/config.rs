//! Runtime key/value configuration store.
//!
//! Configuration is a flat map of dotted string keys to string values, the
//! way the operator-facing configuration table presents it. Components keep
//! typed views over the subset of keys they own and read through the typed
//! accessors here. Writes are allowed at runtime; readers always see the
//! latest value.

use crate::errors::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// A flat, thread-safe string key/value store with typed getters.
///
/// Keys not present fall back to the defaults supplied at construction.
pub struct ConfigStore {
    values: RwLock<HashMap<String, String>>,
    defaults: HashMap<String, String>,
}

impl ConfigStore {
    /// Create an empty store with no defaults.
    pub fn new() -> Self {
        ConfigStore {
            values: RwLock::new(HashMap::new()),
            defaults: HashMap::new(),
        }
    }

    /// Create a store seeded with `(key, default-value)` pairs.
    pub fn with_defaults<I, K, V>(defaults: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        ConfigStore {
            values: RwLock::new(HashMap::new()),
            defaults: defaults
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Set a value, replacing any previous one.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }

    /// Remove a runtime value, reverting the key to its default.
    pub fn unset(&self, key: &str) {
        self.values.write().remove(key);
    }

    /// Is the key defined, either explicitly or by default?
    pub fn defines(&self, key: &str) -> bool {
        self.values.read().contains_key(key) || self.defaults.contains_key(key)
    }

    /// Get a string value, falling back to the default. Empty string if
    /// neither exists; callers that must distinguish use [`defines`].
    ///
    /// [`defines`]: ConfigStore::defines
    pub fn get_str(&self, key: &str) -> String {
        if let Some(v) = self.values.read().get(key) {
            return v.clone();
        }
        self.defaults.get(key).cloned().unwrap_or_default()
    }

    /// Get a required string value.
    pub fn require_str(&self, key: &str) -> Result<String> {
        if self.defines(key) {
            Ok(self.get_str(key))
        } else {
            Err(Error::MissingConfig(key.to_string()))
        }
    }

    /// Get an integer value; the default applies if the key is unset.
    pub fn get_num(&self, key: &str) -> Result<i64> {
        let raw = self.get_str(key);
        raw.trim()
            .parse::<i64>()
            .map_err(|_| Error::InvalidConfig {
                key: key.to_string(),
                value: raw,
            })
    }

    /// Get a boolean value. Accepts 1/0, true/false, yes/no.
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        let raw = self.get_str(key);
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            _ => Err(Error::InvalidConfig {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    /// Snapshot the effective configuration (defaults overlaid with runtime
    /// values) as a JSON object, for reporting.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let mut merged = self.defaults.clone();
        for (k, v) in self.values.read().iter() {
            merged.insert(k.clone(), v.clone());
        }
        serde_json::to_value(merged).unwrap_or(serde_json::Value::Null)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let store = ConfigStore::with_defaults([("A.B", "5"), ("A.C", "hello")]);
        assert_eq!(store.get_num("A.B").unwrap(), 5);
        store.set("A.B", "7");
        assert_eq!(store.get_num("A.B").unwrap(), 7);
        store.unset("A.B");
        assert_eq!(store.get_num("A.B").unwrap(), 5);
        assert_eq!(store.get_str("A.C"), "hello");
        assert!(!store.defines("A.D"));
    }

    #[test]
    fn bool_parsing() {
        let store = ConfigStore::new();
        store.set("X", "yes");
        assert!(store.get_bool("X").unwrap());
        store.set("X", "0");
        assert!(!store.get_bool("X").unwrap());
        store.set("X", "maybe");
        assert!(store.get_bool("X").is_err());
    }
}
