//! Per-run key/value store shared between flow phases
//!
//! Values are kept as JSON so that any serializable type can be stored and
//! read back under a different (compatible) type. Every write records when it
//! happened and which platform produced the value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::drivers::Platform;
use crate::error::{E2eError, E2eResult};

/// A stored value with its provenance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone)]
struct Persistence {
    path: PathBuf,
    flow_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotMetadata {
    flow_name: String,
    updated_at: DateTime<Utc>,
    entry_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    metadata: SnapshotMetadata,
    entries: BTreeMap<String, Entry>,
}

#[derive(Debug, Default)]
pub struct DataStore {
    entries: BTreeMap<String, Entry>,
    persistence: Option<Persistence>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rewrites `path` after every mutation.
    pub fn persistent(path: impl Into<PathBuf>, flow_name: impl Into<String>) -> Self {
        Self {
            entries: BTreeMap::new(),
            persistence: Some(Persistence {
                path: path.into(),
                flow_name: flow_name.into(),
            }),
        }
    }

    /// Read a snapshot written by a persistent store.
    pub fn load(path: impl AsRef<Path>) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let file: SnapshotFile = serde_json::from_str(&content)?;
        Ok(Self {
            entries: file.entries,
            persistence: None,
        })
    }

    pub fn persistence_path(&self) -> Option<&Path> {
        self.persistence.as_ref().map(|p| p.path.as_path())
    }

    pub fn set<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: T,
        platform: Option<Platform>,
    ) -> E2eResult<()> {
        let key = key.into();
        let value = serde_json::to_value(value)?;
        debug!("store: set {} ({:?})", key, platform);
        self.entries.insert(
            key,
            Entry {
                value,
                timestamp: Utc::now(),
                platform,
            },
        );
        self.flush()
    }

    /// Typed read. `None` when the key is absent or does not deserialize as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.entries.get(key)?;
        serde_json::from_value(entry.value.clone()).ok()
    }

    /// Typed read that reports why a required value is unusable.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> E2eResult<T> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| E2eError::AssertionFailed(format!("no value stored under '{}'", key)))?;
        Ok(serde_json::from_value(entry.value.clone())?)
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn delete(&mut self, key: &str) -> E2eResult<bool> {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    pub fn clear(&mut self) -> E2eResult<()> {
        self.entries.clear();
        self.flush()
    }

    /// Values whose most recent write was tagged with `platform`.
    pub fn get_by_platform(&self, platform: Platform) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .filter(|(_, e)| e.platform == Some(platform))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Add `by` to a numeric value (missing counts as 0). Keeps the previous
    /// platform tag.
    pub fn increment(&mut self, key: &str, by: i64) -> E2eResult<i64> {
        let (current, platform) = match self.entries.get(key) {
            Some(entry) => {
                let n = entry.value.as_i64().ok_or_else(|| {
                    E2eError::AssertionFailed(format!("'{}' is not an integer", key))
                })?;
                (n, entry.platform)
            }
            None => (0, None),
        };
        let next = current + by;
        self.set(key, next, platform)?;
        Ok(next)
    }

    /// Append to an array value (missing counts as empty). Returns the new length.
    pub fn push<T: Serialize>(&mut self, key: &str, value: T) -> E2eResult<usize> {
        let (mut items, platform) = match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Array(items) => (items.clone(), entry.platform),
                _ => {
                    return Err(E2eError::AssertionFailed(format!(
                        "'{}' is not an array",
                        key
                    )))
                }
            },
            None => (Vec::new(), None),
        };
        items.push(serde_json::to_value(value)?);
        let len = items.len();
        self.set(key, Value::Array(items), platform)?;
        Ok(len)
    }

    /// Shallow-merge the fields of `patch` into an object value.
    pub fn merge<T: Serialize>(&mut self, key: &str, patch: T) -> E2eResult<()> {
        let patch = match serde_json::to_value(patch)? {
            Value::Object(map) => map,
            _ => {
                return Err(E2eError::AssertionFailed(format!(
                    "merge into '{}' needs an object",
                    key
                )))
            }
        };
        let (mut target, platform) = match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Object(map) => (map.clone(), entry.platform),
                _ => {
                    return Err(E2eError::AssertionFailed(format!(
                        "'{}' is not an object",
                        key
                    )))
                }
            },
            None => (serde_json::Map::new(), None),
        };
        target.extend(patch);
        self.set(key, Value::Object(target), platform)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plain `key -> value` object, as embedded in flow reports.
    pub fn snapshot(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        Value::Object(map)
    }

    fn flush(&self) -> E2eResult<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        if let Some(parent) = persistence.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = json!({
            "metadata": SnapshotMetadata {
                flow_name: persistence.flow_name.clone(),
                updated_at: Utc::now(),
                entry_count: self.entries.len(),
            },
            "entries": self.entries,
        });
        std::fs::write(&persistence.path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_last_write_wins() {
        let mut store = DataStore::new();
        store.set("orderId", 1, Some(Platform::Api)).unwrap();
        store.set("orderId", 2, Some(Platform::Mobile)).unwrap();

        assert_eq!(store.get::<i64>("orderId"), Some(2));
        assert_eq!(store.entry("orderId").unwrap().platform, Some(Platform::Mobile));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_by_platform_uses_latest_tag() {
        let mut store = DataStore::new();
        store.set("restaurantId", 7, Some(Platform::Api)).unwrap();
        store.set("menuItemId", 3, Some(Platform::Api)).unwrap();
        store.set("menuItemId", 4, Some(Platform::Web)).unwrap();
        store.set("note", "untagged", None).unwrap();

        let api = store.get_by_platform(Platform::Api);
        assert_eq!(api.len(), 1);
        assert_eq!(api["restaurantId"], json!(7));
        assert!(store.get_by_platform(Platform::Web).contains_key("menuItemId"));
    }

    #[test]
    fn test_get_or_and_type_mismatch() {
        let mut store = DataStore::new();
        store.set("name", "Pizza", None).unwrap();

        assert_eq!(store.get_or("missing", 5u32), 5);
        assert_eq!(store.get::<u32>("name"), None);
        assert!(store.require::<u32>("missing").is_err());
    }

    #[test]
    fn test_increment_push_merge() {
        let mut store = DataStore::new();
        assert_eq!(store.increment("retries", 1).unwrap(), 1);
        assert_eq!(store.increment("retries", 2).unwrap(), 3);

        assert_eq!(store.push("created", 10).unwrap(), 1);
        assert_eq!(store.push("created", 11).unwrap(), 2);
        assert_eq!(store.get::<Vec<i64>>("created"), Some(vec![10, 11]));

        store
            .set("order", json!({"id": 1, "status": "EN_ATTENTE"}), Some(Platform::Api))
            .unwrap();
        store.merge("order", json!({"status": "PRETE"})).unwrap();
        let order: Value = store.get("order").unwrap();
        assert_eq!(order, json!({"id": 1, "status": "PRETE"}));
        assert_eq!(store.entry("order").unwrap().platform, Some(Platform::Api));

        assert!(store.increment("order", 1).is_err());
    }

    #[test]
    fn test_delete_and_clear() {
        let mut store = DataStore::new();
        store.set("a", 1, None).unwrap();
        store.set("b", 2, None).unwrap();

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(!store.has("a"));

        store.clear().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_persistent_store_writes_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("order-flow.json");
        let mut store = DataStore::persistent(&path, "order-flow");

        store.set("orderId", 42, Some(Platform::Api)).unwrap();
        store.set("status", "PRETE", Some(Platform::Web)).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["metadata"]["flowName"], "order-flow");
        assert_eq!(raw["metadata"]["entryCount"], 2);
        assert_eq!(raw["entries"]["orderId"]["value"], 42);
        assert_eq!(raw["entries"]["status"]["platform"], "web");

        let loaded = DataStore::load(&path).unwrap();
        assert_eq!(loaded.get::<String>("status").as_deref(), Some("PRETE"));
        assert_eq!(loaded.snapshot(), store.snapshot());
    }
}
