//! Local Key-Value Storage
//!
//! Durable on-device storage for entitlement state. Two keys are in play:
//!
//! - [`PURCHASED_THEMES_KEY`] - list of owned theme ids
//! - [`CURRENT_THEME_KEY`] - the active theme id
//!
//! Both are read once at startup and written on every mutation. Writes are
//! modeled as non-failing: the entitlement manager has no error path for
//! persistence I/O, so implementations log and swallow failures.

use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Storage key holding the list of owned theme ids.
pub const PURCHASED_THEMES_KEY: &str = "purchasedThemes";

/// Storage key holding the active theme id.
pub const CURRENT_THEME_KEY: &str = "currentTheme";

/// Durable local key-value storage.
///
/// The platform equivalent is the app's preference store. Keys map to JSON
/// values so string lists and plain strings share one interface.
pub trait KeyValueStore: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;

    fn set_string(&self, key: &str, value: &str);

    fn get_string_list(&self, key: &str) -> Option<Vec<String>>;

    fn set_string_list(&self, key: &str, values: &[String]);
}

// ============================================================================
// File-backed store
// ============================================================================

/// JSON-file-backed store, one flat object per file.
///
/// The whole map is rewritten on every set; entitlement state is a handful
/// of strings, so this stays trivially cheap.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Value>>,
}

impl FileStore {
    /// Open a store at `path`, loading any existing contents.
    ///
    /// A missing or unreadable file starts the store empty rather than
    /// failing; the next write recreates it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, Value>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Settings file unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!(path = %path.display(), keys = entries.len(), "Settings store opened");
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn persist(&self, entries: &HashMap<String, Value>) {
        let bytes = match serde_json::to_vec_pretty(entries) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Failed to serialize settings");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.path, bytes) {
            warn!(path = %self.path.display(), error = %e, "Failed to write settings");
        }
    }

    fn set(&self, key: &str, value: Value) {
        let mut entries = self.entries.lock().expect("settings lock poisoned");
        entries.insert(key.to_string(), value);
        self.persist(&entries);
    }

    fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().expect("settings lock poisoned");
        entries.get(key).cloned()
    }
}

impl KeyValueStore for FileStore {
    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)?.as_str().map(str::to_string)
    }

    fn set_string(&self, key: &str, value: &str) {
        self.set(key, Value::String(value.to_string()));
    }

    fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        let value = self.get(key)?;
        let items = value.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    fn set_string_list(&self, key: &str, values: &[String]) {
        self.set(
            key,
            Value::Array(values.iter().cloned().map(Value::String).collect()),
        );
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store for tests and previews.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_string(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().expect("settings lock poisoned");
        entries.get(key)?.as_str().map(str::to_string)
    }

    fn set_string(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().expect("settings lock poisoned");
        entries.insert(key.to_string(), Value::String(value.to_string()));
    }

    fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        let entries = self.entries.lock().expect("settings lock poisoned");
        let items = entries.get(key)?.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    fn set_string_list(&self, key: &str, values: &[String]) {
        let mut entries = self.entries.lock().expect("settings lock poisoned");
        entries.insert(
            key.to_string(),
            Value::Array(values.iter().cloned().map(Value::String).collect()),
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("wardrobe-{}-{}.json", name, std::process::id()));
        path
    }

    #[test]
    fn test_file_store_round_trip() {
        let path = temp_path("round-trip");
        let _ = std::fs::remove_file(&path);

        let store = FileStore::open(&path);
        assert!(store.get_string(CURRENT_THEME_KEY).is_none());

        store.set_string(CURRENT_THEME_KEY, "dark");
        store.set_string_list(
            PURCHASED_THEMES_KEY,
            &["default".to_string(), "dark".to_string()],
        );

        // A fresh handle sees the persisted values
        let reopened = FileStore::open(&path);
        assert_eq!(reopened.get_string(CURRENT_THEME_KEY).as_deref(), Some("dark"));
        assert_eq!(
            reopened.get_string_list(PURCHASED_THEMES_KEY),
            Some(vec!["default".to_string(), "dark".to_string()])
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_file_store_survives_garbage() {
        let path = temp_path("garbage");
        std::fs::write(&path, b"not json at all").expect("write garbage");

        let store = FileStore::open(&path);
        assert!(store.get_string(CURRENT_THEME_KEY).is_none());

        // Writes recover the file
        store.set_string(CURRENT_THEME_KEY, "galaxy");
        let reopened = FileStore::open(&path);
        assert_eq!(
            reopened.get_string(CURRENT_THEME_KEY).as_deref(),
            Some("galaxy")
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.get_string_list(PURCHASED_THEMES_KEY).is_none());

        store.set_string_list(PURCHASED_THEMES_KEY, &["default".to_string()]);
        assert_eq!(
            store.get_string_list(PURCHASED_THEMES_KEY),
            Some(vec!["default".to_string()])
        );

        // Wrong-typed reads return None instead of panicking
        assert!(store.get_string(PURCHASED_THEMES_KEY).is_none());
    }
}
