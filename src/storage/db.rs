//! JSON-file backed key/value store.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

/// Store persisted as a single JSON object at `<root>/<name>.json`.
///
/// Keys are dotted paths into the object. A missing or unreadable file
/// reads as empty.
#[derive(Debug, Clone)]
pub struct KeyValueStore {
    path: PathBuf,
}

impl KeyValueStore {
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            path: root.join(format!("{}.json", name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut current = self.load();
        for part in key.split('.') {
            current = match current {
                Value::Object(mut object) => object.remove(part)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set `key`, creating intermediate objects as needed.
    pub fn push(&self, key: &str, value: Value) -> Result<()> {
        let mut root = self.load();
        let mut current = &mut root;
        let mut parts = key.split('.').peekable();
        while let Some(part) = parts.next() {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            let Value::Object(object) = current else {
                break;
            };
            if parts.peek().is_none() {
                object.insert(part.to_string(), value);
                break;
            }
            current = object
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        self.save(&root)
    }

    /// Remove `key`; missing keys are not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut root = self.load();
        let (parent, last) = match key.rsplit_once('.') {
            Some((parent, last)) => (Some(parent), last),
            None => (None, key),
        };

        let mut current = &mut root;
        if let Some(parent) = parent {
            for part in parent.split('.') {
                match current.get_mut(part) {
                    Some(next) => current = next,
                    None => return Ok(()),
                }
            }
        }
        let removed = current
            .as_object_mut()
            .and_then(|object| object.remove(last))
            .is_some();
        if removed {
            self.save(&root)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.save(&Value::Object(Map::new()))
    }

    fn load(&self) -> Value {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return Value::Object(Map::new()),
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!("Ignoring corrupt store {}: {}", self.path.display(), e);
            Value::Object(Map::new())
        })
    }

    fn save(&self, value: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(value)?)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}
