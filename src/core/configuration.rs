//! In-memory configuration store.
//!
//! Parsing and merging settings files happens in the host; this store only
//! holds the merged payload it is seeded with and answers section lookups.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::event::{Emitter, Event};
use crate::util::{read, write};

/// Sections whose effective value changed
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationChange {
    pub sections: Vec<String>,
}

impl ConfigurationChange {
    /// Whether `section` (or any parent or child of it) changed.
    pub fn affects(&self, section: &str) -> bool {
        self.sections.iter().any(|changed| {
            changed == section
                || section
                    .strip_prefix(changed.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
                || changed
                    .strip_prefix(section)
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

#[derive(Debug)]
pub struct ConfigurationStore {
    data: RwLock<Value>,
    on_did_change: Emitter<ConfigurationChange>,
    disposed: AtomicBool,
}

impl Default for ConfigurationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Value::Object(Map::new())),
            on_did_change: Emitter::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn on_did_change(&self) -> Event<ConfigurationChange> {
        self.on_did_change.event()
    }

    /// Replace the whole payload, firing for every top-level section that
    /// differs from before.
    pub fn update_configurations(&self, payload: Value) {
        let payload = match payload {
            Value::Object(_) => payload,
            Value::Null => Value::Object(Map::new()),
            other => {
                log::warn!("Ignoring non-object configuration payload: {}", other);
                return;
            }
        };

        let sections = {
            let mut data = write(&self.data);
            let changed = changed_sections(&data, &payload);
            *data = payload;
            changed
        };

        if !sections.is_empty() {
            log::debug!("Configuration sections changed: {:?}", sections);
            self.on_did_change.fire(&ConfigurationChange { sections });
        }
    }

    /// Look up a dotted section; `""` returns the whole payload.
    pub fn get(&self, section: &str) -> Option<Value> {
        let data = read(&self.data);
        if section.is_empty() {
            return Some(data.clone());
        }
        lookup(&data, section).cloned()
    }

    /// Typed lookup falling back to `default` when missing or mistyped.
    pub fn get_or<T: DeserializeOwned>(&self, section: &str, default: T) -> T {
        match self.get(section) {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                log::warn!("Invalid value for configuration '{}': {}", section, e);
                default
            }),
            None => default,
        }
    }

    /// Set a single dotted key.
    pub fn update(&self, key: &str, value: Value) {
        let changed = {
            let mut data = write(&self.data);
            if lookup(&data, key) == Some(&value) {
                false
            } else {
                assign(&mut data, key, value);
                true
            }
        };

        if changed {
            self.on_did_change.fire(&ConfigurationChange {
                sections: vec![key.to_string()],
            });
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.on_did_change.clear();
        *write(&self.data) = Value::Object(Map::new());
    }
}

fn lookup<'a>(value: &'a Value, section: &str) -> Option<&'a Value> {
    let object = value.as_object()?;
    if let Some(found) = object.get(section) {
        return Some(found);
    }
    // Keys may be stored flat ("workspace.rootPatterns") or nested.
    for (idx, _) in section.match_indices('.') {
        let (head, rest) = (&section[..idx], &section[idx + 1..]);
        if let Some(found) = object.get(head).and_then(|child| lookup(child, rest)) {
            return Some(found);
        }
    }
    None
}

fn assign(root: &mut Value, key: &str, value: Value) {
    let mut current = root;
    let mut parts = key.split('.').peekable();
    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(object) = current else {
            return;
        };
        if parts.peek().is_none() {
            object.insert(part.to_string(), value);
            return;
        }
        current = object
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn changed_sections(old: &Value, new: &Value) -> Vec<String> {
    let empty = Map::new();
    let old = old.as_object().unwrap_or(&empty);
    let new = new.as_object().unwrap_or(&empty);

    let mut sections: Vec<String> = old
        .keys()
        .chain(new.keys())
        .filter(|key| old.get(*key) != new.get(*key))
        .cloned()
        .collect();
    sections.sort();
    sections.dedup();
    sections
}
