//! JSON-backed instance context.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tickfsm_core::Context;

/// Context holding a JSON object that guards read and actions patch.
#[derive(Debug)]
pub struct JsonContext {
    name: String,
    valid: AtomicBool,
    data: RwLock<Value>,
}

impl JsonContext {
    /// Creates a context. Non-object data is wrapped as `{"value": data}`.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(_) => data,
            Value::Null => Value::Object(Map::new()),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Value::Object(map)
            }
        };
        Self {
            name: name.into(),
            valid: AtomicBool::new(true),
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of the current data.
    pub fn data(&self) -> Value {
        self.data.read().clone()
    }

    /// Reads the data without copying it.
    pub fn with_data<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.data.read())
    }

    /// Top-level field lookup.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        if let Value::Object(map) = &mut *self.data.write() {
            map.insert(key.into(), value);
        }
    }

    /// Shallow merge: top-level keys of `patch` overwrite existing keys.
    pub fn merge(&self, patch: &Map<String, Value>) {
        if let Value::Object(map) = &mut *self.data.write() {
            for (k, v) in patch {
                map.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }
}

impl Context for JsonContext {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
