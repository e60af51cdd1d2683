//! Shared fixtures for unit tests.

use crate::context::Context;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Context with named boolean flags and a callback journal.
pub struct TestContext {
    name: String,
    valid: AtomicBool,
    flags: Mutex<HashMap<String, bool>>,
    journal: Mutex<Vec<String>>,
}

impl TestContext {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            valid: AtomicBool::new(true),
            flags: Mutex::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        self.flags.lock().get(key).copied().unwrap_or(false)
    }

    pub fn set_flag(&self, key: &str, value: bool) {
        self.flags.lock().insert(key.to_string(), value);
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.journal.lock().push(entry.into());
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }
}

impl Context for TestContext {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
