//! Context Store
//!
//! Per-run key/value state shared between steps. The engine seeds the
//! run input under [`INPUT_KEY`] and every successful step writes its
//! output under its output key (the step name unless overridden).
//!
//! The store is plain owned data: the engine owns it for the lifetime of
//! a run, hands out shared borrows to capabilities while steps execute,
//! and performs all writes itself between barriers. No locking is needed.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ContextError;
use crate::flow::KeyPath;

/// Reserved key holding the run's initial input.
pub const INPUT_KEY: &str = "input";

/// Mutable keyed bag of values scoped to one workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextStore {
    values: BTreeMap<String, Value>,
}

impl ContextStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with the run input.
    pub fn with_input(input: Value) -> Self {
        let mut store = Self::new();
        store.set(INPUT_KEY, input);
        store
    }

    /// Stores a value, overwriting any previous value for the key.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        debug!("Context write: '{}'", key);
        self.values.insert(key, value);
    }

    /// Returns the value for a key.
    pub fn get(&self, key: &str) -> Result<&Value, ContextError> {
        self.values
            .get(key)
            .ok_or_else(|| ContextError::KeyNotFound(key.to_string()))
    }

    /// Returns true if the key has been written.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Resolves a dotted path, walking object fields and array indices.
    pub fn lookup(&self, path: &KeyPath) -> Option<&Value> {
        let mut current = self.values.get(path.root())?;
        for field in path.fields() {
            current = match current {
                Value::Object(map) => map.get(field)?,
                Value::Array(items) => items.get(field.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Returns the run input, if seeded.
    pub fn input(&self) -> Option<&Value> {
        self.values.get(INPUT_KEY)
    }

    /// Iterates over all keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Returns the number of stored keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consumes the store and returns it as a JSON object.
    pub fn into_value(self) -> Value {
        Value::Object(self.values.into_iter().collect())
    }
}
