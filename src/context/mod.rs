//! Per-subscription context.
//!
//! A [`Context`] is an immutable key/value map attached to one subscription
//! lineage. It is passed explicitly through every stage's subscribe call, from
//! the consumer toward the source. A `context_write` stage derives a new
//! context for everything upstream of it, so a reader sees every write that
//! sits between itself and the consumer, and for a duplicated key the write
//! nearest to the reader wins. Writes never mutate: each one produces a new map.

mod value;

pub use value::ContextValue;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Immutable key/value store scoped to one subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    entries: Arc<BTreeMap<String, ContextValue>>,
}

impl Context {
    /// The empty context every plain `subscribe` starts from.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a new context with `key` bound to `value`.
    #[must_use]
    pub fn put(&self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(key.into(), value.into());
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Returns a new context with every entry of `other` layered on top of this one.
    #[must_use]
    pub fn put_all(&self, other: &Self) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        let mut entries = (*self.entries).clone();
        for (k, v) in other.entries.iter() {
            entries.insert(k.clone(), v.clone());
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Returns a new context without `key`.
    #[must_use]
    pub fn delete(&self, key: &str) -> Self {
        if !self.entries.contains_key(key) {
            return self.clone();
        }
        let mut entries = (*self.entries).clone();
        entries.remove(key);
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Looks up `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.get(key)
    }

    /// Looks up `key` as text. `None` when absent or of another kind.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            ContextValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Looks up `key` as an integer.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            ContextValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Looks up `key` as a float; integers widen.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            ContextValue::Float(v) => Some(*v),
            ContextValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Looks up `key` as a flag.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            ContextValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    /// Looks up `key`, falling back to `default`.
    #[must_use]
    pub fn get_or(&self, key: &str, default: impl Into<ContextValue>) -> ContextValue {
        self.get(key).cloned().unwrap_or_else(|| default.into())
    }

    /// Returns true if `key` is bound.
    #[must_use]
    pub fn has_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true for a context with no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContextValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Renders the context as a JSON object, for diagnostics.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&*self.entries).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for Context {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Context {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = BTreeMap::<String, ContextValue>::deserialize(deserializer)?;
        Ok(Self {
            entries: Arc::new(entries),
        })
    }
}
