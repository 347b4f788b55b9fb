//! Local simulation overrides
//!
//! While a key is overridden, reads return the local value and writes update
//! it; nothing goes on the wire. Concurrent setters are last-writer-wins.

use dashmap::DashMap;

use super::types::{PropertyKey, PropertyValue};

#[derive(Debug, Default)]
pub struct OverrideStore {
    entries: DashMap<PropertyKey, PropertyValue>,
}

impl OverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: PropertyKey, value: PropertyValue) {
        tracing::info!("Override set: {} = {}", key, value);
        self.entries.insert(key, value);
    }

    /// Returns the value that was overriding the key, if any
    pub fn clear(&self, key: &PropertyKey) -> Option<PropertyValue> {
        let removed = self.entries.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            tracing::info!("Override released: {}", key);
        }
        removed
    }

    pub fn is_overridden(&self, key: &PropertyKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn current(&self, key: &PropertyKey) -> Option<PropertyValue> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    /// Replace the value only if the key is still overridden
    ///
    /// Returns false when the override was released in the meantime.
    pub(crate) fn update_existing(&self, key: &PropertyKey, value: PropertyValue) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                *entry = value;
                true
            }
            None => false,
        }
    }

    /// All active overrides
    pub fn list(&self) -> Vec<(PropertyKey, PropertyValue)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::types::ObjectType;

    #[test]
    fn test_set_and_clear() {
        let store = OverrideStore::new();
        let key = PropertyKey::present_value(5, ObjectType::AnalogValue, 1);

        assert!(!store.is_overridden(&key));
        store.set(key, PropertyValue::Real(21.0));
        assert!(store.is_overridden(&key));
        assert_eq!(store.current(&key), Some(PropertyValue::Real(21.0)));

        assert_eq!(store.clear(&key), Some(PropertyValue::Real(21.0)));
        assert!(store.current(&key).is_none());
        assert!(store.clear(&key).is_none());
    }

    #[test]
    fn test_update_existing_only() {
        let store = OverrideStore::new();
        let key = PropertyKey::present_value(5, ObjectType::BinaryOutput, 2);

        assert!(!store.update_existing(&key, PropertyValue::Boolean(true)));
        assert!(!store.is_overridden(&key));

        store.set(key, PropertyValue::Boolean(false));
        assert!(store.update_existing(&key, PropertyValue::Boolean(true)));
        assert_eq!(store.current(&key), Some(PropertyValue::Boolean(true)));
    }

    #[test]
    fn test_last_writer_wins() {
        let store = OverrideStore::new();
        let key = PropertyKey::present_value(5, ObjectType::AnalogOutput, 3);
        store.set(key, PropertyValue::Real(1.0));
        store.set(key, PropertyValue::Real(2.0));
        assert_eq!(store.list(), vec![(key, PropertyValue::Real(2.0))]);
    }
}
