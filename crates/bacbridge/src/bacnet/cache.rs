//! Last value seen on the wire for each property

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::types::{PropertyKey, PropertyValue};

/// A value a device returned to a read
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedValue {
    pub value: PropertyValue,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ValueCache {
    values: DashMap<PropertyKey, CachedValue>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: PropertyKey, value: PropertyValue) {
        self.values.insert(
            key,
            CachedValue {
                value,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, key: &PropertyKey) -> Option<CachedValue> {
        self.values.get(key).map(|v| v.value().clone())
    }
}
