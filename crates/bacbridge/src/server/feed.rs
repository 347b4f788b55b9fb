//! Feed Publisher
//!
//! Read-only view over what the client already knows. Renderers poll it; it
//! never puts anything on the network.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bacnet::cache::ValueCache;
use crate::bacnet::overrides::OverrideStore;
use crate::bacnet::registry::DeviceRegistry;
use crate::bacnet::types::{Device, PropertyKey, PropertyValue};

/// Where a point value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PointSource {
    /// Operator-set simulation value
    Override,
    /// Last successful read from the device
    Network,
}

/// Current value of one property as seen by the feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointSnapshot {
    pub key: PropertyKey,
    pub value: PropertyValue,
    pub source: PointSource,
    /// When the device reported it; absent for overrides
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct FeedPublisher {
    registry: Arc<DeviceRegistry>,
    overrides: Arc<OverrideStore>,
    cache: Arc<ValueCache>,
}

impl FeedPublisher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        overrides: Arc<OverrideStore>,
        cache: Arc<ValueCache>,
    ) -> Self {
        Self {
            registry,
            overrides,
            cache,
        }
    }

    /// Device table, ordered by device id
    pub fn devices(&self) -> Vec<Device> {
        self.registry.snapshot()
    }

    pub fn device(&self, device_id: u32) -> Option<Device> {
        self.registry.lookup(device_id)
    }

    /// Override first, then the last read value
    pub fn point(&self, key: &PropertyKey) -> Option<PointSnapshot> {
        if let Some(value) = self.overrides.current(key) {
            return Some(PointSnapshot {
                key: *key,
                value,
                source: PointSource::Override,
                updated_at: None,
            });
        }

        self.cache.get(key).map(|cached| PointSnapshot {
            key: *key,
            value: cached.value,
            source: PointSource::Network,
            updated_at: Some(cached.updated_at),
        })
    }

    /// Every active override
    pub fn overrides(&self) -> Vec<PointSnapshot> {
        self.overrides
            .list()
            .into_iter()
            .map(|(key, value)| PointSnapshot {
                key,
                value,
                source: PointSource::Override,
                updated_at: None,
            })
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::types::{DeviceMetadata, ObjectType};

    fn publisher() -> FeedPublisher {
        FeedPublisher::new(
            Arc::new(DeviceRegistry::new()),
            Arc::new(OverrideStore::new()),
            Arc::new(ValueCache::new()),
        )
    }

    #[test]
    fn test_override_wins_over_cache() {
        let feed = publisher();
        let key = PropertyKey::present_value(1, ObjectType::AnalogValue, 2);
        assert!(feed.point(&key).is_none());

        feed.cache.record(key, PropertyValue::Real(70.0));
        let point = feed.point(&key).unwrap();
        assert_eq!(point.source, PointSource::Network);
        assert!(point.updated_at.is_some());

        feed.overrides.set(key, PropertyValue::Real(55.0));
        let point = feed.point(&key).unwrap();
        assert_eq!(point.source, PointSource::Override);
        assert_eq!(point.value, PropertyValue::Real(55.0));
        assert_eq!(feed.overrides().len(), 1);

        feed.overrides.clear(&key);
        assert_eq!(feed.point(&key).unwrap().value, PropertyValue::Real(70.0));
    }

    #[test]
    fn test_device_table() {
        let feed = publisher();
        for id in [30, 10, 20] {
            let addr = format!("10.0.0.{}:47808", id).parse().unwrap();
            feed.registry.upsert(id, addr, DeviceMetadata::default());
        }
        let ids: Vec<u32> = feed.devices().iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert!(feed.device(20).is_some());
        assert!(feed.device(40).is_none());
        assert_eq!(feed.device_count(), 3);
    }
}
