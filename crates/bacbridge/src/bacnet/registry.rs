//! Device registry
//!
//! Built by discovery, consulted by reads and writes. Entries are never
//! evicted; a device that goes quiet stays known with its last address.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use chrono::Utc;
use parking_lot::RwLock;

use super::types::{Device, DeviceMetadata};

/// What an upsert did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// Known device answered from a different address
    Readdressed { previous: SocketAddr },
}

/// Table of discovered devices keyed by device instance
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<u32, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device or refresh an existing one
    pub fn upsert(&self, device_id: u32, address: SocketAddr, metadata: DeviceMetadata) -> Upsert {
        let now = Utc::now();
        let mut devices = self.devices.write();

        match devices.get_mut(&device_id) {
            Some(device) => {
                let previous = device.address;
                device.address = address;
                device.metadata = metadata;
                device.last_seen = now;
                if previous != address {
                    tracing::info!(
                        "Device {} moved from {} to {}",
                        device_id,
                        previous,
                        address
                    );
                    Upsert::Readdressed { previous }
                } else {
                    Upsert::Updated
                }
            }
            None => {
                devices.insert(
                    device_id,
                    Device {
                        device_id,
                        address,
                        metadata,
                        first_seen: now,
                        last_seen: now,
                    },
                );
                Upsert::Inserted
            }
        }
    }

    pub fn lookup(&self, device_id: u32) -> Option<Device> {
        self.devices.read().get(&device_id).cloned()
    }

    /// Address of a known device
    pub fn address_of(&self, device_id: u32) -> Option<SocketAddr> {
        self.devices.read().get(&device_id).map(|d| d.address)
    }

    /// Point-in-time copy ordered by device instance
    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn metadata(vendor_id: u16) -> DeviceMetadata {
        DeviceMetadata {
            vendor_id,
            vendor_name: Some("Acme Controls".to_string()),
            ..DeviceMetadata::default()
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.upsert(100, addr("10.0.0.5:47808"), metadata(7)), Upsert::Inserted);
        let first = registry.lookup(100).unwrap();

        assert_eq!(registry.upsert(100, addr("10.0.0.5:47808"), metadata(7)), Upsert::Updated);
        let second = registry.lookup(100).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(first.address, second.address);
        assert_eq!(first.metadata, second.metadata);
        assert_eq!(first.first_seen, second.first_seen);
        assert!(second.last_seen >= first.last_seen);
    }

    #[test]
    fn test_readdressed_device_keeps_identity() {
        let registry = DeviceRegistry::new();
        registry.upsert(100, addr("10.0.0.5:47808"), metadata(7));
        let outcome = registry.upsert(100, addr("10.0.0.9:47808"), metadata(8));

        assert_eq!(outcome, Upsert::Readdressed { previous: addr("10.0.0.5:47808") });
        let device = registry.lookup(100).unwrap();
        assert_eq!(device.address, addr("10.0.0.9:47808"));
        assert_eq!(device.metadata.vendor_id, 8);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_is_ordered_copy() {
        let registry = DeviceRegistry::new();
        registry.upsert(300, addr("10.0.0.3:47808"), metadata(1));
        registry.upsert(100, addr("10.0.0.1:47808"), metadata(1));
        registry.upsert(200, addr("10.0.0.2:47808"), metadata(1));

        let snapshot = registry.snapshot();
        registry.upsert(50, addr("10.0.0.4:47808"), metadata(1));

        let ids: Vec<u32> = snapshot.iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec![100, 200, 300]);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_lookup_missing() {
        let registry = DeviceRegistry::new();
        assert!(registry.lookup(1).is_none());
        assert!(registry.address_of(1).is_none());
        assert!(registry.is_empty());
    }
}
