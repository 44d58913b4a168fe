//! Per-device state for the lifetime of the process.
//!
//! The registry remembers every device that has advertised since start-up,
//! keeps only its latest reading, and records whether its Home Assistant
//! discovery message has been queued. Entries are never removed.

use crate::mac_address::MacAddress;
use crate::measurement::Measurement;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// What the registry knew about a device before the latest observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// First time this address has been seen in this process
    pub is_new_device: bool,
    /// No discovery message has been queued for the device yet
    pub needs_announcement: bool,
}

#[derive(Debug, Clone)]
struct DeviceRecord {
    latest: Measurement,
    discovery_announced: bool,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<MacAddress, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `measurement` as the latest reading for `address`.
    ///
    /// The previous reading, if any, is replaced rather than merged.
    pub fn observe(&mut self, address: MacAddress, measurement: Measurement) -> Observation {
        match self.devices.get_mut(&address) {
            Some(record) => {
                record.latest = measurement;
                Observation {
                    is_new_device: false,
                    needs_announcement: !record.discovery_announced,
                }
            }
            None => {
                self.devices.insert(
                    address,
                    DeviceRecord {
                        latest: measurement,
                        discovery_announced: false,
                    },
                );
                Observation {
                    is_new_device: true,
                    needs_announcement: true,
                }
            }
        }
    }

    /// Record that the discovery message for `address` has been queued.
    ///
    /// Returns `true` only on the call that flips the flag.
    pub fn mark_announced(&mut self, address: &MacAddress) -> bool {
        match self.devices.get_mut(address) {
            Some(record) if !record.discovery_announced => {
                record.discovery_announced = true;
                true
            }
            _ => false,
        }
    }

    /// Forget that the discovery message for `address` was queued, so the
    /// next observation announces the device again.
    ///
    /// Returns `true` if the flag was set.
    pub fn clear_announced(&mut self, address: &MacAddress) -> bool {
        match self.devices.get_mut(address) {
            Some(record) if record.discovery_announced => {
                record.discovery_announced = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_announced(&self, address: &MacAddress) -> bool {
        self.devices
            .get(address)
            .is_some_and(|record| record.discovery_announced)
    }

    pub fn latest(&self, address: &MacAddress) -> Option<&Measurement> {
        self.devices.get(address).map(|record| &record.latest)
    }

    /// Copy of the latest reading per device, sorted by address for logging.
    pub fn snapshot(&self) -> BTreeMap<MacAddress, Measurement> {
        self.devices
            .iter()
            .map(|(address, record)| (*address, record.latest.clone()))
            .collect()
    }

    pub fn known_count(&self) -> usize {
        self.devices.len()
    }

    pub fn contains(&self, address: &MacAddress) -> bool {
        self.devices.contains_key(address)
    }

    /// Whether every address in `targets` has been observed at least once.
    pub fn all_seen(&self, targets: &BTreeSet<MacAddress>) -> bool {
        targets.iter().all(|address| self.contains(address))
    }
}
