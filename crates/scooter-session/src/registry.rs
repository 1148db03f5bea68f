//! Discovery registry with per-device advertisement expiry
//!
//! Scooters advertise continuously while powered on, so the registry keeps
//! one record per [`DeviceId`] and forgets a device once it has not been seen
//! for `advertisement_timeout`. Each observation (re)arms a single expiry
//! timer for its device; timers are never stacked.
//!
//! # Expiry races
//!
//! Every observation bumps a generation counter and the timer task carries
//! the generation it was armed with. An expiry only removes the record when
//! its generation is still current, so a timer that fires just after a fresh
//! observation is a no-op. Observation and expiry both run under the same
//! lock, which makes them atomic per identifier.
//!
//! Records are kept in first-seen order so a device list rendered from
//! [`DiscoveryRegistry::snapshot`] does not jump around while refreshing.

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::config::DiscoveryConfig;
use crate::device::{DeviceId, DiscoveredScooter};

/// Result of recording one advertisement
#[derive(Debug, Clone)]
pub struct Observation {
    /// Generation the expiry timer was armed with
    pub generation: u64,
    /// Service data of the record this observation replaced, if any
    pub previous_service_data: Option<Bytes>,
    /// Service data carried by this observation
    pub service_data: Bytes,
}

impl Observation {
    /// The device was not listed before this observation
    pub fn is_new(&self) -> bool {
        self.previous_service_data.is_none()
    }

    /// A known device advertised different service data than last time
    pub fn service_data_changed(&self) -> bool {
        matches!(&self.previous_service_data, Some(prev) if *prev != self.service_data)
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Advertisements recorded
    pub observations: u64,
    /// Devices that appeared for the first time (or after expiring)
    pub new_devices: u64,
    /// Advertisements that refreshed a known device
    pub refreshes: u64,
    /// Refreshes whose service data differed from the previous one
    pub service_data_changes: u64,
    /// Records removed by their expiry timer
    pub expirations: u64,
    /// Timers that fired after being superseded
    pub stale_expiries: u64,
}

struct ExpiryTimer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct RegistryInner {
    devices: IndexMap<DeviceId, DiscoveredScooter>,
    timers: HashMap<DeviceId, ExpiryTimer>,
    next_generation: u64,
    stats: RegistryStats,
}

impl RegistryInner {
    fn expire(&mut self, id: &DeviceId, generation: u64) -> bool {
        match self.timers.get(id) {
            Some(timer) if timer.generation == generation => {
                self.timers.remove(id);
                self.devices.shift_remove(id);
                self.stats.expirations += 1;
                debug!(device = %id, "Scooter advertisement expired");
                true
            }
            _ => {
                self.stats.stale_expiries += 1;
                trace!(device = %id, generation, "Ignoring superseded expiry");
                false
            }
        }
    }
}

/// Set of currently visible scooters
///
/// Clones share the same underlying registry.
#[derive(Clone)]
pub struct DiscoveryRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    timeout: Duration,
}

impl DiscoveryRegistry {
    /// Create a registry with the given advertisement timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            timeout,
        }
    }

    /// Create from discovery configuration
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(config.advertisement_timeout)
    }

    /// Insert or replace the record for `record.id` and re-arm its timer
    ///
    /// Must be called from within a Tokio runtime; the expiry timer is a
    /// spawned task.
    pub fn observe(&self, record: DiscoveredScooter) -> Observation {
        let id = record.id.clone();
        let service_data = record.service_data.clone();

        let mut inner = self.inner.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;

        // IndexMap::insert keeps the original position of an existing key
        let previous = inner.devices.insert(id.clone(), record);
        let observation = Observation {
            generation,
            previous_service_data: previous.map(|p| p.service_data),
            service_data,
        };

        inner.stats.observations += 1;
        if observation.is_new() {
            inner.stats.new_devices += 1;
            debug!(device = %id, "New scooter discovered");
        } else {
            inner.stats.refreshes += 1;
            if observation.service_data_changed() {
                inner.stats.service_data_changes += 1;
                debug!(device = %id, "Scooter service data changed");
            }
        }

        let handle = self.spawn_expiry(id.clone(), generation);
        if let Some(old) = inner.timers.insert(id, ExpiryTimer { generation, handle }) {
            old.handle.abort();
        }

        observation
    }

    fn spawn_expiry(&self, id: DeviceId, generation: u64) -> AbortHandle {
        let weak: Weak<Mutex<RegistryInner>> = Arc::downgrade(&self.inner);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.lock().expire(&id, generation);
            }
        })
        .abort_handle()
    }

    /// Remove `id` if `generation` is still its latest observation
    ///
    /// Returns `true` if a record was removed. Called by the expiry timers;
    /// a superseded generation is a no-op.
    pub fn expire(&self, id: &DeviceId, generation: u64) -> bool {
        self.inner.lock().expire(id, generation)
    }

    /// Look up one record
    pub fn get(&self, id: &DeviceId) -> Option<DiscoveredScooter> {
        self.inner.lock().devices.get(id).cloned()
    }

    /// Whether `id` is currently listed
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.inner.lock().devices.contains_key(id)
    }

    /// All listed records in first-seen order
    pub fn snapshot(&self) -> Vec<DiscoveredScooter> {
        self.inner.lock().devices.values().cloned().collect()
    }

    /// Number of listed devices
    pub fn len(&self) -> usize {
        self.inner.lock().devices.len()
    }

    /// Check if no device is listed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record and cancel all timers
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for (_, timer) in inner.timers.drain() {
            timer.handle.abort();
        }
        inner.devices.clear();
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        self.inner.lock().stats.clone()
    }

    /// Get the configured advertisement timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for DiscoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryRegistry")
            .field("devices", &self.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
