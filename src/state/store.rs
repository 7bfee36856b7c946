use crate::state::event::Event;
use crate::state::snapshot::WorldSnapshot;
use crate::telemetry::{DeviceKey, DeviceKind, DeviceState, DeviceUpdate};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

/// Stored device state plus the telemetry timestamp that produced it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub state: DeviceState,
    /// Simulation timestamp of the winning update
    pub timestamp: f64,
    /// Wall-clock time the update was applied
    pub received_at: DateTime<Utc>,
}

/// Errors returned by [`WorldStateStore::apply`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Incoming timestamp is not newer than the stored one; update dropped
    StaleUpdate {
        key: DeviceKey,
        incoming: f64,
        stored: f64,
    },
    /// The key's kind disagrees with the state payload
    KindMismatch { key: DeviceKey, reported: DeviceKind },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::StaleUpdate {
                key,
                incoming,
                stored,
            } => write!(
                f,
                "stale update for {}: timestamp {} is not newer than {}",
                key, incoming, stored
            ),
            StoreError::KindMismatch { key, reported } => {
                write!(f, "update for {} carries {} state", key, reported)
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// World state store: last-known state of every device.
///
/// Telemetry producers call [`apply`](Self::apply) concurrently; per-key
/// exclusion comes from the DashMap shard locks. The `gate` lock is taken
/// shared by writers and exclusive by [`snapshot`](Self::snapshot), so a
/// snapshot never observes a half-applied batch of concurrent updates.
pub struct WorldStateStore {
    devices: DashMap<DeviceKey, DeviceRecord>,

    gate: RwLock<()>,

    /// Opaque KPI summary forwarded to decision providers
    kpi_summary: RwLock<Option<Value>>,

    stale_updates: AtomicU64,
}

impl WorldStateStore {
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
            gate: RwLock::new(()),
            kpi_summary: RwLock::new(None),
            stale_updates: AtomicU64::new(0),
        }
    }

    /// Apply a single device update (core state mutation)
    ///
    /// Returns:
    /// - `Ok(Some(event))` for a new device (full-state creation event) or
    ///   when at least one tracked field changed
    /// - `Ok(None)` when the update is newer but identical
    /// - `Err(StoreError::StaleUpdate)` when the timestamp is not newer than
    ///   the stored one (last-write-wins by timestamp)
    pub fn apply(&self, update: DeviceUpdate) -> Result<Option<Event>, StoreError> {
        let DeviceUpdate {
            key,
            timestamp,
            state,
        } = update;

        if key.kind != state.kind() {
            return Err(StoreError::KindMismatch {
                key,
                reported: state.kind(),
            });
        }

        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();

        match self.devices.entry(key) {
            Entry::Vacant(vacant) => {
                let event = Event::created(vacant.key().clone(), &state, timestamp);
                debug!(device = %vacant.key(), timestamp, "New device registered");
                vacant.insert(DeviceRecord {
                    state,
                    timestamp,
                    received_at: now,
                });
                Ok(Some(event))
            }
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get().timestamp;
                if timestamp <= stored {
                    self.stale_updates.fetch_add(1, Ordering::Relaxed);
                    let key = occupied.key().clone();
                    warn!(
                        device = %key,
                        incoming = timestamp,
                        stored,
                        "Stale telemetry dropped"
                    );
                    return Err(StoreError::StaleUpdate {
                        key,
                        incoming: timestamp,
                        stored,
                    });
                }

                let event = Event::diff(occupied.key(), &occupied.get().state, &state, timestamp);
                occupied.insert(DeviceRecord {
                    state,
                    timestamp,
                    received_at: now,
                });
                Ok(event)
            }
        }
    }

    /// Point-in-time copy of the entire store
    pub fn snapshot(&self) -> WorldSnapshot {
        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);

        let devices = self
            .devices
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let kpi_summary = self
            .kpi_summary
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        WorldSnapshot::new(devices, kpi_summary)
    }

    /// Get a device record by key
    pub fn get(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        self.devices.get(key).map(|r| r.clone())
    }

    /// Replace the opaque KPI summary carried in snapshots
    pub fn set_kpi_summary(&self, summary: Value) {
        *self
            .kpi_summary
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(summary);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Number of stale updates dropped since startup
    pub fn stale_update_count(&self) -> u64 {
        self.stale_updates.load(Ordering::Relaxed)
    }
}

impl Default for WorldStateStore {
    fn default() -> Self {
        Self::new()
    }
}
