use crate::state::store::DeviceRecord;
use crate::telemetry::{AgvState, DeviceKey, DeviceKind, DeviceState, SHARED_LINE};
use chrono::{DateTime, Utc};
use serde::ser::Serializer;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Immutable point-in-time copy of the world store.
///
/// Taken once per dispatch cycle; decision making and guard validation read
/// this copy while telemetry keeps flowing into the live store.
#[derive(Clone, Debug, Serialize)]
pub struct WorldSnapshot {
    pub taken_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_devices")]
    devices: BTreeMap<DeviceKey, DeviceRecord>,

    /// Opaque KPI summary, passed through untouched
    pub kpi_summary: Option<Value>,
}

/// Why a snapshot needs attention regardless of provider output
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UrgentReason {
    BatteryBelowFloor { level: f64 },
    Fault,
    Blocked,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UrgentCondition {
    pub key: DeviceKey,
    #[serde(flatten)]
    pub reason: UrgentReason,
}

impl fmt::Display for UrgentCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            UrgentReason::BatteryBelowFloor { level } => {
                write!(f, "{} battery critically low ({:.1}%)", self.key, level)
            }
            UrgentReason::Fault => write!(f, "{} in fault", self.key),
            UrgentReason::Blocked => write!(f, "{} blocked", self.key),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AgvSummary {
    pub status: String,
    pub battery: f64,
    pub position: String,
    pub payload_count: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProcessSummary {
    pub status: String,
    pub buffer_count: usize,
}

/// Per-line status overview
#[derive(Clone, Debug, Serialize)]
pub struct LineSummary {
    pub line_id: String,
    pub agvs: BTreeMap<String, AgvSummary>,
    pub stations: BTreeMap<String, ProcessSummary>,
    pub conveyors: BTreeMap<String, ProcessSummary>,
    /// Products currently sitting in station and conveyor buffers
    pub total_products: usize,
    pub urgent_issues: Vec<String>,
}

/// Compact description of a snapshot for the decision log
#[derive(Clone, Debug, Serialize)]
pub struct SnapshotSummary {
    pub taken_at: DateTime<Utc>,
    pub device_count: usize,
    pub agv_count: usize,
    pub lines: Vec<String>,
    pub urgent_issues: Vec<String>,
}

impl WorldSnapshot {
    pub fn new(devices: BTreeMap<DeviceKey, DeviceRecord>, kpi_summary: Option<Value>) -> Self {
        Self {
            taken_at: Utc::now(),
            devices,
            kpi_summary,
        }
    }

    /// Build a snapshot directly from device states (timestamps zeroed)
    pub fn from_states(states: impl IntoIterator<Item = (DeviceKey, DeviceState)>) -> Self {
        let now = Utc::now();
        let devices = states
            .into_iter()
            .map(|(key, state)| {
                (
                    key,
                    DeviceRecord {
                        state,
                        timestamp: 0.0,
                        received_at: now,
                    },
                )
            })
            .collect();
        Self::new(devices, None)
    }

    pub fn get(&self, key: &DeviceKey) -> Option<&DeviceRecord> {
        self.devices.get(key)
    }

    /// Look up a device; warehouse-class kinds resolve to the shared line
    pub fn device(&self, line_id: &str, kind: DeviceKind, device_id: &str) -> Option<&DeviceState> {
        self.devices
            .get(&DeviceKey::new(line_id, kind, device_id))
            .map(|r| &r.state)
    }

    pub fn agv(&self, line_id: &str, device_id: &str) -> Option<&AgvState> {
        self.device(line_id, DeviceKind::Agv, device_id)
            .and_then(DeviceState::as_agv)
    }

    /// All AGVs in key order
    pub fn agvs(&self) -> impl Iterator<Item = (&DeviceKey, &AgvState)> {
        self.devices
            .iter()
            .filter_map(|(key, record)| record.state.as_agv().map(|agv| (key, agv)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceKey, &DeviceRecord)> {
        self.devices.iter()
    }

    /// Production lines with at least one reporting device
    pub fn line_ids(&self) -> BTreeSet<String> {
        self.devices
            .keys()
            .filter(|key| key.line_id != SHARED_LINE)
            .map(|key| key.line_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Conditions that justify running the fallback policy when the guard
    /// accepted nothing: AGVs under the hard floor, faulted or blocked devices.
    pub fn urgent_conditions(&self, battery_floor: f64) -> Vec<UrgentCondition> {
        let mut conditions = Vec::new();

        for (key, record) in &self.devices {
            if let DeviceState::Agv(agv) = &record.state {
                if agv.battery < battery_floor {
                    conditions.push(UrgentCondition {
                        key: key.clone(),
                        reason: UrgentReason::BatteryBelowFloor { level: agv.battery },
                    });
                }
            }
            if record.state.is_fault() {
                conditions.push(UrgentCondition {
                    key: key.clone(),
                    reason: UrgentReason::Fault,
                });
            } else if record.state.is_blocked() {
                conditions.push(UrgentCondition {
                    key: key.clone(),
                    reason: UrgentReason::Blocked,
                });
            }
        }

        conditions
    }

    pub fn line_summary(&self, line_id: &str, battery_floor: f64) -> LineSummary {
        let mut summary = LineSummary {
            line_id: line_id.to_string(),
            agvs: BTreeMap::new(),
            stations: BTreeMap::new(),
            conveyors: BTreeMap::new(),
            total_products: 0,
            urgent_issues: Vec::new(),
        };

        for (key, record) in self.devices.iter().filter(|(k, _)| k.line_id == line_id) {
            match &record.state {
                DeviceState::Agv(agv) => {
                    summary.agvs.insert(
                        key.device_id.clone(),
                        AgvSummary {
                            status: agv.status.as_str().to_string(),
                            battery: agv.battery,
                            position: agv.position.clone(),
                            payload_count: agv.payload.len(),
                        },
                    );
                }
                DeviceState::Station(p) | DeviceState::Conveyor(p) => {
                    summary.total_products += p.buffer.len();
                    let entry = ProcessSummary {
                        status: p.status.as_str().to_string(),
                        buffer_count: p.buffer.len(),
                    };
                    if key.kind == DeviceKind::Station {
                        summary.stations.insert(key.device_id.clone(), entry);
                    } else {
                        summary.conveyors.insert(key.device_id.clone(), entry);
                    }
                }
                DeviceState::RawMaterial(_) | DeviceState::Warehouse(_) => {}
            }
        }

        summary.urgent_issues = self
            .urgent_conditions(battery_floor)
            .into_iter()
            .filter(|c| c.key.line_id == line_id)
            .map(|c| c.to_string())
            .collect();

        summary
    }

    pub fn summary(&self, battery_floor: f64) -> SnapshotSummary {
        SnapshotSummary {
            taken_at: self.taken_at,
            device_count: self.devices.len(),
            agv_count: self.agvs().count(),
            lines: self.line_ids().into_iter().collect(),
            urgent_issues: self
                .urgent_conditions(battery_floor)
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

/// JSON maps need string keys, so devices are written as a list of
/// `{key, record}` entries.
fn serialize_devices<S>(
    devices: &BTreeMap<DeviceKey, DeviceRecord>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    #[derive(Serialize)]
    struct Entry<'a> {
        key: &'a DeviceKey,
        record: &'a DeviceRecord,
    }

    serializer.collect_seq(devices.iter().map(|(key, record)| Entry { key, record }))
}
