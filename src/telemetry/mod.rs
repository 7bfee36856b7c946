use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

mod validation;

pub use validation::{validate_and_convert, TelemetryError};

/// Line id under which warehouse-class devices are stored.
///
/// RawMaterial and Warehouse buffers are shared by every line, so their keys
/// are normalised onto this pseudo-line regardless of the reporting topic.
pub const SHARED_LINE: &str = "factory";

/// Maximum number of products an AGV can carry.
pub const MAX_PAYLOAD: usize = 2;

/// Kind of device reporting telemetry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Agv,
    Station,
    Conveyor,
    RawMaterial,
    Warehouse,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Agv => "agv",
            DeviceKind::Station => "station",
            DeviceKind::Conveyor => "conveyor",
            DeviceKind::RawMaterial => "raw_material",
            DeviceKind::Warehouse => "warehouse",
        }
    }

    /// Buffer-only devices shared across all lines
    pub fn is_warehouse_class(self) -> bool {
        matches!(self, DeviceKind::RawMaterial | DeviceKind::Warehouse)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a device in the world state: (line, kind, device id)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub line_id: String,
    pub kind: DeviceKind,
    pub device_id: String,
}

impl DeviceKey {
    /// Build a key, folding warehouse-class devices onto [`SHARED_LINE`].
    pub fn new(line_id: impl Into<String>, kind: DeviceKind, device_id: impl Into<String>) -> Self {
        let line_id = if kind.is_warehouse_class() {
            SHARED_LINE.to_string()
        } else {
            line_id.into()
        };

        Self {
            line_id,
            kind,
            device_id: device_id.into(),
        }
    }

    pub fn agv(line_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self::new(line_id, DeviceKind::Agv, device_id)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.line_id, self.kind, self.device_id)
    }
}

/// AGV operating status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgvStatus {
    Idle,
    Moving,
    Charging,
    Interacting,
    Fault,
}

impl AgvStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgvStatus::Idle => "idle",
            AgvStatus::Moving => "moving",
            AgvStatus::Charging => "charging",
            AgvStatus::Interacting => "interacting",
            AgvStatus::Fault => "fault",
        }
    }
}

/// Station / conveyor operating status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Idle,
    Processing,
    Blocked,
    Fault,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Idle => "idle",
            ProcessStatus::Processing => "processing",
            ProcessStatus::Blocked => "blocked",
            ProcessStatus::Fault => "fault",
        }
    }
}

/// Last known state of an AGV
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgvState {
    pub status: AgvStatus,
    /// Current path-point id (e.g. "P3")
    pub position: String,
    /// Battery level, 0-100
    pub battery: f64,
    /// Carried product ids, oldest first
    pub payload: Vec<String>,
    pub target: Option<String>,
}

/// Last known state of a station or conveyor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub status: ProcessStatus,
    pub buffer: Vec<String>,
}

/// Last known state of a warehouse-class device
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    pub buffer: Vec<String>,
}

/// Per-kind device state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceState {
    Agv(AgvState),
    Station(ProcessState),
    Conveyor(ProcessState),
    RawMaterial(StorageState),
    Warehouse(StorageState),
}

impl DeviceState {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceState::Agv(_) => DeviceKind::Agv,
            DeviceState::Station(_) => DeviceKind::Station,
            DeviceState::Conveyor(_) => DeviceKind::Conveyor,
            DeviceState::RawMaterial(_) => DeviceKind::RawMaterial,
            DeviceState::Warehouse(_) => DeviceKind::Warehouse,
        }
    }

    pub fn as_agv(&self) -> Option<&AgvState> {
        match self {
            DeviceState::Agv(agv) => Some(agv),
            _ => None,
        }
    }

    /// Status label, if the kind has one (warehouses don't)
    pub fn status_label(&self) -> Option<&'static str> {
        match self {
            DeviceState::Agv(agv) => Some(agv.status.as_str()),
            DeviceState::Station(p) | DeviceState::Conveyor(p) => Some(p.status.as_str()),
            DeviceState::RawMaterial(_) | DeviceState::Warehouse(_) => None,
        }
    }

    pub fn is_fault(&self) -> bool {
        self.status_label() == Some("fault")
    }

    pub fn is_blocked(&self) -> bool {
        self.status_label() == Some("blocked")
    }

    /// Product buffer for stations, conveyors and warehouses
    pub fn buffer(&self) -> Option<&[String]> {
        match self {
            DeviceState::Agv(_) => None,
            DeviceState::Station(p) | DeviceState::Conveyor(p) => Some(&p.buffer),
            DeviceState::RawMaterial(s) | DeviceState::Warehouse(s) => Some(&s.buffer),
        }
    }
}

/// A single device-state update ready to be applied to the world store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub key: DeviceKey,
    /// Simulation timestamp, monotonic per key
    pub timestamp: f64,
    pub state: DeviceState,
}

impl DeviceUpdate {
    pub fn new(
        line_id: impl Into<String>,
        device_id: impl Into<String>,
        timestamp: f64,
        state: DeviceState,
    ) -> Self {
        Self {
            key: DeviceKey::new(line_id, state.kind(), device_id),
            timestamp,
            state,
        }
    }

    /// Convenience constructor for AGV telemetry
    pub fn agv(
        line_id: &str,
        device_id: &str,
        timestamp: f64,
        position: &str,
        battery: f64,
        status: AgvStatus,
        payload: &[&str],
    ) -> Self {
        Self::new(
            line_id,
            device_id,
            timestamp,
            DeviceState::Agv(AgvState {
                status,
                position: position.to_string(),
                battery,
                payload: payload.iter().map(|p| p.to_string()).collect(),
                target: None,
            }),
        )
    }
}

/// Raw telemetry message as published on the factory bus.
///
/// Field names follow the bus convention (`source_id`, `current_point`,
/// `battery_level`, ...). Kind-specific fields are collected into `fields`
/// and only interpreted by [`validate_and_convert`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryMessage {
    /// Producing line; may be empty for warehouse-class devices
    #[serde(default)]
    pub line_id: String,

    pub kind: DeviceKind,

    pub source_id: String,

    /// Simulation timestamp (seconds)
    pub timestamp: f64,

    /// Kind-specific state fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TelemetryMessage {
    /// Validate the message and convert it into a typed [`DeviceUpdate`].
    pub fn into_update(self) -> Result<DeviceUpdate, TelemetryError> {
        validate_and_convert(self)
    }
}
