use super::{
    AgvState, AgvStatus, DeviceKind, DeviceState, DeviceUpdate, ProcessState, ProcessStatus,
    StorageState, TelemetryMessage, MAX_PAYLOAD,
};
use serde_json::{Map, Value};
use std::fmt;

/// Validation errors for incoming telemetry
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryError {
    MissingSourceId,
    MissingLineId(DeviceKind),
    InvalidTimestamp(f64),
    MissingField(&'static str),
    InvalidField { field: &'static str, reason: String },
    UnknownStatus { kind: DeviceKind, status: String },
    BatteryOutOfRange(f64),
    PayloadTooLarge(usize),
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryError::MissingSourceId => write!(f, "source_id is required"),
            TelemetryError::MissingLineId(kind) => {
                write!(f, "line_id is required for {} telemetry", kind)
            }
            TelemetryError::InvalidTimestamp(ts) => {
                write!(f, "timestamp must be finite and non-negative, got {}", ts)
            }
            TelemetryError::MissingField(field) => write!(f, "field '{}' is required", field),
            TelemetryError::InvalidField { field, reason } => {
                write!(f, "invalid field '{}': {}", field, reason)
            }
            TelemetryError::UnknownStatus { kind, status } => {
                write!(f, "unknown {} status '{}'", kind, status)
            }
            TelemetryError::BatteryOutOfRange(level) => {
                write!(f, "battery_level must be within 0-100, got {}", level)
            }
            TelemetryError::PayloadTooLarge(len) => {
                write!(f, "payload holds {} items, maximum is {}", len, MAX_PAYLOAD)
            }
        }
    }
}

impl std::error::Error for TelemetryError {}

/// Validates a raw telemetry message and converts it into a [`DeviceUpdate`].
///
/// Validation rules:
/// - `source_id` non-empty; `line_id` non-empty except for warehouse-class kinds
/// - `timestamp` finite and non-negative
/// - AGV: `status`, `current_point`, `battery_level` required; battery in 0-100;
///   `payload` at most [`MAX_PAYLOAD`] items
/// - Station / conveyor: `status` required
/// - Status strings must belong to the kind's status set
pub fn validate_and_convert(msg: TelemetryMessage) -> Result<DeviceUpdate, TelemetryError> {
    if msg.source_id.is_empty() {
        return Err(TelemetryError::MissingSourceId);
    }
    if msg.line_id.is_empty() && !msg.kind.is_warehouse_class() {
        return Err(TelemetryError::MissingLineId(msg.kind));
    }
    if !msg.timestamp.is_finite() || msg.timestamp < 0.0 {
        return Err(TelemetryError::InvalidTimestamp(msg.timestamp));
    }

    let fields = &msg.fields;
    let state = match msg.kind {
        DeviceKind::Agv => {
            let status = parse_agv_status(&required_str(fields, "status")?)?;
            let position = required_str(fields, "current_point")?;
            let battery = required_number(fields, "battery_level")?;
            if !(0.0..=100.0).contains(&battery) {
                return Err(TelemetryError::BatteryOutOfRange(battery));
            }
            let payload = string_list(fields, "payload")?;
            if payload.len() > MAX_PAYLOAD {
                return Err(TelemetryError::PayloadTooLarge(payload.len()));
            }
            let target = optional_str(fields, "target_point")?;

            DeviceState::Agv(AgvState {
                status,
                position,
                battery,
                payload,
                target,
            })
        }
        DeviceKind::Station | DeviceKind::Conveyor => {
            let status = parse_process_status(msg.kind, &required_str(fields, "status")?)?;
            let state = ProcessState {
                status,
                buffer: string_list(fields, "buffer")?,
            };
            if msg.kind == DeviceKind::Station {
                DeviceState::Station(state)
            } else {
                DeviceState::Conveyor(state)
            }
        }
        DeviceKind::RawMaterial | DeviceKind::Warehouse => {
            let state = StorageState {
                buffer: string_list(fields, "buffer")?,
            };
            if msg.kind == DeviceKind::RawMaterial {
                DeviceState::RawMaterial(state)
            } else {
                DeviceState::Warehouse(state)
            }
        }
    };

    Ok(DeviceUpdate::new(msg.line_id, msg.source_id, msg.timestamp, state))
}

fn parse_agv_status(raw: &str) -> Result<AgvStatus, TelemetryError> {
    match raw {
        "idle" => Ok(AgvStatus::Idle),
        "moving" => Ok(AgvStatus::Moving),
        "charging" => Ok(AgvStatus::Charging),
        "interacting" => Ok(AgvStatus::Interacting),
        "fault" => Ok(AgvStatus::Fault),
        other => Err(TelemetryError::UnknownStatus {
            kind: DeviceKind::Agv,
            status: other.to_string(),
        }),
    }
}

fn parse_process_status(kind: DeviceKind, raw: &str) -> Result<ProcessStatus, TelemetryError> {
    match raw {
        "idle" => Ok(ProcessStatus::Idle),
        // The factory bus reports busy stations as "working"
        "processing" | "working" => Ok(ProcessStatus::Processing),
        "blocked" => Ok(ProcessStatus::Blocked),
        "fault" => Ok(ProcessStatus::Fault),
        other => Err(TelemetryError::UnknownStatus {
            kind,
            status: other.to_string(),
        }),
    }
}

fn required_str(fields: &Map<String, Value>, field: &'static str) -> Result<String, TelemetryError> {
    match fields.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | Some(Value::Null) | None => Err(TelemetryError::MissingField(field)),
        Some(other) => Err(TelemetryError::InvalidField {
            field,
            reason: format!("expected string, got {}", other),
        }),
    }
}

fn optional_str(
    fields: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, TelemetryError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(TelemetryError::InvalidField {
            field,
            reason: format!("expected string or null, got {}", other),
        }),
    }
}

fn required_number(fields: &Map<String, Value>, field: &'static str) -> Result<f64, TelemetryError> {
    match fields.get(field) {
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| TelemetryError::InvalidField {
            field,
            reason: "not representable as f64".to_string(),
        }),
        None | Some(Value::Null) => Err(TelemetryError::MissingField(field)),
        Some(other) => Err(TelemetryError::InvalidField {
            field,
            reason: format!("expected number, got {}", other),
        }),
    }
}

/// Product id list; a missing field reads as an empty list
fn string_list(fields: &Map<String, Value>, field: &'static str) -> Result<Vec<String>, TelemetryError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(TelemetryError::InvalidField {
                    field,
                    reason: format!("expected product id string, got {}", other),
                }),
            })
            .collect(),
        Some(other) => Err(TelemetryError::InvalidField {
            field,
            reason: format!("expected array, got {}", other),
        }),
    }
}
