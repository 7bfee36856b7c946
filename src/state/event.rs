use crate::telemetry::{DeviceKey, DeviceKind, DeviceState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Device attribute tracked for change detection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Status,
    Position,
    Target,
    Battery,
    Payload,
    Buffer,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Field::Status => "status",
            Field::Position => "position",
            Field::Target => "target",
            Field::Battery => "battery",
            Field::Payload => "payload",
            Field::Buffer => "buffer",
        }
    }
}

/// Value of a tracked field
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Level(f64),
    Items(Vec<String>),
    Absent,
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_level(&self) -> Option<f64> {
        match self {
            FieldValue::Level(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_items(&self) -> Option<&[String]> {
        match self {
            FieldValue::Items(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Level(v) => write!(f, "{:.1}%", v),
            FieldValue::Items(items) => write!(f, "{} items", items.len()),
            FieldValue::Absent => f.write_str("none"),
        }
    }
}

/// Old/new pair for one changed field (`old` is None on creation)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Option<FieldValue>,
    pub new: FieldValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// First report from a previously unseen device
    Created,
    Updated,
}

/// Change event derived from applying telemetry to the world store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub key: DeviceKey,
    pub changes: BTreeMap<Field, FieldChange>,
    pub timestamp: f64,
    pub raw_kind: EventKind,
}

impl Event {
    /// Full-state event for a device seen for the first time
    pub fn created(key: DeviceKey, state: &DeviceState, timestamp: f64) -> Self {
        let changes = tracked_fields(state)
            .into_iter()
            .map(|(field, value)| (field, FieldChange { old: None, new: value }))
            .collect();

        Self {
            key,
            changes,
            timestamp,
            raw_kind: EventKind::Created,
        }
    }

    /// Field-by-field diff; None when nothing tracked changed
    pub fn diff(key: &DeviceKey, old: &DeviceState, new: &DeviceState, timestamp: f64) -> Option<Self> {
        let before: BTreeMap<Field, FieldValue> = tracked_fields(old).into_iter().collect();
        let mut changes = BTreeMap::new();

        for (field, value) in tracked_fields(new) {
            let previous = before.get(&field);
            if previous != Some(&value) {
                changes.insert(
                    field,
                    FieldChange {
                        old: previous.cloned(),
                        new: value,
                    },
                );
            }
        }

        if changes.is_empty() {
            return None;
        }

        Some(Self {
            key: key.clone(),
            changes,
            timestamp,
            raw_kind: EventKind::Updated,
        })
    }

    pub fn is_creation(&self) -> bool {
        self.raw_kind == EventKind::Created
    }

    pub fn change(&self, field: Field) -> Option<&FieldChange> {
        self.changes.get(&field)
    }

    /// Stable textual signature of the key and changed values, used for dedup
    pub fn signature(&self) -> String {
        let changes = serde_json::to_string(&self.changes).unwrap_or_default();
        format!("{}|{:?}|{}", self.key, self.raw_kind, changes)
    }

    /// Event category: agv, station, conveyor or warehouse
    pub fn category(&self) -> &'static str {
        match self.key.kind {
            DeviceKind::Agv => "agv",
            DeviceKind::Station => "station",
            DeviceKind::Conveyor => "conveyor",
            DeviceKind::RawMaterial | DeviceKind::Warehouse => "warehouse",
        }
    }

    /// Context tags: kind label, device id, line id
    pub fn tags(&self) -> Vec<String> {
        vec![
            kind_label(self.key.kind).to_string(),
            self.key.device_id.clone(),
            self.key.line_id.clone(),
        ]
    }

    /// Human-readable one-line description for decision context and logs
    pub fn describe(&self) -> String {
        let subject = format!(
            "{} {}/{}",
            kind_label(self.key.kind),
            self.key.line_id,
            self.key.device_id
        );

        if self.is_creation() {
            let fields: Vec<String> = self
                .changes
                .iter()
                .map(|(field, change)| format!("{} {}", field.as_str(), change.new))
                .collect();
            return format!("{} reported for the first time: {}", subject, fields.join(", "));
        }

        let mut parts = Vec::with_capacity(self.changes.len());
        for (field, change) in &self.changes {
            let old = change
                .old
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string());
            let part = match field {
                Field::Position => format!("moved {} -> {}", old, change.new),
                _ => format!("{} {} -> {}", field.as_str(), old, change.new),
            };
            parts.push(part);
        }

        let mut description = format!("{} {}", subject, parts.join(", "));

        if let Some(level) = self.change(Field::Battery).and_then(|c| c.new.as_level()) {
            if level <= 10.0 {
                description.push_str(" (critical battery, charge immediately)");
            } else if level <= 20.0 {
                description.push_str(" (low battery, charge soon)");
            }
        }

        description
    }
}

fn kind_label(kind: DeviceKind) -> &'static str {
    match kind {
        DeviceKind::Agv => "AGV",
        DeviceKind::Station => "Station",
        DeviceKind::Conveyor => "Conveyor",
        DeviceKind::RawMaterial => "RawMaterial",
        DeviceKind::Warehouse => "Warehouse",
    }
}

/// Tracked fields of a state, per kind
fn tracked_fields(state: &DeviceState) -> Vec<(Field, FieldValue)> {
    match state {
        DeviceState::Agv(agv) => vec![
            (Field::Status, FieldValue::Text(agv.status.as_str().to_string())),
            (Field::Position, FieldValue::Text(agv.position.clone())),
            (
                Field::Target,
                agv.target
                    .clone()
                    .map(FieldValue::Text)
                    .unwrap_or(FieldValue::Absent),
            ),
            (Field::Battery, FieldValue::Level(agv.battery)),
            (Field::Payload, FieldValue::Items(agv.payload.clone())),
        ],
        DeviceState::Station(p) | DeviceState::Conveyor(p) => vec![
            (Field::Status, FieldValue::Text(p.status.as_str().to_string())),
            (Field::Buffer, FieldValue::Items(p.buffer.clone())),
        ],
        DeviceState::RawMaterial(s) | DeviceState::Warehouse(s) => {
            vec![(Field::Buffer, FieldValue::Items(s.buffer.clone()))]
        }
    }
}
