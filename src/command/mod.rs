use crate::significance::Importance;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use uuid::Uuid;


/// Command as proposed by a decision provider (wire shape).
///
/// Nothing here is trusted; the safety guard parses `action` and `params`
/// into a typed [`Action`] before anything reaches actuation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,

    pub line_id: String,

    /// One of: move, load, unload, charge
    pub action: String,

    /// AGV device id
    pub target: String,

    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Command {
    pub fn new(line_id: impl Into<String>, action: &str, target: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Self {
            command_id: None,
            line_id: line_id.into(),
            action: action.to_string(),
            target: target.into(),
            params,
        }
    }

    pub fn move_to(line_id: impl Into<String>, target: impl Into<String>, point: &str) -> Self {
        Self::new(line_id, "move", target, json!({ "target_point": point }))
    }

    pub fn load(line_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(line_id, "load", target, json!({}))
    }

    pub fn unload(line_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(line_id, "unload", target, json!({}))
    }

    pub fn charge(line_id: impl Into<String>, target: impl Into<String>, target_level: f64) -> Self {
        Self::new(line_id, "charge", target, json!({ "target_level": target_level }))
    }

    /// Assign a fresh time-ordered id
    pub fn with_generated_id(mut self) -> Self {
        self.command_id = Some(Uuid::now_v7().to_string());
        self
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.action, self.line_id, self.target)?;
        if !self.params.is_empty() {
            write!(f, " {}", Value::Object(self.params.clone()))?;
        }
        Ok(())
    }
}

/// Typed action, produced by schema validation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Move { target_point: String },
    Load { product_id: Option<String> },
    Unload,
    Charge { target_level: f64 },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Move { .. } => "move",
            Action::Load { .. } => "load",
            Action::Unload => "unload",
            Action::Charge { .. } => "charge",
        }
    }
}

/// Where an accepted command came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOrigin {
    /// Proposed by the decision provider
    Provider,
    /// Generated by the guard (forced charge replacing an unsafe move)
    Synthesized,
    /// Produced by the rule-based fallback policy
    Fallback,
}

/// Command that passed every guard rule; the only type actuation accepts
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidatedCommand {
    pub command: Command,
    pub action: Action,
    pub origin: CommandOrigin,
    /// Names of the rules the command passed, in order
    pub trace: Vec<String>,
}

impl ValidatedCommand {
    pub fn line_id(&self) -> &str {
        &self.command.line_id
    }

    pub fn target(&self) -> &str {
        &self.command.target
    }
}

/// Why the guard refused a command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    SchemaViolation,
    UnknownDevice,
    BatteryBelowFloor,
    InvalidPath,
    InvalidOperationSite,
    CapacityExceeded,
    NothingToUnload,
    DuplicateTarget,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::SchemaViolation => "SchemaViolation",
            ReasonCode::UnknownDevice => "UnknownDevice",
            ReasonCode::BatteryBelowFloor => "BatteryBelowFloor",
            ReasonCode::InvalidPath => "InvalidPath",
            ReasonCode::InvalidOperationSite => "InvalidOperationSite",
            ReasonCode::CapacityExceeded => "CapacityExceeded",
            ReasonCode::NothingToUnload => "NothingToUnload",
            ReasonCode::DuplicateTarget => "DuplicateTarget",
        }
    }

    /// Importance of the rejection when fed back into decision context.
    /// Malformed or conflicting proposals matter less than safety refusals.
    pub fn feedback_importance(self) -> Importance {
        match self {
            ReasonCode::SchemaViolation | ReasonCode::UnknownDevice | ReasonCode::DuplicateTarget => {
                Importance::Low
            }
            _ => Importance::Medium,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused command with the rule that refused it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub command: Command,
    pub rule: String,
    pub reason: ReasonCode,
    pub detail: String,
}

impl RejectionRecord {
    pub fn new(command: Command, rule: &str, reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            command,
            rule: rule.to_string(),
            reason,
            detail: detail.into(),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "Command rejected by {} ({}): {} - {}",
            self.rule, self.reason, self.command, self.detail
        )
    }
}
