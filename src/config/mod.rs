use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::warn;

// Re-export section types owned by their modules
pub use crate::context::ContextConfig;
pub use crate::decision_log::DecisionLogConfig;
pub use crate::dispatch::DispatchConfig;
pub use crate::fallback::FallbackConfig;
pub use crate::guard::GuardConfig;
pub use crate::significance::FilterConfig;
pub use crate::topology::LineTopology;

use crate::topology::FactoryTopology;


/// Complete fleet dispatch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub decision_log: DecisionLogConfig,
    /// Per-line topology; empty means the default three-line layout
    #[serde(default)]
    pub lines: Vec<LineTopology>,
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.reason)
    }
}

impl std::error::Error for ConfigError {}

impl FleetConfig {
    /// Topology used by the guard and fallback policy
    pub fn topology(&self) -> FactoryTopology {
        if self.lines.is_empty() {
            FactoryTopology::default_factory()
        } else {
            FactoryTopology::new(self.lines.clone())
        }
    }

    /// Apply FLEET_* environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<f64>("FLEET_BATTERY_FLOOR") {
            self.guard.battery_floor = v;
        }
        if let Some(v) = env_parse::<f64>("FLEET_BATTERY_THRESHOLD") {
            self.filter.battery_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("FLEET_CONTEXT_CAPACITY") {
            self.context.capacity = v;
        }
        if let Some(v) = env_parse::<u64>("FLEET_BATCH_INTERVAL_MS") {
            self.dispatch.batch_interval_ms = v;
        }
        if let Some(v) = env_parse::<u64>("FLEET_PROVIDER_DEADLINE_MS") {
            self.dispatch.provider_deadline_ms = v;
        }
        if let Some(v) = env_parse::<usize>("FLEET_MAX_QUEUED_EVENTS") {
            self.dispatch.max_queued_events = v;
        }
    }

    /// Reject values the dispatch core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let percent = |v: f64| (0.0..=100.0).contains(&v);

        if !percent(self.guard.battery_floor) {
            return Err(ConfigError::new("guard.battery_floor", "must be within 0-100"));
        }
        if !(self.guard.charge_target > 0.0 && self.guard.charge_target <= 100.0) {
            return Err(ConfigError::new("guard.charge_target", "must be within (0, 100]"));
        }
        if self.guard.charge_target <= self.guard.battery_floor {
            return Err(ConfigError::new(
                "guard.charge_target",
                "must be above the battery floor",
            ));
        }
        if self.guard.max_payload == 0 {
            return Err(ConfigError::new("guard.max_payload", "must be at least 1"));
        }
        if !percent(self.fallback.min_battery) {
            return Err(ConfigError::new("fallback.min_battery", "must be within 0-100"));
        }
        if !(self.filter.battery_threshold > 0.0) {
            return Err(ConfigError::new("filter.battery_threshold", "must be positive"));
        }
        if !percent(self.filter.low_battery_mark) {
            return Err(ConfigError::new("filter.low_battery_mark", "must be within 0-100"));
        }
        if !(self.filter.dedup_window_secs >= 0.0) {
            return Err(ConfigError::new("filter.dedup_window_secs", "must not be negative"));
        }
        if self.context.capacity == 0 {
            return Err(ConfigError::new("context.capacity", "must be at least 1"));
        }
        if self.dispatch.batch_interval_ms == 0 {
            return Err(ConfigError::new("dispatch.batch_interval_ms", "must be positive"));
        }
        if self.dispatch.provider_deadline_ms == 0 {
            return Err(ConfigError::new("dispatch.provider_deadline_ms", "must be positive"));
        }
        if self.dispatch.max_queued_events == 0 {
            return Err(ConfigError::new("dispatch.max_queued_events", "must be at least 1"));
        }

        let mut seen = std::collections::HashSet::new();
        for line in &self.lines {
            line.validate().map_err(|reason| ConfigError::new("lines", reason))?;
            if !seen.insert(line.line_id.as_str()) {
                return Err(ConfigError::new(
                    "lines",
                    format!("duplicate line '{}'", line.line_id),
                ));
            }
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(variable = name, value = %value, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Load configuration from a TOML file, apply env overrides and validate
pub fn load_config(path: impl AsRef<Path>) -> Result<FleetConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let mut config: FleetConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Defaults plus env overrides, for running without a config file
pub fn default_config() -> Result<FleetConfig> {
    let mut config = FleetConfig::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
