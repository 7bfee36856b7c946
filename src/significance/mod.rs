use crate::state::{Event, Field, FieldChange};
use crate::telemetry::DeviceKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;


/// Readings kept per AGV for trend analysis
const TREND_HISTORY: usize = 10;

/// Ordinal importance of an event for decision context
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Importance {
    Noise,
    Low,
    Medium,
    High,
    Critical,
}

impl Importance {
    /// HIGH and CRITICAL events bypass the batching delay
    pub fn is_urgent(self) -> bool {
        self >= Importance::High
    }
}

/// Direction of an AGV's recent battery readings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryTrend {
    Improving,
    Degrading,
    Stable,
}

/// Event with its assigned importance and descriptive metadata
#[derive(Clone, Debug, Serialize)]
pub struct ClassifiedEvent {
    pub event: Event,
    pub importance: Importance,
    pub trend: Option<BatteryTrend>,
    pub description: String,
}

/// Significance filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Minimum battery change (percentage points) that matters
    #[serde(default = "default_battery_threshold")]
    pub battery_threshold: f64,

    /// Dropping below this level is always HIGH
    #[serde(default = "default_low_battery_mark")]
    pub low_battery_mark: f64,

    /// Identical events within this window (simulated seconds) are NOISE
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: f64,
}

fn default_battery_threshold() -> f64 {
    10.0
}

fn default_low_battery_mark() -> f64 {
    15.0
}

fn default_dedup_window_secs() -> f64 {
    2.0
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            battery_threshold: default_battery_threshold(),
            low_battery_mark: default_low_battery_mark(),
            dedup_window_secs: default_dedup_window_secs(),
        }
    }
}

/// Classifies store events and suppresses noise and duplicates.
///
/// Importance is the maximum over the changed fields; identical
/// (key, changes) signatures seen again inside the dedup window are
/// downgraded to NOISE to absorb retransmission storms.
pub struct EventSignificanceFilter {
    config: FilterConfig,

    /// signature -> simulated time last seen
    recent: HashMap<String, f64>,

    battery_history: HashMap<DeviceKey, VecDeque<f64>>,

    suppressed: u64,
}

impl EventSignificanceFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            recent: HashMap::new(),
            battery_history: HashMap::new(),
            suppressed: 0,
        }
    }

    /// Assign an importance to `event`, recording it for dedup and trends
    pub fn classify(&mut self, event: &Event) -> Importance {
        self.record_battery(event);

        let importance = self.base_importance(event);
        let signature = event.signature();
        let window = self.config.dedup_window_secs;

        let duplicate = self
            .recent
            .get(&signature)
            .map_or(false, |&seen| (event.timestamp - seen).abs() < window);

        self.recent.insert(signature, event.timestamp);
        self.prune(event.timestamp);

        if duplicate {
            debug!(
                device = %event.key,
                original = ?importance,
                "Duplicate event within dedup window, downgraded to noise"
            );
            return Importance::Noise;
        }

        importance
    }

    /// Classify and wrap an event; NOISE yields None
    pub fn assess(&mut self, event: Event) -> Option<ClassifiedEvent> {
        let importance = self.classify(&event);
        if importance == Importance::Noise {
            self.suppressed += 1;
            return None;
        }

        let trend = event
            .change(Field::Battery)
            .map(|_| self.trend(&event.key));

        Some(ClassifiedEvent {
            description: event.describe(),
            event,
            importance,
            trend,
        })
    }

    /// Battery trend from the last few readings:
    /// average step > +2 improving, < -2 degrading, else stable
    pub fn trend(&self, key: &DeviceKey) -> BatteryTrend {
        let Some(history) = self.battery_history.get(key) else {
            return BatteryTrend::Stable;
        };
        if history.len() < 3 {
            return BatteryTrend::Stable;
        }

        let recent: Vec<f64> = history.iter().rev().take(4).rev().copied().collect();
        let steps = (recent.len() - 1) as f64;
        let avg_change = (recent[recent.len() - 1] - recent[0]) / steps;

        if avg_change > 2.0 {
            BatteryTrend::Improving
        } else if avg_change < -2.0 {
            BatteryTrend::Degrading
        } else {
            BatteryTrend::Stable
        }
    }

    /// Events dropped as NOISE since startup
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed
    }

    fn base_importance(&self, event: &Event) -> Importance {
        if event.is_creation() {
            let faulted = event
                .change(Field::Status)
                .and_then(|c| c.new.as_text())
                .map_or(false, |s| s == "fault");
            return if faulted {
                Importance::Critical
            } else {
                Importance::High
            };
        }

        event
            .changes
            .iter()
            .map(|(field, change)| self.field_importance(*field, change))
            .max()
            .unwrap_or(Importance::Noise)
    }

    fn field_importance(&self, field: Field, change: &FieldChange) -> Importance {
        match field {
            Field::Status => {
                if change.new.as_text() == Some("fault") {
                    Importance::Critical
                } else {
                    // Includes recovery out of fault
                    Importance::High
                }
            }
            Field::Battery => {
                let (Some(old), Some(new)) = (
                    change.old.as_ref().and_then(|v| v.as_level()),
                    change.new.as_level(),
                ) else {
                    return Importance::Noise;
                };

                let mark = self.config.low_battery_mark;
                if old >= mark && new < mark {
                    Importance::High
                } else if (new - old).abs() >= self.config.battery_threshold {
                    Importance::Medium
                } else {
                    Importance::Noise
                }
            }
            Field::Payload | Field::Buffer => {
                let old_len = change
                    .old
                    .as_ref()
                    .and_then(|v| v.as_items())
                    .map(|items| items.len());
                let new_len = change.new.as_items().map(|items| items.len());
                if old_len != new_len {
                    Importance::Medium
                } else {
                    // Same length: reordering only
                    Importance::Noise
                }
            }
            Field::Position | Field::Target => Importance::Medium,
        }
    }

    fn record_battery(&mut self, event: &Event) {
        let Some(level) = event.change(Field::Battery).and_then(|c| c.new.as_level()) else {
            return;
        };

        let history = self.battery_history.entry(event.key.clone()).or_default();
        history.push_back(level);
        while history.len() > TREND_HISTORY {
            history.pop_front();
        }
    }

    /// Forget dedup entries older than twice the window
    fn prune(&mut self, now: f64) {
        let horizon = self.config.dedup_window_secs * 2.0;
        self.recent.retain(|_, seen| now - *seen <= horizon);
    }
}

impl Default for EventSignificanceFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}
