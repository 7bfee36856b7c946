use crate::command::{Command, RejectionRecord};
use crate::significance::{BatteryTrend, ClassifiedEvent, Importance};
use crate::state::Event;
use chrono::{DateTime, Utc};
use crate::telemetry::DeviceKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

#[cfg(test)]
mod tests;

/// Context window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Maximum number of entries retained
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Most recent MEDIUM+ entries handed to a provider as its focused view
    #[serde(default = "default_provider_events")]
    pub provider_events: usize,
}

fn default_capacity() -> usize {
    200
}

fn default_provider_events() -> usize {
    50
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            provider_events: default_provider_events(),
        }
    }
}

/// Entries shown per tier in a [`ContextSummary`]
const SUMMARY_RECENT_PER_TIER: usize = 3;

/// What a context entry carries
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextItem {
    Telemetry {
        event: Event,
        #[serde(skip_serializing_if = "Option::is_none")]
        trend: Option<BatteryTrend>,
    },
    Rejection {
        record: RejectionRecord,
    },
    ActuationFailure {
        command: Command,
        reason: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct ContextEntry {
    /// Admission order; chronological across item kinds
    pub seq: u64,
    pub importance: Importance,
    pub admitted_at: DateTime<Utc>,
    pub description: String,
    pub item: ContextItem,
    /// Already shown to a decision provider
    pub consumed: bool,
}

/// One importance tier of a [`ContextSummary`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TierSummary {
    pub importance: Importance,
    /// Retained entries at this tier
    pub count: usize,
    /// Descriptions of the newest entries, chronological
    pub recent: Vec<String>,
}

/// Retained context grouped by importance, highest tier first.
///
/// Tiers with no entries are omitted, so an empty summary means a quiet
/// floor.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ContextSummary {
    pub tiers: Vec<TierSummary>,
}

impl ContextSummary {
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn tier(&self, importance: Importance) -> Option<&TierSummary> {
        self.tiers.iter().find(|t| t.importance == importance)
    }
}

impl fmt::Display for ContextSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tiers.is_empty() {
            return write!(f, "No notable events.");
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:?} ({}):", tier.importance, tier.count)?;
            for description in &tier.recent {
                write!(f, "\n  - {}", description)?;
            }
        }
        Ok(())
    }
}

/// Result of offering an item to the window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted { evicted: Option<Importance> },
    /// Below every retained entry with the window full, or NOISE
    Dropped,
}

/// Fixed-capacity window of the most relevant recent events.
///
/// When full, the lowest-importance entry is evicted, oldest first within
/// a tier. An incoming entry strictly below everything retained is dropped
/// instead, so CRITICAL entries never make way while anything lower remains.
pub struct ContextWindow {
    capacity: usize,
    provider_events: usize,
    entries: Vec<ContextEntry>,
    next_seq: u64,
}

impl ContextWindow {
    pub fn new(config: &ContextConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            provider_events: config.provider_events,
            entries: Vec::with_capacity(capacity),
            next_seq: 0,
        }
    }

    /// Admit a telemetry event at the given importance
    pub fn admit(&mut self, event: Event, importance: Importance) -> Admission {
        let description = event.describe();
        self.insert(ContextItem::Telemetry { event, trend: None }, importance, description)
    }

    /// Admit an event already scored by the significance filter
    pub fn admit_classified(&mut self, classified: ClassifiedEvent) -> Admission {
        let ClassifiedEvent {
            event,
            importance,
            trend,
            description,
        } = classified;
        self.insert(ContextItem::Telemetry { event, trend }, importance, description)
    }

    /// Feed a guard rejection back so the next decision can see it
    pub fn admit_rejection(&mut self, record: RejectionRecord) -> Admission {
        let importance = record.reason.feedback_importance();
        let description = record.describe();
        self.insert(ContextItem::Rejection { record }, importance, description)
    }

    pub fn admit_actuation_failure(&mut self, command: Command, reason: impl Into<String>) -> Admission {
        let reason = reason.into();
        let description = format!("Actuation refused {}: {}", command, reason);
        self.insert(
            ContextItem::ActuationFailure { command, reason },
            Importance::Medium,
            description,
        )
    }

    /// Retained entries in chronological order.
    ///
    /// Entries are ordered by admission, except that telemetry for one
    /// device is put back in event-timestamp order within the slots that
    /// device occupies. Concurrent producers can forward two events for
    /// the same device in the opposite order they were applied.
    pub fn snapshot(&self) -> Vec<ContextEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|e| e.seq);

        let mut slots: HashMap<DeviceKey, Vec<usize>> = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            if let ContextItem::Telemetry { event, .. } = &entry.item {
                slots.entry(event.key.clone()).or_default().push(idx);
            }
        }

        for indices in slots.into_values().filter(|indices| indices.len() > 1) {
            let mut group: Vec<ContextEntry> = indices.iter().map(|&i| entries[i].clone()).collect();
            group.sort_by(|a, b| event_timestamp(a).total_cmp(&event_timestamp(b)));
            for (&idx, entry) in indices.iter().zip(group) {
                entries[idx] = entry;
            }
        }

        entries
    }

    /// The newest `count` entries at or above `min_importance`, chronological
    pub fn filtered(&self, count: usize, min_importance: Importance) -> Vec<ContextEntry> {
        let mut entries: Vec<ContextEntry> = self
            .snapshot()
            .into_iter()
            .filter(|e| e.importance >= min_importance)
            .collect();
        let skip = entries.len().saturating_sub(count);
        entries.split_off(skip)
    }

    /// The focused provider view: newest MEDIUM+ entries up to the
    /// configured `provider_events`
    pub fn relevant(&self) -> Vec<ContextEntry> {
        self.filtered(self.provider_events, Importance::Medium)
    }

    /// Group retained entries by tier, listing the newest few of each
    pub fn summary(&self) -> ContextSummary {
        let snapshot = self.snapshot();
        let tiers = [
            Importance::Critical,
            Importance::High,
            Importance::Medium,
            Importance::Low,
        ]
        .into_iter()
        .filter_map(|importance| {
            let descriptions: Vec<&str> = snapshot
                .iter()
                .filter(|e| e.importance == importance)
                .map(|e| e.description.as_str())
                .collect();
            if descriptions.is_empty() {
                return None;
            }
            let skip = descriptions.len().saturating_sub(SUMMARY_RECENT_PER_TIER);
            Some(TierSummary {
                importance,
                count: descriptions.len(),
                recent: descriptions[skip..].iter().map(|d| d.to_string()).collect(),
            })
        })
        .collect();

        ContextSummary { tiers }
    }

    /// Mark everything currently retained as shown to a provider
    pub fn mark_consumed(&mut self) {
        for entry in &mut self.entries {
            entry.consumed = true;
        }
    }

    /// An unconsumed HIGH or CRITICAL entry is waiting
    pub fn urgent_pending(&self) -> bool {
        self.entries
            .iter()
            .any(|e| !e.consumed && e.importance.is_urgent())
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.consumed).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn insert(&mut self, item: ContextItem, importance: Importance, description: String) -> Admission {
        if importance == Importance::Noise {
            return Admission::Dropped;
        }

        let entry = ContextEntry {
            seq: self.next_seq,
            importance,
            admitted_at: Utc::now(),
            description,
            item,
            consumed: false,
        };
        self.next_seq += 1;

        if self.entries.len() < self.capacity {
            self.entries.push(entry);
            return Admission::Admitted { evicted: None };
        }

        // Window full: the victim is the lowest tier, oldest first
        let victim = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.importance, e.seq))
            .map(|(idx, e)| (idx, e.importance));

        match victim {
            Some((idx, lowest)) if importance >= lowest => {
                debug!(
                    evicted = ?lowest,
                    incoming = ?importance,
                    "Context window full, evicting lowest entry"
                );
                self.entries[idx] = entry;
                Admission::Admitted {
                    evicted: Some(lowest),
                }
            }
            _ => {
                debug!(incoming = ?importance, "Context window full, entry dropped");
                Admission::Dropped
            }
        }
    }
}

fn event_timestamp(entry: &ContextEntry) -> f64 {
    match &entry.item {
        ContextItem::Telemetry { event, .. } => event.timestamp,
        _ => f64::NEG_INFINITY,
    }
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::new(&ContextConfig::default())
    }
}
