use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the dispatch loop and telemetry ingestion.
///
/// Shared between the loop and every [`TelemetryIngestor`](super::TelemetryIngestor)
/// clone, so everything is a lock-free atomic.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Telemetry updates offered to the world store
    telemetry_received: AtomicU64,

    /// Updates dropped as stale (timestamp not newer)
    stale_updates: AtomicU64,

    /// Messages that failed validation
    invalid_messages: AtomicU64,

    /// Change events forwarded to the loop
    events_forwarded: AtomicU64,

    /// Events admitted into decision context
    events_admitted: AtomicU64,

    cycles: AtomicU64,

    provider_failures: AtomicU64,

    fallback_activations: AtomicU64,

    commands_dispatched: AtomicU64,

    commands_rejected: AtomicU64,

    actuation_failures: AtomicU64,

    decision_log_failures: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_telemetry, telemetry_received);
    counter!(record_stale, stale_updates);
    counter!(record_invalid, invalid_messages);
    counter!(record_forwarded, events_forwarded);
    counter!(record_admitted, events_admitted);
    counter!(record_cycle, cycles);
    counter!(record_provider_failure, provider_failures);
    counter!(record_fallback, fallback_activations);
    counter!(record_actuation_failure, actuation_failures);
    counter!(record_decision_log_failure, decision_log_failures);

    pub fn record_dispatched(&self, count: usize) {
        self.commands_dispatched
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, count: usize) {
        self.commands_rejected
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        DispatchMetricsSnapshot {
            telemetry_received: load(&self.telemetry_received),
            stale_updates: load(&self.stale_updates),
            invalid_messages: load(&self.invalid_messages),
            events_forwarded: load(&self.events_forwarded),
            events_admitted: load(&self.events_admitted),
            cycles: load(&self.cycles),
            provider_failures: load(&self.provider_failures),
            fallback_activations: load(&self.fallback_activations),
            commands_dispatched: load(&self.commands_dispatched),
            commands_rejected: load(&self.commands_rejected),
            actuation_failures: load(&self.actuation_failures),
            decision_log_failures: load(&self.decision_log_failures),
        }
    }
}

/// Snapshot of dispatch metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchMetricsSnapshot {
    pub telemetry_received: u64,
    pub stale_updates: u64,
    pub invalid_messages: u64,
    pub events_forwarded: u64,
    pub events_admitted: u64,
    pub cycles: u64,
    pub provider_failures: u64,
    pub fallback_activations: u64,
    pub commands_dispatched: u64,
    pub commands_rejected: u64,
    pub actuation_failures: u64,
    pub decision_log_failures: u64,
}
