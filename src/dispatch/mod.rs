mod ingest;
mod metrics;

#[cfg(test)]
mod tests;

pub use crate::decision_log::CycleTrigger;
pub use ingest::{IngestOutcome, TelemetryIngestor};
pub use metrics::{DispatchMetrics, DispatchMetricsSnapshot};

use crate::actuation::{ActuationError, Actuator};
use crate::config::FleetConfig;
use crate::context::{Admission, ContextWindow};
use crate::decision_log::{ActuationFailure, CycleRecord, DecisionLogSink, ProviderOutcome};
use crate::fallback::FallbackPolicy;
use crate::guard::CommandSafetyGuard;
use crate::provider::{decide_with_deadline, DecisionProvider, DecisionRequest};
use crate::significance::EventSignificanceFilter;
use crate::state::{Event, WorldStateStore};
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Dispatch loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum time events are batched before a cycle runs
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// Time the decision provider gets per cycle
    #[serde(default = "default_provider_deadline_ms")]
    pub provider_deadline_ms: u64,

    /// Start a cycle early once this many events have queued
    #[serde(default = "default_max_queued_events")]
    pub max_queued_events: usize,

    /// Capacity of the ingestor -> loop event channel
    #[serde(default = "default_telemetry_buffer")]
    pub telemetry_buffer: usize,
}

fn default_batch_interval_ms() -> u64 {
    5000
}

fn default_provider_deadline_ms() -> u64 {
    3000
}

fn default_max_queued_events() -> usize {
    50
}

fn default_telemetry_buffer() -> usize {
    1024
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            provider_deadline_ms: default_provider_deadline_ms(),
            max_queued_events: default_max_queued_events(),
            telemetry_buffer: default_telemetry_buffer(),
        }
    }
}

impl DispatchConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn provider_deadline(&self) -> Duration {
        Duration::from_millis(self.provider_deadline_ms)
    }
}

/// Where the loop currently is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Collecting,
    Deciding,
    Guarding,
    Dispatching,
    Stopped,
}

/// Requests a graceful stop of the dispatch loop
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // Fails only when the loop is already gone
        let _ = self.tx.send(true);
    }
}

enum CollectStep {
    Event(Event),
    ChannelClosed,
    Elapsed,
    Shutdown,
}

/// Single-threaded decision cycle driver.
///
/// Telemetry is applied to the world store by [`TelemetryIngestor`]
/// handles on their own tasks; the resulting events arrive here, are scored
/// and admitted into the context window, and a cycle runs when an urgent
/// event is pending, the batch interval elapses, or too many events queue
/// up. Cycles never overlap: the next collection starts only after the
/// previous cycle's commands have been dispatched.
pub struct DispatchLoop {
    config: DispatchConfig,
    store: Arc<WorldStateStore>,
    filter: EventSignificanceFilter,
    context: ContextWindow,
    provider: Arc<dyn DecisionProvider>,
    guard: Arc<CommandSafetyGuard>,
    fallback: FallbackPolicy,
    actuator: Arc<dyn Actuator>,
    decision_log: Arc<dyn DecisionLogSink>,
    events_rx: mpsc::Receiver<Event>,
    telemetry_closed: bool,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    state: LoopState,
    metrics: Arc<DispatchMetrics>,
}

impl DispatchLoop {
    /// Wire up a loop and the ingestor that feeds it
    pub fn new(
        config: &FleetConfig,
        provider: Arc<dyn DecisionProvider>,
        actuator: Arc<dyn Actuator>,
        decision_log: Arc<dyn DecisionLogSink>,
    ) -> (Self, TelemetryIngestor) {
        let store = Arc::new(WorldStateStore::new());
        let metrics = Arc::new(DispatchMetrics::new());
        let (events_tx, events_rx) = mpsc::channel(config.dispatch.telemetry_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let guard = Arc::new(CommandSafetyGuard::new(
            config.guard.clone(),
            Arc::new(config.topology()),
        ));
        let fallback = FallbackPolicy::new(config.fallback.clone(), Arc::clone(&guard));

        let ingestor = TelemetryIngestor::new(Arc::clone(&store), events_tx, Arc::clone(&metrics));

        let dispatch_loop = Self {
            config: config.dispatch.clone(),
            store,
            filter: EventSignificanceFilter::new(config.filter.clone()),
            context: ContextWindow::new(&config.context),
            provider,
            guard,
            fallback,
            actuator,
            decision_log,
            events_rx,
            telemetry_closed: false,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            state: LoopState::Idle,
            metrics,
        };

        (dispatch_loop, ingestor)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn store(&self) -> Arc<WorldStateStore> {
        Arc::clone(&self.store)
    }

    pub fn context(&self) -> &ContextWindow {
        &self.context
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run cycles until shutdown is requested or actuation disconnects
    pub async fn run(mut self) -> Result<()> {
        info!(
            provider = self.provider.name(),
            batch_interval_ms = self.config.batch_interval_ms,
            provider_deadline_ms = self.config.provider_deadline_ms,
            max_queued_events = self.config.max_queued_events,
            "Dispatch loop starting"
        );

        let result = loop {
            match self.run_cycle().await {
                Ok(Some(_)) => continue,
                Ok(None) => break Ok(()),
                Err(e) => {
                    error!(error = %e, "Dispatch loop stopping on fatal error");
                    break Err(e);
                }
            }
        };

        self.state = LoopState::Stopped;
        info!(
            cycles = self.metrics.snapshot().cycles,
            "Dispatch loop stopped"
        );
        result
    }

    /// Collect events until a trigger fires, then run one full cycle.
    ///
    /// Returns `Ok(None)` on shutdown, `Err` only when the actuation
    /// boundary disconnects.
    pub async fn run_cycle(&mut self) -> Result<Option<CycleRecord>> {
        let Some(trigger) = self.collect().await else {
            self.state = LoopState::Stopped;
            return Ok(None);
        };

        // Deciding
        self.state = LoopState::Deciding;
        let cycle_id = Uuid::now_v7();
        let world = Arc::new(self.store.snapshot());
        let request = DecisionRequest {
            cycle_id,
            world: Arc::clone(&world),
            context: self.context.snapshot(),
            relevant: self.context.relevant(),
            summary: self.context.summary(),
            deadline: self.config.provider_deadline(),
        };
        self.context.mark_consumed();
        self.metrics.record_cycle();

        debug!(
            cycle_id = %cycle_id,
            trigger = ?trigger,
            devices = world.len(),
            context = request.context.len(),
            "Requesting decision"
        );

        let decided = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut self.shutdown_rx) => None,
            result = decide_with_deadline(self.provider.as_ref(), &request) => Some(result),
        };
        let Some(decided) = decided else {
            info!(cycle_id = %cycle_id, "Shutdown requested while deciding");
            self.state = LoopState::Stopped;
            return Ok(None);
        };

        let context: Vec<String> = request
            .context
            .iter()
            .map(|entry| entry.description.clone())
            .collect();
        let battery_floor = self.guard.config().battery_floor;

        let (proposed, provider_outcome, provider_failed) = match decided {
            Ok(decision) => {
                debug!(
                    cycle_id = %cycle_id,
                    proposed = decision.commands.len(),
                    "Provider answered"
                );
                let outcome = ProviderOutcome::Decided {
                    commands: decision.commands.clone(),
                    diagnostic: decision.diagnostic,
                };
                (decision.commands, outcome, false)
            }
            Err(e) => {
                warn!(
                    cycle_id = %cycle_id,
                    provider = self.provider.name(),
                    error = %e,
                    "Decision provider failed, using fallback policy"
                );
                self.metrics.record_provider_failure();
                (Vec::new(), ProviderOutcome::Failed { error: e.to_string() }, true)
            }
        };

        // An empty answer means "no action needed"
        if !provider_failed && proposed.is_empty() {
            debug!(cycle_id = %cycle_id, "Provider proposed no action");
            let record = CycleRecord {
                cycle_id,
                recorded_at: Utc::now(),
                trigger,
                snapshot: world.summary(battery_floor),
                context,
                context_summary: request.summary.clone(),
                provider: provider_outcome,
                accepted: Vec::new(),
                rejected: Vec::new(),
                fallback_used: false,
                actuation_failures: Vec::new(),
            };
            self.write_log(&record);
            return Ok(Some(record));
        }

        // Guarding
        self.state = LoopState::Guarding;
        let mut outcome = self.guard.validate(proposed, &world);

        let urgent = world.urgent_conditions(battery_floor);
        let fallback_used = provider_failed || (outcome.accepted.is_empty() && !urgent.is_empty());
        if fallback_used {
            if !provider_failed {
                warn!(
                    cycle_id = %cycle_id,
                    urgent = urgent.len(),
                    "No command accepted while urgent conditions exist, using fallback policy"
                );
            }
            self.metrics.record_fallback();
            let fallback = self.fallback.synthesize(&world);
            outcome.accepted = fallback.accepted;
            outcome.rejected.extend(fallback.rejected);
        }

        self.metrics.record_rejected(outcome.rejected.len());
        for record in &outcome.rejected {
            self.context.admit_rejection(record.clone());
        }

        // Dispatching
        self.state = LoopState::Dispatching;
        let mut dispatched = 0;
        let mut failures = Vec::new();
        let mut fatal = None;

        for command in &outcome.accepted {
            match self.actuator.dispatch(command).await {
                Ok(()) => {
                    dispatched += 1;
                    debug!(
                        cycle_id = %cycle_id,
                        command = %command.command,
                        origin = ?command.origin,
                        "Command dispatched"
                    );
                }
                Err(ActuationError::Rejected(reason)) => {
                    warn!(
                        cycle_id = %cycle_id,
                        command = %command.command,
                        reason = %reason,
                        "Actuation refused command"
                    );
                    self.metrics.record_actuation_failure();
                    self.context
                        .admit_actuation_failure(command.command.clone(), reason.clone());
                    failures.push(ActuationFailure {
                        command: command.command.clone(),
                        reason,
                    });
                }
                Err(e @ ActuationError::Disconnected(_)) => {
                    error!(cycle_id = %cycle_id, error = %e, "Actuation boundary disconnected");
                    fatal = Some(e);
                    break;
                }
            }
        }
        self.metrics.record_dispatched(dispatched);

        let record = CycleRecord {
            cycle_id,
            recorded_at: Utc::now(),
            trigger,
            snapshot: world.summary(battery_floor),
            context,
            context_summary: request.summary.clone(),
            provider: provider_outcome,
            accepted: outcome.accepted,
            rejected: outcome.rejected,
            fallback_used,
            actuation_failures: failures,
        };
        self.write_log(&record);

        if let Some(e) = fatal {
            self.state = LoopState::Stopped;
            return Err(anyhow::Error::new(e).context("Dispatch cycle aborted"));
        }

        info!(
            cycle_id = %cycle_id,
            trigger = ?trigger,
            accepted = record.accepted.len(),
            rejected = record.rejected.len(),
            fallback = fallback_used,
            "Decision cycle complete"
        );

        Ok(Some(record))
    }

    /// Wait for a cycle trigger; None on shutdown
    async fn collect(&mut self) -> Option<CycleTrigger> {
        self.state = LoopState::Collecting;
        let deadline = Instant::now() + self.config.batch_interval();
        let mut queued = 0usize;

        loop {
            if *self.shutdown_rx.borrow() {
                return None;
            }
            if self.context.urgent_pending() {
                return Some(CycleTrigger::Urgent);
            }
            if queued >= self.config.max_queued_events {
                return Some(CycleTrigger::QueueFull);
            }

            let step = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown_rx) => CollectStep::Shutdown,
                event = self.events_rx.recv(), if !self.telemetry_closed => match event {
                    Some(event) => CollectStep::Event(event),
                    None => CollectStep::ChannelClosed,
                },
                _ = tokio::time::sleep_until(deadline) => CollectStep::Elapsed,
            };

            match step {
                CollectStep::Event(event) => {
                    queued += 1;
                    self.observe(event);
                }
                CollectStep::ChannelClosed => {
                    warn!("Telemetry channel closed, continuing on interval only");
                    self.telemetry_closed = true;
                }
                CollectStep::Elapsed => return Some(CycleTrigger::Interval),
                CollectStep::Shutdown => return None,
            }
        }
    }

    /// Score an event and admit it into context unless it is noise
    fn observe(&mut self, event: Event) {
        let Some(classified) = self.filter.assess(event) else {
            return;
        };

        let importance = classified.importance;
        let description = classified.description.clone();
        if let Admission::Admitted { evicted } = self.context.admit_classified(classified) {
            self.metrics.record_admitted();
            debug!(
                importance = ?importance,
                evicted = ?evicted,
                event = %description,
                "Event admitted to context"
            );
        }
    }

    fn write_log(&self, record: &CycleRecord) {
        if let Err(e) = self.decision_log.record(record) {
            self.metrics.record_decision_log_failure();
            error!(cycle_id = %record.cycle_id, error = %e, "Failed to write decision log");
        }
    }
}

/// Resolves once shutdown has been requested
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: shutdown can no longer be requested
            std::future::pending::<()>().await;
        }
    }
}
