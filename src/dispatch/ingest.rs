use super::metrics::DispatchMetrics;
use crate::state::{Event, StoreError, WorldStateStore};
use crate::telemetry::{DeviceUpdate, TelemetryMessage};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// What happened to one telemetry update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Store changed; the event is on its way to the dispatch loop
    Forwarded,
    /// Newer timestamp but nothing tracked changed
    Unchanged,
    /// Not newer than the stored state; dropped
    Stale,
}

/// Producer-side handle: applies telemetry to the world store and forwards
/// the resulting change events to the dispatch loop.
///
/// Cheap to clone; hand one to every telemetry source. Store writes happen
/// on the caller's task, so producers never wait for a decision cycle.
///
/// The store applies updates for one device in timestamp order, but the
/// forward to the loop happens after the store lock is released. Two
/// clones racing on the same device may therefore enqueue its events out
/// of order; [`ContextWindow::snapshot`](crate::context::ContextWindow::snapshot)
/// restores per-device timestamp order.
#[derive(Clone)]
pub struct TelemetryIngestor {
    store: Arc<WorldStateStore>,
    events_tx: mpsc::Sender<Event>,
    metrics: Arc<DispatchMetrics>,
}

impl TelemetryIngestor {
    pub(crate) fn new(
        store: Arc<WorldStateStore>,
        events_tx: mpsc::Sender<Event>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            store,
            events_tx,
            metrics,
        }
    }

    /// Apply a typed update
    pub async fn ingest(&self, update: DeviceUpdate) -> Result<IngestOutcome> {
        self.metrics.record_telemetry();

        match self.store.apply(update) {
            Ok(Some(event)) => {
                self.events_tx
                    .send(event)
                    .await
                    .map_err(|_| anyhow!("dispatch loop stopped, event not forwarded"))?;
                self.metrics.record_forwarded();
                Ok(IngestOutcome::Forwarded)
            }
            Ok(None) => Ok(IngestOutcome::Unchanged),
            Err(StoreError::StaleUpdate { .. }) => {
                self.metrics.record_stale();
                Ok(IngestOutcome::Stale)
            }
            Err(e) => Err(anyhow::Error::new(e)),
        }
    }

    /// Validate a raw bus message, then apply it
    pub async fn ingest_message(&self, message: TelemetryMessage) -> Result<IngestOutcome> {
        let source = message.source_id.clone();
        let update = match message.into_update() {
            Ok(update) => update,
            Err(e) => {
                self.metrics.record_invalid();
                warn!(source = %source, error = %e, "Invalid telemetry message");
                return Err(anyhow::Error::new(e)
                    .context(format!("Rejected telemetry from '{}'", source)));
            }
        };

        self.ingest(update).await
    }

    /// Replace the KPI summary carried in future snapshots
    pub fn set_kpi_summary(&self, summary: Value) {
        self.store.set_kpi_summary(summary);
    }

    pub fn store(&self) -> &Arc<WorldStateStore> {
        &self.store
    }
}
