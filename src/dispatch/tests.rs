use super::*;
use crate::command::{Command, CommandOrigin, ReasonCode, ValidatedCommand};
use crate::context::ContextItem;
use crate::decision_log::MemoryDecisionLog;
use crate::provider::{ScriptedProvider, ScriptedResponse};
use crate::telemetry::{AgvStatus, DeviceUpdate};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

/// Actuator that records dispatched commands and refuses chosen targets
#[derive(Default)]
struct RecordingActuator {
    refuse: HashSet<String>,
    disconnected: bool,
    sent: Mutex<Vec<ValidatedCommand>>,
}

impl RecordingActuator {
    fn sent(&self) -> Vec<ValidatedCommand> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Actuator for RecordingActuator {
    async fn dispatch(&self, command: &ValidatedCommand) -> Result<(), ActuationError> {
        if self.disconnected {
            return Err(ActuationError::Disconnected("link down".to_string()));
        }
        if self.refuse.contains(command.target()) {
            return Err(ActuationError::Rejected("AGV busy".to_string()));
        }
        self.sent.lock().unwrap().push(command.clone());
        Ok(())
    }
}

struct FailingLog;

impl DecisionLogSink for FailingLog {
    fn record(&self, _record: &CycleRecord) -> Result<()> {
        anyhow::bail!("disk full")
    }
}

struct Harness {
    dispatch: DispatchLoop,
    ingestor: TelemetryIngestor,
    provider: Arc<ScriptedProvider>,
    actuator: Arc<RecordingActuator>,
    log: Arc<MemoryDecisionLog>,
}

fn fast_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.dispatch.batch_interval_ms = 50;
    config.dispatch.provider_deadline_ms = 200;
    config
}

fn harness_with(
    config: FleetConfig,
    responses: Vec<ScriptedResponse>,
    actuator: RecordingActuator,
) -> Harness {
    let provider = Arc::new(ScriptedProvider::new(responses));
    let actuator = Arc::new(actuator);
    let log = Arc::new(MemoryDecisionLog::new());

    let (dispatch, ingestor) = DispatchLoop::new(
        &config,
        provider.clone(),
        actuator.clone(),
        log.clone(),
    );

    Harness {
        dispatch,
        ingestor,
        provider,
        actuator,
        log,
    }
}

fn harness(responses: Vec<ScriptedResponse>) -> Harness {
    harness_with(fast_config(), responses, RecordingActuator::default())
}

fn agv(id: &str, ts: f64, position: &str, battery: f64, payload: &[&str]) -> DeviceUpdate {
    DeviceUpdate::agv("line1", id, ts, position, battery, AgvStatus::Idle, payload)
}

#[tokio::test]
async fn test_first_report_triggers_urgent_cycle() {
    let mut h = harness(vec![ScriptedResponse::Commands(vec![Command::move_to(
        "line1", "AGV_1", "P5",
    )])]);
    assert_eq!(h.dispatch.state(), LoopState::Idle);

    let outcome = h.ingestor.ingest(agv("AGV_1", 1.0, "P3", 60.0, &["p1"])).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Forwarded);

    let record = h.dispatch.run_cycle().await.unwrap().unwrap();

    assert_eq!(record.trigger, CycleTrigger::Urgent);
    assert_eq!(record.accepted.len(), 1);
    assert!(!record.fallback_used);
    assert_eq!(record.context.len(), 1);
    assert!(record.context[0].contains("reported for the first time"));

    let sent = h.actuator.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].origin, CommandOrigin::Provider);
    assert_eq!(h.log.len(), 1);
    assert_eq!(h.dispatch.state(), LoopState::Dispatching);
}

#[tokio::test]
async fn test_provider_sees_snapshot_and_context() {
    let mut h = harness(vec![]);
    h.ingestor.ingest(agv("AGV_1", 1.0, "P3", 60.0, &[])).await.unwrap();
    h.ingestor.set_kpi_summary(serde_json::json!({ "completed": 3 }));

    h.dispatch.run_cycle().await.unwrap();

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].world.agv("line1", "AGV_1").unwrap().position, "P3");
    assert_eq!(requests[0].world.kpi_summary.as_ref().unwrap()["completed"], 3);
    assert_eq!(requests[0].context.len(), 1);
    assert_eq!(requests[0].deadline, Duration::from_millis(200));
}

#[tokio::test]
async fn test_interval_trigger_without_events() {
    let mut h = harness(vec![]);

    let record = h.dispatch.run_cycle().await.unwrap().unwrap();

    assert_eq!(record.trigger, CycleTrigger::Interval);
    assert!(record.accepted.is_empty());
    assert!(!record.fallback_used);
}

#[tokio::test]
async fn test_queue_full_trigger() {
    let mut config = fast_config();
    config.dispatch.batch_interval_ms = 10_000;
    config.dispatch.max_queued_events = 2;
    let mut h = harness_with(config, vec![], RecordingActuator::default());

    h.ingestor.ingest(agv("AGV_1", 0.0, "P0", 90.0, &[])).await.unwrap();
    h.dispatch.run_cycle().await.unwrap();

    // Position changes are MEDIUM: they queue without forcing a cycle.
    // Exactly the configured count must be enough.
    h.ingestor.ingest(agv("AGV_1", 1.0, "P1", 90.0, &[])).await.unwrap();
    h.ingestor.ingest(agv("AGV_1", 2.0, "P2", 90.0, &[])).await.unwrap();

    let record = tokio::time::timeout(Duration::from_millis(500), h.dispatch.run_cycle())
        .await
        .expect("cycle should start once the queue limit is reached")
        .unwrap()
        .unwrap();
    assert_eq!(record.trigger, CycleTrigger::QueueFull);
}

#[tokio::test]
async fn test_queue_below_limit_waits_for_interval() {
    let mut config = fast_config();
    config.dispatch.batch_interval_ms = 300;
    config.dispatch.max_queued_events = 3;
    let mut h = harness_with(config, vec![], RecordingActuator::default());

    h.ingestor.ingest(agv("AGV_1", 0.0, "P0", 90.0, &[])).await.unwrap();
    h.dispatch.run_cycle().await.unwrap();

    h.ingestor.ingest(agv("AGV_1", 1.0, "P1", 90.0, &[])).await.unwrap();
    h.ingestor.ingest(agv("AGV_1", 2.0, "P2", 90.0, &[])).await.unwrap();

    let record = h.dispatch.run_cycle().await.unwrap().unwrap();
    assert_eq!(record.trigger, CycleTrigger::Interval);
}

#[tokio::test]
async fn test_provider_failure_uses_fallback() {
    let mut h = harness(vec![ScriptedResponse::Fail("model overloaded".to_string())]);
    h.ingestor.ingest(agv("AGV_1", 1.0, "P5", 100.0, &[])).await.unwrap();

    let record = h.dispatch.run_cycle().await.unwrap().unwrap();

    assert!(record.fallback_used);
    assert!(matches!(record.provider, ProviderOutcome::Failed { .. }));
    let sent = h.actuator.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].origin, CommandOrigin::Fallback);
    assert_eq!(sent[0].command.params["target_point"], "P0");

    let metrics = h.dispatch.metrics().snapshot();
    assert_eq!(metrics.provider_failures, 1);
    assert_eq!(metrics.fallback_activations, 1);
}

#[tokio::test]
async fn test_refused_fallback_commands_are_recorded() {
    let mut h = harness(vec![ScriptedResponse::Fail("model overloaded".to_string())]);
    // PX is off the path graph, so the fallback move to the intake is refused
    h.ingestor.ingest(agv("AGV_1", 1.0, "PX", 100.0, &[])).await.unwrap();

    let record = h.dispatch.run_cycle().await.unwrap().unwrap();

    assert!(record.fallback_used);
    assert!(record.accepted.is_empty());
    assert_eq!(record.rejected.len(), 1);
    assert_eq!(record.rejected[0].reason, ReasonCode::InvalidPath);
    assert!(h.actuator.sent().is_empty());

    let rejections = h
        .dispatch
        .context()
        .snapshot()
        .into_iter()
        .filter(|e| matches!(e.item, ContextItem::Rejection { .. }))
        .count();
    assert_eq!(rejections, 1);
    assert_eq!(h.dispatch.metrics().snapshot().commands_rejected, 1);
}

#[tokio::test]
async fn test_provider_timeout_uses_fallback() {
    let mut h = harness(vec![ScriptedResponse::Stall(Duration::from_secs(5))]);
    h.ingestor.ingest(agv("AGV_1", 1.0, "P5", 100.0, &[])).await.unwrap();

    let record = h.dispatch.run_cycle().await.unwrap().unwrap();

    assert!(record.fallback_used);
    match &record.provider {
        ProviderOutcome::Failed { error } => assert!(error.contains("timed out")),
        other => panic!("Expected failure, got {:?}", other),
    }
    assert_eq!(h.actuator.sent().len(), 1);
}

#[tokio::test]
async fn test_empty_answer_is_no_action_even_when_urgent() {
    let mut h = harness(vec![ScriptedResponse::Commands(vec![])]);
    h.ingestor.ingest(agv("AGV_1", 1.0, "P5", 5.0, &[])).await.unwrap();

    let record = h.dispatch.run_cycle().await.unwrap().unwrap();

    assert!(!record.fallback_used);
    assert!(record.accepted.is_empty());
    assert!(h.actuator.sent().is_empty());
    assert_eq!(h.log.len(), 1);
}

#[tokio::test]
async fn test_all_rejected_with_urgent_condition_falls_back() {
    // AGV_2 is in trouble; the provider only proposes an invalid move
    let mut h = harness(vec![ScriptedResponse::Commands(vec![Command::move_to(
        "line1", "AGV_1", "P42",
    )])]);
    h.ingestor.ingest(agv("AGV_1", 1.0, "P5", 90.0, &[])).await.unwrap();
    h.ingestor.ingest(agv("AGV_2", 1.0, "P2", 4.0, &[])).await.unwrap();

    let record = h.dispatch.run_cycle().await.unwrap().unwrap();

    assert!(record.fallback_used);
    assert_eq!(record.rejected[0].reason, ReasonCode::InvalidPath);
    let sent = h.actuator.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target(), "AGV_2");
    assert_eq!(sent[0].action.name(), "charge");
}

#[tokio::test]
async fn test_rejections_fed_back_into_context() {
    let mut h = harness(vec![ScriptedResponse::Commands(vec![
        Command::move_to("line1", "AGV_1", "P5"),
        Command::move_to("line1", "AGV_1", "P1"),
    ])]);
    h.ingestor.ingest(agv("AGV_1", 1.0, "P3", 60.0, &["p1"])).await.unwrap();

    let record = h.dispatch.run_cycle().await.unwrap().unwrap();
    assert_eq!(record.rejected.len(), 1);

    let entries = h.dispatch.context().snapshot();
    let rejection = entries
        .iter()
        .find(|e| matches!(e.item, ContextItem::Rejection { .. }))
        .unwrap();
    assert_eq!(rejection.importance, crate::significance::Importance::Low);
    assert!(!rejection.consumed);
}

#[tokio::test]
async fn test_provider_view_drops_low_feedback() {
    let mut h = harness(vec![ScriptedResponse::Commands(vec![
        Command::move_to("line1", "AGV_1", "P5"),
        Command::move_to("line1", "AGV_1", "P1"),
    ])]);
    h.ingestor.ingest(agv("AGV_1", 1.0, "P3", 60.0, &["p1"])).await.unwrap();
    h.dispatch.run_cycle().await.unwrap();

    // Second cycle sees the LOW duplicate-target rejection in full context only
    let record = h.dispatch.run_cycle().await.unwrap().unwrap();

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 2);
    let second = &requests[1];
    assert_eq!(second.context.len(), 2);
    assert_eq!(second.relevant.len(), 1);
    assert!(second
        .relevant
        .iter()
        .all(|e| e.importance >= crate::significance::Importance::Medium));

    let low = second.summary.tier(crate::significance::Importance::Low).unwrap();
    assert_eq!(low.count, 1);
    assert!(low.recent[0].contains("DuplicateTarget"));
    assert_eq!(record.context_summary, second.summary);
}

#[tokio::test]
async fn test_actuation_rejection_is_recorded() {
    let actuator = RecordingActuator {
        refuse: HashSet::from(["AGV_1".to_string()]),
        ..Default::default()
    };
    let mut h = harness_with(
        fast_config(),
        vec![ScriptedResponse::Commands(vec![
            Command::move_to("line1", "AGV_1", "P5"),
            Command::move_to("line1", "AGV_2", "P1"),
        ])],
        actuator,
    );
    h.ingestor.ingest(agv("AGV_1", 1.0, "P3", 60.0, &[])).await.unwrap();
    h.ingestor.ingest(agv("AGV_2", 1.0, "P0", 60.0, &[])).await.unwrap();

    let record = h.dispatch.run_cycle().await.unwrap().unwrap();

    assert_eq!(record.actuation_failures.len(), 1);
    assert_eq!(record.actuation_failures[0].command.target, "AGV_1");
    // The rest of the batch still went out
    assert_eq!(h.actuator.sent().len(), 1);
    assert_eq!(h.dispatch.metrics().snapshot().actuation_failures, 1);
}

#[tokio::test]
async fn test_disconnect_stops_loop() {
    let actuator = RecordingActuator {
        disconnected: true,
        ..Default::default()
    };
    let h = harness_with(
        fast_config(),
        vec![ScriptedResponse::Commands(vec![Command::move_to(
            "line1", "AGV_1", "P5",
        )])],
        actuator,
    );
    h.ingestor.ingest(agv("AGV_1", 1.0, "P3", 60.0, &[])).await.unwrap();

    let err = h.dispatch.run().await.unwrap_err();
    assert!(err.to_string().contains("Dispatch cycle aborted"));
    // The failed cycle is still logged
    assert_eq!(h.log.len(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_run() {
    let h = harness(vec![]);
    let shutdown = h.dispatch.shutdown_handle();

    let task = tokio::spawn(h.dispatch.run());
    tokio::time::sleep(Duration::from_millis(120)).await;
    shutdown.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_decision_log_failure_does_not_stop_cycle() {
    let provider = Arc::new(ScriptedProvider::default());
    let (mut dispatch, ingestor) = DispatchLoop::new(
        &fast_config(),
        provider,
        Arc::new(RecordingActuator::default()),
        Arc::new(FailingLog),
    );
    ingestor.ingest(agv("AGV_1", 1.0, "P3", 60.0, &[])).await.unwrap();

    assert!(dispatch.run_cycle().await.unwrap().is_some());
    assert!(dispatch.run_cycle().await.unwrap().is_some());
    assert_eq!(dispatch.metrics().snapshot().decision_log_failures, 2);
}

#[tokio::test]
async fn test_noise_does_not_reach_context() {
    let mut h = harness(vec![]);
    h.ingestor.ingest(agv("AGV_1", 1.0, "P3", 60.0, &[])).await.unwrap();
    h.dispatch.run_cycle().await.unwrap();

    // 2-point battery wobble: NOISE
    h.ingestor.ingest(agv("AGV_1", 2.0, "P3", 58.0, &[])).await.unwrap();
    let record = h.dispatch.run_cycle().await.unwrap().unwrap();

    assert_eq!(record.trigger, CycleTrigger::Interval);
    assert_eq!(h.dispatch.context().len(), 1);
}

#[tokio::test]
async fn test_stale_and_invalid_telemetry() {
    let h = harness(vec![]);
    h.ingestor.ingest(agv("AGV_1", 5.0, "P3", 60.0, &[])).await.unwrap();

    let outcome = h.ingestor.ingest(agv("AGV_1", 4.0, "P4", 60.0, &[])).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Stale);

    let outcome = h.ingestor.ingest(agv("AGV_1", 6.0, "P3", 60.0, &[])).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Unchanged);

    let message: crate::telemetry::TelemetryMessage = serde_json::from_value(serde_json::json!({
        "line_id": "line1",
        "kind": "agv",
        "source_id": "AGV_2",
        "timestamp": 1.0,
        "status": "idle",
        "current_point": "P0",
        "battery_level": 140.0,
        "payload": []
    }))
    .unwrap();
    assert!(h.ingestor.ingest_message(message).await.is_err());

    let metrics = h.dispatch.metrics().snapshot();
    assert_eq!(metrics.telemetry_received, 3);
    assert_eq!(metrics.stale_updates, 1);
    assert_eq!(metrics.invalid_messages, 1);
    assert_eq!(metrics.events_forwarded, 1);
}
