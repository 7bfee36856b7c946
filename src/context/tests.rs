use super::*;
use crate::command::ReasonCode;
use crate::telemetry::{AgvStatus, DeviceKey, DeviceUpdate};

fn event(id: &str, ts: f64) -> Event {
    let update = DeviceUpdate::agv("line1", id, ts, "P1", 50.0, AgvStatus::Idle, &[]);
    Event::created(DeviceKey::agv("line1", id), &update.state, ts)
}

fn window(capacity: usize) -> ContextWindow {
    ContextWindow::new(&ContextConfig {
        capacity,
        ..ContextConfig::default()
    })
}

fn importances(window: &ContextWindow) -> Vec<Importance> {
    window.snapshot().iter().map(|e| e.importance).collect()
}

#[test]
fn test_noise_never_admitted() {
    let mut window = window(4);
    assert_eq!(window.admit(event("AGV_1", 1.0), Importance::Noise), Admission::Dropped);
    assert!(window.is_empty());
}

#[test]
fn test_snapshot_is_chronological() {
    let mut window = window(4);
    window.admit(event("AGV_1", 1.0), Importance::High);
    window.admit(event("AGV_2", 2.0), Importance::Low);
    window.admit(event("AGV_3", 3.0), Importance::Medium);

    let seqs: Vec<u64> = window.snapshot().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    assert_eq!(
        importances(&window),
        vec![Importance::High, Importance::Low, Importance::Medium]
    );
}

#[test]
fn test_eviction_prefers_lowest_then_oldest() {
    let mut window = window(3);
    window.admit(event("AGV_1", 1.0), Importance::Medium);
    window.admit(event("AGV_2", 2.0), Importance::Low);
    window.admit(event("AGV_3", 3.0), Importance::Low);

    let admission = window.admit(event("AGV_4", 4.0), Importance::High);
    assert_eq!(
        admission,
        Admission::Admitted {
            evicted: Some(Importance::Low)
        }
    );

    // Oldest LOW (seq 1) went first
    let seqs: Vec<u64> = window.snapshot().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![0, 2, 3]);
}

#[test]
fn test_lowest_incoming_is_dropped_when_full() {
    let mut window = window(2);
    window.admit(event("AGV_1", 1.0), Importance::Critical);
    window.admit(event("AGV_2", 2.0), Importance::Medium);

    assert_eq!(window.admit(event("AGV_3", 3.0), Importance::Low), Admission::Dropped);
    assert_eq!(window.len(), 2);
}

#[test]
fn test_critical_survives_low_flood() {
    let mut window = window(5);
    window.admit(event("AGV_1", 0.0), Importance::Critical);

    for i in 1..50 {
        window.admit(event(&format!("AGV_{}", i + 1), i as f64), Importance::Low);
    }

    assert_eq!(window.len(), 5);
    assert!(window
        .snapshot()
        .iter()
        .any(|e| e.importance == Importance::Critical));
}

#[test]
fn test_same_tier_flood_keeps_newest() {
    let mut window = window(3);
    for i in 0..10 {
        window.admit(event("AGV_1", i as f64), Importance::Medium);
    }

    let seqs: Vec<u64> = window.snapshot().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![7, 8, 9]);
}

#[test]
fn test_urgent_pending_until_consumed() {
    let mut window = window(10);
    window.admit(event("AGV_1", 1.0), Importance::Medium);
    assert!(!window.urgent_pending());

    window.admit(event("AGV_2", 2.0), Importance::High);
    assert!(window.urgent_pending());
    assert_eq!(window.pending_count(), 2);

    window.mark_consumed();
    assert!(!window.urgent_pending());
    assert_eq!(window.pending_count(), 0);
    // Consumed entries stay as history
    assert_eq!(window.len(), 2);
}

#[test]
fn test_rejection_feedback_importance() {
    let mut window = window(10);
    window.admit_rejection(RejectionRecord::new(
        Command::move_to("line1", "AGV_1", "P9"),
        "battery_safety",
        ReasonCode::BatteryBelowFloor,
        "battery 8.0% below floor 10.0%",
    ));
    window.admit_rejection(RejectionRecord::new(
        Command::move_to("line1", "AGV_1", "P5"),
        "conflict",
        ReasonCode::DuplicateTarget,
        "duplicate",
    ));

    let entries = window.snapshot();
    assert_eq!(entries[0].importance, Importance::Medium);
    assert_eq!(entries[1].importance, Importance::Low);
    assert!(matches!(entries[0].item, ContextItem::Rejection { .. }));
    assert!(entries[0].description.contains("BatteryBelowFloor"));
}

#[test]
fn test_classified_event_keeps_trend() {
    let mut window = window(10);
    let classified = ClassifiedEvent {
        event: event("AGV_1", 1.0),
        importance: Importance::Medium,
        trend: Some(BatteryTrend::Degrading),
        description: "AGV line1/AGV_1 battery 42.0% -> 28.0%".to_string(),
    };
    window.admit_classified(classified);

    let entry = &window.snapshot()[0];
    assert_eq!(entry.description, "AGV line1/AGV_1 battery 42.0% -> 28.0%");
    match &entry.item {
        ContextItem::Telemetry { trend, .. } => assert_eq!(*trend, Some(BatteryTrend::Degrading)),
        other => panic!("Expected telemetry item, got {:?}", other),
    }
}

#[test]
fn test_filtered_keeps_newest_at_or_above_tier() {
    let mut window = window(10);
    window.admit(event("AGV_1", 1.0), Importance::Medium);
    window.admit(event("AGV_2", 2.0), Importance::Low);
    window.admit(event("AGV_3", 3.0), Importance::Critical);
    window.admit(event("AGV_4", 4.0), Importance::High);
    window.admit(event("AGV_5", 5.0), Importance::Low);

    let seqs: Vec<u64> = window
        .filtered(10, Importance::Medium)
        .iter()
        .map(|e| e.seq)
        .collect();
    assert_eq!(seqs, vec![0, 2, 3]);

    // Count trims from the oldest end
    let seqs: Vec<u64> = window
        .filtered(2, Importance::Medium)
        .iter()
        .map(|e| e.seq)
        .collect();
    assert_eq!(seqs, vec![2, 3]);

    assert!(window.filtered(0, Importance::Low).is_empty());
}

#[test]
fn test_summary_groups_by_tier_newest_three() {
    let mut window = window(20);
    for i in 0..5 {
        window.admit(event(&format!("AGV_{}", i), i as f64), Importance::High);
    }
    window.admit(event("AGV_9", 9.0), Importance::Low);
    window.admit(event("AGV_8", 8.0), Importance::Critical);

    let summary = window.summary();
    let tiers: Vec<Importance> = summary.tiers.iter().map(|t| t.importance).collect();
    assert_eq!(
        tiers,
        vec![Importance::Critical, Importance::High, Importance::Low]
    );

    let high = summary.tier(Importance::High).unwrap();
    assert_eq!(high.count, 5);
    assert_eq!(high.recent.len(), 3);
    assert!(high.recent[0].contains("AGV_2"));
    assert!(high.recent[2].contains("AGV_4"));
    assert!(summary.tier(Importance::Medium).is_none());

    let text = summary.to_string();
    assert!(text.starts_with("Critical (1):"));
    assert!(text.contains("High (5):"));
}

#[test]
fn test_empty_summary_reads_quiet() {
    let window = window(4);
    let summary = window.summary();
    assert!(summary.is_empty());
    assert_eq!(summary.to_string(), "No notable events.");
}

#[test]
fn test_late_event_for_same_device_is_reordered() {
    let mut window = window(10);
    // AGV_1's newer event was forwarded before its older one
    window.admit(event("AGV_1", 2.0), Importance::Medium);
    window.admit(event("AGV_2", 1.5), Importance::Medium);
    window.admit(event("AGV_1", 1.0), Importance::High);

    let timestamps: Vec<f64> = window
        .snapshot()
        .iter()
        .map(|e| match &e.item {
            ContextItem::Telemetry { event, .. } => event.timestamp,
            other => panic!("Expected telemetry item, got {:?}", other),
        })
        .collect();
    assert_eq!(timestamps, vec![1.0, 1.5, 2.0]);

    // AGV_2 keeps its slot; AGV_1's entries swap within theirs
    let seqs: Vec<u64> = window.snapshot().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![2, 1, 0]);

    let relevant: Vec<u64> = window
        .filtered(10, Importance::High)
        .iter()
        .map(|e| e.seq)
        .collect();
    assert_eq!(relevant, vec![2]);
}
