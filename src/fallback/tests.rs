use super::*;
use crate::command::Action;
use crate::guard::GuardConfig;
use crate::telemetry::{DeviceKey, DeviceState};
use crate::topology::FactoryTopology;

fn policy() -> FallbackPolicy {
    let guard = CommandSafetyGuard::new(
        GuardConfig::default(),
        Arc::new(FactoryTopology::default_factory()),
    );
    FallbackPolicy::new(FallbackConfig::default(), Arc::new(guard))
}

fn agv(line: &str, id: &str, position: &str, battery: f64, status: AgvStatus, payload: &[&str]) -> (DeviceKey, DeviceState) {
    (
        DeviceKey::agv(line, id),
        DeviceState::Agv(AgvState {
            status,
            position: position.to_string(),
            battery,
            payload: payload.iter().map(|p| p.to_string()).collect(),
            target: None,
        }),
    )
}

#[test]
fn test_idle_agv_sent_to_intake() {
    let snapshot = WorldSnapshot::from_states(vec![agv(
        "line1", "AGV_1", "P5", 100.0, AgvStatus::Idle, &[],
    )]);

    let commands = policy().synthesize(&snapshot).accepted;

    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].origin, CommandOrigin::Fallback);
    assert_eq!(
        commands[0].action,
        Action::Move {
            target_point: "P0".to_string()
        }
    );
}

#[test]
fn test_idle_agv_at_intake_loads() {
    let snapshot = WorldSnapshot::from_states(vec![agv(
        "line1", "AGV_1", "P0", 100.0, AgvStatus::Idle, &[],
    )]);

    let commands = policy().synthesize(&snapshot).accepted;
    assert_eq!(commands.len(), 1);
    assert!(matches!(commands[0].action, Action::Load { .. }));
}

#[test]
fn test_low_battery_agvs_charge_first() {
    let snapshot = WorldSnapshot::from_states(vec![
        agv("line1", "AGV_1", "P3", 6.0, AgvStatus::Idle, &[]),
        agv("line1", "AGV_2", "P5", 90.0, AgvStatus::Idle, &[]),
    ]);

    let commands = policy().synthesize(&snapshot).accepted;

    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].target(), "AGV_1");
    assert_eq!(commands[0].action, Action::Charge { target_level: 80.0 });
}

#[test]
fn test_charging_agv_left_alone() {
    let snapshot = WorldSnapshot::from_states(vec![
        agv("line1", "AGV_1", "P10", 6.0, AgvStatus::Charging, &[]),
        agv("line1", "AGV_2", "P5", 90.0, AgvStatus::Idle, &[]),
    ]);

    let commands = policy().synthesize(&snapshot).accepted;

    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].target(), "AGV_2");
}

#[test]
fn test_busy_or_weak_agvs_not_dispatched() {
    let snapshot = WorldSnapshot::from_states(vec![
        agv("line1", "AGV_1", "P3", 90.0, AgvStatus::Moving, &[]),
        agv("line1", "AGV_2", "P5", 25.0, AgvStatus::Idle, &[]),
        agv("line1", "AGV_3", "P7", 90.0, AgvStatus::Idle, &["p1"]),
    ]);

    assert!(policy().plan(&snapshot).is_empty());
}

#[test]
fn test_each_line_handled_independently() {
    let snapshot = WorldSnapshot::from_states(vec![
        agv("line1", "AGV_1", "P4", 80.0, AgvStatus::Idle, &[]),
        agv("line2", "AGV_1", "P2", 5.0, AgvStatus::Idle, &[]),
        agv("line3", "AGV_1", "P8", 70.0, AgvStatus::Idle, &[]),
    ]);

    let commands = policy().synthesize(&snapshot).accepted;

    assert_eq!(commands.len(), 3);
    let by_line: Vec<(&str, &str)> = commands
        .iter()
        .map(|c| (c.line_id(), c.action.name()))
        .collect();
    assert_eq!(
        by_line,
        vec![("line1", "move"), ("line2", "charge"), ("line3", "move")]
    );
}

#[test]
fn test_fallback_commands_carry_ids() {
    let snapshot = WorldSnapshot::from_states(vec![agv(
        "line1", "AGV_1", "P5", 100.0, AgvStatus::Idle, &[],
    )]);

    let commands = policy().synthesize(&snapshot).accepted;
    assert!(commands[0].command.command_id.is_some());
}

#[test]
fn test_refused_fallback_commands_are_returned() {
    // PX is not on the line1 path graph, so the move to the intake is refused
    let snapshot = WorldSnapshot::from_states(vec![agv(
        "line1", "AGV_1", "PX", 100.0, AgvStatus::Idle, &[],
    )]);

    let outcome = policy().synthesize(&snapshot);

    assert!(outcome.accepted.is_empty());
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].reason, crate::command::ReasonCode::InvalidPath);
    assert_eq!(outcome.rejected[0].command.target, "AGV_1");
}
