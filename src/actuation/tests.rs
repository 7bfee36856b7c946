use super::*;
use crate::command::{Action, Command, CommandOrigin};

fn validated() -> ValidatedCommand {
    ValidatedCommand {
        command: Command::move_to("line1", "AGV_1", "P5"),
        action: Action::Move {
            target_point: "P5".to_string(),
        },
        origin: CommandOrigin::Provider,
        trace: vec!["schema".to_string()],
    }
}

#[tokio::test]
async fn test_channel_actuator_forwards() {
    let (actuator, mut rx) = ChannelActuator::new(4);

    actuator.dispatch(&validated()).await.unwrap();

    let received = rx.recv().await.unwrap();
    assert_eq!(received, validated());
}

#[tokio::test]
async fn test_dropped_receiver_is_fatal() {
    let (actuator, rx) = ChannelActuator::new(4);
    drop(rx);

    let err = actuator.dispatch(&validated()).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, ActuationError::Disconnected(_)));
}

#[test]
fn test_rejection_is_not_fatal() {
    assert!(!ActuationError::Rejected("busy".to_string()).is_fatal());
}
