use crate::command::ValidatedCommand;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, PartialEq)]
pub enum ActuationError {
    /// The boundary refused this command; the cycle carries on
    Rejected(String),
    /// The boundary is gone; the dispatch loop stops
    Disconnected(String),
}

impl ActuationError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ActuationError::Disconnected(_))
    }
}

impl fmt::Display for ActuationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuationError::Rejected(reason) => write!(f, "command rejected by actuator: {}", reason),
            ActuationError::Disconnected(reason) => write!(f, "actuator disconnected: {}", reason),
        }
    }
}

impl std::error::Error for ActuationError {}

/// Receives guarded commands for execution.
///
/// Only [`ValidatedCommand`] is accepted, so nothing unguarded can be
/// dispatched.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn dispatch(&self, command: &ValidatedCommand) -> Result<(), ActuationError>;
}

/// Actuator that forwards commands over a bounded channel
pub struct ChannelActuator {
    tx: mpsc::Sender<ValidatedCommand>,
}

impl ChannelActuator {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ValidatedCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Actuator for ChannelActuator {
    async fn dispatch(&self, command: &ValidatedCommand) -> Result<(), ActuationError> {
        self.tx
            .send(command.clone())
            .await
            .map_err(|_| ActuationError::Disconnected("command receiver dropped".to_string()))
    }
}
