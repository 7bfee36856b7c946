use crate::command::{Command, CommandOrigin};
use crate::guard::{CommandSafetyGuard, GuardOutcome};
use crate::state::WorldSnapshot;
use crate::telemetry::{AgvState, AgvStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

/// Fallback policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Idle AGVs need more than this to be sent for raw material
    #[serde(default = "default_min_battery")]
    pub min_battery: f64,
}

fn default_min_battery() -> f64 {
    30.0
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            min_battery: default_min_battery(),
        }
    }
}

/// Conservative per-line policy that keeps the fleet alive without a
/// provider.
///
/// For each line: AGVs under the battery floor are sent to charge.
/// Otherwise one idle, empty AGV with enough battery is put to work at the
/// raw-material intake (moved there, or told to load if already there).
/// Output goes through the guard like any other command.
pub struct FallbackPolicy {
    config: FallbackConfig,
    guard: Arc<CommandSafetyGuard>,
}

impl FallbackPolicy {
    pub fn new(config: FallbackConfig, guard: Arc<CommandSafetyGuard>) -> Self {
        Self { config, guard }
    }

    /// Commands the policy would issue for this snapshot, before guarding
    pub fn plan(&self, snapshot: &WorldSnapshot) -> Vec<Command> {
        let floor = self.guard.config().battery_floor;
        let charge_target = self.guard.config().charge_target;
        let mut commands = Vec::new();

        for line_id in snapshot.line_ids() {
            let agvs: Vec<(&str, &AgvState)> = snapshot
                .agvs()
                .filter(|(key, _)| key.line_id == line_id)
                .map(|(key, agv)| (key.device_id.as_str(), agv))
                .collect();

            let low: Vec<&str> = agvs
                .iter()
                .filter(|(_, agv)| agv.battery < floor && agv.status != AgvStatus::Charging)
                .map(|(id, _)| *id)
                .collect();

            if !low.is_empty() {
                for id in low {
                    commands.push(Command::charge(&line_id, id, charge_target).with_generated_id());
                }
                continue;
            }

            let Some(intake) = self
                .guard
                .topology()
                .line(&line_id)
                .map(|t| t.intake_point.as_str())
            else {
                debug!(line = %line_id, "No topology for line, fallback skips it");
                continue;
            };

            let worker = agvs.iter().find(|(_, agv)| {
                agv.status == AgvStatus::Idle
                    && agv.battery > self.config.min_battery
                    && agv.payload.is_empty()
            });

            if let Some((id, agv)) = worker {
                let command = if agv.position == intake {
                    Command::load(&line_id, *id)
                } else {
                    Command::move_to(&line_id, *id, intake)
                };
                commands.push(command.with_generated_id());
            }
        }

        commands
    }

    /// Guard the plan for this snapshot.
    ///
    /// Refused fallback commands come back in `rejected` like any other
    /// refusal, so the caller can log them and feed them into context.
    pub fn synthesize(&self, snapshot: &WorldSnapshot) -> GuardOutcome {
        let plan = self.plan(snapshot);
        let outcome = self
            .guard
            .validate_batch(plan, CommandOrigin::Fallback, snapshot);

        if !outcome.rejected.is_empty() {
            warn!(
                accepted = outcome.accepted.len(),
                rejected = outcome.rejected.len(),
                "Guard refused fallback commands"
            );
        }

        outcome
    }
}
