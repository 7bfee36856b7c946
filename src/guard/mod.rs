mod rules;


pub use rules::{
    BatterySafetyRule, CapacityRule, ConflictRule, GuardRule, RuleContext, SchemaRule,
    TopologyRule,
};

use crate::command::{Action, Command, CommandOrigin, RejectionRecord, ValidatedCommand};
use crate::state::WorldSnapshot;
use crate::topology::FactoryTopology;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Moves are refused below this battery level (percent)
    #[serde(default = "default_battery_floor")]
    pub battery_floor: f64,

    /// Level requested by synthesized charge commands
    #[serde(default = "default_charge_target")]
    pub charge_target: f64,

    #[serde(default = "default_max_payload")]
    pub max_payload: usize,

    #[serde(default = "default_buffer_capacity")]
    pub station_capacity: usize,

    #[serde(default = "default_buffer_capacity")]
    pub conveyor_capacity: usize,
}

fn default_battery_floor() -> f64 {
    10.0
}

fn default_charge_target() -> f64 {
    80.0
}

fn default_max_payload() -> usize {
    crate::telemetry::MAX_PAYLOAD
}

fn default_buffer_capacity() -> usize {
    3
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            battery_floor: default_battery_floor(),
            charge_target: default_charge_target(),
            max_payload: default_max_payload(),
            station_capacity: default_buffer_capacity(),
            conveyor_capacity: default_buffer_capacity(),
        }
    }
}

/// A command that has passed schema validation and is working its way
/// through the rule pipeline
#[derive(Clone, Debug)]
pub struct Candidate {
    pub command: Command,
    pub action: Action,
    pub origin: CommandOrigin,
    pub trace: Vec<String>,
}

impl Candidate {
    fn into_validated(self) -> ValidatedCommand {
        ValidatedCommand {
            command: self.command,
            action: self.action,
            origin: self.origin,
            trace: self.trace,
        }
    }
}

/// Partition of a batch into accepted and rejected commands
#[derive(Clone, Debug, Default)]
pub struct GuardOutcome {
    pub accepted: Vec<ValidatedCommand>,
    pub rejected: Vec<RejectionRecord>,
}

/// Validates proposed commands against a world snapshot.
///
/// Rules run in a fixed order (schema, battery safety, topology, capacity,
/// conflict). Each rule sees the survivors of the previous one, and every
/// refusal becomes a [`RejectionRecord`]; nothing is dropped silently.
pub struct CommandSafetyGuard {
    config: GuardConfig,
    topology: Arc<FactoryTopology>,
    schema: SchemaRule,
    rules: Vec<Box<dyn GuardRule>>,
}

impl CommandSafetyGuard {
    pub fn new(config: GuardConfig, topology: Arc<FactoryTopology>) -> Self {
        Self {
            config,
            topology,
            schema: SchemaRule,
            rules: vec![
                Box::new(BatterySafetyRule),
                Box::new(TopologyRule),
                Box::new(CapacityRule),
                Box::new(ConflictRule),
            ],
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn topology(&self) -> &FactoryTopology {
        &self.topology
    }

    /// Validate provider-proposed commands
    pub fn validate(&self, commands: Vec<Command>, snapshot: &WorldSnapshot) -> GuardOutcome {
        self.validate_batch(commands, CommandOrigin::Provider, snapshot)
    }

    /// Validate a batch, tagging accepted commands with `origin`
    pub fn validate_batch(
        &self,
        commands: Vec<Command>,
        origin: CommandOrigin,
        snapshot: &WorldSnapshot,
    ) -> GuardOutcome {
        let ctx = RuleContext {
            snapshot,
            topology: &self.topology,
            config: &self.config,
        };
        let proposed = commands.len();
        let mut rejected = Vec::new();

        let mut batch = self.schema.parse(commands, origin, &ctx, &mut rejected);
        for rule in &self.rules {
            batch = rule.apply(batch, &ctx, &mut rejected);
        }

        for record in &rejected {
            info!(
                rule = %record.rule,
                reason = %record.reason,
                line = %record.command.line_id,
                target = %record.command.target,
                detail = %record.detail,
                "Command rejected"
            );
        }

        let accepted: Vec<ValidatedCommand> =
            batch.into_iter().map(Candidate::into_validated).collect();

        debug!(
            proposed,
            accepted = accepted.len(),
            rejected = rejected.len(),
            "Guard pass complete"
        );

        GuardOutcome { accepted, rejected }
    }
}
