use super::{Candidate, GuardConfig};
use crate::command::{Action, Command, CommandOrigin, ReasonCode, RejectionRecord};
use crate::state::WorldSnapshot;
use crate::telemetry::{AgvState, DeviceKind};
use crate::topology::{FactoryTopology, LineTopology, Operation, Site};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Read-only inputs shared by every rule in one guard pass
pub struct RuleContext<'a> {
    pub snapshot: &'a WorldSnapshot,
    pub topology: &'a FactoryTopology,
    pub config: &'a GuardConfig,
}

impl RuleContext<'_> {
    fn agv(&self, command: &Command) -> Option<&AgvState> {
        self.snapshot.agv(&command.line_id, &command.target)
    }
}

type Verdict = Result<(), (ReasonCode, String)>;

/// One stage of the guard pipeline.
///
/// Rules that judge commands independently only implement `check`;
/// rules that need to see the whole batch override `apply`.
pub trait GuardRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, _candidate: &Candidate, _ctx: &RuleContext<'_>) -> Verdict {
        Ok(())
    }

    fn apply(
        &self,
        batch: Vec<Candidate>,
        ctx: &RuleContext<'_>,
        rejected: &mut Vec<RejectionRecord>,
    ) -> Vec<Candidate> {
        let mut passed = Vec::with_capacity(batch.len());
        for mut candidate in batch {
            match self.check(&candidate, ctx) {
                Ok(()) => {
                    candidate.trace.push(self.name().to_string());
                    passed.push(candidate);
                }
                Err((reason, detail)) => {
                    rejected.push(RejectionRecord::new(candidate.command, self.name(), reason, detail));
                }
            }
        }
        passed
    }
}

/// Parses wire commands into typed actions and checks the target exists.
///
/// Runs first and turns `Command`s into pipeline candidates, so it is
/// not a [`GuardRule`] itself.
pub struct SchemaRule;

impl SchemaRule {
    pub const NAME: &'static str = "schema";

    pub fn parse(
        &self,
        commands: Vec<Command>,
        origin: CommandOrigin,
        ctx: &RuleContext<'_>,
        rejected: &mut Vec<RejectionRecord>,
    ) -> Vec<Candidate> {
        let mut parsed = Vec::with_capacity(commands.len());
        for command in commands {
            match self.check(&command, ctx) {
                Ok(action) => parsed.push(Candidate {
                    command,
                    action,
                    origin,
                    trace: vec![Self::NAME.to_string()],
                }),
                Err((reason, detail)) => {
                    rejected.push(RejectionRecord::new(command, Self::NAME, reason, detail));
                }
            }
        }
        parsed
    }

    fn check(&self, command: &Command, ctx: &RuleContext<'_>) -> Result<Action, (ReasonCode, String)> {
        if command.line_id.trim().is_empty() {
            return Err(schema_violation("line_id is required"));
        }
        if command.target.trim().is_empty() {
            return Err(schema_violation("target is required"));
        }

        let action = parse_action(command, ctx.config)?;

        if ctx.agv(command).is_none() {
            return Err((
                ReasonCode::UnknownDevice,
                format!("no AGV '{}' on {}", command.target, command.line_id),
            ));
        }

        Ok(action)
    }
}

fn schema_violation(detail: impl Into<String>) -> (ReasonCode, String) {
    (ReasonCode::SchemaViolation, detail.into())
}

fn parse_action(command: &Command, config: &GuardConfig) -> Result<Action, (ReasonCode, String)> {
    let params = &command.params;

    match command.action.as_str() {
        "move" => {
            let point = params
                .get("target_point")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| schema_violation("move requires params.target_point"))?;
            Ok(Action::Move {
                target_point: point.to_string(),
            })
        }
        "load" => {
            let product_id = match params.get("product_id") {
                None | Some(Value::Null) => None,
                Some(Value::String(id)) => Some(id.clone()),
                Some(_) => return Err(schema_violation("params.product_id must be a string")),
            };
            Ok(Action::Load { product_id })
        }
        "unload" => Ok(Action::Unload),
        "charge" => {
            let target_level = match params.get("target_level") {
                None | Some(Value::Null) => config.charge_target,
                Some(value) => value
                    .as_f64()
                    .ok_or_else(|| schema_violation("params.target_level must be a number"))?,
            };
            if !(target_level > 0.0 && target_level <= 100.0) {
                return Err(schema_violation(format!(
                    "charge target {} outside (0, 100]",
                    target_level
                )));
            }
            Ok(Action::Charge { target_level })
        }
        other => Err(schema_violation(format!("unknown action '{}'", other))),
    }
}

/// Refuses moves below the battery floor and gives each refused AGV a
/// single charge.
///
/// The charge takes the AGV's first slot in the batch, so the conflict rule
/// keeps it over anything else proposed for that AGV. A charge the batch
/// already carries for the AGV is moved up instead of synthesizing another.
pub struct BatterySafetyRule;

type AgvKey = (String, String);

fn agv_key(command: &Command) -> AgvKey {
    (command.line_id.clone(), command.target.clone())
}

impl BatterySafetyRule {
    fn refusal(&self, candidate: &Candidate, ctx: &RuleContext<'_>) -> Option<String> {
        match (&candidate.action, ctx.agv(&candidate.command)) {
            (Action::Move { target_point }, Some(agv)) if agv.battery < ctx.config.battery_floor => {
                Some(format!(
                    "battery {:.1}% below floor {:.1}%, move to {} refused",
                    agv.battery, ctx.config.battery_floor, target_point
                ))
            }
            _ => None,
        }
    }

    fn forced_charge(&self, command: &Command, ctx: &RuleContext<'_>) -> Candidate {
        let target_level = ctx.config.charge_target;
        Candidate {
            command: Command::charge(&command.line_id, &command.target, target_level).with_generated_id(),
            action: Action::Charge { target_level },
            origin: CommandOrigin::Synthesized,
            trace: vec![self.name().to_string()],
        }
    }
}

impl GuardRule for BatterySafetyRule {
    fn name(&self) -> &'static str {
        "battery_safety"
    }

    fn apply(
        &self,
        batch: Vec<Candidate>,
        ctx: &RuleContext<'_>,
        rejected: &mut Vec<RejectionRecord>,
    ) -> Vec<Candidate> {
        let mut refusals: HashMap<usize, String> = HashMap::new();
        let mut needs_charge: HashSet<AgvKey> = HashSet::new();
        for (index, candidate) in batch.iter().enumerate() {
            if let Some(detail) = self.refusal(candidate, ctx) {
                refusals.insert(index, detail);
                needs_charge.insert(agv_key(&candidate.command));
            }
        }

        // First proposed charge per AGV that needs one
        let mut proposed_charge: HashMap<AgvKey, usize> = HashMap::new();
        for (index, candidate) in batch.iter().enumerate() {
            let key = agv_key(&candidate.command);
            if matches!(candidate.action, Action::Charge { .. }) && needs_charge.contains(&key) {
                proposed_charge.entry(key).or_insert(index);
            }
        }

        let mut slots: Vec<Option<Candidate>> = batch.into_iter().map(Some).collect();
        let mut charged: HashSet<AgvKey> = HashSet::new();
        let mut passed = Vec::with_capacity(slots.len() + needs_charge.len());

        for index in 0..slots.len() {
            let Some(mut candidate) = slots[index].take() else {
                continue;
            };
            let key = agv_key(&candidate.command);

            if needs_charge.contains(&key) && charged.insert(key.clone()) {
                let charge = match proposed_charge.get(&key) {
                    Some(&at) if at != index => slots[at].take().map(|mut charge| {
                        charge.trace.push(self.name().to_string());
                        charge
                    }),
                    // This candidate is the charge itself
                    Some(_) => None,
                    None => Some(self.forced_charge(&candidate.command, ctx)),
                };
                passed.extend(charge);
            }

            match refusals.remove(&index) {
                Some(detail) => rejected.push(RejectionRecord::new(
                    candidate.command,
                    self.name(),
                    ReasonCode::BatteryBelowFloor,
                    detail,
                )),
                None => {
                    candidate.trace.push(self.name().to_string());
                    passed.push(candidate);
                }
            }
        }
        passed
    }
}

/// Moves must follow the path graph; load/unload must happen at a site
/// that supports the operation and is not in fault.
pub struct TopologyRule;

impl GuardRule for TopologyRule {
    fn name(&self) -> &'static str {
        "topology"
    }

    fn check(&self, candidate: &Candidate, ctx: &RuleContext<'_>) -> Verdict {
        let command = &candidate.command;
        let Some(agv) = ctx.agv(command) else {
            return Ok(());
        };

        match &candidate.action {
            Action::Move { target_point } => {
                let line = ctx.topology.line(&command.line_id).ok_or_else(|| {
                    (
                        ReasonCode::InvalidPath,
                        format!("no topology for {}", command.line_id),
                    )
                })?;
                if !line.has_point(target_point) {
                    return Err((
                        ReasonCode::InvalidPath,
                        format!("unknown path point {}", target_point),
                    ));
                }
                if !line.is_reachable(&agv.position, target_point) {
                    return Err((
                        ReasonCode::InvalidPath,
                        format!("no path from {} to {}", agv.position, target_point),
                    ));
                }
                Ok(())
            }
            Action::Load { .. } | Action::Unload => {
                let operation = operation_for(&candidate.action);
                let line = ctx.topology.line(&command.line_id).ok_or_else(|| {
                    (
                        ReasonCode::InvalidOperationSite,
                        format!("no topology for {}", command.line_id),
                    )
                })?;
                operable_site(line, &agv.position, operation, ctx)
                    .map(|_| ())
                    .map_err(|detail| (ReasonCode::InvalidOperationSite, detail))
            }
            Action::Charge { .. } => Ok(()),
        }
    }
}

/// Loads need payload room; unloads need a product and destination room
pub struct CapacityRule;

impl GuardRule for CapacityRule {
    fn name(&self) -> &'static str {
        "capacity"
    }

    fn check(&self, candidate: &Candidate, ctx: &RuleContext<'_>) -> Verdict {
        let command = &candidate.command;
        let Some(agv) = ctx.agv(command) else {
            return Ok(());
        };

        match &candidate.action {
            Action::Load { .. } => {
                if agv.payload.len() >= ctx.config.max_payload {
                    return Err((
                        ReasonCode::CapacityExceeded,
                        format!(
                            "payload full ({}/{})",
                            agv.payload.len(),
                            ctx.config.max_payload
                        ),
                    ));
                }
                Ok(())
            }
            Action::Unload => {
                if agv.payload.is_empty() {
                    return Err((
                        ReasonCode::NothingToUnload,
                        format!("{} carries no product", command.target),
                    ));
                }

                let Some(line) = ctx.topology.line(&command.line_id) else {
                    return Ok(());
                };
                let site = operable_site(line, &agv.position, Operation::Unload, ctx)
                    .map_err(|detail| (ReasonCode::InvalidOperationSite, detail))?;

                let capacity = site.capacity.or_else(|| default_capacity(site.kind, ctx.config));
                let held = ctx
                    .snapshot
                    .device(&command.line_id, site.kind, &site.device_id)
                    .and_then(|state| state.buffer())
                    .map_or(0, |buffer| buffer.len());

                match capacity {
                    Some(capacity) if held >= capacity => Err((
                        ReasonCode::CapacityExceeded,
                        format!("{} buffer full ({}/{})", site.device_id, held, capacity),
                    )),
                    _ => Ok(()),
                }
            }
            Action::Move { .. } | Action::Charge { .. } => Ok(()),
        }
    }
}

/// At most one command per AGV per batch; the first one wins
pub struct ConflictRule;

impl GuardRule for ConflictRule {
    fn name(&self) -> &'static str {
        "conflict"
    }

    fn apply(
        &self,
        batch: Vec<Candidate>,
        _ctx: &RuleContext<'_>,
        rejected: &mut Vec<RejectionRecord>,
    ) -> Vec<Candidate> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut passed = Vec::with_capacity(batch.len());

        for mut candidate in batch {
            let key = (
                candidate.command.line_id.clone(),
                candidate.command.target.clone(),
            );
            if seen.insert(key) {
                candidate.trace.push(self.name().to_string());
                passed.push(candidate);
            } else {
                let detail = format!(
                    "{} already has a command this cycle",
                    candidate.command.target
                );
                rejected.push(RejectionRecord::new(
                    candidate.command,
                    self.name(),
                    ReasonCode::DuplicateTarget,
                    detail,
                ));
            }
        }
        passed
    }
}

fn operation_for(action: &Action) -> Operation {
    match action {
        Action::Unload => Operation::Unload,
        _ => Operation::Load,
    }
}

/// First site at `position` supporting `operation` whose device is not in
/// fault. Devices with no reported state are assumed operable.
fn operable_site<'a>(
    line: &'a LineTopology,
    position: &str,
    operation: Operation,
    ctx: &RuleContext<'_>,
) -> Result<&'a Site, String> {
    let mut candidates = line
        .sites_at(position)
        .iter()
        .filter(|site| site.supports(operation))
        .peekable();

    if candidates.peek().is_none() {
        return Err(format!(
            "no site at {} supports {:?}",
            position, operation
        ));
    }

    let mut faulted = Vec::new();
    for site in candidates {
        let in_fault = ctx
            .snapshot
            .device(&line.line_id, site.kind, &site.device_id)
            .map_or(false, |state| state.is_fault());
        if !in_fault {
            return Ok(site);
        }
        faulted.push(site.device_id.as_str());
    }

    Err(format!("{} at {} in fault", faulted.join(", "), position))
}

fn default_capacity(kind: DeviceKind, config: &GuardConfig) -> Option<usize> {
    match kind {
        DeviceKind::Station => Some(config.station_capacity),
        DeviceKind::Conveyor => Some(config.conveyor_capacity),
        DeviceKind::Agv | DeviceKind::RawMaterial | DeviceKind::Warehouse => None,
    }
}
