// Telemetry model and message validation
pub mod telemetry;

// World state store, change events and snapshots
pub mod state;

// Event significance filter
pub mod significance;

// Bounded decision context
pub mod context;

// Commands, typed actions and rejection records
pub mod command;

// Line path graphs and operation sites
pub mod topology;

// Command safety guard
pub mod guard;

// Rule-based fallback policy
pub mod fallback;

// Decision provider seam
pub mod provider;

// Actuation boundary
pub mod actuation;

// Per-cycle decision records
pub mod decision_log;

// Dispatch loop and telemetry ingestion
pub mod dispatch;

// Configuration loading
pub mod config;
