mod event;
mod snapshot;
mod store;

pub use event::{Event, EventKind, Field, FieldChange, FieldValue};
pub use snapshot::{
    AgvSummary, LineSummary, ProcessSummary, SnapshotSummary, UrgentCondition, UrgentReason,
    WorldSnapshot,
};
pub use store::{DeviceRecord, StoreError, WorldStateStore};
