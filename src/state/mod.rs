//! Persistent pipeline state: the single authoritative view of batch progress.
//!
//! Two stores share the same write discipline (validate, backup to `.bak`,
//! atomic rename): `sand-state.json` for Stage 2 and `gravel-state.json` for
//! Stage 1.

mod model;
mod store;

pub use model::{
    AttackResult, AttackStats, BatchRecord, BatchStatus, FeedbackSummary, GravelBatchRecord,
    GravelState, PipelineState,
};
pub use store::{GravelStore, StateStore};
