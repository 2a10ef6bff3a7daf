//! Reversible history of relational reconciliations.
//!
//! [`diff`] turns two snapshots into a [`HistoryDelta`] whose patches can be
//! replayed backwards with [`apply_reverse`]; [`HistoryRecorder`] attributes
//! the delta to an actor and appends it to the event log.

mod diff;
mod recorder;

pub use diff::{
    apply_reverse, diff, set_path, ChangeKind, ChangeOp, EntityKind, HistoryDelta, HistoryOperation, Patch, RowKind,
};
pub use recorder::{
    action_label, inferred_label, mutation_label, HistoryRecorder, RecordOutcome, CURRENT_TABLE, EVENTS_TABLE,
    SNAPSHOTS_TABLE,
};

use thiserror::Error;

use crate::db::DbError;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Store error: {0}")]
    Store(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed history delta: {0}")]
    Malformed(String),
}

pub type HistoryResult<T> = Result<T, HistoryError>;
