//! Units of work derived from the (lane, host, revision) cross-product.

use serde::{Deserialize, Serialize};

use crate::{EntityId, WorkState};

/// "This revision must be built on this host for this lane."
/// Unique per (lane_id, host_id, revision_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionWork {
    pub id: EntityId,
    pub lane_id: EntityId,
    pub host_id: EntityId,
    pub revision_id: EntityId,
    pub state: WorkState,
    /// Set by the executor once every work row has finished.
    pub completed: bool,
}

/// One command execution within a revision work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub id: EntityId,
    pub revision_work_id: EntityId,
    pub command_id: EntityId,
    pub state: WorkState,
}

/// An output file produced by a work step, referenced by
/// `success_with_file` dependency conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkFile {
    pub id: EntityId,
    pub work_id: EntityId,
    pub filename: String,
}
