//! Inter-lane dependency declarations.

use serde::{Deserialize, Serialize};

use crate::{DependencyCondition, EntityId};

/// Declares that a lane's work may only proceed once another lane's revision
/// work for the same revision string reaches a qualifying state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneDependency {
    pub id: EntityId,
    /// The lane whose work is gated.
    pub lane_id: EntityId,
    /// The lane that must reach the qualifying state first.
    pub dependent_lane_id: EntityId,
    /// Restrict the dependency to one host's revision work, if set.
    pub dependent_host_id: Option<EntityId>,
    pub condition: DependencyCondition,
    /// Output file required by `success_with_file`.
    pub filename: Option<String>,
}
