//! State enumerations shared by the work expansion engine and dependency
//! resolution.
//!
//! These are the only definition of work states in the system; stores persist
//! them as text via [`std::fmt::Display`]/[`std::str::FromStr`].

use serde::{Deserialize, Serialize};

/// State of a [`RevisionWork`](crate::work::RevisionWork) or a single
/// [`Work`](crate::work::Work) step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    /// Runnable, not picked up by any builder yet.
    NotDone,
    /// A builder is executing it.
    Executing,
    /// Fatal failure.
    Failed,
    /// Completed successfully.
    Success,
    /// Aborted by an operator.
    Aborted,
    /// Killed after exceeding its time limit.
    Timeout,
    /// Paused by an operator; builders skip it.
    Paused,
    /// Completed with non-fatal test failures.
    Issues,
    /// Blocked until the lane's dependencies are satisfied.
    DependencyNotFulfilled,
    /// Just inserted by the expansion engine; no work rows exist yet.
    /// Only valid between bulk insert and classification.
    NoWorkYet,
}

impl WorkState {
    /// Terminal states a builder can leave a revision work in.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            WorkState::Success
                | WorkState::Failed
                | WorkState::Issues
                | WorkState::Aborted
                | WorkState::Timeout
        )
    }

    /// States that satisfy a success-or-issues dependency condition.
    pub fn is_successish(&self) -> bool {
        matches!(self, WorkState::Success | WorkState::Issues)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkState::NotDone => "not_done",
            WorkState::Executing => "executing",
            WorkState::Failed => "failed",
            WorkState::Success => "success",
            WorkState::Aborted => "aborted",
            WorkState::Timeout => "timeout",
            WorkState::Paused => "paused",
            WorkState::Issues => "issues",
            WorkState::DependencyNotFulfilled => "dependency_not_fulfilled",
            WorkState::NoWorkYet => "no_work_yet",
        }
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_done" => Ok(WorkState::NotDone),
            "executing" => Ok(WorkState::Executing),
            "failed" => Ok(WorkState::Failed),
            "success" => Ok(WorkState::Success),
            "aborted" => Ok(WorkState::Aborted),
            "timeout" => Ok(WorkState::Timeout),
            "paused" => Ok(WorkState::Paused),
            "issues" => Ok(WorkState::Issues),
            "dependency_not_fulfilled" => Ok(WorkState::DependencyNotFulfilled),
            "no_work_yet" => Ok(WorkState::NoWorkYet),
            other => Err(format!("unknown work state: {}", other)),
        }
    }
}

/// What a lane dependency requires of the target lane's revision work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// Target revision work must be in `Success`.
    Success,
    /// Target revision work must be in `Success` and have produced an output
    /// file with the declared name.
    SuccessWithFile,
    /// `Success` or `Issues` both qualify.
    IssuesOrSuccess,
}

impl DependencyCondition {
    /// The states of the target revision work that satisfy this condition.
    pub fn qualifying_states(&self) -> &'static [WorkState] {
        match self {
            DependencyCondition::Success | DependencyCondition::SuccessWithFile => {
                &[WorkState::Success]
            }
            DependencyCondition::IssuesOrSuccess => &[WorkState::Success, WorkState::Issues],
        }
    }

    /// Whether the set-based fast path can evaluate this condition.
    pub fn supports_fast_path(&self) -> bool {
        matches!(
            self,
            DependencyCondition::Success | DependencyCondition::IssuesOrSuccess
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyCondition::Success => "success",
            DependencyCondition::SuccessWithFile => "success_with_file",
            DependencyCondition::IssuesOrSuccess => "issues_or_success",
        }
    }
}

impl std::fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DependencyCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(DependencyCondition::Success),
            "success_with_file" => Ok(DependencyCondition::SuccessWithFile),
            "issues_or_success" => Ok(DependencyCondition::IssuesOrSuccess),
            other => Err(format!("unknown dependency condition: {}", other)),
        }
    }
}
