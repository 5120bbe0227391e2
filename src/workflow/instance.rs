// Workflow phase machine. Phases only move forward; terminal phases
// accept no transitions. The current phase is part of durable history.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowPhase {
    Created,
    LockAcquisition,
    Executing,
    Aggregating,
    Committing,
    Completed,
    Failed,
}

impl WorkflowPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowPhase::Completed | WorkflowPhase::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            WorkflowPhase::Created => 0,
            WorkflowPhase::LockAcquisition => 1,
            WorkflowPhase::Executing => 2,
            WorkflowPhase::Aggregating => 3,
            WorkflowPhase::Committing => 4,
            WorkflowPhase::Completed | WorkflowPhase::Failed => 5,
        }
    }

    /// Whether this phase is at or past another one. A resumed instance
    /// skips transitions it already made.
    pub fn has_reached(&self, other: WorkflowPhase) -> bool {
        self.rank() >= other.rank()
    }

    /// Forward transitions only. Any non-terminal phase may fail.
    pub fn can_transition_to(&self, next: WorkflowPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == WorkflowPhase::Failed {
            return true;
        }
        next.rank() == self.rank() + 1
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkflowPhase::Created => "created",
            WorkflowPhase::LockAcquisition => "lock_acquisition",
            WorkflowPhase::Executing => "executing",
            WorkflowPhase::Aggregating => "aggregating",
            WorkflowPhase::Committing => "committing",
            WorkflowPhase::Completed => "completed",
            WorkflowPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_order() {
        use WorkflowPhase::*;
        assert!(Created.can_transition_to(LockAcquisition));
        assert!(LockAcquisition.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Aggregating));
        assert!(Aggregating.can_transition_to(Committing));
        assert!(Committing.can_transition_to(Completed));
    }

    #[test]
    fn any_active_phase_can_fail() {
        use WorkflowPhase::*;
        for phase in [Created, LockAcquisition, Executing, Aggregating, Committing] {
            assert!(phase.can_transition_to(Failed), "{phase} should be able to fail");
        }
    }

    #[test]
    fn terminal_phases_accept_no_transitions() {
        use WorkflowPhase::*;
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Executing));
        assert!(!Completed.can_transition_to(Completed));
    }

    #[test]
    fn no_phase_skipping() {
        use WorkflowPhase::*;
        assert!(!Created.can_transition_to(Executing));
        assert!(!LockAcquisition.can_transition_to(Committing));
    }
}
