//! Task lifecycle state machine.
//!
//! `transition` is a pure function of (state, event, attempt, budget), kept
//! free of I/O so the bounded-retry guarantee can be tested exhaustively.
//! `attempt` is the 1-based number of the attempt being resolved; `budget`
//! is the number of retries allowed after the first attempt, so a task gets
//! `budget + 1` attempts in total.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Linting,
    Testing,
    Success,
    Escalated,
    Failed,
}

impl TaskStatus {
    /// Terminal states absorb every further event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Escalated | TaskStatus::Failed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Linting => "LINTING",
            TaskStatus::Testing => "TESTING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Escalated => "ESCALATED",
            TaskStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Everything that can happen to a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// A sandbox was acquired and context hydrated.
    SandboxAcquired,
    /// The planner produced a non-empty patch, now written to the sandbox.
    PatchWritten,
    /// The planner produced nothing usable. Consumes an attempt, exactly
    /// like a failed gate.
    PatchEmpty,
    LintPassed,
    TestsPassed,
    /// A lint or test gate rejected the patch.
    GateFailed,
    /// An internal fault: the system itself broke, not the patch.
    Fault,
}

/// Advance the task state machine by one event.
///
/// A gate failure (or empty patch) on the final allowed attempt lands in
/// `Escalated`; earlier failures return to `Running` for another attempt.
/// `Fault` lands in `Failed` from any non-terminal state. Terminal states
/// and undefined (state, event) pairs are absorbing.
pub fn transition(state: TaskStatus, event: TaskEvent, attempt: u32, budget: u32) -> TaskStatus {
    if state.is_terminal() {
        return state;
    }
    if event == TaskEvent::Fault {
        return TaskStatus::Failed;
    }

    let retries_left = attempt <= budget;
    match (state, event) {
        (TaskStatus::Pending, TaskEvent::SandboxAcquired) => TaskStatus::Running,
        (TaskStatus::Running, TaskEvent::PatchWritten) => TaskStatus::Linting,
        (TaskStatus::Running, TaskEvent::PatchEmpty)
        | (TaskStatus::Linting, TaskEvent::GateFailed)
        | (TaskStatus::Testing, TaskEvent::GateFailed) => {
            if retries_left {
                TaskStatus::Running
            } else {
                TaskStatus::Escalated
            }
        }
        (TaskStatus::Linting, TaskEvent::LintPassed) => TaskStatus::Testing,
        (TaskStatus::Testing, TaskEvent::TestsPassed) => TaskStatus::Success,
        (state, _) => state,
    }
}
