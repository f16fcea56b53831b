//! Plugin instance lifecycle: `Uninitialized → Initialized → Running → Stopped`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Running,
    /// Terminal. A stopped instance is never restarted; create a new one.
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Operations that move (or require) a lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Initialize,
    Start,
    Run,
    Stop,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Initialize => "initialize",
            Operation::Start => "start",
            Operation::Run => "run",
            Operation::Stop => "stop",
        }
    }
}

/// State after applying `op` in `current`, or `None` if `op` is not allowed.
///
/// `Stop` is allowed from every state and is idempotent.
pub fn next_state(current: LifecycleState, op: Operation) -> Option<LifecycleState> {
    use LifecycleState::{Initialized, Running, Stopped, Uninitialized};
    match (current, op) {
        (Uninitialized, Operation::Initialize) => Some(Initialized),
        (Initialized, Operation::Start) => Some(Running),
        (Running, Operation::Run) => Some(Running),
        (_, Operation::Stop) => Some(Stopped),
        _ => None,
    }
}
