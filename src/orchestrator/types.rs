// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state types.
//!
//! # State Transitions
//!
//! ```text
//!            recover()                run()
//! Created ───────────→ Recovering ───────────→ Running
//!    │                                            │
//!    │ run() (recovers first)     end of stream / │ shutdown / failure
//!    └──────────────────────────────────────────→ ShuttingDown
//!                                                 │
//!                                 ┌───────────────┴───────────────┐
//!                                 ↓                               ↓
//!                              Stopped                         Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `ReplayEngine::new()`.
//! - **Recovering**: Reading the progress log tail.
//! - **Running**: Transactions are being built and dispatched.
//! - **ShuttingDown**: No new jobs; running jobs finishing.
//! - **Stopped**: Everything submitted was handled. Safe to drop.
//! - **Failed**: A fatal error ended the run. See the returned error.

/// State of the replay engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Recovering,
    Running,
    ShuttingDown,
    Stopped,
    /// Connect, execute, progress log or event source failure.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Recovering => write!(f, "Recovering"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Recovering.to_string(), "Recovering");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_engine_state_equality() {
        assert_eq!(EngineState::Created, EngineState::Created);
        assert_ne!(EngineState::Created, EngineState::Running);
    }
}
