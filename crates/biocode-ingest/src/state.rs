//! Ingestion loop states
//!
//! ```text
//! Disconnected -> Connecting -> Polling <-> Processing
//!                     |            |  ^         |
//!                     v            v  |         v
//!                  Stopped <---- Backoff <------+
//! ```
//!
//! Every state can reach `Stopped` on an explicit stop.

use serde::{Deserialize, Serialize};

/// Loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IngestState {
    /// Not yet connected
    Disconnected,
    /// Establishing the first connection
    Connecting,
    /// Fetching the next page of images
    Polling,
    /// Working through a page
    Processing,
    /// Reconnecting after a lost connection
    Backoff,
    /// Terminal
    Stopped,
}

impl IngestState {
    /// Check if the state is terminal
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Validates a state transition
///
/// # Errors
/// Returns [`StateError::IllegalTransition`] if `to` is not reachable from `from`
pub fn validate_transition(from: IngestState, to: IngestState) -> Result<(), StateError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: IngestState) -> Vec<IngestState> {
    use IngestState::{Backoff, Connecting, Disconnected, Polling, Processing, Stopped};
    match from {
        Disconnected => vec![Connecting, Stopped],
        Connecting => vec![Polling, Stopped],
        Polling => vec![Processing, Backoff, Stopped],
        Processing => vec![Polling, Backoff, Stopped],
        Backoff => vec![Polling, Stopped],
        Stopped => vec![],
    }
}

/// State machine violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// Transition not in the table
    #[error("illegal state transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: IngestState,
        to: IngestState,
    },
}
