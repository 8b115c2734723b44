//! Published chat state.

use super::message::Transcript;
use crate::error::{ChatError, ChatErrorKind};
use std::fmt;

/// Snapshot broadcast to every observer after each change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    pub transcript: Transcript,
    /// A model is loaded and prompts are accepted. Never goes back to false.
    pub ready: bool,
    /// A lookup, load or generation is in flight.
    pub loading: bool,
    /// The most recent failure, kept so callers can offer a retry.
    pub last_error: Option<ChatError>,
}

/// Where the session sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingModel,
    Ready,
    Generating,
    Unavailable,
    Error,
}

impl ChatState {
    /// Busy indicator for the presentation layer.
    pub fn is_busy(&self) -> bool {
        self.loading
    }

    pub fn phase(&self) -> Phase {
        match (self.ready, self.loading) {
            (true, true) => Phase::Generating,
            (true, false) => Phase::Ready,
            (false, true) => Phase::AwaitingModel,
            (false, false) => match self.last_error.as_ref().map(|e| e.kind) {
                None => Phase::Idle,
                Some(ChatErrorKind::ModelUnavailable) => Phase::Unavailable,
                Some(_) => Phase::Error,
            },
        }
    }

    /// Whether a manual retry of initialization makes sense.
    pub fn can_retry(&self) -> bool {
        !self.ready
            && !self.loading
            && self
                .last_error
                .as_ref()
                .is_some_and(|e| e.kind.is_retryable())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Idle => "idle",
            Phase::AwaitingModel => "loading model",
            Phase::Ready => "ready",
            Phase::Generating => "generating",
            Phase::Unavailable => "model unavailable",
            Phase::Error => "error",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_error(kind: ChatErrorKind) -> ChatState {
        ChatState {
            last_error: Some(ChatError::new(kind, "x")),
            ..ChatState::default()
        }
    }

    #[test]
    fn test_phase_transitions() {
        let mut state = ChatState::default();
        assert_eq!(state.phase(), Phase::Idle);

        state.loading = true;
        assert_eq!(state.phase(), Phase::AwaitingModel);

        state.ready = true;
        assert_eq!(state.phase(), Phase::Generating);

        state.loading = false;
        assert_eq!(state.phase(), Phase::Ready);
    }

    #[test]
    fn test_failure_phases() {
        assert_eq!(
            with_error(ChatErrorKind::ModelUnavailable).phase(),
            Phase::Unavailable
        );
        assert_eq!(with_error(ChatErrorKind::ModelLoad).phase(), Phase::Error);
        assert_eq!(
            with_error(ChatErrorKind::ModelDiscovery).phase(),
            Phase::Error
        );
    }

    #[test]
    fn test_generation_error_keeps_ready_phase() {
        let state = ChatState {
            ready: true,
            ..with_error(ChatErrorKind::Generation)
        };
        assert_eq!(state.phase(), Phase::Ready);
        assert!(!state.can_retry());
    }

    #[test]
    fn test_can_retry_after_load_failure() {
        assert!(with_error(ChatErrorKind::ModelLoad).can_retry());
        assert!(!ChatState::default().can_retry());
    }
}
