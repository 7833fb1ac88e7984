use std::time::Duration;

use thiserror::Error;
use turnstile_protocol::models::AssistantMessage;
use turnstile_protocol::protocol::StreamErrorReason;

/// Why a turn did not produce a final assistant message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TurnError {
    /// A turn is already in flight for this session.
    #[error("a turn is already streaming for this session")]
    AlreadyStreaming,

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The turn was cancelled before the backend produced a terminal event.
    #[error("turn aborted")]
    Aborted,

    /// The session was disposed before the prompt could run.
    #[error("session disposed")]
    Disposed,
}

impl TurnError {
    /// True for every abort flavour: an explicit cancellation, or an `error`
    /// event whose reason is `aborted`.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            TurnError::Aborted
                | TurnError::Transport(TransportError::Backend {
                    reason: StreamErrorReason::Aborted,
                    ..
                })
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The backend reported a failure through an `error` stream event.
    #[error("model backend reported {reason}: {}", message.text())]
    Backend {
        reason: StreamErrorReason,
        message: Box<AssistantMessage>,
    },

    /// The producer went away without a `done` or `error` event.
    #[error("stream closed before a terminal event")]
    ImplicitStreamEnd,

    #[error("idle timeout waiting for stream events after {0:?}")]
    IdleTimeout(Duration),

    #[error("failed to open model stream: {0}")]
    Connect(String),
}

/// Outcome of a queued maintenance operation that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// The session was torn down before the operation started.
    #[error("session disposed before the operation ran")]
    Disposed,

    /// The operation itself failed; later operations are unaffected.
    #[error("operation failed: {0}")]
    Failed(String),
}
