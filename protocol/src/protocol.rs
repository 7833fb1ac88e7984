//! Types exchanged between the model transport, the session coordinator and
//! whoever observes a session.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use uuid::Uuid;

use crate::models::AssistantMessage;
use crate::models::ContentDelta;

/// Identifies one prompt/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a stream ended with an `error` event. An abort reported by the backend
/// is still an error as far as turn settlement is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamErrorReason {
    #[default]
    Error,
    Aborted,
}

/// Lifecycle events produced by the model transport for a single turn.
///
/// At most one of `Done`/`Error` is produced and it is always the last event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        partial: AssistantMessage,
    },
    Delta {
        delta: ContentDelta,
    },
    Done {
        message: AssistantMessage,
    },
    Error {
        reason: StreamErrorReason,
        error: AssistantMessage,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// Maintenance work that may be requested at any time and runs between turns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    /// Summarize older history to shrink the context.
    Compact {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompactionResult {
    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationOutput {
    Compaction(CompactionResult),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TurnStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Aborted,
    Errored,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnStatus::Completed | TurnStatus::Aborted | TurnStatus::Errored
        )
    }

    /// A turn occupies the session's turn slot until it reaches a terminal
    /// status.
    pub fn is_in_flight(self) -> bool {
        !self.is_terminal()
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub is_streaming: bool,
    pub turn_id: Option<TurnId>,
    pub queued_operations: usize,
    pub disposed: bool,
}

/// Notifications broadcast to session observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    TurnStarted {
        turn_id: TurnId,
    },
    MessageStarted {
        turn_id: TurnId,
    },
    MessageDelta {
        turn_id: TurnId,
        delta: ContentDelta,
    },
    TurnEnded {
        turn_id: TurnId,
        status: TurnStatus,
    },
    OperationQueued {
        seq: u64,
        kind: OperationKind,
    },
    OperationStarted {
        seq: u64,
    },
    OperationFinished {
        seq: u64,
        success: bool,
    },
    OperationRejected {
        seq: u64,
    },
    HistoryCompacted {
        removed_entries: usize,
        tokens_before: u64,
    },
    SessionDisposed,
}
