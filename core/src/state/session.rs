//! Session-wide mutable state.

use turnstile_protocol::protocol::SessionStatus;

use crate::conversation_history::ConversationHistory;
use crate::queue::OperationQueue;
use crate::state::Turn;

/// Everything the coordinator task owns for one session.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    /// Most recent turn. Kept after it settles so its outcome stays
    /// inspectable; a new prompt replaces it.
    pub(crate) turn: Option<Turn>,
    pub(crate) queue: OperationQueue,
    pub(crate) history: ConversationHistory,
    pub(crate) disposed: bool,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            turn: None,
            queue: OperationQueue::new(),
            history: ConversationHistory::new(),
            disposed: false,
        }
    }

    pub(crate) fn turn_in_flight(&self) -> bool {
        self.turn.as_ref().is_some_and(Turn::is_in_flight)
    }

    pub(crate) fn status(&self) -> SessionStatus {
        let in_flight = self.turn.as_ref().filter(|turn| turn.is_in_flight());
        SessionStatus {
            is_streaming: in_flight.is_some(),
            turn_id: in_flight.map(Turn::id),
            queued_operations: self.queue.len(),
            disposed: self.disposed,
        }
    }
}
