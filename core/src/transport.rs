use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use turnstile_protocol::TurnId;

use crate::conversation_history::HistoryEntry;
use crate::error::TransportError;
use crate::event_stream::EventStream;

/// Request payload for a single model turn.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub turn_id: TurnId,

    /// The user input that opened this turn.
    pub input: String,

    /// Conversation transcript, oldest first, ending with the entry for
    /// `input`.
    pub history: Vec<HistoryEntry>,

    /// Cancelled once the turn settles, whatever ended it: a terminal event,
    /// an implicit end, an idle timeout, an abort or disposal. Producers
    /// should stop emitting once it fires.
    pub cancellation: CancellationToken,

    /// Suggested capacity for the event channel backing the returned stream.
    pub stream_channel_capacity: usize,
}

/// Opens one streaming turn against the model backend.
///
/// Retries, authentication and model selection are the implementor's
/// business; the returned stream must follow the `StreamEvent` ordering rules.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn stream(&self, prompt: Prompt) -> Result<EventStream, TransportError>;
}
