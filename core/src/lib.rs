//! Root of the `turnstile-core` library.
//!
//! A [`Session`] drives one streaming turn at a time against a
//! [`ModelTransport`] and runs maintenance operations (compaction) requested
//! in the meantime once the turn has settled.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the appropriate abstraction.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod conversation_history;
mod coordinator;
pub mod error;
pub mod event_stream;
pub mod operations;
mod queue;
mod session;
mod state;
pub mod transport;

pub use config::SessionConfig;
pub use config::load_config_from_path;
pub use conversation_history::ConversationHistory;
pub use conversation_history::HistoryEntry;
pub use conversation_history::HistoryItem;
pub use error::OperationError;
pub use error::TransportError;
pub use error::TurnError;
pub use event_stream::EventSender;
pub use event_stream::EventStream;
pub use event_stream::StreamStep;
pub use operations::OperationExecutor;
pub use session::PendingOperation;
pub use session::PendingTurn;
pub use session::Session;
pub use state::TransitionError;
pub use state::Turn;
pub use transport::ModelTransport;
pub use transport::Prompt;

/// Protocol types from `turnstile-protocol`, reachable as
/// `turnstile_core::protocol` and `turnstile_core::models`.
pub use turnstile_protocol::models;
pub use turnstile_protocol::protocol;
