//! Session/turn state owned by the coordinator.
//!
//! Nothing outside the coordinator task mutates these types; observers get
//! snapshots through the session facade.

mod session;
mod turn;

pub(crate) use session::SessionState;
pub use turn::TransitionError;
pub use turn::Turn;
