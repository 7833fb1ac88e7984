#![deny(unreachable_pub)]

// Public modules that make up the protocol surface.
pub mod models;
pub mod protocol;

pub use protocol::TurnId;

// Convenience prelude that re-exports the full public API of the submodules.
pub mod prelude {
    pub use crate::models::*;
    pub use crate::protocol::*;
}
