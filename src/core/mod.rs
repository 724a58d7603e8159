//! Core value types.
//!
//! Small, copyable types shared by the game and network layers.

pub mod id;
pub mod position;

// Re-export core types
pub use id::{FightId, IdAllocator, PlayerId};
pub use position::Position;
