//! # Wayfarer Game Server
//!
//! Authoritative server and client core for Wayfarer, a multiplayer
//! terminal exploration game played on a shared tile map.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WAYFARER SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Value types                               │
//! │  ├── position.rs - Grid coordinates                          │
//! │  └── id.rs       - Player and fight ids                      │
//! │                                                              │
//! │  game/           - Game rules (no I/O)                       │
//! │  ├── events.rs   - Event set and synchronous bus             │
//! │  ├── tile.rs     - Work/cooldown state machine               │
//! │  ├── path.rs     - Walkability grid and A*                   │
//! │  ├── map.rs      - Tile grid, snapshots, generation          │
//! │  ├── fight.rs    - Turn-based combat                         │
//! │  ├── character.rs- Client-side stats                         │
//! │  └── scheduler.rs- Keyed timers                              │
//! │                                                              │
//! │  network/        - TCP transport                             │
//! │  ├── framing.rs  - Line and bulk frames                      │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── world.rs    - Shared server state, command handling     │
//! │  ├── session.rs  - Per-connection tasks                      │
//! │  ├── server.rs   - Accept loop                               │
//! │  └── client.rs   - Client session and map mirror             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority
//!
//! The server owns the map, the tile timers and every fight. Clients
//! keep a mirror that only changes in response to server broadcasts.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::{FightId, PlayerId, Position};
pub use game::{EventBus, GameEvent, GameMap, Tile, TileState};
pub use network::{ClientConfig, ClientSession, GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
