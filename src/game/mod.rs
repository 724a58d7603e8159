//! Game Logic Module
//!
//! World rules with no I/O: tiles, the map, pathfinding, combat, the
//! local character mirror and the event bus that ties them to the
//! network layer.
//!
//! ## Module Structure
//!
//! - `events`: Closed event set and synchronous bus
//! - `tile`: Terrain kinds and the work/cooldown state machine
//! - `path`: Walkability grid and A*
//! - `map`: Tile grid, snapshots, map generation
//! - `fight`: Rock-paper-scissors combat encounters
//! - `character`: Client-side player stats
//! - `scheduler`: Keyed deferred tasks for tile and fight timers

pub mod character;
pub mod events;
pub mod fight;
pub mod map;
pub mod path;
pub mod scheduler;
pub mod tile;

// Re-export key types
pub use character::{Character, CharacterError, SharedCharacter, Stats, LEVELABLE_STATS};
pub use events::{EventBus, EventKind, EventSink, GameEvent, PublishReport, SubscriptionId, View};
pub use fight::{resolve, FightAction, FightEncounter, FightError, FightOutcome, RoundResult};
pub use map::{ClosestPlayer, GameMap, MapError, MapGenerator, MapSnapshot, TileSnapshot};
pub use scheduler::{Scheduler, TaskKey};
pub use tile::{Terrain, Tile, TileState};
