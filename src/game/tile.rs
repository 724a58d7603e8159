//! Tiles
//!
//! One grid cell and its work/cooldown interaction cycle:
//!
//! ```text
//! READY --work--> WORKING --work_complete--> FINISHED
//!   ^                                            |
//!   +--cooldown_complete-- COOLING_DOWN <--cooldown
//! ```
//!
//! Every transition attempt emits an event into the caller's sink,
//! successful or not. Tiles never schedule their own completions; whoever
//! owns the map does that after a successful `work`/`cooldown`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{PlayerId, Position};
use crate::game::events::{EventSink, GameEvent};

/// Default time a tile spends in WORKING.
pub const DEFAULT_WORK_TIME: Duration = Duration::from_secs(5);

/// Default time a tile spends in COOLING_DOWN.
pub const DEFAULT_COOLDOWN_TIME: Duration = Duration::from_secs(5);

/// Terrain kind of a tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terrain {
    /// Placeholder; never present on a valid map.
    Unknown,
    /// Open plain.
    Plain,
    /// Dungeon entrance.
    Dungeon,
    /// Forest.
    Woods,
    /// River; not walkable.
    River,
    /// Mountain; not walkable.
    Mountain,
    /// Farmland.
    Farmland,
    /// Castle.
    Castle,
    /// Grassland.
    Grassland,
    /// Swamp.
    Swamp,
    /// Desert.
    Desert,
    /// Town.
    Town,
    /// Lake.
    Lake,
    /// Dirt path.
    Path,
    /// Hill.
    Hill,
    /// Bridge over water.
    Bridge,
}

impl Terrain {
    /// Every terrain that may appear on a map, in layout-letter order.
    pub const PLACEABLE: [Terrain; 15] = [
        Terrain::Plain,
        Terrain::Dungeon,
        Terrain::Woods,
        Terrain::River,
        Terrain::Mountain,
        Terrain::Farmland,
        Terrain::Castle,
        Terrain::Grassland,
        Terrain::Swamp,
        Terrain::Desert,
        Terrain::Town,
        Terrain::Lake,
        Terrain::Path,
        Terrain::Hill,
        Terrain::Bridge,
    ];

    /// Parse a layout letter.
    pub fn from_letter(letter: char) -> Option<Terrain> {
        let terrain = match letter {
            'x' => Terrain::Plain,
            'o' => Terrain::Dungeon,
            'w' => Terrain::Woods,
            'r' => Terrain::River,
            'm' => Terrain::Mountain,
            'f' => Terrain::Farmland,
            'c' => Terrain::Castle,
            'g' => Terrain::Grassland,
            's' => Terrain::Swamp,
            'd' => Terrain::Desert,
            't' => Terrain::Town,
            'l' => Terrain::Lake,
            'p' => Terrain::Path,
            'h' => Terrain::Hill,
            'b' => Terrain::Bridge,
            _ => return None,
        };
        Some(terrain)
    }

    /// Layout letter.
    pub fn letter(self) -> char {
        match self {
            Terrain::Unknown => '?',
            Terrain::Plain => 'x',
            Terrain::Dungeon => 'o',
            Terrain::Woods => 'w',
            Terrain::River => 'r',
            Terrain::Mountain => 'm',
            Terrain::Farmland => 'f',
            Terrain::Castle => 'c',
            Terrain::Grassland => 'g',
            Terrain::Swamp => 's',
            Terrain::Desert => 'd',
            Terrain::Town => 't',
            Terrain::Lake => 'l',
            Terrain::Path => 'p',
            Terrain::Hill => 'h',
            Terrain::Bridge => 'b',
        }
    }

    /// Can players stand on this terrain?
    #[inline]
    pub fn is_walkable(self) -> bool {
        !matches!(self, Terrain::Unknown | Terrain::Mountain | Terrain::River)
    }

    /// Can players work this terrain? Same set as walkable.
    #[inline]
    pub fn is_workable(self) -> bool {
        self.is_walkable()
    }
}

/// Work/cooldown cycle state. Exactly one holds at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileState {
    /// Can be worked.
    #[default]
    Ready,
    /// Work in progress.
    Working,
    /// Work done, can be activated.
    Finished,
    /// Activated, waiting to become ready.
    CoolingDown,
}

/// A single map cell.
#[derive(Clone, Debug, PartialEq)]
pub struct Tile {
    /// Transport-local label. Not stable across snapshots.
    pub id: u64,
    /// Terrain kind.
    pub terrain: Terrain,
    /// Grid position.
    pub position: Position,
    /// Time spent in WORKING.
    pub work_time: Duration,
    /// Time spent in COOLING_DOWN.
    pub cooldown_time: Duration,
    /// Free-form per-tile data.
    pub additional_data: serde_json::Map<String, serde_json::Value>,
    state: TileState,
}

impl Tile {
    /// Create a READY tile with default durations.
    pub fn new(id: u64, terrain: Terrain, position: Position) -> Self {
        Self {
            id,
            terrain,
            position,
            work_time: DEFAULT_WORK_TIME,
            cooldown_time: DEFAULT_COOLDOWN_TIME,
            additional_data: serde_json::Map::new(),
            state: TileState::Ready,
        }
    }

    /// Create a tile with an explicit state (used when rebuilding from a snapshot).
    pub fn with_state(mut self, state: TileState) -> Self {
        self.state = state;
        self
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> TileState {
        self.state
    }

    /// Start work. Legal only from READY on workable terrain.
    pub fn work(&mut self, player_id: Option<PlayerId>, mut sink: impl EventSink) -> bool {
        let success = self.state == TileState::Ready && self.terrain.is_workable();
        if success {
            debug!(tile = self.id, position = %self.position, ?player_id, "tile working");
            self.state = TileState::Working;
        } else {
            debug!(tile = self.id, state = ?self.state, terrain = ?self.terrain, "tile not ready to work");
        }
        sink.emit(GameEvent::TileWorking {
            player_id,
            position: self.position,
            success,
        });
        success
    }

    /// Work timer elapsed: WORKING -> FINISHED.
    pub fn work_complete(&mut self, mut sink: impl EventSink) -> bool {
        if self.state != TileState::Working {
            warn!(tile = self.id, state = ?self.state, "work completion outside WORKING ignored");
            return false;
        }
        self.state = TileState::Finished;
        sink.emit(GameEvent::TileWorked {
            position: self.position,
            success: true,
        });
        true
    }

    /// Activate a worked tile. Legal only from FINISHED.
    pub fn cooldown(&mut self, player_id: Option<PlayerId>, mut sink: impl EventSink) -> bool {
        let success = self.state == TileState::Finished;
        if success {
            debug!(tile = self.id, position = %self.position, ?player_id, "tile activated");
            self.state = TileState::CoolingDown;
        } else {
            debug!(tile = self.id, state = ?self.state, "tile not finished working");
        }
        sink.emit(GameEvent::TileActivated {
            player_id,
            position: self.position,
            success,
        });
        success
    }

    /// Cooldown timer elapsed: COOLING_DOWN -> READY.
    pub fn cooldown_complete(&mut self, mut sink: impl EventSink) -> bool {
        if self.state != TileState::CoolingDown {
            warn!(tile = self.id, state = ?self.state, "cooldown completion outside COOLING_DOWN ignored");
            return false;
        }
        self.state = TileState::Ready;
        sink.emit(GameEvent::TileReady {
            position: self.position,
            success: true,
        });
        true
    }

    /// Wire flags `(is_ready_to_work, is_finished_work, is_cooling_down)`.
    pub fn state_flags(&self) -> (bool, bool, bool) {
        match self.state {
            TileState::Ready => (true, false, false),
            TileState::Working => (false, false, false),
            TileState::Finished => (false, true, false),
            TileState::CoolingDown => (false, false, true),
        }
    }

    /// Inverse of [`Tile::state_flags`]. None for contradictory flags.
    pub fn state_from_flags(ready: bool, finished: bool, cooling: bool) -> Option<TileState> {
        match (ready, finished, cooling) {
            (true, false, false) => Some(TileState::Ready),
            (false, false, false) => Some(TileState::Working),
            (false, true, false) => Some(TileState::Finished),
            (false, false, true) => Some(TileState::CoolingDown),
            _ => None,
        }
    }
}
