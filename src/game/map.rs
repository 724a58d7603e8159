//! World Map
//!
//! Fixed-size grid of [`Tile`]s. The server owns the authoritative copy;
//! each client holds a mirror rebuilt from a [`MapSnapshot`].
//!
//! Terrain never changes after construction, so the walkability grid used
//! for pathfinding is built once on first use and cached.

use std::sync::OnceLock;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::{PlayerId, Position};
use crate::game::path::WalkGrid;
use crate::game::tile::{Terrain, Tile, TileState};

/// Width of the built-in world.
pub const DEFAULT_WIDTH: usize = 50;

/// Height of the built-in world.
pub const DEFAULT_HEIGHT: usize = 10;

/// Built-in world layout, one letter per tile (see [`Terrain::from_letter`]).
pub const DEFAULT_LAYOUT: &str = "\
ggggwwwwwwwwffffffxxxxxxxxpmmmmxxxxxwwwwwwwwwggggg
ggtgwwwwoowwffffffxxcxxxxxpmmmxxxxxxwwwwsswwwgggdd
gggghhwwwwwwffffffxxxxxxxxpxmxxxxxxxwwwssswwwggddd
xxxxhhhxxxxxxxxxxxppppppppppxxxxxxxxxxxxxxxxxxxddd
rrrrrrrrbrrrrrrrrrrrrrrrrrbrrrrrrrrrrrrrrbrrrrrrrr
xxxxxxxxpxxxxxffffxxxxxxxxpxxxxxlllxxxxxxpxxxxxxxx
wwwwxxxxpxxxxxffffxxxttxxxpxxxxllllxxxhhhpxxxsssxx
wwwwwxxxppppppppppppptttppppxxxxllxxxhhhhpxxsssssx
wwowwxxxxxxxxxmmmxxxxxxxxxxxxxxxxxxxxxhhhpxxxsssxx
wwwwwxxxxxxxxmmmmmxxxxxxxxxxxxxxxxxxxxxxxpxxxxxxdd";

/// Map construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Width or height is zero.
    #[error("Map dimensions must be non-zero (got {width}x{height})")]
    EmptyDimensions { width: usize, height: usize },

    /// Layout does not have width * height letters.
    #[error("Layout has {actual} tiles, expected {expected}")]
    LayoutSize { expected: usize, actual: usize },

    /// Layout letter does not name a terrain.
    #[error("Unknown terrain letter {letter:?} at ({x}, {y})")]
    UnknownTerrain { letter: char, x: usize, y: usize },

    /// Snapshot tile references a position outside the grid.
    #[error("Tile position ({0}) is out of bounds")]
    OutOfBounds(Position),

    /// Snapshot carries a terrain that may not be placed.
    #[error("Terrain {0:?} cannot be placed on a map")]
    UnplaceableTerrain(Terrain),

    /// Snapshot state flags do not describe exactly one state.
    #[error("Tile at ({0}) has contradictory state flags")]
    InvalidTileState(Position),

    /// Snapshot does not cover every cell.
    #[error("Snapshot has no tile for ({0})")]
    MissingTile(Position),
}

/// Wire form of a single tile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileSnapshot {
    /// Terrain kind.
    pub tile_type: Terrain,
    /// Grid position.
    pub position: Position,
    /// Work duration in milliseconds.
    pub work_time_ms: u64,
    /// Cooldown duration in milliseconds.
    pub cooldown_time_ms: u64,
    /// READY flag.
    pub is_ready_to_work: bool,
    /// FINISHED flag.
    pub is_finished_work: bool,
    /// COOLING_DOWN flag.
    pub is_cooling_down: bool,
    /// Free-form per-tile data.
    #[serde(default)]
    pub additional_data: serde_json::Map<String, serde_json::Value>,
    /// Transport-local label.
    pub id: u64,
}

impl From<&Tile> for TileSnapshot {
    fn from(tile: &Tile) -> Self {
        let (is_ready_to_work, is_finished_work, is_cooling_down) = tile.state_flags();
        Self {
            tile_type: tile.terrain,
            position: tile.position,
            work_time_ms: tile.work_time.as_millis() as u64,
            cooldown_time_ms: tile.cooldown_time.as_millis() as u64,
            is_ready_to_work,
            is_finished_work,
            is_cooling_down,
            additional_data: tile.additional_data.clone(),
            id: tile.id,
        }
    }
}

/// Wire form of a whole map: dimensions plus rows of tiles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapSnapshot {
    /// Columns.
    pub width: usize,
    /// Rows.
    pub height: usize,
    /// Row-major tiles.
    pub map: Vec<Vec<TileSnapshot>>,
}

/// Result of a closest-player search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClosestPlayer {
    /// The player found.
    pub player_id: PlayerId,
    /// Where they stand.
    pub position: Position,
    /// Waypoints on the shortest walkable path, both endpoints included.
    pub waypoints: usize,
}

impl ClosestPlayer {
    /// Moves needed to reach the player.
    pub fn steps(&self) -> usize {
        self.waypoints.saturating_sub(1)
    }
}

/// The world grid.
#[derive(Clone, Debug)]
pub struct GameMap {
    width: usize,
    height: usize,
    tiles: Vec<Tile>,
    walk_grid: OnceLock<WalkGrid>,
}

impl GameMap {
    /// Build from a layout string of terrain letters. Whitespace is ignored.
    pub fn from_layout(width: usize, height: usize, layout: &str) -> Result<Self, MapError> {
        if width == 0 || height == 0 {
            return Err(MapError::EmptyDimensions { width, height });
        }

        let letters: Vec<char> = layout.chars().filter(|c| !c.is_whitespace()).collect();
        let expected = width * height;
        if letters.len() != expected {
            return Err(MapError::LayoutSize { expected, actual: letters.len() });
        }

        let mut tiles = Vec::with_capacity(expected);
        for (index, letter) in letters.into_iter().enumerate() {
            let (x, y) = (index % width, index / width);
            let terrain = Terrain::from_letter(letter)
                .ok_or(MapError::UnknownTerrain { letter, x, y })?;
            tiles.push(Tile::new(index as u64, terrain, Position::new(x as i32, y as i32)));
        }

        Ok(Self {
            width,
            height,
            tiles,
            walk_grid: OnceLock::new(),
        })
    }

    /// The built-in 50x10 world.
    pub fn default_world() -> Self {
        match Self::from_layout(DEFAULT_WIDTH, DEFAULT_HEIGHT, DEFAULT_LAYOUT) {
            Ok(map) => map,
            Err(e) => unreachable!("built-in layout is valid: {}", e),
        }
    }

    /// A map of a single terrain.
    pub fn filled(width: usize, height: usize, terrain: Terrain) -> Result<Self, MapError> {
        let layout: String = std::iter::repeat(terrain.letter()).take(width * height).collect();
        Self::from_layout(width, height, &layout)
    }

    /// Columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Rows.
    pub fn height(&self) -> usize {
        self.height
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(y as usize * self.width + x as usize)
    }

    /// Bounds-checked lookup.
    pub fn get_tile(&self, x: i32, y: i32) -> Option<&Tile> {
        self.index(x, y).map(|i| &self.tiles[i])
    }

    /// Bounds-checked mutable lookup.
    pub fn get_tile_mut(&mut self, x: i32, y: i32) -> Option<&mut Tile> {
        self.index(x, y).map(move |i| &mut self.tiles[i])
    }

    /// Lookup by position.
    pub fn tile_at(&self, pos: Position) -> Option<&Tile> {
        self.get_tile(pos.x, pos.y)
    }

    /// Mutable lookup by position.
    pub fn tile_at_mut(&mut self, pos: Position) -> Option<&mut Tile> {
        self.get_tile_mut(pos.x, pos.y)
    }

    /// All tiles in row-major order.
    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter()
    }

    /// False outside bounds or on unknown/mountain/river terrain.
    pub fn is_walkable(&self, x: i32, y: i32) -> bool {
        self.get_tile(x, y).is_some_and(|t| t.terrain.is_walkable())
    }

    /// Attach free-form data to a tile. Returns false if out of bounds.
    pub fn set_additional_data(
        &mut self,
        x: i32,
        y: i32,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        match self.get_tile_mut(x, y) {
            Some(tile) => {
                tile.additional_data = data;
                true
            }
            None => false,
        }
    }

    /// Override work/cooldown durations on every tile.
    pub fn set_durations(&mut self, work_time: Duration, cooldown_time: Duration) {
        for tile in &mut self.tiles {
            tile.work_time = work_time;
            tile.cooldown_time = cooldown_time;
        }
    }

    /// One string of terrain letters per row.
    pub fn render_rows(&self) -> Vec<String> {
        self.tiles
            .chunks(self.width)
            .map(|row| row.iter().map(|t| t.terrain.letter()).collect())
            .collect()
    }

    /// Log the terrain grid at info level.
    pub fn log_layout(&self) {
        for row in self.render_rows() {
            info!("{}", row);
        }
    }

    /// Cached walkability grid.
    pub fn walk_grid(&self) -> &WalkGrid {
        self.walk_grid.get_or_init(|| {
            debug!(width = self.width, height = self.height, "building walkability grid");
            WalkGrid::from_fn(self.width, self.height, |p| self.is_walkable(p.x, p.y))
        })
    }

    /// Shortest walkable path, both endpoints included.
    pub fn find_walkable_path(&self, start: Position, end: Position) -> Option<Vec<Position>> {
        self.walk_grid().find_path(start, end)
    }

    /// Whether any walkable path connects the two positions.
    pub fn is_path_walkable(&self, start: Position, end: Position) -> bool {
        self.find_walkable_path(start, end).is_some()
    }

    /// Nearest other player by walkable path length.
    ///
    /// The requester is skipped. Players with no path are skipped. Ties
    /// keep the earlier player, so callers should pass players in a stable
    /// order (e.g. from a `BTreeMap`).
    pub fn find_closest_player_to_player<I>(
        &self,
        requester: PlayerId,
        position: Position,
        players: I,
    ) -> Option<ClosestPlayer>
    where
        I: IntoIterator<Item = (PlayerId, Position)>,
    {
        let mut closest: Option<ClosestPlayer> = None;

        for (player_id, other) in players {
            if player_id == requester {
                continue;
            }
            let Some(path) = self.find_walkable_path(position, other) else {
                debug!(%player_id, %other, "no walkable path to player");
                continue;
            };
            if closest.map_or(true, |c| path.len() < c.waypoints) {
                closest = Some(ClosestPlayer {
                    player_id,
                    position: other,
                    waypoints: path.len(),
                });
            }
        }

        closest
    }

    /// Wire snapshot of the whole grid.
    pub fn to_snapshot(&self) -> MapSnapshot {
        MapSnapshot {
            width: self.width,
            height: self.height,
            map: self
                .tiles
                .chunks(self.width)
                .map(|row| row.iter().map(TileSnapshot::from).collect())
                .collect(),
        }
    }

    /// Rebuild a grid from a snapshot, placing each tile at its own
    /// position with its transmitted state.
    pub fn from_snapshot(snapshot: &MapSnapshot) -> Result<Self, MapError> {
        let (width, height) = (snapshot.width, snapshot.height);
        if width == 0 || height == 0 {
            return Err(MapError::EmptyDimensions { width, height });
        }

        let mut cells: Vec<Option<Tile>> = vec![None; width * height];
        for tile in snapshot.map.iter().flatten() {
            let pos = tile.position;
            if pos.x < 0 || pos.y < 0 || pos.x as usize >= width || pos.y as usize >= height {
                return Err(MapError::OutOfBounds(pos));
            }
            if tile.tile_type == Terrain::Unknown {
                return Err(MapError::UnplaceableTerrain(tile.tile_type));
            }
            let state = Tile::state_from_flags(
                tile.is_ready_to_work,
                tile.is_finished_work,
                tile.is_cooling_down,
            )
            .ok_or(MapError::InvalidTileState(pos))?;

            let mut rebuilt = Tile::new(tile.id, tile.tile_type, pos).with_state(state);
            rebuilt.work_time = Duration::from_millis(tile.work_time_ms);
            rebuilt.cooldown_time = Duration::from_millis(tile.cooldown_time_ms);
            rebuilt.additional_data = tile.additional_data.clone();

            cells[pos.y as usize * width + pos.x as usize] = Some(rebuilt);
        }

        let mut tiles = Vec::with_capacity(cells.len());
        for (index, cell) in cells.into_iter().enumerate() {
            let pos = Position::new((index % width) as i32, (index / width) as i32);
            tiles.push(cell.ok_or(MapError::MissingTile(pos))?);
        }

        Ok(Self {
            width,
            height,
            tiles,
            walk_grid: OnceLock::new(),
        })
    }

    /// Count of tiles in a given state.
    pub fn count_in_state(&self, state: TileState) -> usize {
        self.tiles.iter().filter(|t| t.state() == state).count()
    }
}

// =============================================================================
// MAP GENERATION
// =============================================================================

/// Number of 3x3 clusters placed per terrain by [`MapGenerator`].
pub const CLUSTER_COUNTS: [(Terrain, u32); 14] = [
    (Terrain::Dungeon, 5),
    (Terrain::Woods, 10),
    (Terrain::River, 5),
    (Terrain::Mountain, 5),
    (Terrain::Farmland, 15),
    (Terrain::Castle, 1),
    (Terrain::Grassland, 10),
    (Terrain::Swamp, 5),
    (Terrain::Desert, 5),
    (Terrain::Town, 3),
    (Terrain::Lake, 2),
    (Terrain::Path, 10),
    (Terrain::Hill, 5),
    (Terrain::Bridge, 2),
];

/// Random layout generator: plain ground scattered with terrain clusters.
#[derive(Clone, Copy, Debug)]
pub struct MapGenerator {
    width: usize,
    height: usize,
}

impl MapGenerator {
    /// Generator for a grid of the given size.
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Produce a layout string usable with [`GameMap::from_layout`].
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let mut grid = vec![Terrain::Plain.letter(); self.width * self.height];
        if grid.is_empty() {
            return String::new();
        }

        for (terrain, count) in CLUSTER_COUNTS {
            for _ in 0..count {
                let cx = rng.gen_range(0..self.width) as i64;
                let cy = rng.gen_range(0..self.height) as i64;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let (x, y) = (cx + dx, cy + dy);
                        if x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height {
                            grid[y as usize * self.width + x as usize] = terrain.letter();
                        }
                    }
                }
            }
        }

        grid.into_iter().collect()
    }

    /// Generate and build in one step.
    pub fn build<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<GameMap, MapError> {
        GameMap::from_layout(self.width, self.height, &self.generate(rng))
    }
}
