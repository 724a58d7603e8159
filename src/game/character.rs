//! Player Character
//!
//! Client-side mirror of the local player's stats and position. The
//! server is authoritative for everything except these numbers, which
//! the client applies from damage and XP notifications.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::{PlayerId, Position};
use crate::game::events::{EventBus, EventKind, GameEvent, SubscriptionId};
use crate::game::map::GameMap;

/// Where a fresh character spawns.
pub const SPAWN_POSITION: Position = Position { x: 5, y: 5 };

/// Character errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CharacterError {
    /// Not enough XP banked to level up.
    #[error("Need {needed} xp to level up, have {available}")]
    InsufficientXp {
        /// Cost of the next level.
        needed: u32,
        /// XP currently banked.
        available: u32,
    },

    /// Index outside [`LEVELABLE_STATS`].
    #[error("No levelable stat at index {0}")]
    UnknownStat(usize),
}

/// Numeric character sheet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Current level, starting at 1.
    pub level: u32,
    /// Banked experience.
    pub xp: u32,
    /// XP spent per level.
    pub level_cost: u32,
    /// Current health, in `0..=max_health`.
    pub health: u32,
    /// Health cap.
    pub max_health: u32,
    /// Current stamina, in `0..=max_stamina`.
    pub stamina: u32,
    /// Stamina cap.
    pub max_stamina: u32,
    /// Current mana, in `0..=max_mana`.
    pub mana: u32,
    /// Mana cap.
    pub max_mana: u32,
    /// Melee strength.
    pub strength: u32,
    /// Damage reduction.
    pub defence: u32,
    /// Movement speed.
    pub speed: u32,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            level: 1,
            xp: 0,
            level_cost: 10,
            health: 5,
            max_health: 5,
            stamina: 5,
            max_stamina: 5,
            mana: 5,
            max_mana: 5,
            strength: 5,
            defence: 5,
            speed: 5,
        }
    }
}

/// One row of the level-up table.
#[derive(Clone, Copy)]
pub struct LevelableStat {
    /// Display name.
    pub name: &'static str,
    /// Effect of spending one level on this stat.
    pub apply: fn(&mut Stats),
}

impl std::fmt::Debug for LevelableStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelableStat").field("name", &self.name).finish()
    }
}

/// Stats a level can be spent on, in menu order. Raising a maximum also
/// raises the current value by one.
pub const LEVELABLE_STATS: [LevelableStat; 6] = [
    LevelableStat {
        name: "max_health",
        apply: |s| {
            s.max_health += 1;
            s.health += 1;
        },
    },
    LevelableStat {
        name: "max_stamina",
        apply: |s| {
            s.max_stamina += 1;
            s.stamina += 1;
        },
    },
    LevelableStat {
        name: "max_mana",
        apply: |s| {
            s.max_mana += 1;
            s.mana += 1;
        },
    },
    LevelableStat {
        name: "strength",
        apply: |s| s.strength += 1,
    },
    LevelableStat {
        name: "defence",
        apply: |s| s.defence += 1,
    },
    LevelableStat {
        name: "speed",
        apply: |s| s.speed += 1,
    },
];

/// The local player's character.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    /// Display name sent with the identity message.
    pub name: String,
    /// Session id, once the server has assigned one.
    pub player_id: Option<PlayerId>,
    /// Current position.
    pub position: Position,
    stats: Stats,
}

/// Character handle shared between the session and bus subscribers.
pub type SharedCharacter = Arc<RwLock<Character>>;

impl Character {
    /// Fresh character with default stats at the spawn point.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            player_id: None,
            position: SPAWN_POSITION,
            stats: Stats::default(),
        }
    }

    /// Read-only stat sheet.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Alive while health is above zero.
    pub fn is_alive(&self) -> bool {
        self.stats.health > 0
    }

    /// Move if the target tile exists and is walkable.
    pub fn move_to(&mut self, x: i32, y: i32, map: &GameMap) -> bool {
        if !map.is_walkable(x, y) {
            return false;
        }
        self.position = Position::new(x, y);
        true
    }

    /// Bank experience.
    pub fn gain_xp(&mut self, amount: u32) {
        self.stats.xp = self.stats.xp.saturating_add(amount);
    }

    /// Lose health, floored at zero. Returns the remaining health.
    pub fn take_damage(&mut self, amount: u32) -> u32 {
        self.stats.health = self.stats.health.saturating_sub(amount);
        self.stats.health
    }

    /// Refill health, stamina and mana to their maximums.
    pub fn restore(&mut self) {
        self.stats.health = self.stats.max_health;
        self.stats.stamina = self.stats.max_stamina;
        self.stats.mana = self.stats.max_mana;
    }

    /// Can a level be bought right now?
    pub fn can_level_up(&self) -> bool {
        self.stats.xp >= self.stats.level_cost
    }

    /// Spend `level_cost` xp on the stat at `index` in [`LEVELABLE_STATS`].
    pub fn level_up(&mut self, index: usize) -> Result<(), CharacterError> {
        let stat = LEVELABLE_STATS
            .get(index)
            .ok_or(CharacterError::UnknownStat(index))?;
        if !self.can_level_up() {
            return Err(CharacterError::InsufficientXp {
                needed: self.stats.level_cost,
                available: self.stats.xp,
            });
        }

        self.stats.xp -= self.stats.level_cost;
        self.stats.level += 1;
        (stat.apply)(&mut self.stats);
        info!(level = self.stats.level, stat = stat.name, "level up");
        Ok(())
    }

    /// Subscribe a shared character to damage and XP events addressed to
    /// its player id. Events for other players are ignored.
    pub fn attach(shared: &SharedCharacter, bus: &EventBus) -> [SubscriptionId; 2] {
        let damage = {
            let character = shared.clone();
            bus.subscribe(EventKind::DamageReceived, move |event| {
                if let GameEvent::DamageReceived { player_id, amount } = event {
                    let mut character = character.write();
                    if character.player_id == Some(*player_id) {
                        let left = character.take_damage(*amount);
                        debug!(%player_id, amount, left, "damage applied");
                    }
                }
                Ok(())
            })
        };

        let xp = {
            let character = shared.clone();
            bus.subscribe(EventKind::XpReceived, move |event| {
                if let GameEvent::XpReceived { player_id, amount } = event {
                    let mut character = character.write();
                    if character.player_id == Some(*player_id) {
                        character.gain_xp(*amount);
                        debug!(%player_id, amount, "xp applied");
                    }
                }
                Ok(())
            })
        };

        [damage, xp]
    }
}

impl Default for Character {
    fn default() -> Self {
        Self::new("Unnamed")
    }
}
