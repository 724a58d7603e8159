//! Fight Encounters
//!
//! Turn-based rock-paper-scissors combat between two players. Each side
//! submits one pending action per round; a timer owned by the world
//! resolves the pair, resets both to NONE and reschedules.
//!
//! The beats-relation is a 3-cycle over the wire numbers 1..3:
//! `a` beats `b` iff `(a mod 3) + 1 == b`, i.e. STAB > SLASH > PARRY > STAB.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{FightId, PlayerId, Position};
use crate::game::map::GameMap;

/// Default engagement radius, in path steps.
pub const DEFAULT_FIGHT_RADIUS: usize = 3;

/// Damage dealt to the loser of a round.
pub const ROUND_DAMAGE: u32 = 1;

/// A combat move. Wire form is the integer 1..3; 0 (NONE) is internal only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum FightAction {
    /// No action submitted this round.
    #[default]
    None = 0,
    /// Beats SLASH.
    Stab = 1,
    /// Beats PARRY.
    Slash = 2,
    /// Beats STAB.
    Parry = 3,
}

impl FightAction {
    /// Does `self` beat `other`? NONE never beats anything.
    pub fn beats(self, other: FightAction) -> bool {
        if self == FightAction::None || other == FightAction::None {
            return false;
        }
        (self as u8 % 3) + 1 == other as u8
    }

    /// True for STAB/SLASH/PARRY.
    pub fn is_action(self) -> bool {
        self != FightAction::None
    }
}

impl TryFrom<u8> for FightAction {
    type Error = FightError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FightAction::Stab),
            2 => Ok(FightAction::Slash),
            3 => Ok(FightAction::Parry),
            other => Err(FightError::InvalidAction(other)),
        }
    }
}

impl From<FightAction> for u8 {
    fn from(action: FightAction) -> Self {
        action as u8
    }
}

/// Result of resolving one pair of actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FightOutcome {
    /// Nobody takes damage.
    Draw,
    /// Left (aggressor) wins the round.
    LeftWins,
    /// Right (defender) wins the round.
    RightWins,
}

/// Resolve one round.
///
/// Both NONE or equal actions draw. A lone NONE loses to any real action.
/// Otherwise the beats-relation decides.
pub fn resolve(left: FightAction, right: FightAction) -> FightOutcome {
    match (left.is_action(), right.is_action()) {
        (false, false) => FightOutcome::Draw,
        (true, false) => FightOutcome::LeftWins,
        (false, true) => FightOutcome::RightWins,
        (true, true) if left == right => FightOutcome::Draw,
        (true, true) if left.beats(right) => FightOutcome::LeftWins,
        (true, true) => FightOutcome::RightWins,
    }
}

/// Fight errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FightError {
    /// Wire action outside 1..3.
    #[error("Invalid fight action {0}")]
    InvalidAction(u8),

    /// Player is not part of this encounter.
    #[error("{0} is not a participant of this fight")]
    NotParticipant(PlayerId),
}

/// Pending actions for the current round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingActions {
    /// Aggressor's action.
    pub aggressor: FightAction,
    /// Defender's action.
    pub defender: FightAction,
}

/// Outcome of one resolved round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundResult {
    /// Actions that were resolved.
    pub actions: PendingActions,
    /// Who won.
    pub outcome: FightOutcome,
    /// Player that takes damage, if any.
    pub loser: Option<PlayerId>,
}

/// A live combat session between two players.
#[derive(Debug)]
pub struct FightEncounter {
    id: FightId,
    aggressor: PlayerId,
    defender: PlayerId,
    pending: Mutex<PendingActions>,
}

impl FightEncounter {
    /// Try to start a fight.
    ///
    /// The defender is the reachable player with the shortest walkable
    /// path from `position`. If none exists, or that path needs `radius`
    /// steps or more, no encounter is created.
    pub fn engage<I>(
        id: FightId,
        aggressor: PlayerId,
        position: Position,
        players: I,
        map: &GameMap,
        radius: usize,
    ) -> Option<Self>
    where
        I: IntoIterator<Item = (PlayerId, Position)>,
    {
        let Some(closest) = map.find_closest_player_to_player(aggressor, position, players) else {
            warn!(%aggressor, %position, "no reachable opponent");
            return None;
        };

        if closest.steps() >= radius {
            warn!(
                %aggressor,
                defender = %closest.player_id,
                steps = closest.steps(),
                radius,
                "closest opponent too far away"
            );
            return None;
        }

        debug!(%id, %aggressor, defender = %closest.player_id, "fight engaged");
        Some(Self {
            id,
            aggressor,
            defender: closest.player_id,
            pending: Mutex::new(PendingActions::default()),
        })
    }

    /// Encounter id.
    pub fn id(&self) -> FightId {
        self.id
    }

    /// Player who started the fight.
    pub fn aggressor(&self) -> PlayerId {
        self.aggressor
    }

    /// Player who was engaged.
    pub fn defender(&self) -> PlayerId {
        self.defender
    }

    /// Is the player one of the two sides?
    pub fn involves(&self, player: PlayerId) -> bool {
        player == self.aggressor || player == self.defender
    }

    /// The other side, if `player` participates.
    pub fn opponent_of(&self, player: PlayerId) -> Option<PlayerId> {
        if player == self.aggressor {
            Some(self.defender)
        } else if player == self.defender {
            Some(self.aggressor)
        } else {
            None
        }
    }

    /// Record a player's action for the current round. A later submission
    /// in the same round overwrites the earlier one.
    pub fn submit(&self, player: PlayerId, action: FightAction) -> Result<(), FightError> {
        let mut pending = self.pending.lock();
        if player == self.aggressor {
            pending.aggressor = action;
        } else if player == self.defender {
            pending.defender = action;
        } else {
            return Err(FightError::NotParticipant(player));
        }
        Ok(())
    }

    /// Current pending pair.
    pub fn pending(&self) -> PendingActions {
        *self.pending.lock()
    }

    /// Resolve the pending pair and reset both sides to NONE, atomically
    /// with respect to [`FightEncounter::submit`].
    pub fn resolve_round(&self) -> RoundResult {
        let actions = std::mem::take(&mut *self.pending.lock());
        let outcome = resolve(actions.aggressor, actions.defender);
        let loser = match outcome {
            FightOutcome::Draw => None,
            FightOutcome::LeftWins => Some(self.defender),
            FightOutcome::RightWins => Some(self.aggressor),
        };
        debug!(id = %self.id, ?actions, ?outcome, "round resolved");
        RoundResult { actions, outcome, loser }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::tile::Terrain;
    use proptest::prelude::*;
    use std::sync::Arc;

    const ALL: [FightAction; 4] = [
        FightAction::None,
        FightAction::Stab,
        FightAction::Slash,
        FightAction::Parry,
    ];

    #[test]
    fn test_resolution_table() {
        use FightAction::*;
        assert_eq!(resolve(None, None), FightOutcome::Draw);
        assert_eq!(resolve(Stab, Stab), FightOutcome::Draw);
        assert_eq!(resolve(Stab, Slash), FightOutcome::LeftWins);
        assert_eq!(resolve(Slash, Parry), FightOutcome::LeftWins);
        assert_eq!(resolve(Parry, Stab), FightOutcome::LeftWins);
        assert_eq!(resolve(Slash, Stab), FightOutcome::RightWins);
        assert_eq!(resolve(None, Parry), FightOutcome::RightWins);
        assert_eq!(resolve(Slash, None), FightOutcome::LeftWins);
    }

    #[test]
    fn test_wire_numbers() {
        assert_eq!(FightAction::try_from(1), Ok(FightAction::Stab));
        assert_eq!(FightAction::try_from(3), Ok(FightAction::Parry));
        assert_eq!(FightAction::try_from(0), Err(FightError::InvalidAction(0)));
        assert_eq!(FightAction::try_from(4), Err(FightError::InvalidAction(4)));

        let parsed: FightAction = serde_json::from_str("2").unwrap();
        assert_eq!(parsed, FightAction::Slash);
        assert!(serde_json::from_str::<FightAction>("7").is_err());
        assert_eq!(serde_json::to_string(&FightAction::Parry).unwrap(), "3");
    }

    proptest! {
        #[test]
        fn prop_resolution_is_antisymmetric(a in 0usize..4, b in 0usize..4) {
            let (a, b) = (ALL[a], ALL[b]);
            let forward = resolve(a, b);
            let backward = resolve(b, a);
            let mirrored = match forward {
                FightOutcome::Draw => FightOutcome::Draw,
                FightOutcome::LeftWins => FightOutcome::RightWins,
                FightOutcome::RightWins => FightOutcome::LeftWins,
            };
            prop_assert_eq!(backward, mirrored);
        }

        #[test]
        fn prop_every_real_action_beats_exactly_one(a in 1u8..4) {
            let a = FightAction::try_from(a).unwrap();
            let beaten = ALL.iter().filter(|b| a.beats(**b)).count();
            prop_assert_eq!(beaten, 1);
        }
    }

    fn players(defender_at: Position) -> Vec<(PlayerId, Position)> {
        vec![(PlayerId(1), Position::ORIGIN), (PlayerId(2), defender_at)]
    }

    #[test]
    fn test_engage_within_radius() {
        let map = GameMap::filled(10, 10, Terrain::Plain).unwrap();
        let fight = FightEncounter::engage(
            FightId(1),
            PlayerId(1),
            Position::ORIGIN,
            players(Position::new(1, 1)),
            &map,
            DEFAULT_FIGHT_RADIUS,
        )
        .unwrap();
        assert_eq!(fight.defender(), PlayerId(2));
        assert!(fight.involves(PlayerId(1)));
        assert_eq!(fight.opponent_of(PlayerId(2)), Some(PlayerId(1)));
        assert_eq!(fight.opponent_of(PlayerId(9)), None);
    }

    #[test]
    fn test_engage_rejects_at_or_beyond_radius() {
        let map = GameMap::filled(10, 10, Terrain::Plain).unwrap();
        // Exactly `radius` steps away is not close enough.
        assert!(FightEncounter::engage(
            FightId(1),
            PlayerId(1),
            Position::ORIGIN,
            players(Position::new(1, 2)),
            &map,
            3,
        )
        .is_none());
        assert!(FightEncounter::engage(
            FightId(2),
            PlayerId(1),
            Position::ORIGIN,
            players(Position::new(9, 9)),
            &map,
            3,
        )
        .is_none());
    }

    #[test]
    fn test_engage_needs_walkable_path() {
        // Adjacent in a straight line, but a river with no bridge in between.
        let map = GameMap::from_layout(3, 1, "xrx").unwrap();
        assert!(FightEncounter::engage(
            FightId(1),
            PlayerId(1),
            Position::ORIGIN,
            players(Position::new(2, 0)),
            &map,
            3,
        )
        .is_none());
    }

    fn fight() -> FightEncounter {
        let map = GameMap::filled(4, 4, Terrain::Plain).unwrap();
        FightEncounter::engage(
            FightId(7),
            PlayerId(1),
            Position::ORIGIN,
            players(Position::new(1, 0)),
            &map,
            DEFAULT_FIGHT_RADIUS,
        )
        .unwrap()
    }

    #[test]
    fn test_round_resets_pending() {
        let fight = fight();
        fight.submit(PlayerId(1), FightAction::Parry).unwrap();
        fight.submit(PlayerId(2), FightAction::Stab).unwrap();

        let round = fight.resolve_round();
        assert_eq!(round.outcome, FightOutcome::LeftWins);
        assert_eq!(round.loser, Some(PlayerId(2)));
        assert_eq!(fight.pending(), PendingActions::default());

        // Next round with no submissions is a draw.
        let idle = fight.resolve_round();
        assert_eq!(idle.outcome, FightOutcome::Draw);
        assert_eq!(idle.loser, None);
    }

    #[test]
    fn test_non_responder_penalized() {
        let fight = fight();
        fight.submit(PlayerId(2), FightAction::Slash).unwrap();
        let round = fight.resolve_round();
        assert_eq!(round.loser, Some(PlayerId(1)));
    }

    #[test]
    fn test_outsider_cannot_submit() {
        let fight = fight();
        assert_eq!(
            fight.submit(PlayerId(3), FightAction::Stab),
            Err(FightError::NotParticipant(PlayerId(3)))
        );
    }

    #[test]
    fn test_concurrent_submit_and_resolve() {
        let fight = Arc::new(fight());
        let writers: Vec<_> = [PlayerId(1), PlayerId(2)]
            .into_iter()
            .map(|player| {
                let fight = fight.clone();
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        let action = FightAction::try_from((i % 3 + 1) as u8).unwrap();
                        fight.submit(player, action).unwrap();
                    }
                })
            })
            .collect();

        let resolver = {
            let fight = fight.clone();
            std::thread::spawn(move || {
                (0..200)
                    .map(|_| fight.resolve_round())
                    .filter(|r| r.loser.is_some())
                    .count()
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        let _ = resolver.join().unwrap();

        // Whatever interleaving happened, one final resolve leaves a clean slate.
        fight.resolve_round();
        assert_eq!(fight.pending(), PendingActions::default());
    }
}
