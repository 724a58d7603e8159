//! Game Events
//!
//! Closed set of events and the synchronous bus that carries them.
//!
//! State changes (tile transitions, fight rounds, deaths) publish here;
//! the network layer subscribes and turns them into broadcasts. Delivery
//! is synchronous, on the publisher's own thread, in subscription order.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use crate::core::{FightId, PlayerId, Position};

/// Which panel the client is showing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    /// Map exploration.
    #[default]
    World,
    /// Active fight.
    Battle,
    /// Stat allocation.
    LevelUp,
}

/// Event discriminant, used as the subscription key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    /// See [`GameEvent::TileWorking`]
    TileWorking,
    /// See [`GameEvent::TileWorked`]
    TileWorked,
    /// See [`GameEvent::TileActivated`]
    TileActivated,
    /// See [`GameEvent::TileReady`]
    TileReady,
    /// See [`GameEvent::DamageReceived`]
    DamageReceived,
    /// See [`GameEvent::PlayerDied`]
    PlayerDied,
    /// See [`GameEvent::XpReceived`]
    XpReceived,
    /// See [`GameEvent::SwitchView`]
    SwitchView,
    /// See [`GameEvent::FightInitiated`]
    FightInitiated,
    /// See [`GameEvent::FightConcluded`]
    FightConcluded,
}

/// Game event data.
#[derive(Clone, Debug, PartialEq)]
pub enum GameEvent {
    /// A player attempted to start work on a tile.
    TileWorking {
        /// Player that attempted the work, if any.
        player_id: Option<PlayerId>,
        /// Tile position.
        position: Position,
        /// Whether the tile entered WORKING.
        success: bool,
    },

    /// Work timer elapsed; tile is ready to be activated.
    TileWorked {
        /// Tile position.
        position: Position,
        /// Always true; failed completions are not published.
        success: bool,
    },

    /// A player attempted to activate a worked tile.
    TileActivated {
        /// Player that attempted the activation, if any.
        player_id: Option<PlayerId>,
        /// Tile position.
        position: Position,
        /// Whether the tile entered COOLING_DOWN.
        success: bool,
    },

    /// Cooldown elapsed; tile can be worked again.
    TileReady {
        /// Tile position.
        position: Position,
        /// Always true; failed completions are not published.
        success: bool,
    },

    /// A player lost a fight round.
    DamageReceived {
        /// Damaged player.
        player_id: PlayerId,
        /// Health lost.
        amount: u32,
    },

    /// A player's health reached zero.
    PlayerDied {
        /// Dead player.
        player_id: PlayerId,
        /// Where it happened.
        position: Position,
    },

    /// A player was awarded experience.
    XpReceived {
        /// Recipient.
        player_id: PlayerId,
        /// Experience gained.
        amount: u32,
    },

    /// Client asked to change panels.
    SwitchView {
        /// Panel to show.
        view: View,
    },

    /// A fight encounter started.
    FightInitiated {
        /// Encounter id.
        fight_id: Option<FightId>,
        /// Who started it.
        aggressor: Option<PlayerId>,
        /// Who was engaged.
        defender: Option<PlayerId>,
    },

    /// A fight encounter ended.
    FightConcluded {
        /// Encounter id.
        fight_id: Option<FightId>,
        /// Remaining participant, if any.
        survivor: Option<PlayerId>,
    },
}

impl GameEvent {
    /// Discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            GameEvent::TileWorking { .. } => EventKind::TileWorking,
            GameEvent::TileWorked { .. } => EventKind::TileWorked,
            GameEvent::TileActivated { .. } => EventKind::TileActivated,
            GameEvent::TileReady { .. } => EventKind::TileReady,
            GameEvent::DamageReceived { .. } => EventKind::DamageReceived,
            GameEvent::PlayerDied { .. } => EventKind::PlayerDied,
            GameEvent::XpReceived { .. } => EventKind::XpReceived,
            GameEvent::SwitchView { .. } => EventKind::SwitchView,
            GameEvent::FightInitiated { .. } => EventKind::FightInitiated,
            GameEvent::FightConcluded { .. } => EventKind::FightConcluded,
        }
    }
}

/// Destination for events produced by a state transition.
///
/// Code that mutates state behind a lock emits into a `Vec` and
/// publishes once the guard is dropped, so subscribers are free to read
/// that state again.
pub trait EventSink {
    /// Accept one event.
    fn emit(&mut self, event: GameEvent);
}

impl EventSink for &EventBus {
    fn emit(&mut self, event: GameEvent) {
        self.publish(&event);
    }
}

impl EventSink for &mut Vec<GameEvent> {
    fn emit(&mut self, event: GameEvent) {
        self.push(event);
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Subscriber callback.
pub type Subscriber = Arc<dyn Fn(&GameEvent) -> anyhow::Result<()> + Send + Sync>;

/// Outcome of a single publish call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that returned Ok.
    pub delivered: usize,
    /// Subscribers that returned an error or panicked.
    pub failed: usize,
}

impl PublishReport {
    /// True when every subscriber succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Synchronous in-process publish/subscribe registry.
///
/// Each subscriber runs isolated: an error or panic is logged and counted
/// in the [`PublishReport`], and the remaining subscribers still run.
/// The subscriber list is snapshotted before dispatch, so callbacks may
/// publish or subscribe re-entrantly.
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<BTreeMap<EventKind, Vec<(SubscriptionId, Subscriber)>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a callback for one event kind. Order of registration is
    /// the order of delivery.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&GameEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        trace!(?kind, ?id, "subscribed");
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        for list in subscribers.values_mut() {
            if let Some(index) = list.iter().position(|(sub_id, _)| *sub_id == id) {
                list.remove(index);
                return true;
            }
        }
        false
    }

    /// Number of subscribers for a kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event to every current subscriber of its kind.
    pub fn publish(&self, event: &GameEvent) -> PublishReport {
        let kind = event.kind();
        let snapshot: Vec<(SubscriptionId, Subscriber)> = self
            .subscribers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut report = PublishReport::default();
        for (id, subscriber) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!(?kind, ?id, "subscriber failed: {:#}", e);
                    report.failed += 1;
                }
                Err(payload) => {
                    error!(?kind, ?id, "subscriber panicked: {}", panic_message(payload.as_ref()));
                    report.failed += 1;
                }
            }
        }

        trace!(?kind, delivered = report.delivered, failed = report.failed, "published");
        report
    }

    /// Publish a batch of collected events in order.
    pub fn publish_all<I>(&self, events: I) -> PublishReport
    where
        I: IntoIterator<Item = GameEvent>,
    {
        events.into_iter().fold(PublishReport::default(), |mut total, event| {
            let report = self.publish(&event);
            total.delivered += report.delivered;
            total.failed += report.failed;
            total
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<EventKind, usize> = self
            .subscribers
            .read()
            .iter()
            .map(|(kind, list)| (*kind, list.len()))
            .collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
