//! Authoritative World
//!
//! Everything the server shares between sessions: the map, the player
//! registry, live fights, their timers and the event bus. Commands from
//! sessions are applied here and their effects leave through each
//! player's outbound queue.
//!
//! ## Locking
//!
//! `map`, `players` and `fights` are separate parking_lot mutexes, always
//! taken in that order and never held across an `.await`. Events are
//! collected while a lock is held and published after it is released,
//! so bus subscribers may read any of them.
//!
//! ## Delivery
//!
//! All sends use `try_send`. A full queue drops the message for that
//! player only, so one slow client never stalls a timer or another
//! session.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, instrument, warn};

use crate::core::{FightId, IdAllocator, PlayerId, Position};
use crate::game::events::{EventBus, EventKind, GameEvent};
use crate::game::fight::{FightEncounter, DEFAULT_FIGHT_RADIUS, ROUND_DAMAGE};
use crate::game::map::GameMap;
use crate::game::scheduler::{Scheduler, TaskKey};
use crate::game::tile::{DEFAULT_COOLDOWN_TIME, DEFAULT_WORK_TIME};
use crate::network::framing::{encode_bulk, encode_line};
use crate::network::protocol::{
    Action, ClientCommand, Gift, GiftKind, Identity, Notice, PlayerEntry, PositionUpdate,
    ProtocolError, Reply, Request, ServerMessage, TileBroadcast,
};

/// Gameplay tuning.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Time a tile spends WORKING.
    pub tile_work_time: Duration,
    /// Time a tile spends COOLING_DOWN.
    pub tile_cooldown_time: Duration,
    /// Fights need the defender strictly fewer path steps away than this.
    pub fight_radius: usize,
    /// Time between fight rounds.
    pub fight_round_interval: Duration,
    /// XP given to the survivor of a fight.
    pub fight_victory_xp: u32,
    /// XP given for activating a tile.
    pub tile_activation_xp: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            tile_work_time: DEFAULT_WORK_TIME,
            tile_cooldown_time: DEFAULT_COOLDOWN_TIME,
            fight_radius: DEFAULT_FIGHT_RADIUS,
            fight_round_interval: Duration::from_secs(2),
            fight_victory_xp: 10,
            tile_activation_xp: 1,
        }
    }
}

/// Item queued for a session's writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Encoded JSON line, shared between broadcast recipients.
    Line(Arc<[u8]>),
    /// Encoded bulk frame; the writer waits for an ack after sending it.
    Bulk(Vec<u8>),
    /// Flush and close the connection.
    Close,
}

/// What a session should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Stop reading; the writer drains and closes.
    Close,
}

/// Server-side player record.
#[derive(Debug)]
pub struct PlayerRecord {
    /// Display name from the identity message.
    pub name: Option<String>,
    /// Last known position.
    pub position: Position,
    outbound: mpsc::Sender<Outbound>,
}

/// The shared world.
pub struct World {
    config: WorldConfig,
    me: Weak<World>,
    map: Mutex<GameMap>,
    players: Mutex<BTreeMap<PlayerId, PlayerRecord>>,
    fights: Mutex<BTreeMap<FightId, Arc<FightEncounter>>>,
    player_ids: IdAllocator,
    fight_ids: IdAllocator,
    bus: EventBus,
    scheduler: Scheduler,
}

impl World {
    /// Build a world around `map`, applying the configured tile durations.
    pub fn new(config: WorldConfig, mut map: GameMap) -> Arc<Self> {
        map.set_durations(config.tile_work_time, config.tile_cooldown_time);

        Arc::new_cyclic(|me: &Weak<World>| {
            let bus = EventBus::new();
            Self::wire_bus(&bus, me);
            Self {
                config,
                me: me.clone(),
                map: Mutex::new(map),
                players: Mutex::new(BTreeMap::new()),
                fights: Mutex::new(BTreeMap::new()),
                player_ids: IdAllocator::new(),
                fight_ids: IdAllocator::new(),
                bus,
                scheduler: Scheduler::new(),
            }
        })
    }

    fn wire_bus(bus: &EventBus, me: &Weak<World>) {
        for kind in [
            EventKind::TileWorking,
            EventKind::TileWorked,
            EventKind::TileActivated,
            EventKind::TileReady,
        ] {
            let me = me.clone();
            bus.subscribe(kind, move |event| match me.upgrade() {
                Some(world) => world.broadcast_tile_event(event),
                None => Ok(()),
            });
        }

        let world = me.clone();
        bus.subscribe(EventKind::DamageReceived, move |event| {
            if let (Some(world), GameEvent::DamageReceived { player_id, amount }) = (world.upgrade(), event) {
                world.send_to(
                    *player_id,
                    &Notice::DamageReceived { player_id: *player_id, amount: *amount }.into(),
                )?;
            }
            Ok(())
        });

        let world = me.clone();
        bus.subscribe(EventKind::XpReceived, move |event| {
            if let (Some(world), GameEvent::XpReceived { player_id, amount }) = (world.upgrade(), event) {
                let gift = Gift { gift: GiftKind::Xp, player_id: *player_id, amount: *amount };
                world.send_to(*player_id, &ServerMessage::Gift(gift))?;
            }
            Ok(())
        });

        let world = me.clone();
        bus.subscribe(EventKind::PlayerDied, move |event| {
            if let (Some(world), GameEvent::PlayerDied { player_id, .. }) = (world.upgrade(), event) {
                world.conclude_fights_of(*player_id, true);
            }
            Ok(())
        });
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Gameplay tuning in effect.
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Lock the map. Do not hold across an `.await`.
    pub fn map(&self) -> MutexGuard<'_, GameMap> {
        self.map.lock()
    }

    /// Server-side event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Tile and fight timers.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Connected players.
    pub fn player_count(&self) -> usize {
        self.players.lock().len()
    }

    /// Last known position of a player.
    pub fn player_position(&self, player: PlayerId) -> Option<Position> {
        self.players.lock().get(&player).map(|p| p.position)
    }

    /// Display name of a player.
    pub fn player_name(&self, player: PlayerId) -> Option<String> {
        self.players.lock().get(&player).and_then(|p| p.name.clone())
    }

    /// Live fights.
    pub fn fight_count(&self) -> usize {
        self.fights.lock().len()
    }

    /// The fight a player is in, if any.
    pub fn fight_of(&self, player: PlayerId) -> Option<Arc<FightEncounter>> {
        self.fights.lock().values().find(|f| f.involves(player)).cloned()
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Add a connection to the registry and assign its id.
    pub fn register_player(&self, outbound: mpsc::Sender<Outbound>) -> PlayerId {
        let id = self.player_ids.next_player();
        self.players.lock().insert(
            id,
            PlayerRecord {
                name: None,
                position: Position::ORIGIN,
                outbound,
            },
        );
        info!(%id, "player registered");
        id
    }

    /// Remove a connection. Its fights end without a victory award.
    pub fn remove_player(&self, player: PlayerId) -> bool {
        let removed = self.players.lock().remove(&player).is_some();
        if removed {
            self.conclude_fights_of(player, false);
            info!(%player, "player removed");
        }
        removed
    }

    /// Tell every client to quit and stop all timers.
    pub fn shutdown(&self) {
        let quit = match encode_line(&ServerMessage::from(Notice::Quit)) {
            Ok(bytes) => Arc::<[u8]>::from(bytes),
            Err(e) => {
                warn!("failed to encode quit notice: {}", e);
                return;
            }
        };
        let players = self.players.lock();
        for (id, record) in players.iter() {
            Self::deliver(*id, &record.outbound, Outbound::Line(quit.clone()));
            Self::deliver(*id, &record.outbound, Outbound::Close);
        }
        drop(players);
        let cancelled = self.scheduler.cancel_all();
        info!(cancelled, "world shut down");
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    fn deliver(player: PlayerId, outbound: &mpsc::Sender<Outbound>, item: Outbound) -> bool {
        match outbound.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%player, "outbound queue full, message dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%player, "outbound queue closed");
                false
            }
        }
    }

    /// Queue a raw item for one player. False if the player is gone or
    /// the queue is full.
    pub fn push(&self, player: PlayerId, item: Outbound) -> bool {
        let players = self.players.lock();
        match players.get(&player) {
            Some(record) => Self::deliver(player, &record.outbound, item),
            None => {
                debug!(%player, "send to departed player skipped");
                false
            }
        }
    }

    /// Send one message to one player.
    pub fn send_to(&self, player: PlayerId, message: &ServerMessage) -> Result<bool, ProtocolError> {
        let bytes = encode_line(message)?;
        Ok(self.push(player, Outbound::Line(bytes.into())))
    }

    /// Send one message to every player except `except`. Returns how many
    /// queues accepted it.
    pub fn broadcast(&self, message: &ServerMessage, except: Option<PlayerId>) -> Result<usize, ProtocolError> {
        let bytes: Arc<[u8]> = encode_line(message)?.into();
        let players = self.players.lock();
        Ok(players
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .filter(|(id, record)| Self::deliver(**id, &record.outbound, Outbound::Line(bytes.clone())))
            .count())
    }

    fn broadcast_tile_event(&self, event: &GameEvent) -> anyhow::Result<()> {
        let Some(broadcast) = TileBroadcast::from_event(event) else {
            return Ok(());
        };
        let message = ServerMessage::Tile(broadcast);
        if broadcast.is_success {
            self.broadcast(&message, None)?;
        } else if let Some(player) = broadcast.player_id {
            self.send_to(player, &message)?;
        }
        Ok(())
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Apply one command from `session`'s connection.
    #[instrument(skip_all, fields(session = %session))]
    pub fn handle_command(&self, session: PlayerId, command: ClientCommand) -> Result<Flow, ProtocolError> {
        match command {
            ClientCommand::Identity(identity) => {
                self.handle_identity(session, identity);
                Ok(Flow::Continue)
            }
            ClientCommand::Request(request) => {
                self.handle_request(session, request)?;
                Ok(Flow::Continue)
            }
            ClientCommand::Action(action) => {
                let claimed = action.player_id();
                if claimed != session {
                    return Err(ProtocolError::WrongPlayer { claimed, session });
                }
                debug!(action = action.name(), "applying action");
                self.handle_action(session, action)
            }
        }
    }

    fn handle_identity(&self, session: PlayerId, identity: Identity) {
        let mut players = self.players.lock();
        if let Some(record) = players.get_mut(&session) {
            info!(name = %identity.player_id, position = %identity.position, "identity received");
            record.name = Some(identity.player_id);
            record.position = identity.position;
        }
    }

    fn handle_request(&self, session: PlayerId, request: Request) -> Result<(), ProtocolError> {
        match request {
            Request::Id => {
                self.send_to(session, &Reply::Id { id: session }.into())?;
            }
            Request::Map => {
                let snapshot = self.map.lock().to_snapshot();
                let payload = ServerMessage::Reply(Reply::Map { map: snapshot }).to_vec()?;
                let frame = encode_bulk(&payload)?;
                debug!(raw = payload.len(), framed = frame.len(), "sending map");
                if !self.push(session, Outbound::Bulk(frame)) {
                    warn!(%session, "map frame not queued");
                }
            }
            Request::Players => {
                let players: Vec<PlayerEntry> = self
                    .players
                    .lock()
                    .iter()
                    .filter(|(id, _)| **id != session)
                    .map(|(id, record)| PlayerEntry { player_id: *id, position: record.position })
                    .collect();
                self.send_to(session, &Reply::Players { players }.into())?;
            }
        }
        Ok(())
    }

    fn handle_action(&self, session: PlayerId, action: Action) -> Result<Flow, ProtocolError> {
        match action {
            Action::Move { position, .. } => self.move_player(session, position)?,
            Action::Work { position, .. } => self.work_tile(session, position)?,
            Action::Activate { position, .. } => self.activate_tile(session, position)?,
            Action::Fight { position, .. } => {
                self.start_fight(session, position);
            }
            Action::FightAction { fight_action, .. } => {
                let fight = self.fight_of(session).ok_or(ProtocolError::NotInFight(session))?;
                fight
                    .submit(session, fight_action)
                    .map_err(|_| ProtocolError::NotInFight(session))?;
            }
            Action::PlayerDied { position, .. } => {
                info!(%position, "player died");
                self.bus.publish(&GameEvent::PlayerDied { player_id: session, position });
            }
            Action::Disconnect { .. } => {
                self.send_to(session, &Notice::Quit.into())?;
                self.push(session, Outbound::Close);
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    fn move_player(&self, player: PlayerId, position: Position) -> Result<(), ProtocolError> {
        if !self.map.lock().is_walkable(position.x, position.y) {
            return Err(ProtocolError::NotWalkable(position));
        }
        match self.players.lock().get_mut(&player) {
            Some(record) => record.position = position,
            None => return Ok(()),
        }
        let update = PositionUpdate { player_id: player, new_position: position };
        self.broadcast(&ServerMessage::Position(update), Some(player))?;
        Ok(())
    }

    fn work_tile(&self, player: PlayerId, position: Position) -> Result<(), ProtocolError> {
        let mut events = Vec::new();
        let work_time = {
            let mut map = self.map.lock();
            let tile = map.tile_at_mut(position).ok_or(ProtocolError::NoTile(position))?;
            tile.work(Some(player), &mut events).then_some(tile.work_time)
        };
        self.bus.publish_all(events);

        if let Some(delay) = work_time {
            let me = self.me.clone();
            self.scheduler.schedule_once(TaskKey::TileWork(position), delay, move || {
                if let Some(world) = me.upgrade() {
                    world.complete_work(position);
                }
            });
        }
        Ok(())
    }

    fn complete_work(&self, position: Position) {
        let mut events = Vec::new();
        if let Some(tile) = self.map.lock().tile_at_mut(position) {
            tile.work_complete(&mut events);
        }
        self.bus.publish_all(events);
    }

    fn activate_tile(&self, player: PlayerId, position: Position) -> Result<(), ProtocolError> {
        let mut events = Vec::new();
        let cooldown_time = {
            let mut map = self.map.lock();
            let tile = map.tile_at_mut(position).ok_or(ProtocolError::NoTile(position))?;
            tile.cooldown(Some(player), &mut events).then_some(tile.cooldown_time)
        };
        self.bus.publish_all(events);

        let Some(delay) = cooldown_time else {
            return Ok(());
        };
        let me = self.me.clone();
        self.scheduler.schedule_once(TaskKey::TileCooldown(position), delay, move || {
            if let Some(world) = me.upgrade() {
                world.complete_cooldown(position);
            }
        });
        if self.config.tile_activation_xp > 0 {
            self.bus.publish(&GameEvent::XpReceived {
                player_id: player,
                amount: self.config.tile_activation_xp,
            });
        }
        Ok(())
    }

    fn complete_cooldown(&self, position: Position) {
        let mut events = Vec::new();
        if let Some(tile) = self.map.lock().tile_at_mut(position) {
            tile.cooldown_complete(&mut events);
        }
        self.bus.publish_all(events);
    }

    /// Try to start a fight for `aggressor`. Players already fighting are
    /// neither eligible aggressors nor defenders.
    pub fn start_fight(&self, aggressor: PlayerId, position: Position) -> Option<FightId> {
        let fight = {
            let map = self.map.lock();
            let players = self.players.lock();
            let mut fights = self.fights.lock();

            if fights.values().any(|f| f.involves(aggressor)) {
                warn!(%aggressor, "already in a fight");
                return None;
            }
            let candidates: Vec<(PlayerId, Position)> = players
                .iter()
                .filter(|(id, _)| !fights.values().any(|f| f.involves(**id)))
                .map(|(id, record)| (*id, record.position))
                .collect();

            let id = self.fight_ids.next_fight();
            let fight = Arc::new(FightEncounter::engage(
                id,
                aggressor,
                position,
                candidates,
                &map,
                self.config.fight_radius,
            )?);
            fights.insert(id, fight.clone());
            fight
        };

        let id = fight.id();
        let me = self.me.clone();
        self.scheduler
            .schedule_repeating(TaskKey::FightRound(id), self.config.fight_round_interval, move || {
                me.upgrade().is_some_and(|world| world.run_round(id))
            });

        let notice: ServerMessage = Notice::FightInitiated {
            fight_id: id,
            aggressor: fight.aggressor(),
            defender: fight.defender(),
        }
        .into();
        for side in [fight.aggressor(), fight.defender()] {
            if let Err(e) = self.send_to(side, &notice) {
                warn!(%side, "fight notice failed: {}", e);
            }
        }
        self.bus.publish(&GameEvent::FightInitiated {
            fight_id: Some(id),
            aggressor: Some(fight.aggressor()),
            defender: Some(fight.defender()),
        });
        info!(%id, aggressor = %fight.aggressor(), defender = %fight.defender(), "fight started");
        Some(id)
    }

    /// Resolve one round. False once the fight no longer exists.
    fn run_round(&self, id: FightId) -> bool {
        let Some(fight) = self.fights.lock().get(&id).cloned() else {
            return false;
        };
        let round = fight.resolve_round();
        if let Some(loser) = round.loser {
            self.bus.publish(&GameEvent::DamageReceived {
                player_id: loser,
                amount: ROUND_DAMAGE,
            });
        }
        true
    }

    /// End every fight involving `player`. The opponent is the survivor
    /// and, when `award` is set, receives the victory XP.
    pub fn conclude_fights_of(&self, player: PlayerId, award: bool) -> usize {
        let ended: Vec<Arc<FightEncounter>> = {
            let mut fights = self.fights.lock();
            let ids: Vec<FightId> = fights
                .iter()
                .filter(|(_, f)| f.involves(player))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| fights.remove(id)).collect()
        };

        for fight in &ended {
            self.scheduler.cancel(TaskKey::FightRound(fight.id()));
            let survivor = fight.opponent_of(player);
            let notice: ServerMessage = Notice::FightConcluded { fight_id: fight.id(), survivor }.into();
            for side in [fight.aggressor(), fight.defender()] {
                if let Err(e) = self.send_to(side, &notice) {
                    warn!(%side, "fight notice failed: {}", e);
                }
            }
            if let (true, Some(survivor)) = (award, survivor) {
                if self.config.fight_victory_xp > 0 {
                    self.bus.publish(&GameEvent::XpReceived {
                        player_id: survivor,
                        amount: self.config.fight_victory_xp,
                    });
                }
            }
            self.bus.publish(&GameEvent::FightConcluded { fight_id: Some(fight.id()), survivor });
            info!(id = %fight.id(), ?survivor, "fight concluded");
        }
        ended.len()
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("players", &self.player_count())
            .field("fights", &self.fight_count())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::fight::FightAction;
    use crate::game::tile::{Terrain, TileState};
    use crate::network::framing::decompress;

    struct Client {
        id: PlayerId,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Client {
        fn join(world: &World) -> Self {
            let (tx, rx) = mpsc::channel(64);
            let id = world.register_player(tx);
            Self { id, rx }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(item) = self.rx.try_recv() {
                match item {
                    Outbound::Line(bytes) => {
                        let text = std::str::from_utf8(&bytes).unwrap();
                        out.push(ServerMessage::from_json(text.trim_end()).unwrap());
                    }
                    Outbound::Bulk(frame) => {
                        let payload = decompress(&frame[8..]).unwrap();
                        out.push(ServerMessage::from_slice(&payload).unwrap());
                    }
                    Outbound::Close => {}
                }
            }
            out
        }

        fn act(&self, world: &World, action: Action) -> Result<Flow, ProtocolError> {
            world.handle_command(self.id, ClientCommand::Action(action))
        }

        fn goto(&self, world: &World, x: i32, y: i32) {
            self.act(world, Action::Move { player_id: self.id, position: Position::new(x, y) })
                .unwrap();
        }
    }

    fn config() -> WorldConfig {
        WorldConfig {
            tile_work_time: Duration::from_secs(5),
            tile_cooldown_time: Duration::from_secs(5),
            fight_round_interval: Duration::from_secs(1),
            ..WorldConfig::default()
        }
    }

    fn open_world() -> Arc<World> {
        World::new(config(), GameMap::filled(10, 10, Terrain::Plain).unwrap())
    }

    #[tokio::test]
    async fn test_sequential_ids_and_id_reply() {
        let world = open_world();
        let mut a = Client::join(&world);
        let b = Client::join(&world);
        assert_eq!(a.id, PlayerId(1));
        assert_eq!(b.id, PlayerId(2));

        world.handle_command(a.id, Request::Id.into()).unwrap();
        assert_eq!(a.drain(), vec![ServerMessage::Reply(Reply::Id { id: a.id })]);
    }

    #[tokio::test]
    async fn test_map_request_is_bulk() {
        let world = open_world();
        let mut a = Client::join(&world);
        world.handle_command(a.id, Request::Map.into()).unwrap();

        let item = a.rx.try_recv().unwrap();
        let Outbound::Bulk(frame) = item else {
            panic!("expected bulk frame");
        };
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&frame[..8]);
        assert_eq!(u64::from_be_bytes(prefix) as usize, frame.len() - 8);

        let payload = decompress(&frame[8..]).unwrap();
        let ServerMessage::Reply(Reply::Map { map }) = ServerMessage::from_slice(&payload).unwrap() else {
            panic!("expected map reply");
        };
        assert_eq!((map.width, map.height), (10, 10));
    }

    #[tokio::test]
    async fn test_move_broadcast_to_others_only() {
        let world = World::new(config(), GameMap::from_layout(3, 1, "xmx").unwrap());
        let mut a = Client::join(&world);
        let mut b = Client::join(&world);

        a.goto(&world, 2, 0);
        assert!(a.drain().is_empty());
        assert_eq!(
            b.drain(),
            vec![ServerMessage::Position(PositionUpdate { player_id: a.id, new_position: Position::new(2, 0) })]
        );

        let err = a
            .act(&world, Action::Move { player_id: a.id, position: Position::new(1, 0) })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotWalkable(_)));
        assert_eq!(world.player_position(a.id), Some(Position::new(2, 0)));
    }

    #[tokio::test]
    async fn test_spoofed_player_id_rejected() {
        let world = open_world();
        let a = Client::join(&world);
        let b = Client::join(&world);
        let err = a
            .act(&world, Action::Move { player_id: b.id, position: Position::new(1, 1) })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::WrongPlayer { .. }));
    }

    #[tokio::test]
    async fn test_players_request() {
        let world = open_world();
        let mut a = Client::join(&world);
        let b = Client::join(&world);
        b.goto(&world, 3, 3);
        world.handle_command(a.id, Request::Players.into()).unwrap();
        let replies = a.drain();
        assert_eq!(
            replies.last(),
            Some(&ServerMessage::Reply(Reply::Players {
                players: vec![PlayerEntry { player_id: b.id, position: Position::new(3, 3) }]
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tile_cycle_with_timers() {
        let world = open_world();
        let mut a = Client::join(&world);
        let mut b = Client::join(&world);
        let pos = Position::new(4, 4);

        a.act(&world, Action::Work { player_id: a.id, position: pos }).unwrap();
        assert_eq!(world.map().tile_at(pos).unwrap().state(), TileState::Working);
        assert!(world.scheduler().is_scheduled(TaskKey::TileWork(pos)));

        // A second worker fails, and only they hear about it.
        b.act(&world, Action::Work { player_id: b.id, position: pos }).unwrap();
        let b_seen = b.drain();
        assert_eq!(b_seen.len(), 2);
        let ServerMessage::Tile(failed) = &b_seen[1] else { panic!("expected tile broadcast") };
        assert!(!failed.is_success);
        assert!(a.drain().iter().all(|m| matches!(m, ServerMessage::Tile(t) if t.is_success)));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(world.map().tile_at(pos).unwrap().state(), TileState::Finished);

        a.act(&world, Action::Activate { player_id: a.id, position: pos }).unwrap();
        assert_eq!(world.map().tile_at(pos).unwrap().state(), TileState::CoolingDown);
        let seen = a.drain();
        assert!(seen.contains(&ServerMessage::Gift(Gift { gift: GiftKind::Xp, player_id: a.id, amount: 1 })));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(world.map().tile_at(pos).unwrap().state(), TileState::Ready);
        assert!(world.scheduler().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tile_subscribers_can_read_map() {
        let world = open_world();
        let a = Client::join(&world);
        let pos = Position::new(2, 2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::TileWorking, EventKind::TileWorked, EventKind::TileActivated, EventKind::TileReady] {
            let me = Arc::downgrade(&world);
            let seen = seen.clone();
            world.bus().subscribe(kind, move |_| {
                let world = me.upgrade().ok_or_else(|| anyhow::anyhow!("world gone"))?;
                let state = world.map.try_lock().and_then(|map| map.tile_at(pos).map(|t| t.state()));
                seen.lock().push(state);
                Ok(())
            });
        }

        a.act(&world, Action::Work { player_id: a.id, position: pos }).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        a.act(&world, Action::Activate { player_id: a.id, position: pos }).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(
            *seen.lock(),
            vec![
                Some(TileState::Working),
                Some(TileState::Finished),
                Some(TileState::CoolingDown),
                Some(TileState::Ready),
            ]
        );
        assert_eq!(world.map().tile_at(pos).unwrap().state(), TileState::Ready);
    }

    #[tokio::test]
    async fn test_map_reply_dropped_on_full_queue() {
        let world = open_world();
        let (tx, mut rx) = mpsc::channel(1);
        let id = world.register_player(tx);
        assert!(world.push(id, Outbound::Close));

        world.handle_command(id, Request::Map.into()).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_work_outside_map() {
        let world = open_world();
        let a = Client::join(&world);
        let err = a
            .act(&world, Action::Work { player_id: a.id, position: Position::new(40, 40) })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NoTile(_)));
    }

    #[tokio::test]
    async fn test_fight_without_defender_not_retained() {
        let world = open_world();
        let a = Client::join(&world);
        let b = Client::join(&world);
        a.goto(&world, 0, 0);
        b.goto(&world, 9, 9);

        a.act(&world, Action::Fight { player_id: a.id, position: Position::ORIGIN }).unwrap();
        assert_eq!(world.fight_count(), 0);
        assert!(world.scheduler().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fight_rounds_and_death() {
        let world = open_world();
        let mut a = Client::join(&world);
        let mut b = Client::join(&world);
        let mut c = Client::join(&world);
        a.goto(&world, 0, 0);
        b.goto(&world, 1, 0);
        c.goto(&world, 0, 1);

        a.act(&world, Action::Fight { player_id: a.id, position: Position::ORIGIN }).unwrap();
        let fight = world.fight_of(a.id).unwrap();
        // Ties go to the first player in id order.
        assert_eq!(fight.defender(), b.id);
        assert!(a.drain().iter().any(|m| matches!(m, ServerMessage::Notice(Notice::FightInitiated { .. }))));

        // Already engaged: neither side can start another fight.
        assert_eq!(world.start_fight(b.id, Position::new(1, 0)), None);
        assert_eq!(world.start_fight(a.id, Position::ORIGIN), None);

        a.act(&world, Action::FightAction { player_id: a.id, fight_action: FightAction::Stab }).unwrap();
        b.act(&world, Action::FightAction { player_id: b.id, fight_action: FightAction::Slash }).unwrap();
        let err = c
            .act(&world, Action::FightAction { player_id: c.id, fight_action: FightAction::Stab })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotInFight(_)));

        b.drain();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(b.drain().contains(&ServerMessage::Notice(Notice::DamageReceived { player_id: b.id, amount: 1 })));

        b.act(&world, Action::PlayerDied { player_id: b.id, position: Position::new(1, 0) }).unwrap();
        assert_eq!(world.fight_count(), 0);
        assert!(world.scheduler().is_empty());

        let a_seen = a.drain();
        assert!(a_seen.contains(&ServerMessage::Notice(Notice::FightConcluded {
            fight_id: fight.id(),
            survivor: Some(a.id),
        })));
        assert!(a_seen.contains(&ServerMessage::Gift(Gift { gift: GiftKind::Xp, player_id: a.id, amount: 10 })));
        assert!(c.drain().iter().all(|m| !matches!(m, ServerMessage::Notice(_))));
    }

    #[tokio::test]
    async fn test_removed_player_is_skipped_and_fights_end() {
        let world = open_world();
        let mut a = Client::join(&world);
        let b = Client::join(&world);
        b.goto(&world, 1, 0);
        world.start_fight(a.id, Position::ORIGIN).unwrap();
        a.drain();

        assert!(world.remove_player(b.id));
        assert!(!world.remove_player(b.id));
        assert_eq!(world.fight_count(), 0);
        assert!(!world.send_to(b.id, &Notice::Quit.into()).unwrap());
        // No victory XP for a disconnect.
        assert!(a.drain().iter().all(|m| !matches!(m, ServerMessage::Gift(_))));
    }

    #[tokio::test]
    async fn test_disconnect_and_shutdown() {
        let world = open_world();
        let mut a = Client::join(&world);
        let mut b = Client::join(&world);

        let flow = a.act(&world, Action::Disconnect { player_id: a.id }).unwrap();
        assert_eq!(flow, Flow::Close);
        assert_eq!(a.drain(), vec![ServerMessage::Notice(Notice::Quit)]);
        assert!(b.drain().is_empty());

        world.shutdown();
        assert_eq!(b.drain(), vec![ServerMessage::Notice(Notice::Quit)]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let world = open_world();
        let (tx, _rx) = mpsc::channel(1);
        let slow = world.register_player(tx);
        let mut fast = Client::join(&world);

        for _ in 0..5 {
            world.broadcast(&Notice::Quit.into(), None).unwrap();
        }
        assert_eq!(fast.drain().len(), 5);
        assert!(!world.send_to(slow, &Notice::Quit.into()).unwrap());
    }
}
