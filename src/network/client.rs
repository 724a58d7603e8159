//! Client Session
//!
//! The remote side of a connection: performs the handshake (identity,
//! id, map download), keeps a read-only mirror of the map and the local
//! character, and turns incoming messages into events on a client-local
//! bus that a UI can subscribe to.
//!
//! All state lives in the session value. Quitting one session never
//! touches another in the same process.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::core::{PlayerId, Position};
use crate::game::character::{Character, SharedCharacter};
use crate::game::events::{EventBus, EventKind, GameEvent, View};
use crate::game::fight::FightAction;
use crate::game::map::{GameMap, MapError};
use crate::network::framing::{
    decompress, encode_line, DecodeMode, Frame, FrameReader, FramingError, ACK,
};
use crate::network::protocol::{
    Action, ClientCommand, GiftKind, Identity, Notice, ProtocolError, Reply, Request, ServerMessage,
    TileAction,
};
use crate::network::server::DEFAULT_PORT;
use crate::network::world::Flow;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address.
    pub server_addr: SocketAddr,
    /// Display name sent in the identity message.
    pub username: String,
    /// Messages kept in the history log.
    pub history_capacity: usize,
    /// Limit for connecting plus the handshake.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            username: "Player1".to_string(),
            history_capacity: 50,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing failure.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Message could not be parsed or built.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Map snapshot was invalid.
    #[error("Map error: {0}")]
    Map(#[from] MapError),

    /// Connect or handshake took too long.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Server closed the connection during the handshake.
    #[error("Connection closed during handshake")]
    HandshakeClosed,

    /// Session already closed.
    #[error("Session is closed")]
    Closed,

    /// Character has no health left until its fight ends.
    #[error("Character is dead")]
    Dead,
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Protocol(ProtocolError::Serialization(e))
    }
}

// =============================================================================
// MESSAGE HISTORY
// =============================================================================

/// One logged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Arrival time.
    pub at: DateTime<Utc>,
    /// Raw message text.
    pub text: String,
}

/// Bounded log of received messages, oldest evicted first.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl MessageHistory {
    /// Empty log holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a message stamped with the current time.
    pub fn push(&mut self, text: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry { at: Utc::now(), text: text.into() });
    }

    /// Up to `count` most recent entries, oldest first.
    pub fn last(&self, count: usize) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().skip(self.entries.len().saturating_sub(count))
    }

    /// All entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Entries held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing logged yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for MessageHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "[{}] {}", entry.at.format("%H:%M:%S"), entry.text)?;
        }
        Ok(())
    }
}

/// Decode a bulk map frame payload into a map.
fn decode_map(payload: &[u8]) -> Result<GameMap, ClientError> {
    let decompressed = decompress(payload)?;
    match ServerMessage::from_slice(&decompressed)? {
        ServerMessage::Reply(Reply::Map { map }) => Ok(GameMap::from_snapshot(&map)?),
        other => Err(ProtocolError::Malformed(format!("bulk frame carried {:?}", other)).into()),
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct Shared {
    player_id: PlayerId,
    map: RwLock<GameMap>,
    character: SharedCharacter,
    others: RwLock<BTreeMap<PlayerId, Position>>,
    history: Mutex<MessageHistory>,
    view: Arc<RwLock<View>>,
    bus: EventBus,
    /// Set once a death has been reported; cleared when the fight ends.
    death_reported: AtomicBool,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn new(
        player_id: PlayerId,
        map: GameMap,
        mut character: Character,
        history_capacity: usize,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        character.player_id = Some(player_id);
        let character: SharedCharacter = Arc::new(RwLock::new(character));
        let view = Arc::new(RwLock::new(View::World));
        let bus = EventBus::new();
        Character::attach(&character, &bus);
        Self::track_view(&view, &bus);

        let (closed, _) = watch::channel(false);
        Self {
            player_id,
            map: RwLock::new(map),
            character,
            others: RwLock::new(BTreeMap::new()),
            history: Mutex::new(MessageHistory::new(history_capacity)),
            view,
            bus,
            death_reported: AtomicBool::new(false),
            outbound,
            closed,
        }
    }

    fn track_view(view: &Arc<RwLock<View>>, bus: &EventBus) {
        let v = view.clone();
        bus.subscribe(EventKind::SwitchView, move |event| {
            if let GameEvent::SwitchView { view } = event {
                *v.write() = *view;
            }
            Ok(())
        });
        let v = view.clone();
        bus.subscribe(EventKind::FightInitiated, move |_| {
            *v.write() = View::Battle;
            Ok(())
        });
        let v = view.clone();
        bus.subscribe(EventKind::FightConcluded, move |_| {
            *v.write() = View::World;
            Ok(())
        });
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
    }

    fn queue(&self, bytes: Vec<u8>) -> bool {
        if self.outbound.try_send(bytes).is_err() {
            warn!("outbound queue unavailable, message dropped");
            return false;
        }
        true
    }

    fn replace_map(&self, payload: &[u8]) -> Result<(), ClientError> {
        *self.map.write() = decode_map(payload)?;
        self.history.lock().push("map updated");
        Ok(())
    }

    /// Apply one server message to local state.
    fn dispatch(&self, message: ServerMessage, raw: &str) -> Flow {
        self.history.lock().push(raw);

        match message {
            ServerMessage::Position(update) => {
                if update.player_id != self.player_id {
                    self.others.write().insert(update.player_id, update.new_position);
                }
            }
            ServerMessage::Tile(broadcast) => {
                if broadcast.is_success {
                    let mut events = Vec::new();
                    let applied = match self.map.write().tile_at_mut(broadcast.position()) {
                        Some(tile) => Some(match broadcast.action {
                            TileAction::Working => tile.work(broadcast.player_id, &mut events),
                            TileAction::Worked => tile.work_complete(&mut events),
                            TileAction::Activated => tile.cooldown(broadcast.player_id, &mut events),
                            TileAction::Ready => tile.cooldown_complete(&mut events),
                        }),
                        None => None,
                    };
                    match applied {
                        Some(true) => {}
                        Some(false) => debug!(position = %broadcast.position(), "mirror out of step with server"),
                        None => warn!(position = %broadcast.position(), "tile broadcast outside map"),
                    }
                    self.bus.publish_all(events);
                } else {
                    self.bus.publish(&broadcast.to_event());
                }
            }
            ServerMessage::Gift(gift) => match gift.gift {
                GiftKind::Xp => {
                    self.bus.publish(&GameEvent::XpReceived {
                        player_id: gift.player_id,
                        amount: gift.amount,
                    });
                }
            },
            ServerMessage::Notice(Notice::DamageReceived { player_id, amount }) => {
                self.bus.publish(&GameEvent::DamageReceived { player_id, amount });
                if player_id == self.player_id {
                    self.check_death();
                }
            }
            ServerMessage::Notice(Notice::FightInitiated { fight_id, aggressor, defender }) => {
                self.bus.publish(&GameEvent::FightInitiated {
                    fight_id: Some(fight_id),
                    aggressor: Some(aggressor),
                    defender: Some(defender),
                });
            }
            ServerMessage::Notice(Notice::FightConcluded { fight_id, survivor }) => {
                if self.death_reported.swap(false, Ordering::AcqRel) {
                    self.character.write().restore();
                    info!(player = %self.player_id, "character restored");
                }
                self.bus.publish(&GameEvent::FightConcluded { fight_id: Some(fight_id), survivor });
            }
            ServerMessage::Notice(Notice::Quit) => {
                info!("server asked this session to quit");
                return Flow::Close;
            }
            ServerMessage::Reply(Reply::Players { players }) => {
                let mut others = self.others.write();
                others.clear();
                others.extend(
                    players
                        .into_iter()
                        .filter(|p| p.player_id != self.player_id)
                        .map(|p| (p.player_id, p.position)),
                );
            }
            ServerMessage::Reply(Reply::Id { id }) => {
                if id != self.player_id {
                    warn!(%id, "server reported a different id");
                }
            }
            ServerMessage::Reply(Reply::Map { .. }) => {
                warn!("map reply outside a bulk frame ignored");
            }
        }
        Flow::Continue
    }

    fn check_death(&self) {
        let (alive, position) = {
            let character = self.character.read();
            (character.is_alive(), character.position)
        };
        if alive || self.death_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(player = %self.player_id, "character died");
        self.bus.publish(&GameEvent::PlayerDied { player_id: self.player_id, position });
        let command = ClientCommand::Action(Action::PlayerDied { player_id: self.player_id, position });
        match encode_line(&command) {
            Ok(bytes) => {
                self.queue(bytes);
            }
            Err(e) => warn!("failed to encode death report: {}", e),
        }
    }
}

// =============================================================================
// CLIENT SESSION
// =============================================================================

/// A live connection to the game server.
pub struct ClientSession {
    shared: Arc<Shared>,
}

impl ClientSession {
    /// Connect, identify and download the map.
    #[instrument(skip_all, fields(server = %config.server_addr, user = %config.username))]
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let limit = config.connect_timeout;
        tokio::time::timeout(limit, Self::handshake(config))
            .await
            .map_err(|_| ClientError::Timeout(limit))?
    }

    async fn handshake(config: ClientConfig) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(config.server_addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, DecodeMode::Client);

        let character = Character::new(config.username.clone());
        let identity = ClientCommand::Identity(Identity {
            player_id: config.username.clone(),
            position: character.position,
        });
        for command in [identity, Request::Id.into(), Request::Map.into()] {
            write_half.write_all(&encode_line(&command)?).await?;
        }

        let mut id = None;
        let mut map_payload = None;
        let mut pending: Vec<(ServerMessage, String)> = Vec::new();
        while id.is_none() || map_payload.is_none() {
            match reader.next_frame().await? {
                Some(Frame::Line(text)) => match ServerMessage::from_json(&text) {
                    Ok(ServerMessage::Reply(Reply::Id { id: assigned })) if id.is_none() => {
                        id = Some(assigned);
                    }
                    Ok(message) => pending.push((message, text)),
                    Err(e) => warn!("bad message during handshake: {}", e),
                },
                Some(Frame::Bulk(payload)) => {
                    write_half.write_all(&[ACK]).await?;
                    map_payload = Some(payload);
                }
                Some(Frame::Ack) => {}
                None => return Err(ClientError::HandshakeClosed),
            }
        }
        let (Some(player_id), Some(payload)) = (id, map_payload) else {
            return Err(ClientError::HandshakeClosed);
        };

        let (outbound, rx) = mpsc::channel(64);
        let map = decode_map(&payload)?;
        let shared = Arc::new(Shared::new(player_id, map, character, config.history_capacity, outbound));
        info!(%player_id, "connected");

        for (message, text) in pending {
            if shared.dispatch(message, &text) == Flow::Close {
                shared.mark_closed();
            }
        }

        tokio::spawn(write_loop(write_half, rx, shared.closed.subscribe()));
        tokio::spawn(receive_loop(shared.clone(), reader));
        Ok(Self { shared })
    }

    /// Id assigned by the server.
    pub fn player_id(&self) -> PlayerId {
        self.shared.player_id
    }

    /// Send a command.
    pub async fn send(&self, command: &ClientCommand) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let bytes = encode_line(command)?;
        self.shared.outbound.send(bytes).await.map_err(|_| ClientError::Closed)
    }

    /// Move the character if the mirror says the target is walkable.
    /// Returns false without sending anything otherwise.
    pub async fn move_to(&self, position: Position) -> Result<bool, ClientError> {
        let moved = {
            let map = self.shared.map.read();
            self.shared.character.write().move_to(position.x, position.y, &map)
        };
        if moved {
            self.send(&Action::Move { player_id: self.player_id(), position }.into()).await?;
        }
        Ok(moved)
    }

    /// Start work on the tile under the character.
    pub async fn work(&self) -> Result<(), ClientError> {
        let position = self.position();
        self.send(&Action::Work { player_id: self.player_id(), position }.into()).await
    }

    /// Activate the tile under the character.
    pub async fn activate(&self) -> Result<(), ClientError> {
        let position = self.position();
        self.send(&Action::Activate { player_id: self.player_id(), position }.into()).await
    }

    /// Challenge the closest player.
    pub async fn fight(&self) -> Result<(), ClientError> {
        self.ensure_alive()?;
        let position = self.position();
        self.send(&Action::Fight { player_id: self.player_id(), position }.into()).await
    }

    /// Submit this round's move.
    pub async fn fight_action(&self, fight_action: FightAction) -> Result<(), ClientError> {
        self.ensure_alive()?;
        self.send(&Action::FightAction { player_id: self.player_id(), fight_action }.into()).await
    }

    /// Tell the server this character died.
    pub async fn report_death(&self) -> Result<(), ClientError> {
        let position = self.position();
        self.send(&Action::PlayerDied { player_id: self.player_id(), position }.into()).await
    }

    /// Ask for the other players' positions.
    pub async fn request_players(&self) -> Result<(), ClientError> {
        self.send(&Request::Players.into()).await
    }

    /// Ask the server to end this session; it replies with `quit`.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.send(&Action::Disconnect { player_id: self.player_id() }.into()).await
    }

    fn position(&self) -> Position {
        self.shared.character.read().position
    }

    fn ensure_alive(&self) -> Result<(), ClientError> {
        if self.shared.character.read().is_alive() {
            Ok(())
        } else {
            Err(ClientError::Dead)
        }
    }

    /// Map mirror. Do not hold across an `.await`.
    pub fn map(&self) -> RwLockReadGuard<'_, GameMap> {
        self.shared.map.read()
    }

    /// Local character.
    pub fn character(&self) -> RwLockReadGuard<'_, Character> {
        self.shared.character.read()
    }

    /// Shared handle to the local character.
    pub fn character_handle(&self) -> SharedCharacter {
        self.shared.character.clone()
    }

    /// Last known positions of other players.
    pub fn other_players(&self) -> BTreeMap<PlayerId, Position> {
        self.shared.others.read().clone()
    }

    /// Received-message log.
    pub fn history(&self) -> MutexGuard<'_, MessageHistory> {
        self.shared.history.lock()
    }

    /// Active panel.
    pub fn view(&self) -> View {
        *self.shared.view.read()
    }

    /// Client-local event bus.
    pub fn events(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Has this session ended?
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait until this session ends.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        loop {
            let done = *rx.borrow_and_update();
            if done || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// End this session without notifying the server.
    pub fn close(&self) {
        self.shared.mark_closed();
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shared.mark_closed();
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("player_id", &self.shared.player_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn receive_loop(shared: Arc<Shared>, mut reader: FrameReader<OwnedReadHalf>) {
    let mut closed = shared.closed.subscribe();
    loop {
        let done = *closed.borrow_and_update();
        if done {
            break;
        }
        tokio::select! {
            frame = reader.next_frame() => match frame {
                Ok(Some(Frame::Line(text))) => match ServerMessage::from_json(&text) {
                    Ok(message) => {
                        if shared.dispatch(message, &text) == Flow::Close {
                            break;
                        }
                    }
                    Err(e) => warn!("bad message from server: {}", e),
                },
                Ok(Some(Frame::Bulk(payload))) => {
                    match shared.replace_map(&payload) {
                        Ok(()) => {}
                        Err(e) => warn!("map refresh failed: {}", e),
                    }
                    shared.queue(vec![ACK]);
                }
                Ok(Some(Frame::Ack)) => {}
                Ok(None) => {
                    info!("server closed connection");
                    break;
                }
                Err(e) => {
                    warn!("read failed: {}", e);
                    break;
                }
            },
            changed = closed.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    shared.mark_closed();
    debug!("receive loop ended");
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>, mut closed: watch::Receiver<bool>) {
    loop {
        let done = *closed.borrow_and_update();
        if done {
            break;
        }
        tokio::select! {
            item = rx.recv() => match item {
                Some(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        warn!("write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
            changed = closed.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    debug!("write loop ended");
}
