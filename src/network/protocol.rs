//! Protocol Messages
//!
//! JSON message shapes for client-server communication. Every command is
//! a flat JSON object; its kind is decided by which discriminating key it
//! carries (`request`, `action`, `message`, `gift`, `origin`), so parsing
//! dispatches on that key first and then deserializes the typed body.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{FightId, PlayerId, Position};
use crate::game::events::GameEvent;
use crate::game::fight::FightAction;
use crate::game::map::MapSnapshot;
use crate::network::framing::FramingError;

/// Protocol errors. A failing command is dropped; the connection stays.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not JSON, or not a JSON object.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Object carries none of the known discriminating keys.
    #[error("Unrecognised message with keys {0:?}")]
    Unrecognised(Vec<String>),

    /// Discriminating key present but the body is invalid.
    #[error("Invalid {kind} message: {source}")]
    InvalidBody {
        /// Discriminating key.
        kind: &'static str,
        /// Deserialization error.
        source: serde_json::Error,
    },

    /// Command claims to come from another player.
    #[error("Command for {claimed} received on session of {session}")]
    WrongPlayer {
        /// Id in the command.
        claimed: PlayerId,
        /// Id of the sending session.
        session: PlayerId,
    },

    /// Fight action with no live encounter for the player.
    #[error("{0} is not in a fight")]
    NotInFight(PlayerId),

    /// Move target is not walkable.
    #[error("Position ({0}) is not walkable")]
    NotWalkable(Position),

    /// Work/activate target outside the map.
    #[error("No tile at ({0})")]
    NoTile(Position),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reply could not be framed.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),
}

fn parse_object(text: &[u8]) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::from_slice::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ProtocolError::Malformed(format!("expected object, got {}", other))),
        Err(e) => Err(ProtocolError::Malformed(e.to_string())),
    }
}

fn body<T: DeserializeOwned>(kind: &'static str, map: Map<String, Value>) -> Result<T, ProtocolError> {
    serde_json::from_value(Value::Object(map)).map_err(|source| ProtocolError::InvalidBody { kind, source })
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// First message a client sends: display name and starting position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Display name (not the numeric session id).
    pub player_id: String,
    /// Starting position.
    pub position: Position,
}

/// Queries answered only to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    /// Ask for the session id.
    Id,
    /// Ask for the full map snapshot (bulk transfer).
    Map,
    /// Ask for every other player's position.
    Players,
}

/// State-changing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Move to a walkable tile.
    Move {
        /// Sender.
        player_id: PlayerId,
        /// Target tile.
        position: Position,
    },
    /// Start work on a tile.
    Work {
        /// Sender.
        player_id: PlayerId,
        /// Target tile.
        position: Position,
    },
    /// Activate a worked tile.
    Activate {
        /// Sender.
        player_id: PlayerId,
        /// Target tile.
        position: Position,
    },
    /// Engage the closest player.
    Fight {
        /// Sender.
        player_id: PlayerId,
        /// Where the fight starts.
        position: Position,
    },
    /// Submit this round's move.
    FightAction {
        /// Sender.
        player_id: PlayerId,
        /// STAB, SLASH or PARRY as 1..3.
        fight_action: FightAction,
    },
    /// Report the sender's own death.
    PlayerDied {
        /// Sender.
        player_id: PlayerId,
        /// Where it happened.
        position: Position,
    },
    /// Leave the game.
    Disconnect {
        /// Sender.
        player_id: PlayerId,
    },
}

impl Action {
    /// Player the command claims to come from.
    pub fn player_id(&self) -> PlayerId {
        match *self {
            Action::Move { player_id, .. }
            | Action::Work { player_id, .. }
            | Action::Activate { player_id, .. }
            | Action::Fight { player_id, .. }
            | Action::FightAction { player_id, .. }
            | Action::PlayerDied { player_id, .. }
            | Action::Disconnect { player_id } => player_id,
        }
    }

    /// Wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Move { .. } => "move",
            Action::Work { .. } => "work",
            Action::Activate { .. } => "activate",
            Action::Fight { .. } => "fight",
            Action::FightAction { .. } => "fight_action",
            Action::PlayerDied { .. } => "player_died",
            Action::Disconnect { .. } => "disconnect",
        }
    }
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ClientCommand {
    /// Request reply.
    Request(Request),
    /// World action.
    Action(Action),
    /// Handshake identity.
    Identity(Identity),
}

impl ClientCommand {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one JSON line.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        let map = parse_object(s.as_bytes())?;
        if map.contains_key("request") {
            Ok(ClientCommand::Request(body("request", map)?))
        } else if map.contains_key("action") {
            Ok(ClientCommand::Action(body("action", map)?))
        } else if map.contains_key("player_id") && map.contains_key("position") {
            Ok(ClientCommand::Identity(body("identity", map)?))
        } else {
            Err(ProtocolError::Unrecognised(map.keys().cloned().collect()))
        }
    }
}

impl From<Request> for ClientCommand {
    fn from(request: Request) -> Self {
        ClientCommand::Request(request)
    }
}

impl From<Action> for ClientCommand {
    fn from(action: Action) -> Self {
        ClientCommand::Action(action)
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// One entry of the players reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerEntry {
    /// Session id.
    pub player_id: PlayerId,
    /// Last known position.
    pub position: Position,
}

/// Replies to [`Request`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Reply {
    /// Session id.
    Id {
        /// Assigned id.
        id: PlayerId,
    },
    /// Full map. Only ever sent as a bulk frame.
    Map {
        /// Snapshot of the live map.
        map: MapSnapshot,
    },
    /// Other connected players.
    Players {
        /// Everyone except the requester.
        players: Vec<PlayerEntry>,
    },
}

/// `origin` marker of tile broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Tile state machine.
    #[default]
    Tile,
}

/// Which tile transition a broadcast describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileAction {
    /// `work` attempt.
    Working,
    /// Work timer elapsed.
    Worked,
    /// `activate` attempt.
    Activated,
    /// Cooldown elapsed.
    Ready,
}

/// Tile transition broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileBroadcast {
    /// Always `tile`.
    pub origin: Origin,
    /// Transition kind.
    pub action: TileAction,
    /// Tile coordinates as `[x, y]`.
    pub tile_pos: [i32; 2],
    /// Whether the transition happened.
    pub is_success: bool,
    /// Player that attempted it, for player-driven transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<PlayerId>,
}

impl TileBroadcast {
    /// Build the broadcast for a tile event; None for non-tile events.
    pub fn from_event(event: &GameEvent) -> Option<Self> {
        let (action, position, success, player_id) = match *event {
            GameEvent::TileWorking { player_id, position, success } => {
                (TileAction::Working, position, success, player_id)
            }
            GameEvent::TileWorked { position, success } => (TileAction::Worked, position, success, None),
            GameEvent::TileActivated { player_id, position, success } => {
                (TileAction::Activated, position, success, player_id)
            }
            GameEvent::TileReady { position, success } => (TileAction::Ready, position, success, None),
            _ => return None,
        };
        Some(Self {
            origin: Origin::Tile,
            action,
            tile_pos: position.to_array(),
            is_success: success,
            player_id,
        })
    }

    /// Tile position.
    pub fn position(&self) -> Position {
        Position::from(self.tile_pos)
    }

    /// The equivalent bus event.
    pub fn to_event(&self) -> GameEvent {
        let position = self.position();
        let success = self.is_success;
        match self.action {
            TileAction::Working => GameEvent::TileWorking { player_id: self.player_id, position, success },
            TileAction::Worked => GameEvent::TileWorked { position, success },
            TileAction::Activated => GameEvent::TileActivated { player_id: self.player_id, position, success },
            TileAction::Ready => GameEvent::TileReady { position, success },
        }
    }
}

/// Kind of gift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiftKind {
    /// Experience points.
    #[default]
    Xp,
}

/// Reward sent to one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gift {
    /// What is given.
    pub gift: GiftKind,
    /// Recipient.
    pub player_id: PlayerId,
    /// Quantity.
    pub amount: u32,
}

/// Out-of-band notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum Notice {
    /// The recipient lost a round.
    DamageReceived {
        /// Damaged player.
        player_id: PlayerId,
        /// Damage taken.
        amount: u32,
    },
    /// The recipient is now in a fight.
    FightInitiated {
        /// Encounter id.
        fight_id: FightId,
        /// Who started it.
        aggressor: PlayerId,
        /// Who was engaged.
        defender: PlayerId,
    },
    /// The recipient's fight is over.
    FightConcluded {
        /// Encounter id.
        fight_id: FightId,
        /// Remaining participant, if any.
        #[serde(default)]
        survivor: Option<PlayerId>,
    },
    /// The session is closing.
    Quit,
}

/// Another player moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionUpdate {
    /// Who moved.
    pub player_id: PlayerId,
    /// Where to.
    pub new_position: Position,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Reply to a request.
    Reply(Reply),
    /// Tile transition.
    Tile(TileBroadcast),
    /// Reward.
    Gift(Gift),
    /// Notice.
    Notice(Notice),
    /// Player movement.
    Position(PositionUpdate),
}

impl ServerMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serialize to JSON bytes (bulk payloads).
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse one JSON line.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Self::from_slice(s.as_bytes())
    }

    /// Parse JSON bytes (a line or a decompressed bulk payload).
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let map = parse_object(bytes)?;
        if map.contains_key("request") {
            Ok(ServerMessage::Reply(body("request", map)?))
        } else if map.contains_key("origin") {
            Ok(ServerMessage::Tile(body("origin", map)?))
        } else if map.contains_key("gift") {
            Ok(ServerMessage::Gift(body("gift", map)?))
        } else if map.contains_key("message") {
            Ok(ServerMessage::Notice(body("message", map)?))
        } else if map.contains_key("new_position") {
            Ok(ServerMessage::Position(body("position", map)?))
        } else {
            Err(ProtocolError::Unrecognised(map.keys().cloned().collect()))
        }
    }
}

impl From<Notice> for ServerMessage {
    fn from(notice: Notice) -> Self {
        ServerMessage::Notice(notice)
    }
}

impl From<Reply> for ServerMessage {
    fn from(reply: Reply) -> Self {
        ServerMessage::Reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_requests() {
        assert_eq!(
            ClientCommand::from_json(r#"{"request":"id"}"#).unwrap(),
            ClientCommand::Request(Request::Id)
        );
        assert_eq!(
            ClientCommand::from_json(r#"{"request":"players"}"#).unwrap(),
            ClientCommand::Request(Request::Players)
        );
        assert!(matches!(
            ClientCommand::from_json(r#"{"request":"weather"}"#),
            Err(ProtocolError::InvalidBody { kind: "request", .. })
        ));
    }

    #[test]
    fn test_parse_actions() {
        let cmd = ClientCommand::from_json(
            r#"{"action":"move","player_id":3,"position":{"x":4,"y":2}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Action(Action::Move { player_id: PlayerId(3), position: Position::new(4, 2) })
        );

        // Array positions are accepted too.
        let cmd = ClientCommand::from_json(r#"{"action":"work","player_id":3,"position":[1,1]}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Action(Action::Work { .. })));

        let cmd = ClientCommand::from_json(r#"{"action":"fight_action","player_id":3,"fight_action":2}"#).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Action(Action::FightAction { player_id: PlayerId(3), fight_action: FightAction::Slash })
        );
    }

    #[test]
    fn test_invalid_fields_are_protocol_errors() {
        for bad in [
            r#"{"action":"fight_action","player_id":3,"fight_action":0}"#,
            r#"{"action":"fight_action","player_id":3,"fight_action":4}"#,
            r#"{"action":"move","player_id":3}"#,
            r#"{"action":"teleport","player_id":3,"position":[1,1]}"#,
        ] {
            assert!(
                matches!(ClientCommand::from_json(bad), Err(ProtocolError::InvalidBody { .. })),
                "{bad}"
            );
        }
        assert!(matches!(ClientCommand::from_json("[1,2]"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(ClientCommand::from_json("{\"x\":1}"), Err(ProtocolError::Unrecognised(_))));
    }

    #[test]
    fn test_identity() {
        let json = json!({"player_id": "ana", "position": {"x": 5, "y": 5}}).to_string();
        let ClientCommand::Identity(identity) = ClientCommand::from_json(&json).unwrap() else {
            panic!("expected identity");
        };
        assert_eq!(identity.player_id, "ana");
        assert_eq!(identity.position, Position::new(5, 5));
    }

    #[test]
    fn test_command_wire_shape() {
        let cmd = ClientCommand::Action(Action::Disconnect { player_id: PlayerId(9) });
        let value: Value = serde_json::from_str(&cmd.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"action": "disconnect", "player_id": 9}));

        let cmd = ClientCommand::Request(Request::Map);
        assert_eq!(cmd.to_json().unwrap(), r#"{"request":"map"}"#);
    }

    #[test]
    fn test_tile_broadcast_shape() {
        let event = GameEvent::TileWorking {
            player_id: Some(PlayerId(2)),
            position: Position::new(3, 4),
            success: true,
        };
        let msg = ServerMessage::Tile(TileBroadcast::from_event(&event).unwrap());
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"origin": "tile", "action": "working", "tile_pos": [3, 4], "is_success": true, "player_id": 2})
        );

        let ready = TileBroadcast::from_event(&GameEvent::TileReady { position: Position::ORIGIN, success: true })
            .unwrap();
        let value = serde_json::to_value(ready).unwrap();
        assert!(value.get("player_id").is_none());
        assert_eq!(ready.to_event(), GameEvent::TileReady { position: Position::ORIGIN, success: true });

        assert!(TileBroadcast::from_event(&GameEvent::XpReceived { player_id: PlayerId(1), amount: 1 }).is_none());
    }

    #[test]
    fn test_server_message_dispatch() {
        let cases = [
            (json!({"request": "id", "id": 4}), "reply"),
            (json!({"request": "players", "players": [{"player_id": 2, "position": {"x": 1, "y": 1}}]}), "reply"),
            (json!({"origin": "tile", "action": "ready", "tile_pos": [0, 0], "is_success": true}), "tile"),
            (json!({"gift": "xp", "player_id": 1, "amount": 5}), "gift"),
            (json!({"message": "quit"}), "notice"),
            (json!({"message": "damage_received", "player_id": 1, "amount": 1}), "notice"),
            (json!({"player_id": 7, "new_position": {"x": 2, "y": 3}}), "position"),
        ];
        for (value, expected) in cases {
            let parsed = ServerMessage::from_json(&value.to_string()).unwrap();
            let kind = match parsed {
                ServerMessage::Reply(_) => "reply",
                ServerMessage::Tile(_) => "tile",
                ServerMessage::Gift(_) => "gift",
                ServerMessage::Notice(_) => "notice",
                ServerMessage::Position(_) => "position",
            };
            assert_eq!(kind, expected, "{value}");
            // Re-serializing yields the same object.
            assert_eq!(serde_json::to_value(&parsed).unwrap(), value);
        }
    }

    #[test]
    fn test_quit_notice_shape() {
        let msg = ServerMessage::from(Notice::Quit);
        assert_eq!(msg.to_json().unwrap(), r#"{"message":"quit"}"#);
    }
}
