//! Network Layer
//!
//! TCP transport for the game: framing, the JSON message set, the
//! server-side world and sessions, and the client session.
//! Gameplay rules live in `game/`; this layer only moves them over the wire.

pub mod client;
pub mod framing;
pub mod protocol;
pub mod server;
pub mod session;
pub mod world;

pub use client::{ClientConfig, ClientError, ClientSession, HistoryEntry, MessageHistory};
pub use framing::{Frame, FrameDecoder, FrameReader, FramingError, ACK};
pub use protocol::{
    Action, ClientCommand, Identity, Notice, ProtocolError, Reply, Request, ServerMessage,
    TileBroadcast,
};
pub use server::{GameServer, GameServerError, ServerConfig, DEFAULT_PORT};
pub use session::{Session, SessionConfig, SessionError};
pub use world::{Flow, World, WorldConfig};
