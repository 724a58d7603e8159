//! TCP Game Server
//!
//! Accepts connections and runs one [`Session`] task per client against a
//! shared [`World`]. The accept loop never waits on a session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use crate::game::map::GameMap;
use crate::game::scheduler::Scheduler;
use crate::network::session::{Session, SessionConfig};
use crate::network::world::{World, WorldConfig};

/// Port the game listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 43210;

/// Environment variable overriding [`ServerConfig::bind_addr`].
pub const BIND_ADDR_ENV: &str = "WAYFARER_BIND_ADDR";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-client outbound queue capacity.
    pub outbound_buffer: usize,
    /// How long a session waits for a bulk-frame ack.
    pub ack_timeout: Duration,
    /// Gameplay tuning.
    pub world: WorldConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 1000,
            outbound_buffer: 256,
            ack_timeout: Duration::from_secs(10),
            world: WorldConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, with the bind address taken from `WAYFARER_BIND_ADDR`
    /// when set.
    pub fn from_env() -> Result<Self, GameServerError> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(BIND_ADDR_ENV) {
            config.bind_addr = raw
                .parse()
                .map_err(|_| GameServerError::InvalidAddress(raw.clone()))?;
        }
        Ok(config)
    }

    fn session(&self) -> SessionConfig {
        SessionConfig {
            outbound_buffer: self.outbound_buffer,
            ack_timeout: self.ack_timeout,
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Address could not be parsed.
    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),

    /// `run` was called twice.
    #[error("Server is already running")]
    AlreadyRunning,
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Shared world state.
    world: Arc<World>,
    /// Bound listener and its shutdown receiver, taken by `run`.
    listener: Mutex<Option<(TcpListener, broadcast::Receiver<()>)>>,
    /// Address actually bound.
    local_addr: SocketAddr,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Bind with the built-in world map.
    pub async fn bind(config: ServerConfig) -> Result<Self, GameServerError> {
        Self::bind_with_map(config, GameMap::default_world()).await
    }

    /// Bind with a custom map.
    pub async fn bind_with_map(config: ServerConfig, map: GameMap) -> Result<Self, GameServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let world = World::new(config.world.clone(), map);
        world.map().log_layout();

        Ok(Self {
            config,
            world,
            listener: Mutex::new(Some((listener, shutdown_rx))),
            local_addr,
            shutdown_tx,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared world.
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// Timers owned by the world.
    pub fn scheduler(&self) -> &Scheduler {
        self.world.scheduler()
    }

    /// Accept connections until [`GameServer::shutdown`].
    #[instrument(skip(self), fields(addr = %self.local_addr))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let (listener, mut shutdown_rx) = self
            .listener
            .lock()
            .take()
            .ok_or(GameServerError::AlreadyRunning)?;
        info!("Game server listening on {}", self.local_addr);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.world.player_count() >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("set_nodelay failed for {}: {}", addr, e);
                            }
                            info!("New connection from {}", addr);
                            let session = Session::new(self.world.clone(), addr, self.config.session());
                            tokio::spawn(session.run(stream, self.shutdown_tx.subscribe()));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Tell every client to quit, stop timers and end the accept loop.
    pub fn shutdown(&self) {
        self.world.shutdown();
        let _ = self.shutdown_tx.send(());
    }

    /// Active connection count.
    pub fn connection_count(&self) -> usize {
        self.world.player_count()
    }
}
