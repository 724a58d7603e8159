//! Client Sessions
//!
//! One session per accepted connection. The reader half decodes frames
//! and applies commands to the [`World`]; a spawned writer task drains
//! the player's outbound queue onto the socket.
//!
//! After writing a bulk frame the writer waits for the client's ack
//! before writing anything else. Only this session's writer is blocked
//! by that wait; its reader keeps running so the ack can arrive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::core::PlayerId;
use crate::network::framing::{DecodeMode, Frame, FrameReader, FramingError};
use crate::network::protocol::ClientCommand;
use crate::network::world::{Flow, Outbound, World};

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the outbound queue.
    pub outbound_buffer: usize,
    /// How long to wait for a bulk-frame ack.
    pub ack_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Session errors. Each one ends only its own session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecoverable framing error.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Client never acknowledged a bulk frame.
    #[error("No acknowledgement within {0:?}")]
    AckTimeout(Duration),
}

/// A connected client on the server side.
pub struct Session {
    id: PlayerId,
    addr: SocketAddr,
    world: Arc<World>,
    config: SessionConfig,
    outbound: mpsc::Receiver<Outbound>,
}

impl Session {
    /// Register a new connection with the world.
    pub fn new(world: Arc<World>, addr: SocketAddr, config: SessionConfig) -> Self {
        let (tx, outbound) = mpsc::channel(config.outbound_buffer.max(1));
        let id = world.register_player(tx);
        Self {
            id,
            addr,
            world,
            config,
            outbound,
        }
    }

    /// Assigned player id.
    pub fn id(&self) -> PlayerId {
        self.id
    }

    /// Run until the peer leaves, the writer fails or `shutdown` fires.
    /// The player is removed from the world on return.
    #[instrument(skip_all, fields(player = %self.id, addr = %self.addr))]
    pub async fn run<S>(self, stream: S, mut shutdown: broadcast::Receiver<()>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Session { id, world, config, outbound, .. } = self;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, DecodeMode::Server);
        let (ack_tx, ack_rx) = mpsc::channel::<()>(4);

        let mut writer: JoinHandle<Result<(), SessionError>> =
            tokio::spawn(write_loop(write_half, outbound, ack_rx, config.ack_timeout));
        let mut writer_done = false;

        info!("session started");
        loop {
            tokio::select! {
                frame = reader.next_frame() => match frame {
                    Ok(Some(Frame::Line(text))) => {
                        match ClientCommand::from_json(&text) {
                            Ok(command) => match world.handle_command(id, command) {
                                Ok(Flow::Continue) => {}
                                Ok(Flow::Close) => break,
                                Err(e) => warn!("command rejected: {}", e),
                            },
                            Err(e) => warn!("bad command: {}", e),
                        }
                    }
                    Ok(Some(Frame::Ack)) => {
                        if ack_tx.try_send(()).is_err() {
                            debug!("unexpected ack ignored");
                        }
                    }
                    Ok(Some(Frame::Bulk(_))) => warn!("bulk frame from client ignored"),
                    Ok(None) => {
                        info!("peer closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!("read failed: {}", e);
                        break;
                    }
                },
                result = &mut writer => {
                    writer_done = true;
                    match result {
                        Ok(Ok(())) => debug!("writer finished"),
                        Ok(Err(e)) => warn!("writer failed: {}", e),
                        Err(e) => warn!("writer task failed: {}", e),
                    }
                    break;
                }
                _ = shutdown.recv() => {
                    debug!("shutdown signal received");
                    break;
                }
            }
        }

        // Dropping the registry's sender lets the writer drain and exit.
        world.remove_player(id);
        if !writer_done {
            match tokio::time::timeout(config.ack_timeout, &mut writer).await {
                Ok(Ok(Err(e))) => debug!("writer ended with: {}", e),
                Ok(_) => {}
                Err(_) => {
                    warn!("writer did not drain in time");
                    writer.abort();
                }
            }
        }
        info!("session ended");
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    mut acks: mpsc::Receiver<()>,
    ack_timeout: Duration,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Line(bytes) => {
                writer.write_all(&bytes).await?;
                writer.flush().await?;
            }
            Outbound::Bulk(frame) => {
                while acks.try_recv().is_ok() {}
                writer.write_all(&frame).await?;
                writer.flush().await?;
                match tokio::time::timeout(ack_timeout, acks.recv()).await {
                    Ok(Some(())) => debug!(bytes = frame.len(), "bulk frame acknowledged"),
                    Ok(None) => return Ok(()),
                    Err(_) => return Err(SessionError::AckTimeout(ack_timeout)),
                }
            }
            Outbound::Close => break,
        }
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::map::GameMap;
    use crate::game::tile::Terrain;
    use crate::network::framing::{decompress, encode_line, FrameDecoder, ACK};
    use crate::network::protocol::{Notice, Reply, Request, ServerMessage};
    use crate::network::world::WorldConfig;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn world() -> Arc<World> {
        World::new(WorldConfig::default(), GameMap::filled(6, 4, Terrain::Plain).unwrap())
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9))
    }

    async fn next(stream: &mut DuplexStream, decoder: &mut FrameDecoder) -> Frame {
        loop {
            if let Some(frame) = decoder.next_frame().unwrap() {
                return frame;
            }
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed");
            decoder.extend(&buf[..n]);
        }
    }

    fn spawn_session(
        world: &Arc<World>,
        config: SessionConfig,
    ) -> (PlayerId, DuplexStream, broadcast::Sender<()>, JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = Session::new(world.clone(), addr(), config);
        let id = session.id();
        let handle = tokio::spawn(session.run(server, shutdown_rx));
        (id, client, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_map_transfer_waits_for_ack() {
        let world = world();
        let (id, mut client, _shutdown, _handle) = spawn_session(&world, SessionConfig::default());
        let mut decoder = FrameDecoder::new(DecodeMode::Client);

        client.write_all(&encode_line(&ClientCommand::from(Request::Map)).unwrap()).await.unwrap();
        client.write_all(&encode_line(&ClientCommand::from(Request::Id)).unwrap()).await.unwrap();

        let Frame::Bulk(payload) = next(&mut client, &mut decoder).await else {
            panic!("expected bulk frame first");
        };
        let map = ServerMessage::from_slice(&decompress(&payload).unwrap()).unwrap();
        assert!(matches!(map, ServerMessage::Reply(Reply::Map { .. })));

        // Nothing else arrives until the ack is sent.
        let mut byte = [0u8; 1];
        let early = tokio::time::timeout(Duration::from_millis(100), client.read(&mut byte)).await;
        assert!(early.is_err());

        client.write_all(&[ACK]).await.unwrap();
        let Frame::Line(text) = next(&mut client, &mut decoder).await else {
            panic!("expected id reply");
        };
        assert_eq!(
            ServerMessage::from_json(&text).unwrap(),
            ServerMessage::Reply(Reply::Id { id })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_ends_session() {
        let world = world();
        let config = SessionConfig {
            ack_timeout: Duration::from_secs(1),
            ..SessionConfig::default()
        };
        let (_id, mut client, _shutdown, handle) = spawn_session(&world, config);
        client.write_all(&encode_line(&ClientCommand::from(Request::Map)).unwrap()).await.unwrap();

        handle.await.unwrap();
        assert_eq!(world.player_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_lines_keep_connection() {
        let world = world();
        let (id, mut client, _shutdown, _handle) = spawn_session(&world, SessionConfig::default());
        let mut decoder = FrameDecoder::new(DecodeMode::Client);

        client.write_all(b"not json\n{\"action\":\"warp\"}\n").await.unwrap();
        client.write_all(&encode_line(&ClientCommand::from(Request::Id)).unwrap()).await.unwrap();

        let Frame::Line(text) = next(&mut client, &mut decoder).await else {
            panic!("expected id reply");
        };
        assert_eq!(ServerMessage::from_json(&text).unwrap(), ServerMessage::Reply(Reply::Id { id }));
    }

    #[tokio::test]
    async fn test_shutdown_sends_quit() {
        let world = world();
        let (_id, mut client, shutdown, handle) = spawn_session(&world, SessionConfig::default());
        let mut decoder = FrameDecoder::new(DecodeMode::Client);

        world.shutdown();
        let _ = shutdown.send(());

        let Frame::Line(text) = next(&mut client, &mut decoder).await else {
            panic!("expected quit notice");
        };
        assert_eq!(ServerMessage::from_json(&text).unwrap(), ServerMessage::Notice(Notice::Quit));
        handle.await.unwrap();
        assert_eq!(world.player_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_removes_player() {
        let world = world();
        let (_id, client, _shutdown, handle) = spawn_session(&world, SessionConfig::default());
        assert_eq!(world.player_count(), 1);
        drop(client);
        handle.await.unwrap();
        assert_eq!(world.player_count(), 0);
    }
}
