//! WebSocket server: accepts connections and routes them to room actors.
//!
//! Architecture:
//! ```text
//! Client A ──┐                              ┌── Room "notes" (actor)
//!             ├── connection task ── join ──┤
//! Client B ──┘   (one per socket)           └── Room "todo"  (actor)
//!                  │       ▲
//!     RoomCommand  │       │ ordered frames (bounded, per session)
//!                  ▼       │
//!               room inbox ┘
//! ```
//!
//! The first frame on a socket must be `join`. After that the connection
//! task forwards client frames to the room's inbox, writes the room's frames
//! to the socket, answers protocol pings and closes the socket when the
//! peer goes quiet for longer than the liveness timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::authority::{RoomCommand, RoomConfig, RoomRegistry};
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::store::{MemoryStore, SnapshotStore};

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum live sessions per room
    pub max_peers_per_room: usize,
    /// Frames buffered per session before it is detached
    pub outbound_capacity: usize,
    /// Commands buffered per room
    pub inbox_capacity: usize,
    /// Protocol ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this long without any inbound traffic
    pub liveness_timeout_secs: u64,
    /// Mark an online user idle after this long without activity
    pub idle_after_secs: u64,
    /// Evict an offline user after this long
    pub eviction_grace_secs: u64,
    /// Presence sweep interval in milliseconds
    pub sweep_interval_ms: u64,
    /// Committed operations kept for transforming stale submissions
    pub history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            outbound_capacity: 256,
            inbox_capacity: 1024,
            heartbeat_interval_secs: 30,
            liveness_timeout_secs: 60,
            idle_after_secs: 120,
            eviction_grace_secs: 30,
            sweep_interval_ms: 1000,
            history_limit: 1024,
        }
    }
}

impl ServerConfig {
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            max_peers: self.max_peers_per_room,
            outbound_capacity: self.outbound_capacity,
            inbox_capacity: self.inbox_capacity,
            history_limit: self.history_limit,
            idle_after: Duration::from_secs(self.idle_after_secs),
            eviction_grace: Duration::from_secs(self.eviction_grace_secs),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs.max(1))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server that keeps room snapshots in memory.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create a server that saves and restores room snapshots through `store`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let registry = RoomRegistry::new(config.room_config(), store);
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                {
                    let mut s = stats.write().await;
                    s.total_connections += 1;
                    s.active_connections += 1;
                }
                if let Err(e) = handle_connection(stream, addr, registry, stats.clone(), config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

/// Serve one WebSocket connection from handshake to close.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
) -> ConnectionResult {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::debug!("WebSocket connection established from {addr}");

    // The first text frame must be a join.
    let first = tokio::time::timeout(config.liveness_timeout(), async {
        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;

    let request = match first {
        Ok(Some(text)) => match ClientMessage::decode(text.as_str()) {
            Ok(ClientMessage::Join(request)) => request,
            Ok(other) => {
                log::debug!("{addr} sent {other:?} before joining");
                let refusal = ServerMessage::error(ErrorCode::NotJoined, "first frame must be join");
                ws_sender.send(Message::Text(refusal.encode()?.into())).await?;
                ws_sender.close().await?;
                return Ok(());
            }
            Err(e) => {
                let refusal = ServerMessage::error(ErrorCode::BadFrame, e.to_string());
                ws_sender.send(Message::Text(refusal.encode()?.into())).await?;
                ws_sender.close().await?;
                return Ok(());
            }
        },
        Ok(None) => return Ok(()),
        Err(_) => {
            log::info!("{addr} never joined, closing");
            ws_sender.close().await?;
            return Ok(());
        }
    };

    let session = Uuid::new_v4();
    let user_id = request.user_id.clone();
    let (room, mut frames) = match registry.join(session, request).await {
        Ok(joined) => joined,
        Err(e) => {
            log::info!("{addr} could not join: {e}");
            let refusal = ServerMessage::error(e.code(), e.to_string());
            ws_sender.send(Message::Text(refusal.encode()?.into())).await?;
            ws_sender.close().await?;
            return Ok(());
        }
    };
    log::info!("{user_id} connected from {addr} to room {} (session {session})", room.room_id());

    let period = config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let liveness = config.liveness_timeout();
    let mut last_seen = Instant::now();

    let outcome = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            let command = match ClientMessage::decode(text.as_str()) {
                                Ok(msg) => into_command(session, msg),
                                Err(e) => {
                                    log::warn!("Bad frame from {user_id}: {e}");
                                    let reply = ServerMessage::error(ErrorCode::BadFrame, e.to_string());
                                    ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                                    None
                                }
                            };
                            if let Some(command) = command {
                                if room.send(command).await.is_err() {
                                    log::warn!("Room {} went away under {user_id}", room.room_id());
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_seen = Instant::now();
                        }
                        Some(Ok(Message::Binary(_))) => {
                            last_seen = Instant::now();
                            let reply = ServerMessage::error(ErrorCode::BadFrame, "binary frames are not supported");
                            ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("{user_id} closed the connection");
                            break;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {user_id}: {e}");
                            break;
                        }
                    }
                }

                frame = frames.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Text(frame.as_ref().into())).await?;
                        }
                        None => {
                            // Detached by the room: superseded or too slow.
                            log::info!("Session {session} of {user_id} detached by room");
                            let notice = ServerMessage::error(ErrorCode::Lagged, "session detached, reconnect to resync");
                            ws_sender.send(Message::Text(notice.encode()?.into())).await?;
                            ws_sender.close().await?;
                            break;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > liveness {
                        log::warn!("{user_id} silent for {liveness:?}, closing");
                        ws_sender.close().await?;
                        break;
                    }
                    ws_sender.send(Message::Ping(Default::default())).await?;
                }
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    }
    .await;

    // The room ignores leaves from sessions it no longer knows.
    let _ = room.send(RoomCommand::Leave { session }).await;
    outcome
}

fn into_command(session: Uuid, msg: ClientMessage) -> Option<RoomCommand> {
    match msg {
        ClientMessage::Join(request) => {
            log::debug!("Ignoring repeated join from {}", request.user_id);
            None
        }
        ClientMessage::Operation {
            operation,
            revision,
        } => Some(RoomCommand::Submit {
            session,
            operation,
            revision,
        }),
        ClientMessage::Cursor { position, .. } => Some(RoomCommand::Cursor { session, position }),
        ClientMessage::Typing { is_typing, .. } => Some(RoomCommand::Typing { session, is_typing }),
        ClientMessage::Resync => Some(RoomCommand::Resync { session }),
        ClientMessage::Ping => Some(RoomCommand::Ping { session }),
    }
}
