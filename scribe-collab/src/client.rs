//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, connect again)
//! - Optimistic local edits driven through a [`Replica`]
//! - Caret and typing updates, with peers tracked in a [`PresenceView`]
//! - Offline edits replayed after the next snapshot
//!
//! The replica lock is held while a submission is queued for the writer,
//! so frames leave in the order the replica produced them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use scribe_core::{diff, Operation};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::presence::PresenceView;
use crate::protocol::{ClientMessage, ErrorCode, JoinRequest, ProtocolError, ServerMessage, SessionEntry};
use crate::reconcile::{Reconciled, Replica, ReplicaError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Edits kept while disconnected
    pub offline_queue_limit: usize,
    /// Minimum gap between caret frames in milliseconds
    pub cursor_interval_ms: u64,
    /// Events buffered for the application before new ones are dropped
    pub event_capacity: usize,
    /// Frames buffered for the socket writer
    pub outgoing_capacity: usize,
    /// Give up on the WebSocket handshake after this many seconds
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            offline_queue_limit: 10_000,
            cursor_interval_ms: 33,
            event_capacity: 256,
            outgoing_capacity: 256,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Socket open and join sent
    Connected,
    /// Connection lost
    Disconnected,
    /// A snapshot was adopted
    Synced { content: String, revision: u64 },
    /// A remote operation, already transformed and applied locally
    RemoteOperation {
        user_id: String,
        operation: Operation,
        revision: u64,
    },
    /// Our in-flight operation was committed
    Acknowledged { revision: u64 },
    /// Presence entries changed (joins, leaves, status)
    PresenceChanged(Vec<SessionEntry>),
    CursorMoved { user_id: String, position: Option<usize> },
    TypingChanged { user_id: String, is_typing: bool },
    /// The server rejected something
    Error { code: ErrorCode, message: String },
    /// The replica asked the server for a fresh snapshot
    ResyncRequested,
}

/// The sync client.
///
/// Owns one user's replica of one room and keeps it converged with the
/// server over a WebSocket.
pub struct SyncClient {
    request: JoinRequest,
    server_url: String,
    config: ClientConfig,

    state: Arc<RwLock<ConnectionState>>,
    /// Bumped per connect so a stale reader cannot tear down a newer connection
    generation: Arc<AtomicU64>,
    replica: Arc<Mutex<Replica>>,
    presence: Arc<Mutex<PresenceView>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(request: JoinRequest, server_url: impl Into<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let replica = Replica::new(request.room_id.clone(), request.user_id.clone(), config.offline_queue_limit);
        let presence = PresenceView::with_interval(
            request.user_id.clone(),
            Duration::from_millis(config.cursor_interval_ms),
        );
        Self {
            request,
            server_url: server_url.into(),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            generation: Arc::new(AtomicU64::new(0)),
            replica: Arc::new(Mutex::new(replica)),
            presence: Arc::new(Mutex::new(presence)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the room.
    ///
    /// Spawns background tasks for reading and writing the socket. The
    /// replica becomes synced when the server's `init` arrives.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let handshake = tokio::time::timeout(
            Duration::from_secs(self.config.connect_timeout_secs.max(1)),
            tokio_tungstenite::connect_async(self.server_url.as_str()),
        )
        .await;
        let ws_stream = match handshake {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                log::warn!("Could not reach {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Transport(e.to_string()));
            }
            Err(_) => {
                log::warn!("Handshake with {} timed out", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Timeout);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.config.outgoing_capacity.max(1));
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let join = ClientMessage::Join(self.request.clone()).encode()?;
        out_tx
            .send(Message::Text(join.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, SyncEvent::Connected);
        log::info!("{} connected to room {}", self.request.user_id, self.request.room_id);

        // Reader task: fold server frames into the replica and presence view
        let reader = Reader {
            out_tx,
            event_tx: self.event_tx.clone(),
            replica: self.replica.clone(),
            presence: self.presence.clone(),
        };
        let state = self.state.clone();
        let user_id = self.request.user_id.clone();
        let current = self.generation.clone();
        let generation = current.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(msg) => reader.handle(msg).await,
                        Err(e) => log::warn!("{user_id}: undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            if current.load(Ordering::SeqCst) != generation {
                log::debug!("{user_id}: superseded connection closed");
                return;
            }
            *state.write().await = ConnectionState::Disconnected;
            reader.replica.lock().await.disconnected();
            emit(&reader.event_tx, SyncEvent::Disconnected);
            log::info!("{user_id} disconnected");
        });

        Ok(())
    }

    /// Close the connection. Unacknowledged operations are discarded.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        self.replica.lock().await.disconnected();
    }

    /// Apply a local operation and submit it when nothing else is in flight.
    ///
    /// While disconnected the edit is kept in the offline queue.
    pub async fn apply_local(&self, op: Operation) -> Result<(), ClientError> {
        let mut replica = self.replica.lock().await;
        self.apply_locked(&mut replica, op).await
    }

    /// Replace the local content, submitting the difference.
    pub async fn edit(&self, new_content: &str) -> Result<(), ClientError> {
        let mut replica = self.replica.lock().await;
        let ops = diff(replica.content(), new_content);
        log::trace!(
            "{}: edit at revision {} produced {} operations",
            self.request.user_id,
            replica.revision(),
            ops.len()
        );
        for op in ops {
            self.apply_locked(&mut replica, op).await?;
        }
        Ok(())
    }

    /// Apply through the held replica lock, moving peer carets along.
    async fn apply_locked(&self, replica: &mut Replica, op: Operation) -> Result<(), ClientError> {
        let frame = replica.apply_local(op.clone())?;
        self.presence.lock().await.shift_cursors(&op);
        if let Some(frame) = frame {
            self.send(&frame).await?;
        }
        Ok(())
    }

    /// Move the local caret. Throttled; see [`Self::flush_cursor`].
    pub async fn send_cursor(&self, position: Option<usize>) -> Result<(), ProtocolError> {
        let frame = self.presence.lock().await.update_local_cursor(position);
        match frame {
            Some(frame) if self.is_connected().await => self.send(&frame).await,
            _ => Ok(()),
        }
    }

    /// Send the latest caret position regardless of throttling.
    pub async fn flush_cursor(&self) -> Result<(), ProtocolError> {
        let frame = self.presence.lock().await.force_cursor_broadcast();
        if self.is_connected().await {
            self.send(&frame).await?;
        }
        Ok(())
    }

    /// Typing flags are dropped while offline.
    pub async fn send_typing(&self, is_typing: bool) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        self.send(&ClientMessage::typing(is_typing)).await
    }

    /// Ask for a fresh snapshot.
    pub async fn request_resync(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Resync).await
    }

    /// Send a protocol ping; the server answers with `pong`.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::NotConnected)?;
        send_frame(tx, msg).await
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn content(&self) -> String {
        self.replica.lock().await.content().to_string()
    }

    pub async fn revision(&self) -> u64 {
        self.replica.lock().await.revision()
    }

    /// Whether the replica holds a snapshot it can build on.
    pub async fn is_synced(&self) -> bool {
        self.replica.lock().await.is_synced()
    }

    /// Operations applied locally but not yet acknowledged.
    pub async fn pending_len(&self) -> usize {
        self.replica.lock().await.pending_len()
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.replica.lock().await.offline_len()
    }

    /// Other users in the room, ordered by user id.
    pub async fn peers(&self) -> Vec<SessionEntry> {
        self.presence.lock().await.peers()
    }

    pub async fn local_cursor(&self) -> Option<usize> {
        self.presence.lock().await.local_cursor()
    }

    pub fn user_id(&self) -> &str {
        &self.request.user_id
    }

    pub fn room_id(&self) -> &str {
        &self.request.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// State shared with the reader task.
struct Reader {
    out_tx: mpsc::Sender<Message>,
    event_tx: mpsc::Sender<SyncEvent>,
    replica: Arc<Mutex<Replica>>,
    presence: Arc<Mutex<PresenceView>>,
}

impl Reader {
    async fn handle(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Init {
                ref document,
                revision,
                ..
            } => {
                let mut replica = self.replica.lock().await;
                let replay = replica.on_init(document.clone(), revision);
                self.presence.lock().await.handle_message(&msg);
                if let Some(frame) = replay {
                    self.send(&frame).await;
                }
                emit(
                    &self.event_tx,
                    SyncEvent::Synced {
                        content: replica.content().to_string(),
                        revision,
                    },
                );
            }
            ServerMessage::Operation {
                operation,
                revision,
                user_id,
            } => {
                let mut replica = self.replica.lock().await;
                match replica.on_operation(operation, revision, &user_id) {
                    Reconciled::Acknowledged { revision, next } => {
                        if let Some(frame) = next {
                            self.send(&frame).await;
                        }
                        emit(&self.event_tx, SyncEvent::Acknowledged { revision });
                    }
                    Reconciled::Applied { operation, revision } => {
                        self.presence.lock().await.shift_cursors(&operation);
                        emit(
                            &self.event_tx,
                            SyncEvent::RemoteOperation {
                                user_id,
                                operation,
                                revision,
                            },
                        );
                    }
                    Reconciled::Ignored => {}
                    Reconciled::ResyncNeeded(reason) => {
                        log::info!("{}: resync after {reason:?}", replica.user_id());
                        self.send(&ClientMessage::Resync).await;
                        emit(&self.event_tx, SyncEvent::ResyncRequested);
                    }
                }
            }
            ServerMessage::CursorUpdate { ref user_id, position } => {
                if self.presence.lock().await.handle_message(&msg) {
                    emit(
                        &self.event_tx,
                        SyncEvent::CursorMoved {
                            user_id: user_id.clone(),
                            position,
                        },
                    );
                }
            }
            ServerMessage::TypingUpdate { ref user_id, is_typing } => {
                if self.presence.lock().await.handle_message(&msg) {
                    emit(
                        &self.event_tx,
                        SyncEvent::TypingChanged {
                            user_id: user_id.clone(),
                            is_typing,
                        },
                    );
                }
            }
            ServerMessage::PresenceUpdate { ref presence, .. } => {
                if self.presence.lock().await.handle_message(&msg) {
                    emit(&self.event_tx, SyncEvent::PresenceChanged(presence.clone()));
                }
            }
            ServerMessage::Error { code, message } => {
                log::warn!("server error {code:?}: {message}");
                self.replica.lock().await.on_error(code);
                emit(&self.event_tx, SyncEvent::Error { code, message });
            }
            ServerMessage::Pong => log::trace!("pong"),
        }
    }

    async fn send(&self, msg: &ClientMessage) {
        if let Err(e) = send_frame(&self.out_tx, msg).await {
            log::debug!("dropping {msg:?}: {e}");
        }
    }
}

async fn send_frame(tx: &mpsc::Sender<Message>, msg: &ClientMessage) -> Result<(), ProtocolError> {
    let text = msg.encode()?;
    tx.send(Message::Text(text.into()))
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

/// Events are dropped rather than stalling the reader when nobody drains them.
fn emit(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = tx.try_send(event) {
        log::trace!("event dropped: {e}");
    }
}
