//! Per-room revision authority.
//!
//! ```text
//!  connection tasks                 room actor (one task per room)
//!  ────────────────                 ──────────────────────────────
//!  session A ──┐   RoomCommand     ┌─────────────────────────────┐
//!  session B ──┼──▶ bounded inbox ─▶│ Document     (content, rev) │
//!  session C ──┘                   │ OperationHistory (window)   │
//!        ▲                         │ PresenceRoster              │
//!        │    ordered frames       │ BroadcastGroup ─────────────┼──┐
//!        └─────────────────────────┴─────────────────────────────┘  │
//!                   per-session bounded queues ◀────────────────────┘
//! ```
//!
//! The actor is the only writer of its room's document, so revisions are
//! assigned strictly one after another and every session observes the
//! same order. A submission based on an older revision is transformed
//! forward through the trailing history before it is committed. The
//! committed operation goes to every session in the room; for the
//! submitter it doubles as the acknowledgment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use scribe_core::{transform_against, Document, Operation, OperationError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::broadcast::{BroadcastGroup, BroadcastStats, Frame, SessionId};
use crate::history::{HistoryEntry, OperationHistory};
use crate::presence::PresenceRoster;
use crate::protocol::{ErrorCode, JoinRequest, ServerMessage, SessionEntry};
use crate::store::{Snapshot, SnapshotStore};

/// Limits and timings for one room.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_peers: usize,
    /// Frames queued per session before it is detached.
    pub outbound_capacity: usize,
    pub inbox_capacity: usize,
    pub history_limit: usize,
    pub idle_after: Duration,
    pub eviction_grace: Duration,
    pub sweep_interval: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_peers: 100,
            outbound_capacity: 256,
            inbox_capacity: 1024,
            history_limit: 1024,
            idle_after: Duration::from_secs(120),
            eviction_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("revision {submitted} is ahead of room revision {current}")]
    RevisionAhead { submitted: u64, current: u64 },
    #[error("revision {submitted} is older than the history window (oldest {oldest})")]
    RevisionTooOld { submitted: u64, oldest: u64 },
    #[error(transparent)]
    OutOfBounds(#[from] OperationError),
    #[error("session is not joined")]
    NotJoined,
}

impl SubmitError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SubmitError::RevisionAhead { .. } => ErrorCode::RevisionAhead,
            SubmitError::RevisionTooOld { .. } => ErrorCode::RevisionTooOld,
            SubmitError::OutOfBounds(_) => ErrorCode::OutOfBounds,
            SubmitError::NotJoined => ErrorCode::NotJoined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("room {room_id} is full ({max_peers} peers)")]
    RoomFull { room_id: String, max_peers: usize },
    #[error("room {0} is shutting down")]
    Closed(String),
}

impl JoinError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JoinError::RoomFull { .. } => ErrorCode::RoomFull,
            JoinError::Closed(_) => ErrorCode::RoomClosed,
        }
    }
}

/// Messages a connection task sends to its room.
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        session: SessionId,
        request: JoinRequest,
        reply: oneshot::Sender<Result<mpsc::Receiver<Frame>, JoinError>>,
    },
    Submit {
        session: SessionId,
        operation: Operation,
        revision: Option<u64>,
    },
    Cursor {
        session: SessionId,
        position: Option<usize>,
    },
    Typing {
        session: SessionId,
        is_typing: bool,
    },
    Resync {
        session: SessionId,
    },
    Ping {
        session: SessionId,
    },
    Leave {
        session: SessionId,
    },
    Inspect {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

/// Point-in-time view of a room, for stats and tests.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub content: String,
    pub revision: u64,
    pub presence: Vec<SessionEntry>,
    pub sessions: usize,
    pub history_len: usize,
    pub broadcast: BroadcastStats,
}

/// State owned by a room actor.
pub struct Room {
    document: Document,
    history: OperationHistory,
    roster: PresenceRoster,
    fanout: BroadcastGroup,
    config: RoomConfig,
}

impl Room {
    pub fn new(room_id: impl Into<String>, config: RoomConfig) -> Self {
        Self::restore(room_id, None, config)
    }

    /// Open a room from a saved snapshot, or empty at revision 0.
    pub fn restore(room_id: impl Into<String>, snapshot: Option<Snapshot>, config: RoomConfig) -> Self {
        let document = match snapshot {
            Some(s) => Document::from_snapshot(room_id, s.content, s.revision),
            None => Document::new(room_id),
        };
        Self {
            history: OperationHistory::new(document.revision(), config.history_limit),
            roster: PresenceRoster::new(),
            fanout: BroadcastGroup::new(config.outbound_capacity),
            document,
            config,
        }
    }

    pub fn room_id(&self) -> &str {
        self.document.room_id()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn roster(&self) -> &PresenceRoster {
        &self.roster
    }

    /// No sessions and nobody left on the roster.
    pub fn is_idle(&self) -> bool {
        self.fanout.is_empty() && self.roster.is_empty()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id().to_string(),
            content: self.document.content().to_string(),
            revision: self.document.revision(),
            presence: self.roster.snapshot(),
            sessions: self.fanout.session_count(),
            history_len: self.history.len(),
            broadcast: self.fanout.stats(),
        }
    }

    // ─── commands ──────────────────────────────────────────────

    pub fn handle(&mut self, command: RoomCommand, now: Instant) {
        match command {
            RoomCommand::Join {
                session,
                request,
                reply,
            } => {
                let result = self.join(session, request, now);
                if let Err(Ok(rx)) = reply.send(result) {
                    // The connection gave up waiting.
                    drop(rx);
                    self.leave(session, now);
                }
            }
            RoomCommand::Submit {
                session,
                operation,
                revision,
            } => {
                // Rejections are reported to the session.
                let _ = self.submit(session, operation, revision, now);
            }
            RoomCommand::Cursor { session, position } => self.cursor(session, position, now),
            RoomCommand::Typing { session, is_typing } => self.typing(session, is_typing, now),
            RoomCommand::Resync { session } => self.resync(session, now),
            RoomCommand::Ping { session } => self.ping(session, now),
            RoomCommand::Leave { session } => self.leave(session, now),
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Admit a session: `init` to it, a presence delta to everyone else.
    pub fn join(
        &mut self,
        session: SessionId,
        request: JoinRequest,
        now: Instant,
    ) -> Result<mpsc::Receiver<Frame>, JoinError> {
        let rejoining = self.roster.session_of(&request.user_id).is_some();
        if !rejoining && self.fanout.session_count() >= self.config.max_peers {
            log::warn!("room {} full, refusing {}", self.room_id(), request.user_id);
            return Err(JoinError::RoomFull {
                room_id: self.room_id().to_string(),
                max_peers: self.config.max_peers,
            });
        }

        let outcome = self.roster.join(session, &request, now);
        if let Some(old) = outcome.replaced {
            log::info!(
                "room {}: {} reconnected, detaching session {old}",
                self.room_id(),
                request.user_id
            );
            self.fanout.remove_session(&old);
        }

        let rx = self.fanout.add_session(session, request.user_id.clone());
        self.send_init(session);
        self.broadcast(
            &ServerMessage::PresenceUpdate {
                presence: vec![outcome.entry],
                full: false,
            },
            Some(&session),
        );
        log::info!(
            "room {}: {} ({}) joined at revision {}, {} sessions",
            self.room_id(),
            request.display_name,
            request.user_id,
            self.document.revision(),
            self.fanout.session_count()
        );
        self.reap(now);
        Ok(rx)
    }

    /// Commit a submission and fan it out. On rejection the submitter gets
    /// an `error` followed by a fresh `init`.
    pub fn submit(
        &mut self,
        session: SessionId,
        operation: Operation,
        revision: Option<u64>,
        now: Instant,
    ) -> Result<u64, SubmitError> {
        let Some(user_id) = self.member(&session, now) else {
            return Err(SubmitError::NotJoined);
        };

        match self.commit(&user_id, &operation, revision) {
            Ok((committed, rev)) => {
                self.roster.shift_cursors(&committed, &user_id);
                self.broadcast(
                    &ServerMessage::Operation {
                        operation: committed,
                        revision: rev,
                        user_id,
                    },
                    None,
                );
                self.reap(now);
                Ok(rev)
            }
            Err(e) => {
                log::debug!("room {}: rejected submission from {user_id}: {e}", self.room_id());
                self.send(session, &ServerMessage::error(e.code(), e.to_string()));
                self.send_init(session);
                self.reap(now);
                Err(e)
            }
        }
    }

    /// Transform `operation` from its base revision to the head and apply it.
    fn commit(
        &mut self,
        origin: &str,
        operation: &Operation,
        revision: Option<u64>,
    ) -> Result<(Operation, u64), SubmitError> {
        let current = self.document.revision();
        let base = revision.unwrap_or(current);
        if base > current {
            return Err(SubmitError::RevisionAhead {
                submitted: base,
                current,
            });
        }

        let concurrent: Vec<&HistoryEntry> = self
            .history
            .since(base)
            .ok_or(SubmitError::RevisionTooOld {
                submitted: base,
                oldest: self.history.oldest_base(),
            })?
            .collect();

        // Check against the content the client saw, before any arithmetic.
        let base_len = concurrent
            .iter()
            .fold(self.document.len() as i64, |len, entry| len - entry.operation.len_delta());
        operation.validate(base_len.max(0) as usize)?;

        let transformed = transform_against(
            operation,
            origin,
            concurrent.iter().map(|entry| entry.tagged()),
        );

        let rev = self.document.commit(&transformed)?;
        self.history.push(rev, origin, transformed.clone());
        if base < current {
            log::trace!(
                "room {}: {origin} caught up from {base} to {current}",
                self.room_id()
            );
        }
        Ok((transformed, rev))
    }

    pub fn cursor(&mut self, session: SessionId, position: Option<usize>, now: Instant) {
        let Some(user_id) = self.member(&session, now) else {
            return;
        };
        let position = position.map(|p| p.min(self.document.len()));
        self.roster.set_cursor(&user_id, position);
        self.broadcast(&ServerMessage::CursorUpdate { user_id, position }, Some(&session));
        self.reap(now);
    }

    pub fn typing(&mut self, session: SessionId, is_typing: bool, now: Instant) {
        let Some(user_id) = self.member(&session, now) else {
            return;
        };
        self.roster.set_typing(&user_id, is_typing);
        self.broadcast(&ServerMessage::TypingUpdate { user_id, is_typing }, Some(&session));
        self.reap(now);
    }

    pub fn resync(&mut self, session: SessionId, now: Instant) {
        if self.member(&session, now).is_some() {
            log::debug!("room {}: resync for session {session}", self.room_id());
            self.send_init(session);
            self.reap(now);
        }
    }

    pub fn ping(&mut self, session: SessionId, now: Instant) {
        if self.member(&session, now).is_some() {
            self.send(session, &ServerMessage::Pong);
            self.reap(now);
        }
    }

    /// A connection ended. Its roster entry goes offline unless a newer
    /// session already took it over.
    pub fn leave(&mut self, session: SessionId, now: Instant) {
        if let Some(user_id) = self.fanout.remove_session(&session) {
            log::info!("room {}: {user_id} left", self.room_id());
        }
        if let Some(entry) = self.roster.disconnect(session, now) {
            self.broadcast(
                &ServerMessage::PresenceUpdate {
                    presence: vec![entry],
                    full: false,
                },
                None,
            );
        }
        self.reap(now);
    }

    /// Idle out quiet users and evict long-offline ones.
    pub fn sweep(&mut self, now: Instant) {
        let outcome = self
            .roster
            .sweep(now, self.config.idle_after, self.config.eviction_grace);
        if outcome.is_empty() {
            return;
        }
        if !outcome.idled.is_empty() {
            self.broadcast(
                &ServerMessage::PresenceUpdate {
                    presence: outcome.idled,
                    full: false,
                },
                None,
            );
        }
        if !outcome.evicted.is_empty() {
            log::debug!("room {}: evicted {:?}", self.room_id(), outcome.evicted);
            let presence = self.roster.snapshot();
            self.broadcast(&ServerMessage::PresenceUpdate { presence, full: true }, None);
        }
        self.reap(now);
    }

    // ─── helpers ───────────────────────────────────────────────

    /// The user behind a live session, recording activity on the way.
    fn member(&mut self, session: &SessionId, now: Instant) -> Option<String> {
        let user_id = self.fanout.user_of(session)?.to_string();
        if let Some(entry) = self.roster.touch(&user_id, now) {
            self.broadcast(
                &ServerMessage::PresenceUpdate {
                    presence: vec![entry],
                    full: false,
                },
                Some(session),
            );
        }
        Some(user_id)
    }

    fn send_init(&mut self, session: SessionId) {
        let init = ServerMessage::Init {
            document: self.document.content().to_string(),
            revision: self.document.revision(),
            presence: self.roster.snapshot(),
        };
        self.send(session, &init);
    }

    fn send(&mut self, session: SessionId, msg: &ServerMessage) {
        if let Err(e) = self.fanout.send_to(&session, msg) {
            log::error!("room {}: failed to encode frame: {e}", self.room_id());
        }
    }

    fn broadcast(&mut self, msg: &ServerMessage, except: Option<&SessionId>) {
        if let Err(e) = self.fanout.broadcast(msg, except) {
            log::error!("room {}: failed to encode frame: {e}", self.room_id());
        }
    }

    /// Mark sessions the fan-out detached as offline. Announcing that can
    /// overflow further queues, so repeat until nothing changes.
    fn reap(&mut self, now: Instant) {
        loop {
            let detached = self.fanout.take_detached();
            if detached.is_empty() {
                return;
            }
            for (session, user_id, reason) in detached {
                log::warn!("room {}: {user_id} detached ({reason:?})", self.room_id());
                if let Some(entry) = self.roster.disconnect(session, now) {
                    let frame = ServerMessage::PresenceUpdate {
                        presence: vec![entry],
                        full: false,
                    };
                    if let Err(e) = self.fanout.broadcast(&frame, None) {
                        log::error!("room {}: failed to encode frame: {e}", self.room_id());
                    }
                }
            }
        }
    }

    /// Drive the room until every session is gone and the roster is empty,
    /// then save its snapshot.
    ///
    /// The snapshot is saved before the inbox closes, so a room reopened
    /// under the same id always starts from the latest content.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<RoomCommand>, store: Arc<dyn SnapshotStore>) {
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(command) => self.handle(command, Instant::now()),
                    None => break,
                },
                _ = sweep.tick() => {
                    self.sweep(Instant::now());
                    if self.is_idle() && inbox.is_empty() {
                        break;
                    }
                }
            }
        }

        log::info!(
            "room {} closing at revision {}",
            self.room_id(),
            self.document.revision()
        );
        store.save(
            self.room_id(),
            Snapshot {
                content: self.document.content().to_string(),
                revision: self.document.revision(),
            },
        );
        inbox.close();
    }
}

/// Sending side of a room actor's inbox.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: Arc<str>,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Queue a command. Fails once the room has shut down.
    pub async fn send(&self, command: RoomCommand) -> Result<(), JoinError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| JoinError::Closed(self.room_id.to_string()))
    }

    pub async fn inspect(&self) -> Option<RoomSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Inspect { reply }).await.ok()?;
        rx.await.ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Maps room ids to running room actors, starting them on demand.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    config: RoomConfig,
    store: Arc<dyn SnapshotStore>,
}

impl RoomRegistry {
    pub fn new(config: RoomConfig, store: Arc<dyn SnapshotStore>) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            config,
            store,
        })
    }

    /// The running actor for `room_id`, started if needed.
    pub async fn get_or_create(self: &Arc<Self>, room_id: &str) -> RoomHandle {
        {
            let rooms = self.rooms.read().await;
            if let Some(handle) = rooms.get(room_id).filter(|h| !h.is_closed()) {
                return handle.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(handle) = rooms.get(room_id).filter(|h| !h.is_closed()) {
            return handle.clone();
        }

        let snapshot = self.store.load(room_id);
        if let Some(s) = &snapshot {
            log::info!("room {room_id}: restored snapshot at revision {}", s.revision);
        }
        let room = Room::restore(room_id, snapshot, self.config.clone());
        let (tx, inbox) = mpsc::channel(self.config.inbox_capacity.max(1));
        let handle = RoomHandle {
            room_id: Arc::from(room_id),
            tx,
        };
        rooms.insert(room_id.to_string(), handle.clone());

        let registry = Arc::clone(self);
        let id = room_id.to_string();
        let own = handle.tx.clone();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            room.run(inbox, store).await;
            let mut rooms = registry.rooms.write().await;
            if rooms.get(&id).is_some_and(|h| h.tx.same_channel(&own)) {
                rooms.remove(&id);
            }
        });

        log::info!("room {room_id} opened");
        handle
    }

    /// Join `request.room_id`, retrying if the room shut down between
    /// lookup and delivery.
    pub async fn join(
        self: &Arc<Self>,
        session: SessionId,
        request: JoinRequest,
    ) -> Result<(RoomHandle, mpsc::Receiver<Frame>), JoinError> {
        let room_id = request.room_id.clone();
        for _ in 0..3 {
            let handle = self.get_or_create(&room_id).await;
            let (reply, rx) = oneshot::channel();
            let command = RoomCommand::Join {
                session,
                request: request.clone(),
                reply,
            };
            if handle.send(command).await.is_err() {
                continue;
            }
            match rx.await {
                Ok(result) => return result.map(|frames| (handle, frames)),
                Err(_) => continue,
            }
        }
        Err(JoinError::Closed(room_id))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn get(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.read().await.get(room_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PresenceStatus;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn room() -> Room {
        Room::new("room", RoomConfig::default())
    }

    fn join(user: &str) -> JoinRequest {
        JoinRequest::new("room", user, user)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ServerMessage::decode(&frame).unwrap());
        }
        out
    }

    fn joined(room: &mut Room, user: &str) -> (SessionId, mpsc::Receiver<Frame>) {
        let session = Uuid::new_v4();
        let rx = room.join(session, join(user), Instant::now()).unwrap();
        (session, rx)
    }

    #[test]
    fn test_join_sends_init_and_presence_delta() {
        let mut room = room();
        let (_a, mut rx_a) = joined(&mut room, "alice");
        let init = drain(&mut rx_a);
        assert!(matches!(
            &init[..],
            [ServerMessage::Init { revision: 0, presence, .. }] if presence.len() == 1
        ));

        let (_b, mut rx_b) = joined(&mut room, "bob");
        match &drain(&mut rx_b)[..] {
            [ServerMessage::Init { presence, .. }] => assert_eq!(presence.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        match &drain(&mut rx_a)[..] {
            [ServerMessage::PresenceUpdate { presence, full: false }] => {
                assert_eq!(presence[0].user_id, "bob");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_revisions_increase_by_one() {
        let mut room = room();
        let (a, _rx) = joined(&mut room, "alice");
        let now = Instant::now();
        for (i, ch) in ["a", "b", "c", "d"].iter().enumerate() {
            let rev = room
                .submit(a, Operation::insert(i, *ch), Some(i as u64), now)
                .unwrap();
            assert_eq!(rev, i as u64 + 1);
        }
        assert_eq!(room.document().content(), "abcd");
    }

    #[test]
    fn test_commit_broadcasts_and_acknowledges() {
        let mut room = room();
        let (a, mut rx_a) = joined(&mut room, "alice");
        let (_b, mut rx_b) = joined(&mut room, "bob");
        drain(&mut rx_a);
        drain(&mut rx_b);

        room.submit(a, Operation::insert(0, "hi"), Some(0), Instant::now())
            .unwrap();

        let expected = ServerMessage::Operation {
            operation: Operation::insert(0, "hi"),
            revision: 1,
            user_id: "alice".into(),
        };
        assert_eq!(drain(&mut rx_a), vec![expected.clone()]);
        assert_eq!(drain(&mut rx_b), vec![expected]);
    }

    #[test]
    fn test_stale_submission_is_transformed_forward() {
        let mut room = Room::restore(
            "room",
            Some(Snapshot {
                content: "abcdef".into(),
                revision: 3,
            }),
            RoomConfig::default(),
        );
        let (a, mut rx_a) = joined(&mut room, "alice");
        let (b, _rx_b) = joined(&mut room, "bob");
        let now = Instant::now();

        // Revisions 4 and 5.
        room.submit(b, Operation::insert(0, "XY"), Some(3), now).unwrap();
        room.submit(b, Operation::delete(6, 2), Some(4), now).unwrap();
        assert_eq!(room.document().content(), "XYabcd");
        drain(&mut rx_a);

        // alice built her edit against revision 3: insert after "abc".
        let rev = room.submit(a, Operation::insert(3, "!"), Some(3), now).unwrap();
        assert_eq!(rev, 6);
        assert_eq!(room.document().content(), "XYabc!d");

        let frames = drain(&mut rx_a);
        assert_eq!(
            frames.last(),
            Some(&ServerMessage::Operation {
                operation: Operation::insert(5, "!"),
                revision: 6,
                user_id: "alice".into(),
            })
        );
    }

    #[test]
    fn test_join_error_codes() {
        let full = JoinError::RoomFull {
            room_id: "room".into(),
            max_peers: 2,
        };
        assert_eq!(full.code(), ErrorCode::RoomFull);
        assert_eq!(JoinError::Closed("room".into()).code(), ErrorCode::RoomClosed);
    }

    #[test]
    fn test_stale_duplicate_delete_commits_as_noop() {
        let mut room = Room::restore(
            "room",
            Some(Snapshot {
                content: "abcdef".into(),
                revision: 0,
            }),
            RoomConfig::default(),
        );
        let (a, mut rx_a) = joined(&mut room, "alice");
        let (b, _rx_b) = joined(&mut room, "bob");
        let (c, _rx_c) = joined(&mut room, "carol");
        let now = Instant::now();

        room.submit(b, Operation::delete(4, 2), Some(0), now).unwrap();
        room.submit(c, Operation::delete(0, 4), Some(1), now).unwrap();
        assert_eq!(room.document().content(), "");
        drain(&mut rx_a);

        // alice deleted "ef" too, before seeing either edit.
        let rev = room.submit(a, Operation::delete(4, 2), Some(0), now).unwrap();
        assert_eq!(rev, 3);
        assert_eq!(room.document().content(), "");

        match &drain(&mut rx_a)[..] {
            [ServerMessage::Operation { operation, revision: 3, user_id }] => {
                assert!(operation.is_noop());
                assert_eq!(user_id, "alice");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_omitted_revision_means_current() {
        let mut room = room();
        let (a, _rx) = joined(&mut room, "alice");
        let now = Instant::now();
        room.submit(a, Operation::insert(0, "ab"), None, now).unwrap();
        assert_eq!(room.submit(a, Operation::insert(2, "c"), None, now), Ok(2));
        assert_eq!(room.document().content(), "abc");
    }

    #[test]
    fn test_stale_submission_checked_against_its_base() {
        let mut room = room();
        let (a, _rx_a) = joined(&mut room, "alice");
        let (b, _rx_b) = joined(&mut room, "bob");
        let now = Instant::now();
        room.submit(a, Operation::insert(0, "abc"), Some(0), now).unwrap();

        // Fits the current text, but bob's base was empty.
        let err = room.submit(b, Operation::insert(2, "z"), Some(0), now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfBounds);

        let huge = Operation::delete(usize::MAX, 2);
        assert!(room.submit(b, huge, Some(0), now).is_err());
        assert_eq!(room.document().content(), "abc");
    }

    #[test]
    fn test_rejections_send_error_then_init() {
        let mut room = room();
        let (a, mut rx) = joined(&mut room, "alice");
        drain(&mut rx);
        let now = Instant::now();

        let err = room.submit(a, Operation::insert(0, "x"), Some(9), now).unwrap_err();
        assert_eq!(err, SubmitError::RevisionAhead { submitted: 9, current: 0 });

        let err = room.submit(a, Operation::delete(0, 3), Some(0), now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfBounds);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[0], ServerMessage::Error { code: ErrorCode::RevisionAhead, .. }));
        assert!(matches!(frames[1], ServerMessage::Init { revision: 0, .. }));
        assert!(matches!(frames[2], ServerMessage::Error { code: ErrorCode::OutOfBounds, .. }));
        assert!(matches!(frames[3], ServerMessage::Init { .. }));
        assert_eq!(room.document().revision(), 0);
    }

    #[test]
    fn test_revision_older_than_window() {
        let config = RoomConfig {
            history_limit: 2,
            ..RoomConfig::default()
        };
        let mut room = Room::new("room", config);
        let (a, _rx) = joined(&mut room, "alice");
        let now = Instant::now();
        for i in 0..4 {
            room.submit(a, Operation::insert(0, "x"), Some(i), now).unwrap();
        }
        assert_eq!(
            room.submit(a, Operation::insert(0, "y"), Some(1), now),
            Err(SubmitError::RevisionTooOld { submitted: 1, oldest: 2 })
        );
        assert!(room.submit(a, Operation::insert(0, "y"), Some(2), now).is_ok());
    }

    #[test]
    fn test_unknown_session_is_not_joined() {
        let mut room = room();
        assert_eq!(
            room.submit(Uuid::new_v4(), Operation::insert(0, "x"), None, Instant::now()),
            Err(SubmitError::NotJoined)
        );
    }

    #[test]
    fn test_cursor_and_typing_deltas_skip_sender() {
        let mut room = room();
        let (a, mut rx_a) = joined(&mut room, "alice");
        let (_b, mut rx_b) = joined(&mut room, "bob");
        drain(&mut rx_a);
        drain(&mut rx_b);
        let now = Instant::now();

        room.cursor(a, Some(99), now);
        room.typing(a, true, now);

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(
            drain(&mut rx_b),
            vec![
                ServerMessage::CursorUpdate {
                    user_id: "alice".into(),
                    position: Some(0),
                },
                ServerMessage::TypingUpdate {
                    user_id: "alice".into(),
                    is_typing: true,
                },
            ]
        );
        assert!(room.roster().get("alice").unwrap().is_typing);
    }

    #[test]
    fn test_cursors_follow_commits() {
        let mut room = room();
        let (a, _rx_a) = joined(&mut room, "alice");
        let (b, _rx_b) = joined(&mut room, "bob");
        let now = Instant::now();
        room.submit(a, Operation::insert(0, "hello"), Some(0), now).unwrap();
        room.cursor(b, Some(5), now);

        room.submit(a, Operation::insert(0, ">> "), Some(1), now).unwrap();
        assert_eq!(room.roster().get("bob").unwrap().cursor_position, Some(8));
    }

    #[test]
    fn test_rejoin_detaches_old_session() {
        let mut room = room();
        let (old, mut old_rx) = joined(&mut room, "alice");
        let (_b, mut rx_b) = joined(&mut room, "bob");
        drain(&mut rx_b);
        let (new, _new_rx) = joined(&mut room, "alice");
        drain(&mut rx_b);

        // Old queue drains and closes.
        drain(&mut old_rx);
        assert!(matches!(
            old_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // The stale disconnect leaves the new entry alone.
        room.leave(old, Instant::now());
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(room.roster().session_of("alice"), Some(new));
        assert_eq!(room.roster().len(), 2);
    }

    #[test]
    fn test_leave_then_evict() {
        let config = RoomConfig {
            eviction_grace: Duration::from_secs(5),
            ..RoomConfig::default()
        };
        let mut room = Room::new("room", config);
        let (a, _rx_a) = joined(&mut room, "alice");
        let (_b, mut rx_b) = joined(&mut room, "bob");
        drain(&mut rx_b);

        let t0 = Instant::now();
        room.leave(a, t0);
        match &drain(&mut rx_b)[..] {
            [ServerMessage::PresenceUpdate { presence, full: false }] => {
                assert_eq!(presence[0].status, PresenceStatus::Offline);
            }
            other => panic!("unexpected {other:?}"),
        }

        room.sweep(t0 + Duration::from_secs(5));
        match &drain(&mut rx_b)[..] {
            [ServerMessage::PresenceUpdate { presence, full: true }] => {
                assert_eq!(presence.len(), 1);
                assert_eq!(presence[0].user_id, "bob");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!room.is_idle());
    }

    #[test]
    fn test_room_full() {
        let config = RoomConfig {
            max_peers: 1,
            ..RoomConfig::default()
        };
        let mut room = Room::new("room", config);
        let (_a, _rx) = joined(&mut room, "alice");
        let err = room
            .join(Uuid::new_v4(), join("bob"), Instant::now())
            .unwrap_err();
        assert!(matches!(err, JoinError::RoomFull { max_peers: 1, .. }));
        // Reconnecting under the same identity is still allowed.
        assert!(room.join(Uuid::new_v4(), join("alice"), Instant::now()).is_ok());
    }

    #[test]
    fn test_lagging_session_is_detached_and_marked_offline() {
        let config = RoomConfig {
            outbound_capacity: 2,
            ..RoomConfig::default()
        };
        let mut room = Room::new("room", config);
        let (a, mut rx_a) = joined(&mut room, "alice");
        let (_slow, _rx_slow) = joined(&mut room, "slow");
        let now = Instant::now();

        for i in 0..3 {
            drain(&mut rx_a);
            room.submit(a, Operation::insert(0, "x"), Some(i), now).unwrap();
        }

        assert_eq!(room.roster().get("slow").unwrap().status, PresenceStatus::Offline);
        assert_eq!(room.snapshot().sessions, 1);
        assert_eq!(room.snapshot().broadcast.sessions_detached, 1);
    }

    #[tokio::test]
    async fn test_registry_reuses_running_room() {
        let registry = RoomRegistry::new(RoomConfig::default(), Arc::new(MemoryStore::new()));
        let h1 = registry.get_or_create("doc").await;
        let h2 = registry.get_or_create("doc").await;
        assert!(h1.tx.same_channel(&h2.tx));
        registry.get_or_create("other").await;
        assert_eq!(registry.room_count().await, 2);
        assert_eq!(registry.active_rooms().await, vec!["doc", "other"]);
    }

    #[tokio::test]
    async fn test_registry_join_and_inspect() {
        let registry = RoomRegistry::new(RoomConfig::default(), Arc::new(MemoryStore::new()));
        let session = Uuid::new_v4();
        let (handle, mut frames) = registry
            .join(session, JoinRequest::new("doc", "alice", "Alice"))
            .await
            .unwrap();

        let first = frames.recv().await.unwrap();
        assert!(matches!(
            ServerMessage::decode(&first).unwrap(),
            ServerMessage::Init { revision: 0, .. }
        ));

        handle
            .send(RoomCommand::Submit {
                session,
                operation: Operation::insert(0, "hey"),
                revision: Some(0),
            })
            .await
            .unwrap();
        let snapshot = handle.inspect().await.unwrap();
        assert_eq!(snapshot.content, "hey");
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.sessions, 1);
    }

    #[tokio::test]
    async fn test_empty_room_closes_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let config = RoomConfig {
            eviction_grace: Duration::ZERO,
            sweep_interval: Duration::from_millis(20),
            ..RoomConfig::default()
        };
        let registry = RoomRegistry::new(config, store.clone());
        let session = Uuid::new_v4();
        let (handle, _frames) = registry
            .join(session, JoinRequest::new("doc", "alice", "Alice"))
            .await
            .unwrap();
        handle
            .send(RoomCommand::Submit {
                session,
                operation: Operation::insert(0, "kept"),
                revision: Some(0),
            })
            .await
            .unwrap();
        handle.send(RoomCommand::Leave { session }).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.room_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            store.load("doc"),
            Some(Snapshot {
                content: "kept".into(),
                revision: 1,
            })
        );

        // Reopening restores the saved content.
        let (_handle, mut frames) = registry
            .join(Uuid::new_v4(), JoinRequest::new("doc", "bob", "Bob"))
            .await
            .unwrap();
        match ServerMessage::decode(&frames.recv().await.unwrap()).unwrap() {
            ServerMessage::Init { document, revision, .. } => {
                assert_eq!(document, "kept");
                assert_eq!(revision, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
