//! Ordered fan-out from a room to its sessions, with backpressure.
//!
//! Every session owns a bounded mpsc queue of pre-encoded frames. A frame is
//! serialized once and shared by `Arc` across all recipients. Operation
//! frames must never be skipped, so a session whose queue is full is
//! detached rather than allowed to miss a revision; its connection closes
//! and the client resyncs on reconnect.
//!
//! The group is owned by a single room actor and needs no locking. Stats
//! are atomics so other tasks can read them without asking the actor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// Identifies one transport connection. A user reconnecting gets a new one.
pub type SessionId = Uuid;

/// An encoded server frame, shared between recipients.
pub type Frame = Arc<str>;

/// Snapshot of fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub sessions_detached: u64,
    pub active_sessions: usize,
}

/// Lock-free counters behind [`BroadcastStats`].
#[derive(Debug, Default)]
pub struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    sessions_detached: AtomicU64,
    active_sessions: AtomicUsize,
}

impl AtomicBroadcastStats {
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            sessions_detached: self.sessions_detached.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
        }
    }
}

/// Why a session left the group without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// Outbound queue full.
    Lagged,
    /// Receiver dropped; the connection task is gone.
    Closed,
}

#[derive(Debug)]
struct SessionSink {
    user_id: String,
    tx: mpsc::Sender<Frame>,
}

/// Fan-out for one room.
#[derive(Debug)]
pub struct BroadcastGroup {
    sessions: HashMap<SessionId, SessionSink>,
    capacity: usize,
    detached: Vec<(SessionId, String, DetachReason)>,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` frames may queue per session before it is detached.
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            capacity: capacity.max(1),
            detached: Vec::new(),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register a session and hand back the receiving end of its queue.
    pub fn add_session(&mut self, session: SessionId, user_id: impl Into<String>) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.sessions.insert(
            session,
            SessionSink {
                user_id: user_id.into(),
                tx,
            },
        );
        self.sync_active();
        rx
    }

    /// Drop a session's sender; its receiver drains and then closes.
    pub fn remove_session(&mut self, session: &SessionId) -> Option<String> {
        let removed = self.sessions.remove(session).map(|sink| sink.user_id);
        self.sync_active();
        removed
    }

    /// Send to one session.
    pub fn send_to(&mut self, session: &SessionId, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        let frame: Frame = Arc::from(msg.encode()?);
        Ok(self.deliver(session, frame))
    }

    /// Send to every session except `except`. Returns how many accepted it.
    pub fn broadcast(&mut self, msg: &ServerMessage, except: Option<&SessionId>) -> Result<usize, ProtocolError> {
        let frame: Frame = Arc::from(msg.encode()?);
        Ok(self.broadcast_raw(frame, except))
    }

    /// Fan out a pre-encoded frame.
    pub fn broadcast_raw(&mut self, frame: Frame, except: Option<&SessionId>) -> usize {
        let targets: Vec<SessionId> = self
            .sessions
            .keys()
            .filter(|id| Some(*id) != except)
            .copied()
            .collect();

        targets
            .iter()
            .filter(|id| self.deliver(id, frame.clone()))
            .count()
    }

    fn deliver(&mut self, session: &SessionId, frame: Frame) -> bool {
        let Some(sink) = self.sessions.get(session) else {
            return false;
        };

        let reason = match sink.tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Err(TrySendError::Full(_)) => DetachReason::Lagged,
            Err(TrySendError::Closed(_)) => DetachReason::Closed,
        };

        if let Some(sink) = self.sessions.remove(session) {
            log::warn!("detaching session {session} ({}): {reason:?}", sink.user_id);
            self.detached.push((*session, sink.user_id, reason));
            self.stats.sessions_detached.fetch_add(1, Ordering::Relaxed);
            self.sync_active();
        }
        false
    }

    /// Sessions detached since the last call.
    pub fn take_detached(&mut self) -> Vec<(SessionId, String, DetachReason)> {
        std::mem::take(&mut self.detached)
    }

    fn sync_active(&self) {
        self.stats
            .active_sessions
            .store(self.sessions.len(), Ordering::Relaxed);
    }

    pub fn has_session(&self, session: &SessionId) -> bool {
        self.sessions.contains_key(session)
    }

    pub fn user_of(&self, session: &SessionId) -> Option<&str> {
        self.sessions.get(session).map(|sink| sink.user_id.as_str())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats.snapshot()
    }

    /// Shared handle to the counters.
    pub fn stats_handle(&self) -> Arc<AtomicBroadcastStats> {
        self.stats.clone()
    }
}
