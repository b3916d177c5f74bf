//! Client-side reconciliation: optimistic apply, pending queue, transform on
//! receive.
//!
//! ```text
//!   local edit ──▶ apply to replica ──▶ pending queue ──▶ head in flight
//!                                           ▲                  │
//!                     transform pending     │                  ▼
//!   remote op  ──▶ against incoming op ─────┘         server assigns rev
//!                       │                                      │
//!                       ▼                                      ▼
//!               apply to replica                 ack (own userId) pops head,
//!                                                next entry goes out
//! ```
//!
//! Only the head of the pending queue is ever in flight, so the server
//! never sees an operation built on top of one it has not committed yet.
//! Everything here is synchronous and transport-free; [`crate::client`]
//! drives it over a socket.

use std::collections::VecDeque;

use scribe_core::{diff, transform, Document, Operation, OperationError};
use thiserror::Error;

use crate::protocol::{ClientMessage, ErrorCode};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("offline queue is full ({0} edits)")]
    OfflineQueueFull(usize),
}

/// Why the replica asked for a fresh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// An operation skipped one or more revisions.
    RevisionGap { expected: u64, got: u64 },
    /// An acknowledgment disagreed with the locally transformed pending
    /// head, or a remote operation did not fit the replica.
    Diverged,
    /// An acknowledgment arrived with nothing in flight.
    UnexpectedAck,
}

/// What handling one server `operation` frame did to the replica.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Our in-flight operation was committed. `next` is the following
    /// pending entry, ready to send.
    Acknowledged {
        revision: u64,
        next: Option<ClientMessage>,
    },
    /// A remote operation, transformed against our pending entries and
    /// applied.
    Applied { operation: Operation, revision: u64 },
    /// Stale duplicate, or still waiting for a snapshot.
    Ignored,
    /// The replica cannot be trusted; send `resync`.
    ResyncNeeded(ResyncReason),
}

/// Bounded queue of edits made while disconnected.
///
/// Replayed, clamped to the fresh content, after the next snapshot.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    queue: VecDeque<Operation>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an edit. Returns `false` when full.
    pub fn enqueue(&mut self, operation: Operation) -> bool {
        if self.is_full() {
            return false;
        }
        self.queue.push_back(operation);
        true
    }

    pub fn drain(&mut self) -> Vec<Operation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Chars inserted by the queued edits.
    pub fn inserted_chars(&self) -> usize {
        self.queue
            .iter()
            .map(|op| op.len_delta().max(0) as usize)
            .sum()
    }
}

/// A client's copy of one room's document.
#[derive(Debug)]
pub struct Replica {
    user_id: String,
    document: Document,
    pending: VecDeque<Operation>,
    offline: OfflineQueue,
    synced: bool,
}

impl Replica {
    pub fn new(room_id: impl Into<String>, user_id: impl Into<String>, offline_limit: usize) -> Self {
        Self {
            user_id: user_id.into(),
            document: Document::new(room_id),
            pending: VecDeque::new(),
            offline: OfflineQueue::new(offline_limit),
            synced: false,
        }
    }

    /// Adopt a server snapshot and replay offline edits against it.
    ///
    /// Returns the first replayed edit to send, if any.
    pub fn on_init(&mut self, content: String, revision: u64) -> Option<ClientMessage> {
        let offline = self.offline.drain();
        self.document = Document::from_snapshot(self.document.room_id().to_string(), content, revision);
        self.pending.clear();
        self.synced = true;

        if !offline.is_empty() {
            log::info!("replaying {} offline edits at revision {revision}", offline.len());
        }
        for op in offline {
            let op = op.clamp(self.document.len());
            if op.is_noop() {
                continue;
            }
            match self.document.apply(&op) {
                Ok(()) => self.pending.push_back(op),
                Err(e) => log::warn!("dropping offline edit {op:?}: {e}"),
            }
        }

        self.head_frame()
    }

    /// Apply a local edit optimistically.
    ///
    /// Returns a frame to send when the edit is the only one pending.
    pub fn apply_local(&mut self, op: Operation) -> Result<Option<ClientMessage>, ReplicaError> {
        if op.is_noop() {
            return Ok(None);
        }
        if !self.synced && self.offline.is_full() {
            return Err(ReplicaError::OfflineQueueFull(self.offline.len()));
        }

        self.document.apply(&op)?;

        if !self.synced {
            self.offline.enqueue(op);
            return Ok(None);
        }

        self.pending.push_back(op);
        if self.pending.len() == 1 {
            return Ok(self.head_frame());
        }
        Ok(None)
    }

    /// Diff the replica against `new_content` and apply the result.
    pub fn edit(&mut self, new_content: &str) -> Result<Vec<ClientMessage>, ReplicaError> {
        let mut frames = Vec::new();
        for op in diff(self.document.content(), new_content) {
            if let Some(frame) = self.apply_local(op)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Handle a server `operation` frame.
    pub fn on_operation(&mut self, op: Operation, revision: u64, user_id: &str) -> Reconciled {
        if !self.synced {
            return Reconciled::Ignored;
        }
        if user_id == self.user_id {
            self.on_ack(op, revision)
        } else {
            self.on_remote(op, revision, user_id)
        }
    }

    fn on_ack(&mut self, op: Operation, revision: u64) -> Reconciled {
        let expected = self.document.revision() + 1;
        if revision < expected {
            return Reconciled::Ignored;
        }

        let Some(head) = self.pending.pop_front() else {
            log::warn!("{}: acknowledgment for revision {revision} with nothing in flight", self.user_id);
            return self.request_resync(ResyncReason::UnexpectedAck);
        };
        if revision != expected {
            return self.request_resync(ResyncReason::RevisionGap { expected, got: revision });
        }
        if op != head {
            log::warn!(
                "{}: replica diverged at revision {revision}: server committed {op:?}, local head was {head:?}",
                self.user_id
            );
            return self.request_resync(ResyncReason::Diverged);
        }

        self.document.advance_to(revision);
        log::trace!("{}: acknowledged revision {revision}", self.user_id);
        Reconciled::Acknowledged {
            revision,
            next: self.head_frame(),
        }
    }

    fn on_remote(&mut self, op: Operation, revision: u64, origin: &str) -> Reconciled {
        let expected = self.document.revision() + 1;
        if revision < expected {
            return Reconciled::Ignored;
        }
        if revision > expected {
            return self.request_resync(ResyncReason::RevisionGap { expected, got: revision });
        }

        let mut incoming = op;
        for pending in self.pending.iter_mut() {
            let (pending2, incoming2) = transform(pending, &self.user_id, &incoming, origin);
            *pending = pending2;
            incoming = incoming2;
        }

        if let Err(e) = self.document.apply(&incoming) {
            log::warn!("{}: remote revision {revision} does not fit replica: {e}", self.user_id);
            return self.request_resync(ResyncReason::Diverged);
        }
        self.document.advance_to(revision);

        Reconciled::Applied {
            operation: incoming,
            revision,
        }
    }

    /// The server rejected something. Codes that are followed by a fresh
    /// `init` park local edits in the offline queue until it arrives.
    pub fn on_error(&mut self, code: ErrorCode) {
        match code {
            ErrorCode::RevisionAhead
            | ErrorCode::RevisionTooOld
            | ErrorCode::OutOfBounds
            | ErrorCode::Lagged => {
                self.synced = false;
            }
            ErrorCode::RoomFull | ErrorCode::RoomClosed | ErrorCode::NotJoined | ErrorCode::BadFrame => {}
        }
    }

    /// Transport dropped. Unacknowledged operations are discarded; further
    /// edits queue offline.
    pub fn disconnected(&mut self) {
        if !self.pending.is_empty() {
            log::debug!("{}: discarding {} pending operations", self.user_id, self.pending.len());
        }
        self.pending.clear();
        self.synced = false;
    }

    fn request_resync(&mut self, reason: ResyncReason) -> Reconciled {
        log::debug!("{}: requesting resync ({reason:?})", self.user_id);
        self.synced = false;
        Reconciled::ResyncNeeded(reason)
    }

    fn head_frame(&self) -> Option<ClientMessage> {
        self.pending
            .front()
            .map(|op| ClientMessage::submit(op.clone(), self.document.revision()))
    }

    pub fn content(&self) -> &str {
        self.document.content()
    }

    pub fn revision(&self) -> u64 {
        self.document.revision()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }
}
