//! Presence: who is in a room, where their caret is, who is typing.
//!
//! ## Architecture
//!
//! ```text
//! join / cursor / typing / disconnect
//!       │
//!       ▼
//! PresenceRoster            (server, owned by the room actor)
//!       │  delta: one SessionEntry, cursor_update, typing_update
//!       │  full:  whole roster after an eviction
//!       ▼
//! PresenceView              (client, one per replica)
//!       │
//!       ▼
//! UI layer renders carets (out of scope)
//! ```
//!
//! Status lifecycle of a roster entry:
//!
//! ```text
//! online ──idle_after──▶ idle ──any activity──▶ online
//!    │                     │
//!    └──── disconnect ─────┴──▶ offline ──eviction_grace──▶ evicted
//! ```
//!
//! Caret positions are char offsets into the document and are shifted
//! through every applied operation, so they stay attached to the same text.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use scribe_core::{Bias, Operation};

use crate::broadcast::SessionId;
use crate::protocol::{ClientMessage, JoinRequest, PresenceStatus, ServerMessage, SessionEntry};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// A stable, vivid CSS color for a user id.
///
/// The hue comes from an FNV-1a hash of the id, so every client derives the
/// same color for the same user without coordination.
pub fn color_for(user_id: &str) -> String {
    let hash = user_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        });
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Server roster
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Slot {
    entry: SessionEntry,
    /// Live session bound to this entry; `None` once offline.
    session: Option<SessionId>,
    last_seen: Instant,
    offline_since: Option<Instant>,
}

/// Result of [`PresenceRoster::join`].
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub entry: SessionEntry,
    /// Earlier live session of the same user, now superseded.
    pub replaced: Option<SessionId>,
}

/// Entries whose status changed during a [`PresenceRoster::sweep`].
#[derive(Debug, Default, Clone)]
pub struct SweepOutcome {
    pub idled: Vec<SessionEntry>,
    pub evicted: Vec<String>,
}

impl SweepOutcome {
    pub fn is_empty(&self) -> bool {
        self.idled.is_empty() && self.evicted.is_empty()
    }
}

/// Authoritative presence for one room, keyed by user id.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    slots: HashMap<String, Slot>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the entry for `request.user_id`, bound to `session`.
    pub fn join(&mut self, session: SessionId, request: &JoinRequest, now: Instant) -> JoinOutcome {
        let entry = SessionEntry::online(request);
        let previous = self.slots.insert(
            request.user_id.clone(),
            Slot {
                entry: entry.clone(),
                session: Some(session),
                last_seen: now,
                offline_since: None,
            },
        );
        JoinOutcome {
            entry,
            replaced: previous.and_then(|slot| slot.session),
        }
    }

    /// Record activity. Returns the entry if it just came back from idle.
    pub fn touch(&mut self, user_id: &str, now: Instant) -> Option<SessionEntry> {
        let slot = self.slots.get_mut(user_id)?;
        if slot.session.is_none() {
            return None;
        }
        slot.last_seen = now;
        slot.entry.last_activity = Utc::now();
        if slot.entry.status == PresenceStatus::Idle {
            slot.entry.status = PresenceStatus::Online;
            return Some(slot.entry.clone());
        }
        None
    }

    pub fn set_cursor(&mut self, user_id: &str, position: Option<usize>) -> bool {
        match self.slots.get_mut(user_id) {
            Some(slot) => {
                slot.entry.cursor_position = position;
                true
            }
            None => false,
        }
    }

    pub fn set_typing(&mut self, user_id: &str, is_typing: bool) -> bool {
        match self.slots.get_mut(user_id) {
            Some(slot) => {
                slot.entry.is_typing = is_typing;
                true
            }
            None => false,
        }
    }

    /// Mark the entry bound to `session` offline.
    ///
    /// A session that was already superseded by a newer join of the same
    /// user finds no entry and changes nothing.
    pub fn disconnect(&mut self, session: SessionId, now: Instant) -> Option<SessionEntry> {
        let slot = self
            .slots
            .values_mut()
            .find(|slot| slot.session == Some(session))?;
        slot.session = None;
        slot.offline_since = Some(now);
        slot.entry.status = PresenceStatus::Offline;
        slot.entry.is_typing = false;
        Some(slot.entry.clone())
    }

    /// Idle out quiet entries and evict offline ones past the grace period.
    pub fn sweep(&mut self, now: Instant, idle_after: Duration, eviction_grace: Duration) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for slot in self.slots.values_mut() {
            if slot.entry.status == PresenceStatus::Online
                && now.saturating_duration_since(slot.last_seen) >= idle_after
            {
                slot.entry.status = PresenceStatus::Idle;
                slot.entry.is_typing = false;
                outcome.idled.push(slot.entry.clone());
            }
        }

        self.slots.retain(|user_id, slot| match slot.offline_since {
            Some(since) if now.saturating_duration_since(since) >= eviction_grace => {
                outcome.evicted.push(user_id.clone());
                false
            }
            _ => true,
        });

        outcome.idled.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        outcome.evicted.sort();
        outcome
    }

    /// Move every known caret through `op`, which `author` just committed.
    pub fn shift_cursors(&mut self, op: &Operation, author: &str) {
        for (user_id, slot) in self.slots.iter_mut() {
            if let Some(pos) = slot.entry.cursor_position {
                // The author's caret follows its own insertion.
                let bias = if user_id == author { Bias::Right } else { Bias::Left };
                slot.entry.cursor_position = Some(op.transform_position(pos, bias));
            }
        }
    }

    /// All entries, ordered by user id.
    pub fn snapshot(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> = self.slots.values().map(|s| s.entry.clone()).collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    pub fn get(&self, user_id: &str) -> Option<&SessionEntry> {
        self.slots.get(user_id).map(|slot| &slot.entry)
    }

    pub fn session_of(&self, user_id: &str) -> Option<SessionId> {
        self.slots.get(user_id).and_then(|slot| slot.session)
    }

    /// Entries with a live session.
    pub fn connected_count(&self) -> usize {
        self.slots.values().filter(|s| s.session.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Client view
// ───────────────────────────────────────────────────────────────────

/// A client's picture of everyone else in the room.
///
/// Fed from server frames; the local user's own entry is filtered out.
/// Outgoing caret updates are throttled to one per interval (33ms by
/// default), with [`PresenceView::force_cursor_broadcast`] for the final
/// position.
#[derive(Debug)]
pub struct PresenceView {
    local_user_id: String,
    peers: HashMap<String, SessionEntry>,
    local_cursor: Option<usize>,
    last_cursor_broadcast: Option<Instant>,
    cursor_broadcast_interval: Duration,
}

impl PresenceView {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self::with_interval(local_user_id, Duration::from_millis(33))
    }

    /// Custom caret broadcast interval (for testing).
    pub fn with_interval(local_user_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            peers: HashMap::new(),
            local_cursor: None,
            last_cursor_broadcast: None,
            cursor_broadcast_interval: interval,
        }
    }

    /// Fold a server frame into the view. Returns whether anything changed.
    pub fn handle_message(&mut self, msg: &ServerMessage) -> bool {
        match msg {
            ServerMessage::Init { presence, .. } => {
                self.replace(presence);
                true
            }
            ServerMessage::PresenceUpdate { presence, full: true } => {
                self.replace(presence);
                true
            }
            ServerMessage::PresenceUpdate { presence, full: false } => {
                let mut changed = false;
                for entry in presence.iter().filter(|e| e.user_id != self.local_user_id) {
                    self.peers.insert(entry.user_id.clone(), entry.clone());
                    changed = true;
                }
                changed
            }
            ServerMessage::CursorUpdate { user_id, position } => match self.peers.get_mut(user_id) {
                Some(peer) => {
                    peer.cursor_position = *position;
                    true
                }
                None => false,
            },
            ServerMessage::TypingUpdate { user_id, is_typing } => match self.peers.get_mut(user_id) {
                Some(peer) => {
                    peer.is_typing = *is_typing;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    fn replace(&mut self, presence: &[SessionEntry]) {
        self.peers = presence
            .iter()
            .filter(|e| e.user_id != self.local_user_id)
            .map(|e| (e.user_id.clone(), e.clone()))
            .collect();
    }

    /// Keep carets attached to their text after `op` was applied locally.
    pub fn shift_cursors(&mut self, op: &Operation) {
        for peer in self.peers.values_mut() {
            if let Some(pos) = peer.cursor_position {
                peer.cursor_position = Some(op.transform_position(pos, Bias::Left));
            }
        }
        if let Some(pos) = self.local_cursor {
            self.local_cursor = Some(op.transform_position(pos, Bias::Left));
        }
    }

    /// Record the local caret; returns a frame unless throttled.
    pub fn update_local_cursor(&mut self, position: Option<usize>) -> Option<ClientMessage> {
        self.local_cursor = position;

        let throttled = self
            .last_cursor_broadcast
            .is_some_and(|at| at.elapsed() < self.cursor_broadcast_interval);
        if throttled {
            return None;
        }

        self.last_cursor_broadcast = Some(Instant::now());
        Some(ClientMessage::cursor(position))
    }

    /// Broadcast the local caret regardless of throttling.
    pub fn force_cursor_broadcast(&mut self) -> ClientMessage {
        self.last_cursor_broadcast = Some(Instant::now());
        ClientMessage::cursor(self.local_cursor)
    }

    pub fn local_cursor(&self) -> Option<usize> {
        self.local_cursor
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn peer(&self, user_id: &str) -> Option<&SessionEntry> {
        self.peers.get(user_id)
    }

    /// Peers ordered by user id.
    pub fn peers(&self) -> Vec<SessionEntry> {
        let mut peers: Vec<SessionEntry> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn typing_peers(&self) -> Vec<&str> {
        let mut typing: Vec<&str> = self
            .peers
            .values()
            .filter(|p| p.is_typing)
            .map(|p| p.user_id.as_str())
            .collect();
        typing.sort_unstable();
        typing
    }
}
