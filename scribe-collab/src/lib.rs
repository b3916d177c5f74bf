//! # scribe-collab — Real-time collaboration layer for Scribe
//!
//! Keeps many replicas of a plain-text document converged through a
//! central revision authority, using operational transformation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Replica     │                     │ Room actor  │
//! │ (optimistic │                     │ (authority, │
//! │  + pending) │                     │  history)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames
//! - [`broadcast`] — Per-room fan-out with bounded per-session queues
//! - [`history`] — Trailing window of committed operations
//! - [`presence`] — Server roster and client view of who is where
//! - [`reconcile`] — Client replica: optimistic apply, pending queue
//! - [`authority`] — Room actor and registry
//! - [`store`] — Snapshot persistence seam
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client

pub mod protocol;
pub mod broadcast;
pub mod history;
pub mod presence;
pub mod reconcile;
pub mod store;
pub mod authority;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, ErrorCode, JoinRequest, PresenceStatus, ProtocolError, ServerMessage,
    SessionEntry,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, DetachReason, Frame, SessionId};
pub use history::{HistoryEntry, OperationHistory};
pub use presence::{color_for, PresenceRoster, PresenceView};
pub use reconcile::{OfflineQueue, Reconciled, Replica, ReplicaError, ResyncReason};
pub use store::{MemoryStore, Snapshot, SnapshotStore};
pub use authority::{
    JoinError, Room, RoomCommand, RoomConfig, RoomHandle, RoomRegistry, RoomSnapshot, SubmitError,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientConfig, ClientError, ConnectionState, SyncClient, SyncEvent};
