//! # isoedit-collab
//!
//! Real-time collaboration layer for isoedit maps.
//!
//! Connects replicas of an asset map through a websocket relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RoomHandle  │ ◄─────────────────► │ RelayServer │
//! │ (per user)  │     JSON frames     │ (per room)  │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ MapDocument │                     │ReplicaState │
//! │ + presence  │                     │ (op log)    │
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
//! - [`protocol`]: JSON wire protocol (`op`, `presence`, `sync-request`, `sync-response`)
//! - [`presence`]: Heartbeat presence with local expiry
//! - [`broadcast`]: Room fan-out with backpressure
//! - [`server`]: WebSocket relay
//! - [`client`]: Connection task with reconnection and outbox
//! - [`session`]: Room handle: local edits, undo, subscriptions

pub mod protocol;
pub mod presence;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod session;

// Re-exports for convenience
pub use protocol::{OpKind, OpMessage, PresenceMessage, ProtocolError, WireMessage};
pub use presence::{PeerProfile, PresenceChannel, PresenceConfig, PresenceEntry, PresenceSnapshot};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, RelayFrame};
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use client::{ConnectionState, Outbox, SyncClient};
pub use session::{RoomHandle, SessionConfig, SessionError};
