//! # Game Client Library
//!
//! Client-side state for a connection to the worker cluster. Rendering and
//! gameplay live elsewhere; this crate keeps the view of shared entities
//! consistent with the server.
//!
//! ## Snapshot Reconciliation
//!
//! A client that (re)connects receives a `snapshot-load` with the complete
//! world and the revision it was taken at. Positional and animation updates
//! may reach the client before that snapshot. The [`reconciler`] buffers them
//! until the snapshot lands, drops those already folded into it, and replays
//! the rest in revision order. After that, updates apply as they arrive.
//!
//! ## Module Organization
//!
//! - [`entity_cache`]: the live entities, keyed by session id
//! - [`reconciler`]: the `AwaitingSnapshot → Reconciling → Live` state machine
//! - [`session`]: one connection's cache and reconciler, fed packet by packet
//! - [`network`]: TCP connection, reconnects with a fresh session, optional bot input
//!
//! ## Usage Example
//!
//! ```rust
//! use client::session::Session;
//! use shared::{EntitySnapshot, Packet};
//!
//! let mut session = Session::new(None);
//!
//! // An update that raced the snapshot is held back...
//! session.handle_packet(Packet::PositionUpdate {
//!     entity_id: 1, x: 20.0, y: 20.0, revision: Some(7),
//! }).unwrap();
//!
//! // ...and replayed on top of it because 7 > 5.
//! session.handle_packet(Packet::SnapshotLoad {
//!     entities: vec![EntitySnapshot::new(1, "ada", 10.0, 10.0)],
//!     snapshot_revision: Some(5),
//! }).unwrap();
//!
//! assert_eq!(session.cache().get(1).unwrap().x, 20.0);
//! ```

pub mod entity_cache;
pub mod network;
pub mod reconciler;
pub mod session;
