//! TuneTogether Session Coordinator Library
//!
//! Core functionality for the TuneTogether session coordinator - a stateful
//! WebSocket server for real-time music collaboration:
//!
//! - Session registry with lifetime tied to participation
//! - Per-session track editing with advisory locks
//! - Persist-first track mutations against a project document store
//! - Ephemeral transport/cursor fan-out
//! - Graceful shutdown that drains live sessions
//!
//! # Architecture
//!
//! An actor model hierarchy:
//!
//! ```text
//! CoordinatorActor (singleton per instance)
//! └── supervises N SessionActors
//!     └── SessionActor (one per live session)
//!         ├── owns participants, track cache, lock table
//!         └── supervises N ConnectionActors
//!             └── ConnectionActor (one per WebSocket connection)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One connection per session**: a user on two devices has two connections
//! - **Sessions exist iff populated**: the first join creates a session, the
//!   last leave removes it
//! - **Persist-first mutations**: the store write happens before the cache
//!   update and broadcast, so peers never see state that was not durable
//! - **Advisory locks**: lock checks gate updates, but any participant can
//!   release any lock
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with protocol error codes
//! - [`observability`] - Health probes and Prometheus metrics
//! - [`protocol`] - WebSocket wire protocol (client/server events)
//! - [`store`] - Project document persistence
//! - [`ws`] - WebSocket upgrade, authentication, and dispatch

pub mod actors;
pub mod config;
pub mod errors;
pub mod observability;
pub mod protocol;
pub mod store;
pub mod ws;
