//! Actor system for the session coordinator.
//!
//! Three actor types, arranged as a supervision tree:
//!
//! - [`coordinator::CoordinatorActor`]: singleton session registry
//! - [`session::SessionActor`]: one per live session, owns all session state
//! - [`connection::ConnectionActor`]: one per WebSocket connection
//!
//! Each actor owns its state exclusively and communicates through
//! message-passing channels. Cancellation tokens form a parent/child
//! tree so cancelling the coordinator tears down everything beneath it.

pub mod connection;
pub mod coordinator;
pub mod messages;
pub mod metrics;
pub mod session;

pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use coordinator::CoordinatorActorHandle;
pub use messages::{CoordinatorStatus, JoinAck, ProjectUpdateNotice, SessionState};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use session::{SessionActor, SessionActorHandle};
