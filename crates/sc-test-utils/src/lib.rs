//! # Session Coordinator Test Utilities
//!
//! Shared test utilities for the TuneTogether session coordinator.
//!
//! Provides fixtures and a test client harness for exercising the actor
//! system without a real WebSocket transport:
//!
//! - `fixtures` - Project builders, identities, and token minting
//! - `client` - [`TestClient`], a participant harness that joins through
//!   the coordinator and exposes its event stream
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let alice = test_identity("Alice");
//!     let project = ProjectBuilder::new()
//!         .collaborator(alice.user_id)
//!         .build();
//!
//!     let (coordinator, _store) = coordinator_with_project(&project);
//!     let mut client = TestClient::join(&coordinator, "jam-night", project.id, alice)
//!         .await
//!         .unwrap();
//!
//!     // Drive the session through the client...
//! }
//! ```

pub mod client;
pub mod fixtures;

pub use client::TestClient;
pub use fixtures::{
    coordinator_with_project, expired_token, mint_token, test_identity, ProjectBuilder,
};
