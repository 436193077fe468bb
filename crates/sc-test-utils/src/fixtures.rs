//! Pre-configured test data for session coordinator tests.
//!
//! Provides builders and helpers for:
//! - Project documents with collaborators and tracks
//! - Verified identities
//! - Signed (and deliberately expired) collaboration tokens

use common::auth::{CollabClaims, Identity};
use common::types::{ProjectId, UserId};

use session_coordinator::actors::{ActorMetrics, CoordinatorActorHandle};
use session_coordinator::store::memory::MemoryProjectStore;
use session_coordinator::store::{Collaborator, Project, SharedProjectStore, Track};

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use std::sync::Arc;

/// Builder for project document fixtures.
#[derive(Debug, Clone)]
pub struct ProjectBuilder {
    name: String,
    bpm: u32,
    time_signature: String,
    collaborators: Vec<Collaborator>,
    tracks: Vec<Track>,
}

impl Default for ProjectBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectBuilder {
    /// Create a builder with sensible defaults (120 bpm, 4/4, nobody).
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "Test Project".to_string(),
            bpm: 120,
            time_signature: "4/4".to_string(),
            collaborators: Vec::new(),
            tracks: Vec::new(),
        }
    }

    /// Set the project name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the tempo.
    #[must_use]
    pub fn bpm(mut self, bpm: u32) -> Self {
        self.bpm = bpm;
        self
    }

    /// Set the time signature.
    #[must_use]
    pub fn time_signature(mut self, time_signature: impl Into<String>) -> Self {
        self.time_signature = time_signature.into();
        self
    }

    /// Add a collaborator with the "editor" role.
    #[must_use]
    pub fn collaborator(mut self, user_id: UserId) -> Self {
        self.collaborators.push(Collaborator {
            user_id,
            role: "editor".to_string(),
            last_active: None,
        });
        self
    }

    /// Add a pre-existing track created by the first collaborator.
    #[must_use]
    pub fn track(mut self, name: impl Into<String>, instrument: impl Into<String>) -> Self {
        let created_by = self
            .collaborators
            .first()
            .map_or_else(UserId::new, |c| c.user_id);
        let track_order = u32::try_from(self.tracks.len()).unwrap_or(u32::MAX);
        self.tracks.push(Track::new(
            name.into(),
            instrument.into(),
            String::new(),
            created_by,
            track_order,
        ));
        self
    }

    /// Build the project document with a fresh id.
    #[must_use]
    pub fn build(self) -> Project {
        Project {
            id: ProjectId::new(),
            name: self.name,
            bpm: self.bpm,
            time_signature: self.time_signature,
            collaborators: self.collaborators,
            tracks: self.tracks,
        }
    }
}

/// Create a fresh identity with a random user id.
#[must_use]
pub fn test_identity(name: &str) -> Identity {
    Identity {
        user_id: UserId::new(),
        display_name: name.to_string(),
    }
}

/// Spawn a coordinator over an in-memory store seeded with one project.
///
/// Returns the store too so tests can inspect persisted state or inject
/// write failures.
#[must_use]
pub fn coordinator_with_project(
    project: &Project,
) -> (CoordinatorActorHandle, Arc<MemoryProjectStore>) {
    let store = Arc::new(MemoryProjectStore::new());
    store.insert_project(project.clone());

    let coordinator = CoordinatorActorHandle::new(
        Arc::clone(&store) as SharedProjectStore,
        ActorMetrics::new(),
    );

    (coordinator, store)
}

/// Mint a valid HS256 collaboration token for an identity.
///
/// # Panics
///
/// Panics on encoding failure; this is a test helper.
#[must_use]
pub fn mint_token(secret: &str, identity: &Identity) -> String {
    token_with_expiry(secret, identity, Utc::now().timestamp() + 3600)
}

/// Mint a token that expired an hour ago (beyond any skew allowance).
///
/// # Panics
///
/// Panics on encoding failure; this is a test helper.
#[must_use]
pub fn expired_token(secret: &str, identity: &Identity) -> String {
    token_with_expiry(secret, identity, Utc::now().timestamp() - 3600)
}

fn token_with_expiry(secret: &str, identity: &Identity, exp: i64) -> String {
    let claims = CollabClaims {
        sub: identity.user_id.to_string(),
        name: identity.display_name.clone(),
        exp,
        iat: Utc::now().timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encoding should not fail in tests")
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::auth::Authenticator;
    use common::secret::SecretString;

    #[test]
    fn test_project_builder_defaults() {
        let alice = test_identity("Alice");
        let project = ProjectBuilder::new()
            .collaborator(alice.user_id)
            .track("Drums", "drums")
            .build();

        assert_eq!(project.bpm, 120);
        assert_eq!(project.time_signature, "4/4");
        assert!(project.is_collaborator(alice.user_id));
        assert_eq!(project.tracks.len(), 1);
        assert_eq!(project.tracks[0].created_by, alice.user_id);
    }

    #[test]
    fn test_minted_token_verifies() {
        let secret = "test-secret-for-fixtures";
        let alice = test_identity("Alice");

        let authenticator = Authenticator::new(&SecretString::from(secret.to_string()));
        let verified = authenticator
            .verify(&mint_token(secret, &alice))
            .expect("minted token should verify");

        assert_eq!(verified, alice);
    }

    #[test]
    fn test_expired_token_rejected() {
        let secret = "test-secret-for-fixtures";
        let alice = test_identity("Alice");

        let authenticator = Authenticator::new(&SecretString::from(secret.to_string()));
        assert!(authenticator.verify(&expired_token(secret, &alice)).is_err());
    }
}
