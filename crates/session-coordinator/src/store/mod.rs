//! Project persistence layer.
//!
//! The coordinator treats each project as one document: metadata plus an
//! embedded array of tracks and a collaborator list. [`ProjectStore`] is the
//! seam between the actor system and the backing storage; sessions only ever
//! touch it through a `dyn` handle so tests can swap in the in-memory store.
//!
//! Two implementations are provided:
//! - [`memory::MemoryProjectStore`]: tests and local development
//! - [`sqlite::SqliteProjectStore`]: production, one JSON document per row

pub mod memory;
pub mod sqlite;

use common::types::{ProjectId, TrackId, UserId};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Default volume for newly created tracks.
pub const DEFAULT_TRACK_VOLUME: f32 = 0.8;

/// Shared trait-object handle to a project store.
pub type SharedProjectStore = Arc<dyn ProjectStore>;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed project or track does not exist.
    #[error("not found")]
    NotFound,

    /// Backend failure (I/O, serialization, connection).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A user with access to a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    /// User identifier.
    pub user_id: UserId,
    /// Role within the project (e.g. "owner", "editor").
    pub role: String,
    /// Last time this collaborator touched the project.
    pub last_active: Option<DateTime<Utc>>,
}

/// One track embedded in a project document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Track identifier, generated by the coordinator at creation.
    pub id: TrackId,
    /// Track name.
    pub name: String,
    /// Instrument label (free-form, e.g. "drums").
    pub instrument: String,
    /// Note/pattern payload, opaque to the coordinator.
    pub notes: String,
    /// User who created the track.
    pub created_by: UserId,
    /// Mix volume in `[0.0, 1.0]`.
    pub volume: f32,
    /// Stereo pan in `[-1.0, 1.0]`.
    pub pan: f32,
    /// Muted in the mix.
    pub muted: bool,
    /// Soloed in the mix.
    pub solo: bool,
    /// Position in the project's track list.
    pub track_order: u32,
}

impl Track {
    /// Create a new track with default mix settings.
    #[must_use]
    pub fn new(
        name: String,
        instrument: String,
        notes: String,
        created_by: UserId,
        track_order: u32,
    ) -> Self {
        Self {
            id: TrackId::new(),
            name,
            instrument,
            notes,
            created_by,
            volume: DEFAULT_TRACK_VOLUME,
            pan: 0.0,
            muted: false,
            solo: false,
            track_order,
        }
    }
}

/// Partial update to a track.
///
/// This is a closed field set: every updatable track field appears here as
/// an `Option`, and unknown fields in the incoming payload are rejected at
/// deserialization time rather than silently dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TrackUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pan: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solo: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_order: Option<u32>,
}

impl TrackUpdate {
    /// True when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge the set fields into `track`, leaving the rest untouched.
    pub fn apply_to(&self, track: &mut Track) {
        if let Some(name) = &self.name {
            track.name = name.clone();
        }
        if let Some(instrument) = &self.instrument {
            track.instrument = instrument.clone();
        }
        if let Some(notes) = &self.notes {
            track.notes = notes.clone();
        }
        if let Some(volume) = self.volume {
            track.volume = volume;
        }
        if let Some(pan) = self.pan {
            track.pan = pan;
        }
        if let Some(muted) = self.muted {
            track.muted = muted;
        }
        if let Some(solo) = self.solo {
            track.solo = solo;
        }
        if let Some(track_order) = self.track_order {
            track.track_order = track_order;
        }
    }
}

/// A project document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Project identifier.
    pub id: ProjectId,
    /// Project name.
    pub name: String,
    /// Tempo in beats per minute.
    pub bpm: u32,
    /// Time signature (e.g. "4/4").
    pub time_signature: String,
    /// Users with access to this project.
    pub collaborators: Vec<Collaborator>,
    /// Tracks, ordered by `track_order`.
    pub tracks: Vec<Track>,
}

impl Project {
    /// Check whether `user_id` is a collaborator on this project.
    #[must_use]
    pub fn is_collaborator(&self, user_id: UserId) -> bool {
        self.collaborators.iter().any(|c| c.user_id == user_id)
    }

    /// Append a track to the document.
    pub fn append_track(&mut self, track: Track) {
        self.tracks.push(track);
    }

    /// Merge `updates` into the track with the given id.
    ///
    /// Returns false if no such track exists.
    pub fn update_track(&mut self, track_id: TrackId, updates: &TrackUpdate) -> bool {
        match self.tracks.iter_mut().find(|t| t.id == track_id) {
            Some(track) => {
                updates.apply_to(track);
                true
            }
            None => false,
        }
    }

    /// Remove the track with the given id.
    ///
    /// Returns false if no such track exists.
    pub fn remove_track(&mut self, track_id: TrackId) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|t| t.id != track_id);
        self.tracks.len() != before
    }

    /// Set `last_active` on the given collaborator.
    ///
    /// Returns false if the user is not a collaborator.
    pub fn touch_collaborator(&mut self, user_id: UserId, at: DateTime<Utc>) -> bool {
        match self.collaborators.iter_mut().find(|c| c.user_id == user_id) {
            Some(collaborator) => {
                collaborator.last_active = Some(at);
                true
            }
            None => false,
        }
    }
}

/// Persistence operations needed by the session actors.
///
/// All mutations address one project document and are applied
/// read-modify-write by the backend.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Load a full project document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the project does not exist.
    async fn load_project(&self, project_id: ProjectId) -> Result<Project, StoreError>;

    /// Append a track to a project document.
    async fn append_track(&self, project_id: ProjectId, track: Track) -> Result<(), StoreError>;

    /// Apply a partial update to one track in a project document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the project or track does not exist.
    async fn update_track(
        &self,
        project_id: ProjectId,
        track_id: TrackId,
        updates: &TrackUpdate,
    ) -> Result<(), StoreError>;

    /// Remove a track from a project document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the project or track does not exist.
    async fn remove_track(&self, project_id: ProjectId, track_id: TrackId)
        -> Result<(), StoreError>;

    /// Record collaborator activity (`last_active` timestamp).
    ///
    /// Best-effort from the caller's point of view; sessions log and
    /// continue when this fails.
    async fn touch_collaborator(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> Result<(), StoreError>;
}
