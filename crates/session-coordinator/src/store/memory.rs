//! In-memory project store for tests and local development.

use super::{Project, ProjectStore, StoreError, Track, TrackUpdate};

use common::types::{ProjectId, TrackId, UserId};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-memory [`ProjectStore`] backed by a `HashMap`.
///
/// Supports write-failure injection so tests can exercise the
/// persist-then-broadcast error paths without a real backend.
///
/// The lock is a sync `RwLock`: no await happens while it is held, and
/// keeping the helpers synchronous lets test setup seed projects without
/// an executor.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: RwLock<HashMap<ProjectId, Project>>,
    fail_writes: AtomicBool,
}

impl MemoryProjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a project document.
    pub fn insert_project(&self, project: Project) {
        self.write().insert(project.id, project);
    }

    /// Read back a project document, if present.
    ///
    /// Test helper for asserting on persisted state.
    #[must_use]
    pub fn project(&self, project_id: ProjectId) -> Option<Project> {
        self.read().get(&project_id).cloned()
    }

    /// Make all subsequent writes fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ProjectId, Project>> {
        self.projects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ProjectId, Project>> {
        self.projects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn load_project(&self, project_id: ProjectId) -> Result<Project, StoreError> {
        self.read()
            .get(&project_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn append_track(&self, project_id: ProjectId, track: Track) -> Result<(), StoreError> {
        self.check_writable()?;

        let mut projects = self.write();
        let project = projects.get_mut(&project_id).ok_or(StoreError::NotFound)?;
        project.append_track(track);
        Ok(())
    }

    async fn update_track(
        &self,
        project_id: ProjectId,
        track_id: TrackId,
        updates: &TrackUpdate,
    ) -> Result<(), StoreError> {
        self.check_writable()?;

        let mut projects = self.write();
        let project = projects.get_mut(&project_id).ok_or(StoreError::NotFound)?;
        if project.update_track(track_id, updates) {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn remove_track(
        &self,
        project_id: ProjectId,
        track_id: TrackId,
    ) -> Result<(), StoreError> {
        self.check_writable()?;

        let mut projects = self.write();
        let project = projects.get_mut(&project_id).ok_or(StoreError::NotFound)?;
        if project.remove_track(track_id) {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn touch_collaborator(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        self.check_writable()?;

        let mut projects = self.write();
        let project = projects.get_mut(&project_id).ok_or(StoreError::NotFound)?;
        if project.touch_collaborator(user_id, chrono::Utc::now()) {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::store::Collaborator;

    fn sample_project(owner: UserId) -> Project {
        Project {
            id: ProjectId::new(),
            name: "Loop Station".to_string(),
            bpm: 90,
            time_signature: "3/4".to_string(),
            collaborators: vec![Collaborator {
                user_id: owner,
                role: "owner".to_string(),
                last_active: None,
            }],
            tracks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_load_missing_project() {
        let store = MemoryProjectStore::new();
        let result = store.load_project(ProjectId::new()).await;
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_append_and_update_track() {
        let store = MemoryProjectStore::new();
        let owner = UserId::new();
        let project = sample_project(owner);
        let project_id = project.id;
        store.insert_project(project);

        let track = Track::new(
            "Keys".to_string(),
            "piano".to_string(),
            String::new(),
            owner,
            0,
        );
        let track_id = track.id;
        store.append_track(project_id, track).await.unwrap();

        let updates = TrackUpdate {
            volume: Some(0.4),
            ..TrackUpdate::default()
        };
        store
            .update_track(project_id, track_id, &updates)
            .await
            .unwrap();

        let stored = store.project(project_id).unwrap();
        assert_eq!(stored.tracks.len(), 1);
        assert_eq!(stored.tracks[0].volume, 0.4);
    }

    #[tokio::test]
    async fn test_update_missing_track() {
        let store = MemoryProjectStore::new();
        let project = sample_project(UserId::new());
        let project_id = project.id;
        store.insert_project(project);

        let result = store
            .update_track(project_id, TrackId::new(), &TrackUpdate::default())
            .await;
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_remove_track() {
        let store = MemoryProjectStore::new();
        let owner = UserId::new();
        let project = sample_project(owner);
        let project_id = project.id;
        store.insert_project(project);

        let track = Track::new(
            "FX".to_string(),
            "sampler".to_string(),
            String::new(),
            owner,
            0,
        );
        let track_id = track.id;
        store.append_track(project_id, track).await.unwrap();

        store.remove_track(project_id, track_id).await.unwrap();
        assert!(store.project(project_id).unwrap().tracks.is_empty());

        let result = store.remove_track(project_id, track_id).await;
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_write_failure_injection() {
        let store = MemoryProjectStore::new();
        let owner = UserId::new();
        let project = sample_project(owner);
        let project_id = project.id;
        store.insert_project(project);

        store.set_fail_writes(true);

        let track = Track::new(
            "Vox".to_string(),
            "vocals".to_string(),
            String::new(),
            owner,
            0,
        );
        let result = store.append_track(project_id, track).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));

        // Reads still work while writes are failing
        assert!(store.load_project(project_id).await.is_ok());

        store.set_fail_writes(false);
        let track = Track::new(
            "Vox".to_string(),
            "vocals".to_string(),
            String::new(),
            owner,
            0,
        );
        assert!(store.append_track(project_id, track).await.is_ok());
    }

    #[tokio::test]
    async fn test_touch_collaborator() {
        let store = MemoryProjectStore::new();
        let owner = UserId::new();
        let project = sample_project(owner);
        let project_id = project.id;
        store.insert_project(project);

        store.touch_collaborator(project_id, owner).await.unwrap();
        let stored = store.project(project_id).unwrap();
        assert!(stored.collaborators[0].last_active.is_some());

        let result = store.touch_collaborator(project_id, UserId::new()).await;
        assert!(matches!(result, Err(StoreError::NotFound)));
    }
}
