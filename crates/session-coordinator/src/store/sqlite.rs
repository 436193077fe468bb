//! SQLite-backed project store.
//!
//! Each project is stored as one JSON document in a single table. Mutations
//! are read-modify-write inside a transaction, reusing the same document
//! mutation helpers as the in-memory store.

use super::{Project, ProjectStore, StoreError, Track, TrackUpdate};

use common::types::{ProjectId, TrackId, UserId};

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

/// SQLite [`ProjectStore`].
#[derive(Debug, Clone)]
pub struct SqliteProjectStore {
    pool: SqlitePool,
}

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SqliteProjectStore {
    /// Connect to the database and create the schema if needed.
    ///
    /// SQLite allows a single writer at a time; one pooled connection keeps
    /// every read-modify-write cycle serialized at the database level too.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(backend_err)?;

        sqlx::query("CREATE TABLE IF NOT EXISTS projects (id TEXT PRIMARY KEY, doc TEXT NOT NULL)")
            .execute(&pool)
            .await
            .map_err(backend_err)?;

        Ok(Self { pool })
    }

    /// Insert or replace a full project document.
    pub async fn upsert_project(&self, project: &Project) -> Result<(), StoreError> {
        let doc = serde_json::to_string(project).map_err(backend_err)?;

        sqlx::query("INSERT OR REPLACE INTO projects (id, doc) VALUES (?, ?)")
            .bind(project.id.to_string())
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(())
    }

    /// Read-modify-write one project document in a transaction.
    ///
    /// The mutation closure returns false when its target (a track or a
    /// collaborator) is missing, which maps to [`StoreError::NotFound`]
    /// and rolls the transaction back.
    async fn mutate<F>(&self, project_id: ProjectId, mutation: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Project) -> bool,
    {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let row = sqlx::query("SELECT doc FROM projects WHERE id = ?")
            .bind(project_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend_err)?
            .ok_or(StoreError::NotFound)?;

        let doc: String = row.try_get("doc").map_err(backend_err)?;
        let mut project: Project = serde_json::from_str(&doc).map_err(backend_err)?;

        if !mutation(&mut project) {
            return Err(StoreError::NotFound);
        }

        let doc = serde_json::to_string(&project).map_err(backend_err)?;
        sqlx::query("UPDATE projects SET doc = ? WHERE id = ?")
            .bind(doc)
            .bind(project_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)
    }
}

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    async fn load_project(&self, project_id: ProjectId) -> Result<Project, StoreError> {
        let row = sqlx::query("SELECT doc FROM projects WHERE id = ?")
            .bind(project_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?
            .ok_or(StoreError::NotFound)?;

        let doc: String = row.try_get("doc").map_err(backend_err)?;
        serde_json::from_str(&doc).map_err(backend_err)
    }

    async fn append_track(&self, project_id: ProjectId, track: Track) -> Result<(), StoreError> {
        self.mutate(project_id, |project| {
            project.append_track(track);
            true
        })
        .await
    }

    async fn update_track(
        &self,
        project_id: ProjectId,
        track_id: TrackId,
        updates: &TrackUpdate,
    ) -> Result<(), StoreError> {
        self.mutate(project_id, |project| project.update_track(track_id, updates))
            .await
    }

    async fn remove_track(
        &self,
        project_id: ProjectId,
        track_id: TrackId,
    ) -> Result<(), StoreError> {
        self.mutate(project_id, |project| project.remove_track(track_id))
            .await
    }

    async fn touch_collaborator(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        self.mutate(project_id, |project| {
            project.touch_collaborator(user_id, chrono::Utc::now())
        })
        .await
    }
}
