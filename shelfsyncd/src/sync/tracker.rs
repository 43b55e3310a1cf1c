use std::path::{Path, PathBuf};
use std::{fmt, fs};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use time::OffsetDateTime;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid entity type: {0}")]
    InvalidEntityType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Correspondent,
    Tag,
    Document,
}

impl EntityType {
    fn as_str(&self) -> &'static str {
        match self {
            EntityType::Correspondent => "correspondent",
            EntityType::Tag => "tag",
            EntityType::Document => "document",
        }
    }

    fn parse(value: &str) -> Result<Self, TrackerError> {
        match value {
            "correspondent" => Ok(EntityType::Correspondent),
            "tag" => Ok(EntityType::Tag),
            "document" => Ok(EntityType::Document),
            other => Err(TrackerError::InvalidEntityType(other.to_string())),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-synchronized state of one source record. Entries survive
/// archiving so a reappearing record is treated as an update, never a
/// duplicate create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedState {
    pub entity: EntityType,
    pub source_id: i64,
    pub marker: String,
    pub content_marker: Option<String>,
    pub target_id: String,
    pub archived: bool,
    pub synced_at: Option<i64>,
}

pub struct TrackerStore {
    pool: SqlitePool,
}

impl TrackerStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, TrackerError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, TrackerError> {
        let path = default_db_path()?;
        Self::open(&path).await
    }

    pub async fn init(&self) -> Result<(), TrackerError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get(
        &self,
        entity: EntityType,
        source_id: i64,
    ) -> Result<Option<TrackedState>, TrackerError> {
        let row = sqlx::query(
            "SELECT entity_type, source_id, marker, content_marker, target_id, archived, synced_at
             FROM tracked_state
             WHERE entity_type = ?1 AND source_id = ?2",
        )
        .bind(entity.as_str())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let entity_type: String = row.try_get("entity_type")?;
        let archived: i64 = row.try_get("archived")?;
        Ok(Some(TrackedState {
            entity: EntityType::parse(&entity_type)?,
            source_id: row.try_get("source_id")?,
            marker: row.try_get("marker")?,
            content_marker: row.try_get("content_marker")?,
            target_id: row.try_get("target_id")?,
            archived: archived != 0,
            synced_at: row.try_get("synced_at")?,
        }))
    }

    /// Upserts the tracked state after a successful target write. A record
    /// that was archived becomes active again.
    pub async fn put(
        &self,
        entity: EntityType,
        source_id: i64,
        marker: &str,
        content_marker: Option<&str>,
        target_id: &str,
    ) -> Result<(), TrackerError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            "INSERT INTO tracked_state (entity_type, source_id, marker, content_marker, target_id, archived, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
             ON CONFLICT(entity_type, source_id) DO UPDATE SET
                marker = excluded.marker,
                content_marker = excluded.content_marker,
                target_id = excluded.target_id,
                archived = 0,
                synced_at = excluded.synced_at;",
        )
        .bind(entity.as_str())
        .bind(source_id)
        .bind(marker)
        .bind(content_marker)
        .bind(target_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flips the archived flag. The entry itself is never deleted.
    pub async fn set_archived(
        &self,
        entity: EntityType,
        source_id: i64,
        archived: bool,
    ) -> Result<(), TrackerError> {
        sqlx::query(
            "UPDATE tracked_state SET archived = ?1 WHERE entity_type = ?2 AND source_id = ?3",
        )
        .bind(if archived { 1 } else { 0 })
        .bind(entity.as_str())
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All source ids ever tracked for an entity type, archived included.
    pub async fn source_ids(&self, entity: EntityType) -> Result<Vec<i64>, TrackerError> {
        let rows = sqlx::query(
            "SELECT source_id FROM tracked_state WHERE entity_type = ?1 ORDER BY source_id ASC",
        )
        .bind(entity.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("source_id").map_err(TrackerError::from))
            .collect()
    }
}

fn default_db_path() -> Result<PathBuf, TrackerError> {
    let mut path = dirs::data_dir().ok_or(TrackerError::MissingDataDir)?;
    path.push("shelfsync");
    path.push("tracker.db");
    Ok(path)
}
