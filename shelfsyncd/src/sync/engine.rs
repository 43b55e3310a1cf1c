use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{StreamExt, stream};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use shelfsync_core::{DmsClient, DmsError, Document, WorkspaceClient, WorkspaceError};

use super::mapping::{self, MapError, ReferenceRecord, ResolvedRefs};
use super::tracker::{EntityType, TrackerError, TrackerStore};

const LISTING_ATTEMPTS: u32 = 3;
const LISTING_BACKOFF_BASE: Duration = Duration::from_millis(500);
const LISTING_BACKOFF_MAX: Duration = Duration::from_secs(8);

/// The three target databases, one per entity type.
#[derive(Debug, Clone)]
pub struct DatabaseIds {
    pub documents: String,
    pub tags: String,
    pub correspondents: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub created: usize,
    pub updated: usize,
    pub archived: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl CycleStats {
    /// Number of target writes the cycle issued.
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.archived
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("source api error: {0}")]
    Source(#[from] DmsError),
    #[error("target api error: {0}")]
    Target(#[from] WorkspaceError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("{entity} {source_id} has no synced target page yet")]
    Unresolved {
        entity: EntityType,
        source_id: i64,
    },
}

/// Reconciles one system's records against the other: for every source
/// record it decides between create, update and no-op, and archives
/// target pages whose source record disappeared. Holds no in-memory
/// state between cycles beyond what the tracker persists.
pub struct SyncEngine {
    source: DmsClient,
    target: WorkspaceClient,
    tracker: TrackerStore,
    databases: DatabaseIds,
    concurrency: usize,
}

impl SyncEngine {
    pub fn new(
        source: DmsClient,
        target: WorkspaceClient,
        tracker: TrackerStore,
        databases: DatabaseIds,
    ) -> Self {
        Self {
            source,
            target,
            tracker,
            databases,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Runs one full reconciliation cycle. Entity types are processed in
    /// dependency order because document relations can only point at
    /// correspondent and tag pages that already exist. The stop flag is
    /// honored between entity types so in-flight writes always complete.
    ///
    /// Only tracker storage failures abort the cycle; anything else is
    /// contained to the record or entity type it occurred in.
    pub async fn run_cycle(&self, stop: &AtomicBool) -> Result<CycleStats, TrackerError> {
        let mut stats = CycleStats::default();

        if let Some(items) = self
            .fetch_listing(EntityType::Correspondent, || {
                self.source.list_correspondents()
            })
            .await
        {
            self.sync_references(&items, &self.databases.correspondents, &mut stats)
                .await?;
        }
        if stop.load(Ordering::SeqCst) {
            info!("stop requested, ending cycle after correspondents");
            return Ok(stats);
        }

        if let Some(items) = self
            .fetch_listing(EntityType::Tag, || self.source.list_tags())
            .await
        {
            self.sync_references(&items, &self.databases.tags, &mut stats)
                .await?;
        }
        if stop.load(Ordering::SeqCst) {
            info!("stop requested, ending cycle after tags");
            return Ok(stats);
        }

        if let Some(documents) = self
            .fetch_listing(EntityType::Document, || self.source.list_documents())
            .await
        {
            self.sync_documents(&documents, &mut stats).await?;
            self.archive_disappeared(&documents, &mut stats).await?;
        }

        Ok(stats)
    }

    /// Fetches a full listing, retrying it whole: a listing that failed
    /// partway is not resumable without a cursor. When retries are
    /// exhausted the entity type is skipped for this cycle, including its
    /// disappearance scan, since an incomplete listing cannot distinguish
    /// deleted records from unlisted ones.
    async fn fetch_listing<T, F, Fut>(&self, entity: EntityType, fetch: F) -> Option<Vec<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Vec<T>, DmsError>>,
    {
        let mut attempt = 0u32;
        loop {
            match fetch().await {
                Ok(items) => return Some(items),
                Err(err) if err.is_retryable() && attempt + 1 < LISTING_ATTEMPTS => {
                    warn!(entity = %entity, attempt, error = %err, "listing failed, retrying");
                    tokio::time::sleep(listing_retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(entity = %entity, error = %err, "listing failed, entity type skipped this cycle");
                    return None;
                }
            }
        }
    }

    async fn sync_references<T: ReferenceRecord>(
        &self,
        items: &[T],
        database_id: &str,
        stats: &mut CycleStats,
    ) -> Result<(), TrackerError> {
        for item in items {
            match self.sync_reference(item, database_id).await {
                Ok(outcome) => stats.record(outcome),
                Err(RecordError::Tracker(err)) => return Err(err),
                Err(err) => {
                    warn!(
                        entity = %T::ENTITY,
                        source_id = item.source_id(),
                        error = %err,
                        "record sync failed, will retry next cycle"
                    );
                    stats.failed += 1;
                }
            }
        }

        // Disappeared tags and correspondents are never archived: existing
        // documents may still reference their pages.
        let seen: HashSet<i64> = items.iter().map(ReferenceRecord::source_id).collect();
        for source_id in self.tracker.source_ids(T::ENTITY).await? {
            if !seen.contains(&source_id) {
                debug!(entity = %T::ENTITY, source_id, "tracked record missing from source listing");
            }
        }
        Ok(())
    }

    async fn sync_reference<T: ReferenceRecord>(
        &self,
        item: &T,
        database_id: &str,
    ) -> Result<Outcome, RecordError> {
        let marker = item.marker();
        match self.tracker.get(T::ENTITY, item.source_id()).await? {
            Some(state) if state.marker == marker && !state.archived => Ok(Outcome::Unchanged),
            Some(state) => {
                let properties = item.properties()?;
                self.target.update_page(&state.target_id, properties).await?;
                self.tracker
                    .put(T::ENTITY, item.source_id(), &marker, None, &state.target_id)
                    .await?;
                info!(entity = %T::ENTITY, source_id = item.source_id(), page = %state.target_id, "updated page");
                Ok(Outcome::Updated)
            }
            None => {
                let properties = item.properties()?;
                // A crash between a create and the tracker write leaves the
                // page untracked; re-querying by source id avoids creating a
                // duplicate in that case.
                if let Some(existing) = self
                    .target
                    .find_page_by_source_id(database_id, item.source_id())
                    .await?
                {
                    self.target.update_page(&existing, properties).await?;
                    self.tracker
                        .put(T::ENTITY, item.source_id(), &marker, None, &existing)
                        .await?;
                    info!(entity = %T::ENTITY, source_id = item.source_id(), page = %existing, "adopted existing page");
                    return Ok(Outcome::Updated);
                }
                let page_id = self.target.create_page(database_id, properties).await?;
                self.tracker
                    .put(T::ENTITY, item.source_id(), &marker, None, &page_id)
                    .await?;
                info!(entity = %T::ENTITY, source_id = item.source_id(), page = %page_id, "created page");
                Ok(Outcome::Created)
            }
        }
    }

    async fn sync_documents(
        &self,
        documents: &[Document],
        stats: &mut CycleStats,
    ) -> Result<(), TrackerError> {
        let futures: Vec<_> = documents
            .iter()
            .map(|doc| async move { (doc.id, self.sync_document(doc).await) })
            .collect();
        let results: Vec<(i64, Result<Outcome, RecordError>)> = stream::iter(futures)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (source_id, result) in results {
            match result {
                Ok(outcome) => stats.record(outcome),
                Err(RecordError::Tracker(err)) => return Err(err),
                Err(RecordError::Unresolved {
                    entity,
                    source_id: missing_id,
                }) => {
                    warn!(
                        entity = %EntityType::Document,
                        source_id,
                        missing_entity = %entity,
                        missing_id,
                        "referenced record not synced yet, document skipped this cycle"
                    );
                    stats.skipped += 1;
                }
                Err(err) => {
                    warn!(
                        entity = %EntityType::Document,
                        source_id,
                        error = %err,
                        "record sync failed, will retry next cycle"
                    );
                    stats.failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn sync_document(&self, doc: &Document) -> Result<Outcome, RecordError> {
        let marker = doc.modified.as_str();
        let content_marker = doc.checksum.as_deref();
        match self.tracker.get(EntityType::Document, doc.id).await? {
            Some(state) => {
                let metadata_changed = state.marker != marker;
                // When the source reports no checksum the file conservatively
                // follows the metadata marker.
                let file_changed = match content_marker {
                    Some(checksum) => state.content_marker.as_deref() != Some(checksum),
                    None => metadata_changed,
                };
                if !metadata_changed && !file_changed && !state.archived {
                    return Ok(Outcome::Unchanged);
                }

                if metadata_changed || state.archived {
                    let refs = self.resolve_refs(doc).await?;
                    let properties = mapping::document_properties(doc, &refs)?;
                    self.target.update_page(&state.target_id, properties).await?;
                }
                if state.archived {
                    self.target.set_archived(&state.target_id, false).await?;
                    info!(entity = %EntityType::Document, source_id = doc.id, page = %state.target_id, "reactivated archived page");
                }
                if file_changed {
                    self.upload_file(doc, &state.target_id).await?;
                }
                self.tracker
                    .put(
                        EntityType::Document,
                        doc.id,
                        marker,
                        content_marker,
                        &state.target_id,
                    )
                    .await?;
                info!(entity = %EntityType::Document, source_id = doc.id, page = %state.target_id, "updated page");
                Ok(Outcome::Updated)
            }
            None => {
                let refs = self.resolve_refs(doc).await?;
                let properties = mapping::document_properties(doc, &refs)?;
                if let Some(existing) = self
                    .target
                    .find_page_by_source_id(&self.databases.documents, doc.id)
                    .await?
                {
                    self.target.update_page(&existing, properties).await?;
                    self.upload_file(doc, &existing).await?;
                    self.tracker
                        .put(EntityType::Document, doc.id, marker, content_marker, &existing)
                        .await?;
                    info!(entity = %EntityType::Document, source_id = doc.id, page = %existing, "adopted existing page");
                    return Ok(Outcome::Updated);
                }
                let page_id = self
                    .target
                    .create_page(&self.databases.documents, properties)
                    .await?;
                self.upload_file(doc, &page_id).await?;
                self.tracker
                    .put(EntityType::Document, doc.id, marker, content_marker, &page_id)
                    .await?;
                info!(entity = %EntityType::Document, source_id = doc.id, page = %page_id, "created page");
                Ok(Outcome::Created)
            }
        }
    }

    /// Maps a document's correspondent/tag source ids to target page ids.
    /// A reference without tracked state means the dependency failed or
    /// was skipped earlier this cycle; the document waits for the next one.
    async fn resolve_refs(&self, doc: &Document) -> Result<ResolvedRefs, RecordError> {
        let correspondent = match doc.correspondent {
            Some(id) => Some(self.resolve_target_id(EntityType::Correspondent, id).await?),
            None => None,
        };
        let mut tags = Vec::with_capacity(doc.tags.len());
        for id in &doc.tags {
            tags.push(self.resolve_target_id(EntityType::Tag, *id).await?);
        }
        Ok(ResolvedRefs {
            correspondent,
            tags,
        })
    }

    async fn resolve_target_id(
        &self,
        entity: EntityType,
        source_id: i64,
    ) -> Result<String, RecordError> {
        self.tracker
            .get(entity, source_id)
            .await?
            .map(|state| state.target_id)
            .ok_or(RecordError::Unresolved { entity, source_id })
    }

    async fn upload_file(&self, doc: &Document, page_id: &str) -> Result<(), RecordError> {
        let file = self.source.download_document(doc.id).await?;
        let filename = file
            .filename
            .or_else(|| doc.original_file_name.clone())
            .unwrap_or_else(|| format!("document-{}", doc.id));
        self.target.attach_file(page_id, &filename, file.bytes).await?;
        Ok(())
    }

    async fn archive_disappeared(
        &self,
        documents: &[Document],
        stats: &mut CycleStats,
    ) -> Result<(), TrackerError> {
        let seen: HashSet<i64> = documents.iter().map(|doc| doc.id).collect();
        for source_id in self.tracker.source_ids(EntityType::Document).await? {
            if seen.contains(&source_id) {
                continue;
            }
            let Some(state) = self.tracker.get(EntityType::Document, source_id).await? else {
                continue;
            };
            if state.archived {
                continue;
            }
            match self.target.set_archived(&state.target_id, true).await {
                Ok(()) => {
                    self.tracker
                        .set_archived(EntityType::Document, source_id, true)
                        .await?;
                    info!(entity = %EntityType::Document, source_id, page = %state.target_id, "archived page for disappeared document");
                    stats.archived += 1;
                }
                Err(err) => {
                    warn!(
                        entity = %EntityType::Document,
                        source_id,
                        error = %err,
                        "archive failed, will retry next cycle"
                    );
                    stats.failed += 1;
                }
            }
        }
        Ok(())
    }
}

fn listing_retry_delay(attempt: u32) -> Duration {
    let base_ms = LISTING_BACKOFF_BASE.as_millis() as u64;
    let max_ms = LISTING_BACKOFF_MAX.as_millis() as u64;
    let exp = base_ms
        .saturating_mul(1u64 << attempt.min(16))
        .min(max_ms);
    Duration::from_millis(rand::thread_rng().gen_range(0..=exp))
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
