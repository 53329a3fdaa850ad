//! Ingestion coordinator.
//!
//! [`IngestionCoordinator`] is the service context for the whole pipeline.
//! It owns the document records, the published [`IndexHandle`], and the one
//! background indexing task, all behind a single `tokio::sync::Mutex`.
//!
//! # Document lifecycle
//!
//! ```text
//! submit ──▶ Processing ──▶ Completed
//!                      └──▶ Error(message)
//! ```
//!
//! Terminal states are never retried automatically; `reinitialize` starts a
//! fresh rebuild on request.
//!
//! # Rebuilds
//!
//! Every mutation (submit, remove, clear, reinitialize) first supersedes the
//! running task: it is aborted and its completion awaited while the lock is
//! held, so at most one build is ever in flight. Loading and embedding run
//! outside the lock. The finished handle is published under the lock, and
//! only if no newer mutation has happened since the task was spawned.
//!
//! Each build writes its own collection, `{collection}-{generation}`. A
//! superseded build's partial collection is deleted, and a published one is
//! deleted only once it is no longer the current handle. A handle copied
//! out before a rebuild therefore never sees the next build's segments.
//!
//! Uploading replaces the document set: prior uploads and the collection
//! are deleted before the new file is stored.
//!
//! Queries copy the handle out under the lock and run without holding it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::create_provider;
use crate::encoder::{answer_events, chat_events, EncoderSettings};
use crate::error::{Error, Result};
use crate::files::{sanitize_file_name, FileStore, LocalFileStore};
use crate::index::IndexBuilder;
use crate::loader::DocumentLoader;
use crate::models::{AnswerChunk, DocumentRecord, DocumentStatus, IndexHandle, QueryResult};
use crate::progress::{IndexProgress, LogProgress};
use crate::query::{QueryEngine, QuerySettings};
use crate::router::ChatRouter;
use crate::store::{InMemoryVectorStore, VectorStore};

/// Non-component settings for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub collection: String,
    pub role_description: String,
    pub encoder: EncoderSettings,
}

/// One entry of [`IngestionCoordinator::files`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileEntry {
    pub id: String,
    pub filename: String,
    pub stored_name: String,
    pub upload_time: DateTime<Utc>,
    pub status: DocumentStatus,
    pub error: Option<String>,
}

impl From<&DocumentRecord> for FileEntry {
    fn from(r: &DocumentRecord) -> Self {
        Self {
            id: r.id.clone(),
            filename: r.original_name.clone(),
            stored_name: r.stored_name.clone(),
            upload_time: r.uploaded_at,
            status: r.status,
            error: r.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Ready,
    Initializing,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub query_engine_ready: bool,
    pub total_files: usize,
    pub processing_files: usize,
    pub completed_files: usize,
    pub error_files: usize,
    pub files_detail: Vec<FileEntry>,
    pub status: EngineState,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of [`IngestionCoordinator::clear_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearReport {
    /// Stored files that could not be listed or deleted.
    pub leftover_files: usize,
}

impl ClearReport {
    pub fn is_clean(&self) -> bool {
        self.leftover_files == 0
    }
}

struct IndexingTask {
    generation: u64,
    abort: AbortHandle,
    done: Shared<BoxFuture<'static, ()>>,
}

#[derive(Default)]
struct State {
    documents: Vec<DocumentRecord>,
    handle: Option<IndexHandle>,
    task: Option<IndexingTask>,
    /// Bumped by every mutation; a task publishes only if it still matches.
    generation: u64,
}

struct Inner {
    files: Arc<dyn FileStore>,
    loader: DocumentLoader,
    builder: IndexBuilder,
    engine: QueryEngine,
    progress: Arc<dyn IndexProgress>,
    settings: CoordinatorSettings,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct IngestionCoordinator {
    inner: Arc<Inner>,
}

impl IngestionCoordinator {
    pub fn new(
        files: Arc<dyn FileStore>,
        loader: DocumentLoader,
        builder: IndexBuilder,
        engine: QueryEngine,
        progress: Arc<dyn IndexProgress>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                files,
                loader,
                builder,
                engine,
                progress,
                settings,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Wire up local file storage, the in-memory store, and the configured
    /// embedding and chat backends.
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let router = Arc::new(ChatRouter::from_config(&config.chat)?);

        let builder = IndexBuilder::new(Arc::clone(&embedder), Arc::clone(&store)).with_batching(
            config.indexing.batch_size,
            Duration::from_millis(config.indexing.batch_pause_ms),
        );
        let engine = QueryEngine::new(
            embedder,
            store,
            Arc::clone(&router),
            QuerySettings::from_config(&config.retrieval, &config.chat.role_description),
        );
        let settings = CoordinatorSettings {
            collection: config.storage.collection.clone(),
            role_description: config.chat.role_description.clone(),
            encoder: EncoderSettings {
                max_sources: config.retrieval.max_sources,
                chunk_words: router.chunk_words(),
                chunk_delay: router.chunk_delay(),
            },
        };

        Ok(Self::new(
            Arc::new(LocalFileStore::new(&config.storage.upload_dir)),
            DocumentLoader::new(config.chunking.max_tokens),
            builder,
            engine,
            Arc::new(LogProgress),
            settings,
        ))
    }

    pub fn router(&self) -> &Arc<ChatRouter> {
        self.inner.engine.router()
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    /// Accept an upload and start indexing it in the background.
    ///
    /// Returns as soon as the file is stored and tracked as `Processing`.
    pub async fn submit(&self, original_name: &str, bytes: &[u8]) -> Result<DocumentRecord> {
        let sanitized = sanitize_file_name(original_name)
            .ok_or_else(|| Error::Validation(format!("invalid file name '{original_name}'")))?;

        let mut state = self.inner.state.lock().await;
        supersede(&self.inner, &mut state).await;

        info!("clearing existing documents before upload");
        self.purge(&mut state).await;

        let stored_name = self.unique_name(&sanitized).await;
        let stored_path = match self.inner.files.save(&stored_name, bytes).await {
            Ok(path) => path,
            Err(e) => {
                error!(file = %stored_name, error = %e, "failed to store upload");
                return Err(e);
            }
        };

        let record = DocumentRecord {
            id: Uuid::new_v4().to_string(),
            original_name: original_name.to_string(),
            stored_name,
            stored_path,
            uploaded_at: Utc::now(),
            status: DocumentStatus::Processing,
            error: None,
        };
        state.documents.push(record.clone());
        info!(id = %record.id, file = %record.stored_name, "upload accepted");

        self.spawn_rebuild(&mut state);
        Ok(record)
    }

    /// Remove one document and rebuild from whatever remains.
    ///
    /// `id` may be the record id or the stored file name. If the stored file
    /// cannot be deleted nothing changes, including a running build.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let pos = state
            .documents
            .iter()
            .position(|d| d.id == id || d.stored_name == id)
            .ok_or_else(|| Error::NotFound(format!("document '{id}'")))?;

        self.inner
            .files
            .remove(&state.documents[pos].stored_path)
            .await?;
        supersede(&self.inner, &mut state).await;
        let record = state.documents.remove(pos);
        self.inner.drop_index(&mut state).await;
        info!(id = %record.id, file = %record.stored_name, "document removed");

        if !state.documents.is_empty() {
            for doc in &mut state.documents {
                doc.status = DocumentStatus::Processing;
                doc.error = None;
            }
            self.spawn_rebuild(&mut state);
        }
        Ok(())
    }

    /// Delete every document, stored file, and the collection.
    ///
    /// Records and the index are always cleared. Stored files that could not
    /// be deleted are counted in the report.
    pub async fn clear_all(&self) -> ClearReport {
        let mut state = self.inner.state.lock().await;
        supersede(&self.inner, &mut state).await;
        let leftover_files = self.purge(&mut state).await;
        if leftover_files == 0 {
            info!("all documents cleared");
        } else {
            warn!(leftover_files, "documents cleared with stored files left behind");
        }
        ClearReport { leftover_files }
    }

    /// Rebuild the index from the tracked documents. Returns how many.
    pub async fn reinitialize(&self) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        if state.documents.is_empty() {
            return Err(Error::Validation("no documents to index; upload one first".into()));
        }
        supersede(&self.inner, &mut state).await;
        self.inner.drop_index(&mut state).await;
        for doc in &mut state.documents {
            doc.status = DocumentStatus::Processing;
            doc.error = None;
        }
        let n = state.documents.len();
        self.spawn_rebuild(&mut state);
        Ok(n)
    }

    pub async fn files(&self) -> Vec<FileEntry> {
        let state = self.inner.state.lock().await;
        state.documents.iter().map(FileEntry::from).collect()
    }

    pub async fn status(&self) -> StatusSnapshot {
        let state = self.inner.state.lock().await;
        let count = |s: DocumentStatus| state.documents.iter().filter(|d| d.status == s).count();
        let ready = state.handle.is_some();
        StatusSnapshot {
            query_engine_ready: ready,
            total_files: state.documents.len(),
            processing_files: count(DocumentStatus::Processing),
            completed_files: count(DocumentStatus::Completed),
            error_files: count(DocumentStatus::Error),
            files_detail: state.documents.iter().map(FileEntry::from).collect(),
            status: if ready {
                EngineState::Ready
            } else {
                EngineState::Initializing
            },
            timestamp: Utc::now(),
        }
    }

    pub async fn current_handle(&self) -> Option<IndexHandle> {
        self.inner.state.lock().await.handle.clone()
    }

    /// Answer a question against the current index, using the named chat
    /// backend or the default one.
    pub async fn ask(&self, question: &str, backend: Option<&str>) -> Result<QueryResult> {
        let handle = self
            .current_handle()
            .await
            .ok_or(Error::NotInitialized)?;
        self.inner.engine.query(&handle, question, backend).await
    }

    /// [`ask`](Self::ask) as a wire event stream. Never fails; failures
    /// become a terminal `error` event.
    pub async fn ask_events(
        &self,
        question: &str,
        backend: Option<&str>,
    ) -> BoxStream<'static, AnswerChunk> {
        let result = self.ask(question, backend).await;
        answer_events(result, self.inner.settings.encoder)
    }

    /// Direct chat through the router, no retrieval.
    pub fn chat(&self, message: &str, backend: Option<&str>) -> BoxStream<'static, AnswerChunk> {
        let fragments = self.router().stream_chat(
            message,
            &self.inner.settings.role_description,
            backend,
        );
        chat_events(fragments)
    }

    /// Wait until no background task is running.
    pub async fn wait_idle(&self) {
        loop {
            let pending = {
                let state = self.inner.state.lock().await;
                state
                    .task
                    .as_ref()
                    .map(|t| (t.generation, t.done.clone()))
            };
            let Some((generation, done)) = pending else {
                return;
            };
            done.await;
            let mut state = self.inner.state.lock().await;
            if state.task.as_ref().map(|t| t.generation) == Some(generation) {
                // Ended without publishing (panicked).
                state.task = None;
            }
        }
    }

    /// Delete stored files, forget all records, and drop the index. Returns
    /// how many files were left behind.
    async fn purge(&self, state: &mut State) -> usize {
        let mut leftover = 0;
        match self.inner.files.list().await {
            Ok(paths) => {
                for path in paths {
                    if let Err(e) = self.inner.files.remove(&path).await {
                        warn!(path = %path.display(), error = %e, "failed to remove stored file");
                        leftover += 1;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to list stored files");
                leftover = state.documents.len().max(1);
            }
        }
        state.documents.clear();
        self.inner.drop_index(state).await;
        leftover
    }

    /// `"{unix_millis}_{name}"`, bumped until it does not collide.
    async fn unique_name(&self, sanitized: &str) -> String {
        let mut ts = Utc::now().timestamp_millis();
        loop {
            let name = format!("{ts}_{sanitized}");
            let taken = match self.inner.files.list().await {
                Ok(paths) => paths
                    .iter()
                    .any(|p| p.file_name().map(|f| f == name.as_str()).unwrap_or(false)),
                Err(_) => false,
            };
            if !taken {
                return name;
            }
            ts += 1;
        }
    }

    /// Spawn a rebuild over the current documents. Caller holds the lock and
    /// has already superseded any previous task.
    fn spawn_rebuild(&self, state: &mut State) {
        state.generation += 1;
        let generation = state.generation;
        let docs: Vec<(String, PathBuf)> = state
            .documents
            .iter()
            .map(|d| (d.id.clone(), d.stored_path.clone()))
            .collect();

        let join = tokio::spawn(rebuild(Arc::clone(&self.inner), generation, docs));
        let abort = join.abort_handle();
        let done: BoxFuture<'static, ()> = async move {
            let _ = join.await;
        }
        .boxed();
        state.task = Some(IndexingTask {
            generation,
            abort,
            done: done.shared(),
        });
        debug!(generation, "indexing task spawned");
    }
}

impl Inner {
    /// Physical collection written by the build of `generation`.
    fn collection_for(&self, generation: u64) -> String {
        format!("{}-{generation}", self.settings.collection)
    }

    /// Unpublish the current handle and delete its collection.
    async fn drop_index(&self, state: &mut State) {
        if let Some(handle) = state.handle.take() {
            self.discard(handle.collection()).await;
        }
    }

    async fn discard(&self, collection: &str) {
        if let Err(e) = self.builder.drop_collection(collection).await {
            warn!(collection, error = %e, "failed to drop collection");
        }
    }
}

/// Abort the running task, wait for it to stop, and delete whatever it had
/// written.
async fn supersede(inner: &Inner, state: &mut State) {
    if let Some(task) = state.task.take() {
        task.abort.abort();
        task.done.await;
        inner.discard(&inner.collection_for(task.generation)).await;
        debug!(generation = task.generation, "indexing task superseded");
    }
    state.generation += 1;
}

async fn rebuild(inner: Arc<Inner>, generation: u64, docs: Vec<(String, PathBuf)>) {
    let mut failures: Vec<(String, String)> = Vec::new();
    let mut segments = Vec::new();
    let mut loaded: Vec<String> = Vec::new();

    for (id, path) in docs {
        let loader = inner.loader.clone();
        let result = tokio::task::spawn_blocking(move || loader.load_file(&path))
            .await
            .map_err(|e| Error::provider("loader", e))
            .and_then(|r| r);
        match result {
            Ok(s) if s.is_empty() => {
                failures.push((id, "no text could be extracted from the document".into()));
            }
            Ok(s) => {
                segments.extend(s);
                loaded.push(id);
            }
            Err(e) => failures.push((id, e.to_string())),
        }
    }

    let outcome = if segments.is_empty() {
        Err(Error::EmptyIndex)
    } else {
        inner
            .builder
            .build(&inner.collection_for(generation), segments, inner.progress.as_ref())
            .await
    };

    let mut state = inner.state.lock().await;
    if state.generation != generation {
        debug!(generation, current = state.generation, "discarding stale index build");
        if let Ok(handle) = &outcome {
            inner.discard(handle.collection()).await;
        }
        return;
    }
    state.task = None;

    for (id, message) in &failures {
        warn!(id = %id, error = %message, "document failed to load");
        set_status(&mut state, id, DocumentStatus::Error, Some(message.clone()));
    }
    match outcome {
        Ok(handle) => {
            info!(
                generation = handle.generation(),
                segments = handle.segment_count(),
                documents = loaded.len(),
                "index published"
            );
            for id in &loaded {
                set_status(&mut state, id, DocumentStatus::Completed, None);
            }
            if let Some(previous) = state.handle.replace(handle) {
                inner.discard(previous.collection()).await;
            }
        }
        Err(e) => {
            if !loaded.is_empty() {
                error!(error = %e, "index build failed");
            }
            for id in &loaded {
                set_status(&mut state, id, DocumentStatus::Error, Some(e.to_string()));
            }
            inner.drop_index(&mut state).await;
        }
    }
}

fn set_status(state: &mut State, id: &str, status: DocumentStatus, error: Option<String>) {
    if let Some(doc) = state.documents.iter_mut().find(|d| d.id == id) {
        doc.status = status;
        doc.error = error;
    }
}
