//! End-to-end coordinator tests: upload, background indexing, querying,
//! removal and rebuilds, against the in-memory store and hashed embeddings.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tempfile::TempDir;

use docchat::coordinator::{CoordinatorSettings, EngineState, IngestionCoordinator};
use docchat::embedding::{EmbeddingProvider, HashedEmbedder};
use docchat::encoder::{EncoderSettings, NO_ANSWER_MESSAGE};
use docchat::error::{Error, Result};
use docchat::files::{FileStore, LocalFileStore};
use docchat::index::IndexBuilder;
use docchat::llm::{LanguageModelProvider, Prompt};
use docchat::loader::DocumentLoader;
use docchat::models::{AnswerChunk, ChunkStatus, DocumentStatus, FragmentStream};
use docchat::progress::NoProgress;
use docchat::query::{QueryEngine, QuerySettings};
use docchat::router::{ChatRouter, FALLBACK_MESSAGE};
use docchat::store::{HybridParams, InMemoryVectorStore, VectorStore};

// ─── Fakes ──────────────────────────────────────────────────────────

/// Batch backend: answers expansion prompts (no system role) with two
/// paraphrases and everything else with a fixed answer.
struct Scripted(&'static str);

#[async_trait]
impl LanguageModelProvider for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }
    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        if prompt.system.is_none() {
            return Ok("1. sky colour\n2. why is the sky blue".into());
        }
        Ok(self.0.to_string())
    }
}

/// Native streaming backend.
struct Streaming;

#[async_trait]
impl LanguageModelProvider for Streaming {
    fn name(&self) -> &str {
        "streaming"
    }
    fn supports_streaming(&self) -> bool {
        true
    }
    async fn generate(&self, _prompt: &Prompt) -> Result<String> {
        Err(Error::provider("streaming", "expansion unavailable"))
    }
    async fn stream_generate(&self, _prompt: &Prompt) -> Result<FragmentStream> {
        Ok(futures::stream::iter(vec![Ok("Blue".to_string()), Ok(", mostly.".to_string())]).boxed())
    }
}

/// Local storage whose `list` and `remove` can be made to fail.
struct FlakyFiles {
    inner: LocalFileStore,
    broken: AtomicBool,
}

impl FlakyFiles {
    fn new(root: PathBuf) -> Self {
        Self {
            inner: LocalFileStore::new(root),
            broken: AtomicBool::new(false),
        }
    }

    fn break_io(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only upload dir",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FileStore for FlakyFiles {
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        self.inner.save(name, bytes).await
    }
    async fn list(&self) -> Result<Vec<PathBuf>> {
        self.check()?;
        self.inner.list().await
    }
    async fn remove(&self, path: &Path) -> Result<()> {
        self.check()?;
        self.inner.remove(path).await
    }
    async fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path).await
    }
}

struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }
    fn dims(&self) -> usize {
        8
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::provider("failing", "embedding service down"))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

struct Harness {
    tmp: TempDir,
    coordinator: IngestionCoordinator,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl Harness {
    fn upload_dir(&self) -> std::path::PathBuf {
        self.tmp.path().join("uploads")
    }
}

fn harness_with(
    router: ChatRouter,
    embedder: Arc<dyn EmbeddingProvider>,
    max_tokens: usize,
    batch: (usize, Duration),
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let files = Arc::new(LocalFileStore::new(tmp.path().join("uploads")));
    harness_on(tmp, files, router, embedder, max_tokens, batch)
}

fn harness_on(
    tmp: TempDir,
    files: Arc<dyn FileStore>,
    router: ChatRouter,
    embedder: Arc<dyn EmbeddingProvider>,
    max_tokens: usize,
    batch: (usize, Duration),
) -> Harness {
    let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
    let router = Arc::new(router);
    let builder = IndexBuilder::new(Arc::clone(&embedder), Arc::clone(&store))
        .with_batching(batch.0, batch.1);
    let engine = QueryEngine::new(
        Arc::clone(&embedder),
        Arc::clone(&store),
        Arc::clone(&router),
        QuerySettings {
            params: HybridParams::default(),
            num_queries: 3,
            role_description: "You answer from the documents.".into(),
        },
    );
    let coordinator = IngestionCoordinator::new(
        files,
        DocumentLoader::new(max_tokens),
        builder,
        engine,
        Arc::new(NoProgress),
        CoordinatorSettings {
            collection: "documents".into(),
            role_description: "You answer from the documents.".into(),
            encoder: EncoderSettings {
                max_sources: 3,
                chunk_words: 5,
                chunk_delay: Duration::ZERO,
            },
        },
    );
    Harness {
        tmp,
        coordinator,
        embedder,
        store,
    }
}

/// A build slow enough to interrupt: one segment per batch, 100ms apart.
fn slow_harness(files: Option<Arc<FlakyFiles>>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let files: Arc<dyn FileStore> = match files {
        Some(f) => f as Arc<dyn FileStore>,
        None => Arc::new(LocalFileStore::new(tmp.path().join("uploads"))) as Arc<dyn FileStore>,
    };
    harness_on(
        tmp,
        files,
        scripted_router(),
        Arc::new(HashedEmbedder::new(64)),
        12,
        (1, Duration::from_millis(100)),
    )
}

fn orchard_text() -> String {
    (0..20)
        .map(|i| format!("Paragraph {i} says apples are red in the orchard.\n\n"))
        .collect()
}

fn harness(router: ChatRouter) -> Harness {
    harness_with(
        router,
        Arc::new(HashedEmbedder::new(64)),
        256,
        (3, Duration::ZERO),
    )
}

fn scripted_router() -> ChatRouter {
    ChatRouter::new(5, Duration::ZERO).with_backend(
        "fake",
        Arc::new(Scripted("The sky is blue because of Rayleigh scattering.")),
    )
}

fn stored_files(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            let mut names: Vec<String> = entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
        Err(_) => Vec::new(),
    }
}

fn answer_text(events: &[AnswerChunk]) -> String {
    events
        .iter()
        .filter(|e| e.status == ChunkStatus::Streaming)
        .filter_map(|e| e.chunk.clone())
        .collect()
}

const SKY: &str = "The sky is blue.\n\nSunsets are red and orange.\n\nGrass is green.";

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn ask_before_any_upload_is_not_initialized() {
    let h = harness(scripted_router());
    assert!(matches!(
        h.coordinator.ask("anything?", None).await,
        Err(Error::NotInitialized)
    ));

    let events: Vec<AnswerChunk> = h.coordinator.ask_events("anything?", None).await.collect().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, ChunkStatus::Error);

    let status = h.coordinator.status().await;
    assert!(!status.query_engine_ready);
    assert_eq!(status.status, EngineState::Initializing);
    assert_eq!(status.total_files, 0);
}

#[tokio::test]
async fn upload_indexes_in_background_and_answers_with_sources() {
    let h = harness(scripted_router());
    let record = h.coordinator.submit("sky.txt", SKY.as_bytes()).await.unwrap();
    assert_eq!(record.status, DocumentStatus::Processing);
    assert!(record.stored_name.ends_with("_sky.txt"));
    assert!(record.stored_path.exists());

    h.coordinator.wait_idle().await;

    let status = h.coordinator.status().await;
    assert!(status.query_engine_ready);
    assert_eq!(status.status, EngineState::Ready);
    assert_eq!(status.total_files, 1);
    assert_eq!(status.completed_files, 1);
    assert_eq!(status.processing_files, 0);
    assert_eq!(status.files_detail[0].filename, "sky.txt");

    let events: Vec<AnswerChunk> = h
        .coordinator
        .ask_events("What color is the sky?", None)
        .await
        .collect()
        .await;
    assert_eq!(
        answer_text(&events),
        "The sky is blue because of Rayleigh scattering."
    );

    let sources = events
        .iter()
        .find(|e| e.status == ChunkStatus::Sources)
        .expect("sources event");
    let listed = sources.sources.as_ref().unwrap();
    assert!(!listed.is_empty() && listed.len() <= 3);
    assert_eq!(listed[0].file_name, "sky.txt");
    assert_eq!(listed[0].page, "unknown");
    assert!(listed.iter().all(|s| (0.0..=1.0).contains(&s.score)));
    assert!(sources.chunk.as_deref().unwrap().contains("Sources:"));

    assert_eq!(events.last().unwrap().status, ChunkStatus::Complete);
}

#[tokio::test]
async fn streaming_backend_passes_fragments_through() {
    let h = harness(ChatRouter::new(5, Duration::ZERO).with_backend("s", Arc::new(Streaming)));
    h.coordinator.submit("sky.txt", SKY.as_bytes()).await.unwrap();
    h.coordinator.wait_idle().await;

    // Expansion fails on this backend; retrieval still uses the question.
    let events: Vec<AnswerChunk> = h.coordinator.ask_events("sky", None).await.collect().await;
    assert_eq!(events[0].chunk.as_deref(), Some("Blue"));
    assert_eq!(events[1].chunk.as_deref(), Some(", mostly."));
    assert_eq!(events.last().unwrap().status, ChunkStatus::Complete);
}

#[tokio::test]
async fn empty_answer_yields_no_answer_message() {
    let router = ChatRouter::new(5, Duration::ZERO).with_backend("blank", Arc::new(Scripted("  ")));
    let h = harness(router);
    h.coordinator.submit("sky.txt", SKY.as_bytes()).await.unwrap();
    h.coordinator.wait_idle().await;

    let events: Vec<AnswerChunk> = h.coordinator.ask_events("sky", None).await.collect().await;
    assert_eq!(answer_text(&events), NO_ANSWER_MESSAGE);
}

#[tokio::test]
async fn new_upload_replaces_previous_documents() {
    let h = harness(scripted_router());
    let first = h.coordinator.submit("first.txt", b"Apples are red.").await.unwrap();
    h.coordinator.wait_idle().await;

    let second = h.coordinator.submit("second.md", SKY.as_bytes()).await.unwrap();
    h.coordinator.wait_idle().await;

    let files = h.coordinator.files().await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].id, second.id);
    assert_eq!(files[0].status, DocumentStatus::Completed);
    assert!(!first.stored_path.exists());
    assert_eq!(stored_files(&h.upload_dir()), vec![second.stored_name.clone()]);

    let result = h.coordinator.ask("apples", None).await.unwrap();
    assert!(result.sources.iter().all(|s| s.file_name == "second.md"));
}

#[tokio::test]
async fn upload_during_indexing_supersedes_the_running_build() {
    let mut slow_text = String::new();
    for i in 0..20 {
        slow_text.push_str(&format!("Paragraph {i} is about orchards and apples.\n\n"));
    }
    let h = harness_with(
        scripted_router(),
        Arc::new(HashedEmbedder::new(64)),
        12,
        (1, Duration::from_millis(100)),
    );

    h.coordinator.submit("slow.txt", slow_text.as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = h.coordinator.submit("sky.txt", SKY.as_bytes()).await.unwrap();
    h.coordinator.wait_idle().await;

    let status = h.coordinator.status().await;
    assert_eq!(status.total_files, 1);
    assert_eq!(status.completed_files, 1);
    assert_eq!(status.files_detail[0].id, second.id);

    let handle = h.coordinator.current_handle().await.unwrap();
    assert_eq!(handle.segment_count(), docchat::chunk::split_text(SKY, 12).len());
    let result = h.coordinator.ask("orchards apples", None).await.unwrap();
    assert!(result.sources.iter().all(|s| s.file_name == "sky.txt"));
}

#[tokio::test]
async fn document_without_text_ends_in_error() {
    let h = harness(scripted_router());
    h.coordinator.submit("blank.txt", b"   \n\n  ").await.unwrap();
    h.coordinator.wait_idle().await;

    let files = h.coordinator.files().await;
    assert_eq!(files[0].status, DocumentStatus::Error);
    assert!(files[0].error.as_deref().unwrap().contains("no text"));
    assert!(h.coordinator.current_handle().await.is_none());
    assert!(matches!(
        h.coordinator.ask("anything", None).await,
        Err(Error::NotInitialized)
    ));
}

#[tokio::test]
async fn embedding_failure_ends_in_error_without_index() {
    let h = harness_with(
        scripted_router(),
        Arc::new(FailingEmbedder),
        256,
        (3, Duration::ZERO),
    );
    h.coordinator.submit("sky.txt", SKY.as_bytes()).await.unwrap();
    h.coordinator.wait_idle().await;

    let status = h.coordinator.status().await;
    assert_eq!(status.error_files, 1);
    assert!(!status.query_engine_ready);
    assert!(status.files_detail[0]
        .error
        .as_deref()
        .unwrap()
        .contains("embedding service down"));
}

#[tokio::test]
async fn remove_and_clear() {
    let h = harness(scripted_router());
    let record = h.coordinator.submit("sky.txt", SKY.as_bytes()).await.unwrap();
    h.coordinator.wait_idle().await;

    assert!(matches!(
        h.coordinator.remove("no-such-id").await,
        Err(Error::NotFound(_))
    ));

    h.coordinator.remove(&record.stored_name).await.unwrap();
    assert!(h.coordinator.files().await.is_empty());
    assert!(h.coordinator.current_handle().await.is_none());
    assert!(!record.stored_path.exists());

    h.coordinator.submit("sky.txt", SKY.as_bytes()).await.unwrap();
    assert!(h.coordinator.clear_all().await.is_clean());
    h.coordinator.wait_idle().await;
    assert!(h.coordinator.files().await.is_empty());
    assert!(h.coordinator.current_handle().await.is_none());
    assert!(stored_files(&h.upload_dir()).is_empty());

    let events: Vec<AnswerChunk> = h.coordinator.ask_events("sky", None).await.collect().await;
    assert_eq!(events.len(), 1);
    assert!(events[0].error.as_deref().unwrap().contains("no index"));
}

#[tokio::test]
async fn reinitialize_rebuilds_tracked_documents() {
    let h = harness(scripted_router());
    assert!(matches!(
        h.coordinator.reinitialize().await,
        Err(Error::Validation(_))
    ));

    h.coordinator.submit("sky.txt", SKY.as_bytes()).await.unwrap();
    h.coordinator.wait_idle().await;
    let before = h.coordinator.current_handle().await.unwrap();

    assert_eq!(h.coordinator.reinitialize().await.unwrap(), 1);
    h.coordinator.wait_idle().await;
    let after = h.coordinator.current_handle().await.unwrap();
    assert!(after.generation() > before.generation());
    assert_eq!(after.segment_count(), before.segment_count());
    assert_eq!(h.coordinator.status().await.completed_files, 1);
}

#[tokio::test]
async fn direct_chat_without_backend_yields_fallback() {
    let h = harness(ChatRouter::new(5, Duration::ZERO));
    let events: Vec<AnswerChunk> = h.coordinator.chat("hello", None).collect().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].chunk.as_deref(), Some(FALLBACK_MESSAGE));
    assert_eq!(events[1].status, ChunkStatus::Complete);
}

#[tokio::test]
async fn direct_chat_rechunks_batch_answers() {
    let router = ChatRouter::new(2, Duration::ZERO)
        .with_backend("fake", Arc::new(Scripted("one two three four five")));
    let h = harness(router);
    let events: Vec<AnswerChunk> = h.coordinator.chat("hi", Some("unknown")).collect().await;
    let chunks: Vec<&str> = events.iter().filter_map(|e| e.chunk.as_deref()).collect();
    assert_eq!(chunks, vec!["one two ", "three four ", "five"]);
}

#[tokio::test]
async fn copied_handle_never_sees_the_next_build() {
    let h = slow_harness(None);
    h.coordinator.submit("old.txt", b"Apples are red.").await.unwrap();
    h.coordinator.wait_idle().await;
    let old = h.coordinator.current_handle().await.unwrap();

    h.coordinator.submit("new.txt", orchard_text().as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    // A query that copied the old handle keeps running during the rebuild.
    let side = QueryEngine::new(
        Arc::clone(&h.embedder),
        Arc::clone(&h.store),
        Arc::new(ChatRouter::default()),
        QuerySettings {
            params: HybridParams::default(),
            num_queries: 1,
            role_description: String::new(),
        },
    );
    match side.retrieve(&old, "apples are red").await {
        Err(Error::NotFound(_)) => {}
        Ok(hits) => assert!(hits
            .iter()
            .all(|hit| hit.segment.source_file.as_deref().unwrap().ends_with("old.txt"))),
        Err(other) => panic!("unexpected error: {other:?}"),
    }

    h.coordinator.wait_idle().await;
    let new = h.coordinator.current_handle().await.unwrap();
    assert_ne!(new.collection(), old.collection());
    assert!(!h.store.collection_exists(old.collection()).await.unwrap());
    assert!(h.store.collection_exists(new.collection()).await.unwrap());
}

#[tokio::test]
async fn superseded_build_leaves_no_collection_behind() {
    let h = slow_harness(None);
    h.coordinator.submit("slow.txt", orchard_text().as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.coordinator.reinitialize().await.unwrap(), 1);
    h.coordinator.wait_idle().await;

    let handle = h.coordinator.current_handle().await.unwrap();
    assert!(h.store.collection_exists(handle.collection()).await.unwrap());
    assert!(h.coordinator.clear_all().await.is_clean());
    assert!(!h.store.collection_exists(handle.collection()).await.unwrap());
}

#[tokio::test]
async fn clear_with_failing_storage_still_settles_every_record() {
    let tmp_files = TempDir::new().unwrap();
    let files = Arc::new(FlakyFiles::new(tmp_files.path().to_path_buf()));
    let h = slow_harness(Some(Arc::clone(&files)));

    h.coordinator.submit("slow.txt", orchard_text().as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    files.break_io();

    let report = h.coordinator.clear_all().await;
    assert!(!report.is_clean());
    h.coordinator.wait_idle().await;

    let status = h.coordinator.status().await;
    assert_eq!(status.total_files, 0);
    assert_eq!(status.processing_files, 0);
    assert!(!status.query_engine_ready);
}

#[tokio::test]
async fn failed_remove_leaves_running_build_alone() {
    let tmp_files = TempDir::new().unwrap();
    let files = Arc::new(FlakyFiles::new(tmp_files.path().to_path_buf()));
    let h = slow_harness(Some(Arc::clone(&files)));

    let record = h.coordinator.submit("slow.txt", orchard_text().as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    files.break_io();

    assert!(matches!(
        h.coordinator.remove(&record.id).await,
        Err(Error::Io(_))
    ));
    h.coordinator.wait_idle().await;

    let listed = h.coordinator.files().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, DocumentStatus::Completed);
    assert!(h.coordinator.current_handle().await.is_some());
    assert!(record.stored_path.exists());
}

#[tokio::test]
async fn named_backend_answers_the_question() {
    let router = scripted_router().with_backend(
        "terse",
        Arc::new(Scripted("Blue.")),
    );
    let h = harness(router);
    h.coordinator.submit("sky.txt", SKY.as_bytes()).await.unwrap();
    h.coordinator.wait_idle().await;

    let named: Vec<AnswerChunk> = h
        .coordinator
        .ask_events("What color is the sky?", Some("terse"))
        .await
        .collect()
        .await;
    assert_eq!(answer_text(&named), "Blue.");

    let default: Vec<AnswerChunk> = h
        .coordinator
        .ask_events("What color is the sky?", None)
        .await
        .collect()
        .await;
    assert_eq!(
        answer_text(&default),
        "The sky is blue because of Rayleigh scattering."
    );
}
