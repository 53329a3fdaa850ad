//! Incremental, memory-bounded index construction.
//!
//! [`IndexBuilder::build`] turns a list of segments into a searchable
//! collection in batches:
//!
//! 1. Any existing collection with the same name is deleted.
//! 2. The first batch is embedded and used to create the collection.
//! 3. Later batches are embedded together, then inserted one segment at a
//!    time into the live collection.
//! 4. Between batches the builder sleeps for `pause`, letting other tasks run.
//!
//! Each batch's texts and vectors live only inside its loop iteration. If any
//! step fails the partial collection is deleted and the caller gets
//! [`Error::PartialIndex`]; a half-built collection is never returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::models::{IndexHandle, Segment};
use crate::progress::{IndexProgress, IndexProgressEvent};
use crate::store::{EmbeddedSegment, VectorStore};

pub const DEFAULT_BATCH_SIZE: usize = 3;
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(100);

pub struct IndexBuilder {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    batch_size: usize,
    pause: Duration,
    generation: AtomicU64,
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            pause: DEFAULT_BATCH_PAUSE,
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_batching(mut self, batch_size: usize, pause: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.pause = pause;
        self
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Build a fresh collection from `segments` and return its handle.
    pub async fn build(
        &self,
        collection: &str,
        segments: Vec<Segment>,
        progress: &dyn IndexProgress,
    ) -> Result<IndexHandle> {
        self.store.delete_collection(collection).await?;
        if segments.is_empty() {
            return Err(Error::EmptyIndex);
        }

        let total = segments.len();
        let mut inserted = 0;
        if let Err(source) = self
            .insert_batches(collection, segments, &mut inserted, progress)
            .await
        {
            if let Err(e) = self.store.delete_collection(collection).await {
                warn!(collection, error = %e, "failed to discard partial collection");
            }
            return Err(Error::PartialIndex {
                inserted,
                source: Box::new(source),
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        progress.report(IndexProgressEvent::Done {
            collection: collection.to_string(),
            segments: total,
        });
        Ok(IndexHandle::new(collection, generation, inserted))
    }

    async fn insert_batches(
        &self,
        collection: &str,
        segments: Vec<Segment>,
        inserted: &mut usize,
        progress: &dyn IndexProgress,
    ) -> Result<()> {
        let total = segments.len();
        let mut remaining = segments.into_iter().peekable();
        let mut batch_no = 0;

        while remaining.peek().is_some() {
            let batch: Vec<Segment> = remaining.by_ref().take(self.batch_size).collect();
            {
                let items = self.embed(batch).await?;
                if batch_no == 0 {
                    let dims = items.first().map(|i| i.vector.len()).unwrap_or(0);
                    self.store.create_collection(collection, dims).await?;
                    let n = items.len();
                    self.store.upsert(collection, items).await?;
                    *inserted += n;
                } else {
                    for item in items {
                        self.store.upsert(collection, vec![item]).await?;
                        *inserted += 1;
                    }
                }
            }
            batch_no += 1;
            debug!(collection, batch = batch_no, inserted = *inserted, total, "batch indexed");
            progress.report(IndexProgressEvent::Batch {
                collection: collection.to_string(),
                batch: batch_no,
                inserted: *inserted,
                total,
            });

            if remaining.peek().is_some() && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }
        Ok(())
    }

    async fn embed(&self, batch: Vec<Segment>) -> Result<Vec<EmbeddedSegment>> {
        let texts: Vec<String> = batch.iter().map(|s| s.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != batch.len() {
            return Err(Error::provider(
                self.embedder.model_name(),
                format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    vectors.len()
                ),
            ));
        }
        Ok(batch
            .into_iter()
            .zip(vectors)
            .map(|(segment, vector)| EmbeddedSegment { segment, vector })
            .collect())
    }

    /// Embed one segment and add it to the collection behind `handle`.
    pub async fn insert(&self, handle: &mut IndexHandle, segment: Segment) -> Result<()> {
        let mut items = self.embed(vec![segment]).await?;
        if let Some(item) = items.pop() {
            self.store.upsert(handle.collection(), vec![item]).await?;
            handle.record_insert();
        }
        Ok(())
    }

    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        self.store.delete_collection(name).await
    }
}
