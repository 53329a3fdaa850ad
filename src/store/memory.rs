//! In-memory [`VectorStore`] implementation.
//!
//! Collections live in a `HashMap` behind `std::sync::RwLock`. Dense search
//! is brute-force cosine similarity; sparse search is BM25 over the same
//! tokens the hashed embedder uses. Both candidate lists are blended with
//! [`fuse_hybrid`](crate::search::fuse_hybrid).

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::embedding::{cosine_similarity, tokenize};
use crate::error::{Error, Result};
use crate::models::ScoredSegment;
use crate::search::{fuse_hybrid, Candidate};

use super::{EmbeddedSegment, HybridParams, VectorStore};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

struct StoredSegment {
    item: EmbeddedSegment,
    term_freqs: HashMap<String, u32>,
    len: usize,
}

struct Collection {
    dims: usize,
    segments: Vec<StoredSegment>,
    doc_freqs: HashMap<String, usize>,
    total_len: usize,
}

impl Collection {
    fn new(dims: usize) -> Self {
        Self {
            dims,
            segments: Vec::new(),
            doc_freqs: HashMap::new(),
            total_len: 0,
        }
    }

    /// Insert `item`, replacing a stored segment with the same identity.
    fn upsert(&mut self, item: EmbeddedSegment) {
        let mut term_freqs: HashMap<String, u32> = HashMap::new();
        let mut len = 0;
        for token in tokenize(&item.segment.text) {
            *term_freqs.entry(token).or_default() += 1;
            len += 1;
        }
        for term in term_freqs.keys() {
            *self.doc_freqs.entry(term.clone()).or_default() += 1;
        }
        self.total_len += len;
        let stored = StoredSegment {
            item,
            term_freqs,
            len,
        };

        match self
            .segments
            .iter()
            .position(|s| s.item.segment == stored.item.segment)
        {
            Some(pos) => {
                let old = std::mem::replace(&mut self.segments[pos], stored);
                self.forget(&old);
            }
            None => self.segments.push(stored),
        }
    }

    fn forget(&mut self, old: &StoredSegment) {
        for term in old.term_freqs.keys() {
            if let Some(df) = self.doc_freqs.get_mut(term) {
                *df -= 1;
                if *df == 0 {
                    self.doc_freqs.remove(term);
                }
            }
        }
        self.total_len -= old.len;
    }

    fn keyword_candidates(&self, query: &str, top_k: usize) -> Vec<Candidate> {
        let terms: HashSet<String> = tokenize(query).collect();
        if terms.is_empty() || self.segments.is_empty() {
            return Vec::new();
        }
        let n = self.segments.len() as f64;
        let avg_len = (self.total_len as f64 / n).max(1.0);

        let mut candidates: Vec<Candidate> = self
            .segments
            .iter()
            .enumerate()
            .filter_map(|(id, seg)| {
                let score: f64 = terms
                    .iter()
                    .filter_map(|term| {
                        let tf = *seg.term_freqs.get(term)? as f64;
                        let df = *self.doc_freqs.get(term).unwrap_or(&0) as f64;
                        let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                        let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * seg.len as f64 / avg_len);
                        Some(idf * tf * (BM25_K1 + 1.0) / (tf + norm))
                    })
                    .sum();
                (score > 0.0).then_some(Candidate {
                    id,
                    raw_score: score,
                })
            })
            .collect();
        sort_candidates(&mut candidates);
        candidates.truncate(top_k);
        candidates
    }

    fn vector_candidates(&self, query: &[f32], top_k: usize) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .segments
            .iter()
            .enumerate()
            .map(|(id, seg)| Candidate {
                id,
                raw_score: cosine_similarity(query, &seg.item.vector) as f64,
            })
            .collect();
        sort_candidates(&mut candidates);
        candidates.truncate(top_k);
        candidates
    }
}

fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// In-memory store for a single process.
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Number of segments in a collection, if it exists.
    pub fn segment_count(&self, name: &str) -> Option<usize> {
        self.read()
            .ok()?
            .get(name)
            .map(|c| c.segments.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .read()
            .map_err(|_| Error::provider("memory", "store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .write()
            .map_err(|_| Error::provider("memory", "store lock poisoned"))
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn create_collection(&self, name: &str, dims: usize) -> Result<()> {
        let mut collections = self.write()?;
        if collections.contains_key(name) {
            return Err(Error::provider(
                "memory",
                format!("collection '{name}' already exists"),
            ));
        }
        collections.insert(name.to_string(), Collection::new(dims));
        debug!(collection = name, dims, "created collection");
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        if self.write()?.remove(name).is_some() {
            debug!(collection = name, "deleted collection");
        }
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.read()?.contains_key(name))
    }

    async fn upsert(&self, name: &str, items: Vec<EmbeddedSegment>) -> Result<()> {
        let mut collections = self.write()?;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))?;
        if let Some(bad) = items.iter().find(|i| i.vector.len() != collection.dims) {
            return Err(Error::provider(
                "memory",
                format!(
                    "vector has {} dims, collection '{name}' expects {}",
                    bad.vector.len(),
                    collection.dims
                ),
            ));
        }
        for item in items {
            collection.upsert(item);
        }
        Ok(())
    }

    async fn hybrid_search(
        &self,
        name: &str,
        query_text: &str,
        query_vector: &[f32],
        params: HybridParams,
    ) -> Result<Vec<ScoredSegment>> {
        let collections = self.read()?;
        let collection = collections
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))?;

        let keyword = collection.keyword_candidates(query_text, params.sparse_top_k);
        let vector = collection.vector_candidates(query_vector, params.dense_top_k);
        let fused = fuse_hybrid(&keyword, &vector, params.alpha, params.dense_top_k);

        Ok(fused
            .into_iter()
            .map(|(id, score)| ScoredSegment {
                segment: collection.segments[id].item.segment.clone(),
                score: Some(score.clamp(0.0, 1.0)),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, HashedEmbedder};
    use crate::models::Segment;

    fn embedded(e: &HashedEmbedder, text: &str, file: &str) -> EmbeddedSegment {
        EmbeddedSegment {
            segment: Segment::new(text, file, None),
            vector: e.embed_sync(text),
        }
    }

    #[tokio::test]
    async fn collection_lifecycle() {
        let store = InMemoryVectorStore::new();
        assert!(!store.collection_exists("c").await.unwrap());
        store.delete_collection("c").await.unwrap();

        store.create_collection("c", 8).await.unwrap();
        assert!(store.create_collection("c", 8).await.is_err());
        assert!(store.collection_exists("c").await.unwrap());

        store.delete_collection("c").await.unwrap();
        assert!(!store.collection_exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn upsert_checks_dims_and_collection() {
        let store = InMemoryVectorStore::new();
        let e = HashedEmbedder::new(16);
        let err = store
            .upsert("missing", vec![embedded(&e, "x", "a.txt")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        store.create_collection("c", 8).await.unwrap();
        assert!(store
            .upsert("c", vec![embedded(&e, "x", "a.txt")])
            .await
            .is_err());
        assert_eq!(store.segment_count("c"), Some(0));
    }

    #[tokio::test]
    async fn upsert_replaces_identical_segment() {
        let store = InMemoryVectorStore::new();
        let e = HashedEmbedder::new(16);
        store.create_collection("c", 16).await.unwrap();
        store
            .upsert(
                "c",
                vec![embedded(&e, "red apples", "a.txt"), embedded(&e, "green pears", "a.txt")],
            )
            .await
            .unwrap();
        store
            .upsert("c", vec![embedded(&e, "red apples", "a.txt")])
            .await
            .unwrap();
        assert_eq!(store.segment_count("c"), Some(2));

        // Same text from another file is a different segment.
        store
            .upsert("c", vec![embedded(&e, "red apples", "b.txt")])
            .await
            .unwrap();
        assert_eq!(store.segment_count("c"), Some(3));

        let hits = store
            .hybrid_search("c", "pears", &e.embed_sync("pears"), HybridParams::default())
            .await
            .unwrap();
        assert_eq!(hits[0].segment.text, "green pears");
    }

    #[tokio::test]
    async fn exact_text_ranks_first() {
        let store = InMemoryVectorStore::new();
        let e = HashedEmbedder::default();
        store.create_collection("c", e.dims()).await.unwrap();
        let texts = [
            ("Revenue grew twelve percent in the third quarter.", "finance.pdf"),
            ("The cafeteria menu changes every Monday.", "menu.txt"),
            ("Quarterly revenue targets were missed in Europe.", "europe.pdf"),
        ];
        store
            .upsert(
                "c",
                texts.iter().map(|(t, f)| embedded(&e, t, f)).collect(),
            )
            .await
            .unwrap();

        let query = texts[1].0;
        let hits = store
            .hybrid_search("c", query, &e.embed_sync(query), HybridParams::default())
            .await
            .unwrap();
        assert_eq!(hits[0].segment.source_file.as_deref(), Some("menu.txt"));
        for hit in &hits {
            let score = hit.score.unwrap();
            assert!((0.0..=1.0).contains(&score));
        }
    }

    #[tokio::test]
    async fn search_missing_collection_is_not_found() {
        let store = InMemoryVectorStore::new();
        let err = store
            .hybrid_search("nope", "q", &[0.0], HybridParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
