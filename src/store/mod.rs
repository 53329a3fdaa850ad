//! Vector store abstraction.
//!
//! The [`VectorStore`] trait covers the collection lifecycle the index
//! builder needs (create, delete, upsert) plus hybrid dense+sparse search for
//! the query engine. Implementations must be `Send + Sync`.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ScoredSegment, Segment};

pub use memory::InMemoryVectorStore;

/// Knobs for one hybrid search call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridParams {
    /// Dense candidates to consider, and the size of the returned list.
    pub dense_top_k: usize,
    /// Sparse (keyword) candidates to consider.
    pub sparse_top_k: usize,
    /// Weight of the dense side, in `[0, 1]`.
    pub alpha: f64,
}

impl Default for HybridParams {
    fn default() -> Self {
        Self {
            dense_top_k: 5,
            sparse_top_k: 5,
            alpha: 0.5,
        }
    }
}

/// An embedded segment ready for storage.
#[derive(Debug, Clone)]
pub struct EmbeddedSegment {
    pub segment: Segment,
    pub vector: Vec<f32>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create an empty collection. Fails if it already exists.
    async fn create_collection(&self, name: &str, dims: usize) -> Result<()>;

    /// Delete a collection and everything in it. Absence is not an error.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    async fn collection_exists(&self, name: &str) -> Result<bool>;

    /// Add segments to an existing collection. A segment equal to one already
    /// stored (same text, source file, and page) replaces it.
    async fn upsert(&self, name: &str, items: Vec<EmbeddedSegment>) -> Result<()>;

    /// Hybrid search. Scores in the result are in `[0, 1]`, best first.
    async fn hybrid_search(
        &self,
        name: &str,
        query_text: &str,
        query_vector: &[f32],
        params: HybridParams,
    ) -> Result<Vec<ScoredSegment>>;
}
