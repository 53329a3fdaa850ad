//! Core data models used throughout docchat.
//!
//! These types represent the uploaded documents, extracted segments, index
//! handles, and answer payloads that flow through the ingestion and query
//! pipeline.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;

use crate::error::Result;

/// Processing state of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Completed,
    Error,
}

/// An uploaded document tracked by the ingestion coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub original_name: String,
    /// File name on disk, `"{unix_ts}_{sanitized_name}"`.
    pub stored_name: String,
    pub stored_path: PathBuf,
    pub uploaded_at: DateTime<Utc>,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A chunk of extracted document text with its source metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub text: String,
    pub source_file: Option<String>,
    /// 1-based page label, when the format has pages.
    pub page: Option<u32>,
}

impl Segment {
    pub fn new(text: impl Into<String>, source_file: impl Into<String>, page: Option<u32>) -> Self {
        Self {
            text: text.into(),
            source_file: Some(source_file.into()),
            page,
        }
    }
}

/// A segment returned from retrieval together with its blended score.
#[derive(Debug, Clone)]
pub struct ScoredSegment {
    pub segment: Segment,
    /// Hybrid relevance in `[0.0, 1.0]`, if the store reported one.
    pub score: Option<f64>,
}

/// Reference to one generation of the searchable collection.
///
/// Handles are cheap to clone; a query copies the current handle out of the
/// coordinator and runs against it without holding any lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHandle {
    collection: String,
    generation: u64,
    segment_count: usize,
}

impl IndexHandle {
    pub(crate) fn new(collection: impl Into<String>, generation: u64, segment_count: usize) -> Self {
        Self {
            collection: collection.into(),
            generation,
            segment_count,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub(crate) fn record_insert(&mut self) {
        self.segment_count += 1;
    }
}

/// Source attribution for an answer, as displayed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub file_name: String,
    pub page: String,
    pub score: f64,
}

/// Lazy, single-pass sequence of answer fragments.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// An answer as produced by a language-model backend.
///
/// The router tags the answer when it is constructed, based on whether the
/// backend emits tokens incrementally.
pub enum Answer {
    Streamed(FragmentStream),
    Complete(String),
}

impl fmt::Debug for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::Streamed(_) => f.write_str("Answer::Streamed(..)"),
            Answer::Complete(text) => f.debug_tuple("Answer::Complete").field(text).finish(),
        }
    }
}

/// Result of a retrieval query.
#[derive(Debug)]
pub struct QueryResult {
    pub answer: Answer,
    /// Sources in retrieval rank order.
    pub sources: Vec<SourceRef>,
}

/// Wire-level status of an [`AnswerChunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Streaming,
    Sources,
    Complete,
    Error,
}

/// One server-push event on the answer stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceRef>>,
    pub status: ChunkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnswerChunk {
    pub fn streaming(text: impl Into<String>) -> Self {
        Self {
            chunk: Some(text.into()),
            sources: None,
            status: ChunkStatus::Streaming,
            error: None,
        }
    }

    pub fn sources(block: String, sources: Vec<SourceRef>) -> Self {
        Self {
            chunk: Some(block),
            sources: Some(sources),
            status: ChunkStatus::Sources,
            error: None,
        }
    }

    pub fn complete() -> Self {
        Self {
            chunk: None,
            sources: None,
            status: ChunkStatus::Complete,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            chunk: None,
            sources: None,
            status: ChunkStatus::Error,
            error: Some(message.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ChunkStatus::Complete | ChunkStatus::Error)
    }
}
