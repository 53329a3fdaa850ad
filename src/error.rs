//! Error taxonomy for the ingestion and query core.
//!
//! Every failure path in the core resolves to one of these variants. None of
//! them are fatal to the process: the coordinator records background failures
//! on the document record, and the transport turns the rest into either an
//! HTTP error body or a terminal `error` event on the answer stream.

use thiserror::Error;

use crate::loader::ExtractError;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller input (empty question, unknown backend, disallowed upload).
    #[error("invalid request: {0}")]
    Validation(String),

    /// A query arrived while no index handle is published.
    #[error("no index is initialized; upload a document first")]
    NotInitialized,

    #[error("not found: {0}")]
    NotFound(String),

    /// Embedding, language-model, or vector-store backend failure.
    #[error("{provider} provider error: {message}")]
    Provider { provider: String, message: String },

    /// Index construction failed part-way; the partial collection was discarded.
    #[error("index build failed after {inserted} segments: {source}")]
    PartialIndex {
        inserted: usize,
        #[source]
        source: Box<Error>,
    },

    /// The build was given nothing to index.
    #[error("no text segments to index")]
    EmptyIndex,

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn provider(provider: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Provider {
            provider: provider.into(),
            message: message.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::provider("http", e)
    }
}
