//! # docchat
//!
//! Upload documents, ask questions about them, and get answers streamed back
//! word-group by word-group with source citations.
//!
//! Uploads are chunked into segments, embedded, and indexed in the
//! background. Questions are expanded into several phrasings, answered from a
//! hybrid (keyword + vector) search over the segments, and streamed as
//! `data: {json}` events.
//!
//! ## Architecture
//!
//! ```text
//!  upload ─▶ ┌─────────────┐   ┌────────┐   ┌─────────────┐
//!            │ Coordinator │──▶│ Loader │──▶│ IndexBuilder│──▶ VectorStore
//!            └──────┬──────┘   └────────┘   └─────────────┘        │
//!                   │ IndexHandle                                  │
//!                   ▼                                              │
//!  question ─▶ ┌─────────────┐ ◀──────────── hybrid search ────────┘
//!              │ QueryEngine │──▶ ChatRouter ──▶ backend
//!              └──────┬──────┘
//!                     ▼
//!                  Encoder ──▶ streaming* → sources → complete
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`files`] | Upload storage |
//! | [`chunk`] | Text chunking |
//! | [`loader`] | Document extraction and segmentation |
//! | [`embedding`] | Embedding providers |
//! | [`store`] | Vector store and in-memory hybrid index |
//! | [`search`] | Score normalization, fusion, and reordering |
//! | [`progress`] | Indexing progress reporting |
//! | [`index`] | Batched index builds |
//! | [`llm`] | Language model backends |
//! | [`router`] | Backend routing and simulated streaming |
//! | [`query`] | Retrieval and answer generation |
//! | [`encoder`] | Answer event stream |
//! | [`coordinator`] | Document lifecycle and background indexing |
//! | [`server`] | HTTP server |

pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod embedding;
pub mod encoder;
pub mod error;
pub mod files;
pub mod index;
pub mod llm;
pub mod loader;
pub mod models;
pub mod progress;
pub mod query;
pub mod router;
pub mod search;
pub mod server;
pub mod store;
