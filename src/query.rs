//! Retrieval query engine.
//!
//! A query runs in five steps:
//!
//! 1. **Expand**: ask the chosen backend for up to `num_queries - 1`
//!    paraphrases of the question. Failure here only costs recall.
//! 2. **Retrieve**: hybrid search for every phrasing against the handle's
//!    collection.
//! 3. **Fuse**: merge the lists keeping each segment's best score, top
//!    `similarity_top_k`.
//! 4. **Attribute**: build [`SourceRef`]s in rank order.
//! 5. **Answer**: reorder the segments for long context, build the prompt,
//!    and hand it to the router.
//!
//! `backend` names a `[chat.backends]` entry; `None` or an unknown name uses
//! the router's default.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::llm::Prompt;
use crate::models::{IndexHandle, QueryResult, ScoredSegment, SourceRef};
use crate::router::ChatRouter;
use crate::search::{fuse_by_max, long_context_reorder};
use crate::store::{HybridParams, VectorStore};

pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub params: HybridParams,
    /// Total phrasings searched, including the original question.
    pub num_queries: usize,
    pub role_description: String,
}

impl QuerySettings {
    pub fn from_config(retrieval: &RetrievalConfig, role_description: &str) -> Self {
        Self {
            params: HybridParams {
                dense_top_k: retrieval.similarity_top_k,
                sparse_top_k: retrieval.sparse_top_k,
                alpha: retrieval.hybrid_alpha,
            },
            num_queries: retrieval.num_queries,
            role_description: role_description.to_string(),
        }
    }
}

pub struct QueryEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    router: Arc<ChatRouter>,
    settings: QuerySettings,
}

impl QueryEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        router: Arc<ChatRouter>,
        settings: QuerySettings,
    ) -> Self {
        Self {
            embedder,
            store,
            router,
            settings,
        }
    }

    pub fn router(&self) -> &Arc<ChatRouter> {
        &self.router
    }

    pub async fn query(
        &self,
        handle: &IndexHandle,
        question: &str,
        backend: Option<&str>,
    ) -> Result<QueryResult> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::Validation("question must not be empty".into()));
        }

        let hits = self.retrieve_with(handle, question, backend).await?;
        let sources = hits.iter().map(source_ref).collect();
        let prompt = build_answer_prompt(
            question,
            &long_context_reorder(hits),
            &self.settings.role_description,
        );
        let answer = self.router.answer(&prompt, backend).await?;
        Ok(QueryResult { answer, sources })
    }

    /// Expanded, fused retrieval without generating an answer.
    pub async fn retrieve(&self, handle: &IndexHandle, question: &str) -> Result<Vec<ScoredSegment>> {
        self.retrieve_with(handle, question, None).await
    }

    async fn retrieve_with(
        &self,
        handle: &IndexHandle,
        question: &str,
        backend: Option<&str>,
    ) -> Result<Vec<ScoredSegment>> {
        let mut queries = vec![question.to_string()];
        queries.extend(self.expand(question, backend).await);

        let mut lists = Vec::with_capacity(queries.len());
        for q in &queries {
            let vector = self.embedder.embed(q).await?;
            let hits = self
                .store
                .hybrid_search(handle.collection(), q, &vector, self.settings.params)
                .await?;
            lists.push(hits);
        }
        let fused = fuse_by_max(lists, self.settings.params.dense_top_k);
        debug!(
            collection = handle.collection(),
            queries = queries.len(),
            hits = fused.len(),
            "retrieval complete"
        );
        Ok(fused)
    }

    async fn expand(&self, question: &str, backend: Option<&str>) -> Vec<String> {
        let extra = self.settings.num_queries.saturating_sub(1);
        if extra == 0 {
            return Vec::new();
        }
        let provider = match self.router.resolve(backend) {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };
        match provider.generate(&query_expansion_prompt(question, extra)).await {
            Ok(text) => parse_generated_queries(&text, question, extra),
            Err(e) => {
                warn!(error = %e, "query expansion failed, searching the original question only");
                Vec::new()
            }
        }
    }
}

fn query_expansion_prompt(question: &str, n: usize) -> Prompt {
    Prompt::new(format!(
        "You are a helpful assistant that generates multiple search queries based on a \
         single input query. Generate {n} search queries, one on each line, related to \
         the following input query:\nQuery: {question}\nQueries:\n"
    ))
}

/// One query per non-empty line, list markers stripped, original and
/// duplicates dropped, at most `n`.
fn parse_generated_queries(text: &str, original: &str, n: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in text.lines() {
        let q = strip_list_marker(line.trim());
        if q.is_empty() || q.eq_ignore_ascii_case(original) || out.iter().any(|o| o == q) {
            continue;
        }
        out.push(q.to_string());
        if out.len() == n {
            break;
        }
    }
    out
}

/// `"1. foo"`, `"2) foo"`, `"- foo"`, `"* foo"` → `"foo"`.
fn strip_list_marker(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix(['-', '*']) {
        return rest.trim_start();
    }
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(['.', ')']) {
            return rest.trim_start();
        }
    }
    line
}

fn build_answer_prompt(question: &str, context: &[ScoredSegment], role: &str) -> Prompt {
    let context_str = context
        .iter()
        .map(|hit| {
            let file = hit
                .segment
                .source_file
                .as_deref()
                .map(clean_file_name)
                .unwrap_or(UNKNOWN);
            match hit.segment.page {
                Some(page) => format!("[{file}, page {page}]\n{}", hit.segment.text),
                None => format!("[{file}]\n{}", hit.segment.text),
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    Prompt::new(format!(
        "Context information is below.\n---------------------\n{context_str}\n\
         ---------------------\nGiven the context information and not prior knowledge, \
         answer the query.\nQuery: {question}\nAnswer: "
    ))
    .with_system(role)
}

/// Source attribution for one retrieved segment.
pub fn source_ref(hit: &ScoredSegment) -> SourceRef {
    SourceRef {
        file_name: hit
            .segment
            .source_file
            .as_deref()
            .map(clean_file_name)
            .unwrap_or(UNKNOWN)
            .to_string(),
        page: hit
            .segment
            .page
            .map(|p| p.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string()),
        score: hit
            .score
            .map(|s| (s.clamp(0.0, 1.0) * 1000.0).round() / 1000.0)
            .unwrap_or(0.0),
    }
}

/// Strip a numeric upload-timestamp prefix: `1731000000_report.pdf` → `report.pdf`.
pub fn clean_file_name(name: &str) -> &str {
    match name.split_once('_') {
        Some((prefix, rest))
            if !prefix.is_empty() && !rest.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) =>
        {
            rest
        }
        _ => name,
    }
}
