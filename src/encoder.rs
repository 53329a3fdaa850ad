//! Answer stream encoding.
//!
//! Turns the outcome of a query into the ordered event sequence the caller
//! sees:
//!
//! ```text
//! streaming* → sources? → complete      (answer produced)
//! error                                 (query failed, or the stream broke)
//! ```
//!
//! Each event is framed as `data: {json}\n\n` by [`encode_frame`].

use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::models::{Answer, AnswerChunk, QueryResult, SourceRef};
use crate::router::{simulate_stream, DEFAULT_CHUNK_DELAY, DEFAULT_CHUNK_WORDS};

/// Sent as the only answer text when retrieval produced nothing usable.
pub const NO_ANSWER_MESSAGE: &str =
    "Sorry, no relevant information was found in the uploaded documents.";

#[derive(Debug, Clone, Copy)]
pub struct EncoderSettings {
    /// Sources listed in the `sources` event, 1 to 3.
    pub max_sources: usize,
    /// Word-group size used to stream a finished answer.
    pub chunk_words: usize,
    pub chunk_delay: Duration,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            max_sources: 3,
            chunk_words: DEFAULT_CHUNK_WORDS,
            chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }
}

/// `data: {json}\n\n`
pub fn encode_frame(chunk: &AnswerChunk) -> String {
    // AnswerChunk holds only strings, numbers and enums; serialization
    // cannot fail.
    let json = serde_json::to_string(chunk).unwrap_or_else(|_| {
        r#"{"status":"error","error":"failed to encode event"}"#.to_string()
    });
    format!("data: {json}\n\n")
}

/// Human-readable block listing the top sources.
pub fn sources_block(sources: &[SourceRef]) -> String {
    let mut block = String::from("\n\n📖 Sources:");
    for (i, source) in sources.iter().enumerate() {
        if source.page == crate::query::UNKNOWN {
            block.push_str(&format!(
                "\n{}. {} (relevance: {:.2})",
                i + 1,
                source.file_name,
                source.score
            ));
        } else {
            block.push_str(&format!(
                "\n{}. {} - page {} (relevance: {:.2})",
                i + 1,
                source.file_name,
                source.page,
                source.score
            ));
        }
    }
    block
}

/// Event stream for one query outcome.
///
/// The stream is lazy: fragments are pulled from the answer only as the
/// caller consumes events, and dropping the stream drops the producer.
pub fn answer_events(
    result: Result<QueryResult>,
    settings: EncoderSettings,
) -> BoxStream<'static, AnswerChunk> {
    let QueryResult { answer, sources } = match result {
        Ok(r) => r,
        Err(e) => {
            log_failure(&e);
            return futures::stream::once(async move { AnswerChunk::error(e.to_string()) }).boxed();
        }
    };

    let stream = async_stream::stream! {
        let mut produced = false;
        match answer {
            Answer::Streamed(mut fragments) => {
                while let Some(fragment) = fragments.next().await {
                    match fragment {
                        Ok(text) if text.trim().is_empty() => {}
                        Ok(text) => {
                            produced = true;
                            yield AnswerChunk::streaming(text);
                        }
                        Err(e) => {
                            log_failure(&e);
                            yield AnswerChunk::error(e.to_string());
                            return;
                        }
                    }
                }
            }
            Answer::Complete(text) => {
                let mut chunks = simulate_stream(&text, settings.chunk_words, settings.chunk_delay);
                while let Some(chunk) = chunks.next().await {
                    produced = true;
                    yield AnswerChunk::streaming(chunk);
                }
            }
        }

        if !produced {
            debug!("answer was empty");
            yield AnswerChunk::streaming(NO_ANSWER_MESSAGE);
        }

        if !sources.is_empty() {
            let top: Vec<SourceRef> = sources
                .into_iter()
                .take(settings.max_sources.clamp(1, 3))
                .collect();
            yield AnswerChunk::sources(sources_block(&top), top);
        }

        yield AnswerChunk::complete();
    };
    stream.boxed()
}

/// [`answer_events`], framed for the wire.
pub fn answer_frames(
    result: Result<QueryResult>,
    settings: EncoderSettings,
) -> BoxStream<'static, String> {
    answer_events(result, settings)
        .map(|chunk| encode_frame(&chunk))
        .boxed()
}

/// Events for a direct chat stream, which never fails.
pub fn chat_events(fragments: BoxStream<'static, String>) -> BoxStream<'static, AnswerChunk> {
    fragments
        .map(AnswerChunk::streaming)
        .chain(futures::stream::once(async { AnswerChunk::complete() }))
        .boxed()
}

fn log_failure(e: &Error) {
    match e {
        Error::NotInitialized | Error::Validation(_) => debug!(error = %e, "query rejected"),
        other => error!(error = %other, "query failed"),
    }
}
