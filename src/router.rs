//! Answer provider routing.
//!
//! [`ChatRouter`] holds the configured language-model backends by name and
//! gives callers one contract regardless of backend kind:
//!
//! - [`ChatRouter::answer`] returns an [`Answer`] tagged by capability:
//!   `Streamed` for backends that push tokens, `Complete` for batch ones.
//! - [`ChatRouter::stream_chat`] always yields fragments. Batch answers are
//!   re-chunked into groups of `chunk_words` words with `chunk_delay` between
//!   them. Any backend failure becomes a single [`FALLBACK_MESSAGE`]
//!   fragment, so this stream never errors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, error, warn};

use crate::config::ChatConfig;
use crate::error::{Error, Result};
use crate::llm::{create_backend, LanguageModelProvider, Prompt};
use crate::models::Answer;

/// Emitted in place of an answer when the backend fails.
pub const FALLBACK_MESSAGE: &str =
    "Sorry, the chat service is temporarily unavailable. Please try again later.";

pub const DEFAULT_CHUNK_WORDS: usize = 5;
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(50);

pub struct ChatRouter {
    backends: BTreeMap<String, Arc<dyn LanguageModelProvider>>,
    default: Option<String>,
    chunk_words: usize,
    chunk_delay: Duration,
}

impl Default for ChatRouter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_WORDS, DEFAULT_CHUNK_DELAY)
    }
}

impl ChatRouter {
    pub fn new(chunk_words: usize, chunk_delay: Duration) -> Self {
        Self {
            backends: BTreeMap::new(),
            default: None,
            chunk_words: chunk_words.max(1),
            chunk_delay,
        }
    }

    /// Register a backend. The first one registered becomes the default.
    pub fn with_backend(
        mut self,
        name: impl Into<String>,
        provider: Arc<dyn LanguageModelProvider>,
    ) -> Self {
        let name = name.into();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.backends.insert(name, provider);
        self
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default = Some(name.into());
        self
    }

    /// Build every `[chat.backends.*]` entry.
    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        let mut router = Self::new(
            config.chunk_words,
            Duration::from_millis(config.chunk_delay_ms),
        );
        for (name, backend) in &config.backends {
            router = router.with_backend(name.clone(), create_backend(name, backend)?);
        }
        if let Some(default) = &config.provider {
            router = router.with_default(default.clone());
        }
        Ok(router)
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    pub fn default_backend(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn chunk_words(&self) -> usize {
        self.chunk_words
    }

    pub fn chunk_delay(&self) -> Duration {
        self.chunk_delay
    }

    /// Look up a backend by name. Unknown or absent names use the default.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn LanguageModelProvider>> {
        if let Some(name) = name {
            if let Some(provider) = self.backends.get(name) {
                return Ok(Arc::clone(provider));
            }
            warn!(backend = name, "unknown chat backend, using default");
        }
        self.default
            .as_deref()
            .and_then(|d| self.backends.get(d))
            .map(Arc::clone)
            .ok_or_else(|| Error::provider("router", "no chat backend is configured"))
    }

    /// Generate an answer, tagged by whether the backend streams natively.
    pub async fn answer(&self, prompt: &Prompt, backend: Option<&str>) -> Result<Answer> {
        let provider = self.resolve(backend)?;
        if provider.supports_streaming() {
            debug!(backend = provider.name(), "streaming answer");
            Ok(Answer::Streamed(provider.stream_generate(prompt).await?))
        } else {
            debug!(backend = provider.name(), "batch answer");
            Ok(Answer::Complete(provider.generate(prompt).await?))
        }
    }

    /// Direct chat without retrieval. Never fails; see [`FALLBACK_MESSAGE`].
    pub fn stream_chat(
        &self,
        message: &str,
        role_description: &str,
        backend: Option<&str>,
    ) -> BoxStream<'static, String> {
        let provider = match self.resolve(backend) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "chat backend unavailable");
                return futures::stream::once(async { FALLBACK_MESSAGE.to_string() }).boxed();
            }
        };
        let prompt = Prompt::new(message).with_system(role_description);
        let chunk_words = self.chunk_words;
        let delay = self.chunk_delay;

        let stream = async_stream::stream! {
            if provider.supports_streaming() {
                match provider.stream_generate(&prompt).await {
                    Ok(mut fragments) => {
                        while let Some(fragment) = fragments.next().await {
                            match fragment {
                                Ok(text) => yield text,
                                Err(e) => {
                                    error!(backend = provider.name(), error = %e, "chat stream failed");
                                    yield FALLBACK_MESSAGE.to_string();
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(backend = provider.name(), error = %e, "chat stream failed");
                        yield FALLBACK_MESSAGE.to_string();
                    }
                }
            } else {
                match provider.generate(&prompt).await {
                    Ok(text) => {
                        let mut chunks = simulate_stream(&text, chunk_words, delay);
                        while let Some(chunk) = chunks.next().await {
                            yield chunk;
                        }
                    }
                    Err(e) => {
                        error!(backend = provider.name(), error = %e, "chat request failed");
                        yield FALLBACK_MESSAGE.to_string();
                    }
                }
            }
        };
        stream.boxed()
    }
}

/// Split text into groups of `n` words.
///
/// Every group but the last carries one trailing space, so concatenating the
/// groups gives the words joined by single spaces.
pub fn rechunk_words(text: &str, n: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let groups = words.chunks(n.max(1)).count();
    words
        .chunks(n.max(1))
        .enumerate()
        .map(|(i, group)| {
            let mut chunk = group.join(" ");
            if i + 1 < groups {
                chunk.push(' ');
            }
            chunk
        })
        .collect()
}

/// Present finished text as a paced stream of word groups.
pub fn simulate_stream(text: &str, n: usize, delay: Duration) -> BoxStream<'static, String> {
    let chunks = rechunk_words(text, n);
    let stream = async_stream::stream! {
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            yield chunk;
            if i < last && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::models::FragmentStream;

    struct Batch(&'static str);

    #[async_trait]
    impl LanguageModelProvider for Batch {
        fn name(&self) -> &str {
            "batch"
        }
        async fn generate(&self, _prompt: &Prompt) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Broken;

    #[async_trait]
    impl LanguageModelProvider for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn supports_streaming(&self) -> bool {
            true
        }
        async fn generate(&self, _prompt: &Prompt) -> Result<String> {
            Err(Error::provider("broken", "connection refused"))
        }
        async fn stream_generate(&self, _prompt: &Prompt) -> Result<FragmentStream> {
            Ok(futures::stream::iter(vec![
                Ok("partial ".to_string()),
                Err(Error::provider("broken", "stream reset")),
            ])
            .boxed())
        }
    }

    /// Native streamer that counts how many fragments were pulled.
    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl LanguageModelProvider for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn supports_streaming(&self) -> bool {
            true
        }
        async fn generate(&self, _prompt: &Prompt) -> Result<String> {
            Ok(String::new())
        }
        async fn stream_generate(&self, _prompt: &Prompt) -> Result<FragmentStream> {
            let pulled = Arc::clone(&self.0);
            Ok(futures::stream::iter(0..100)
                .map(move |i| {
                    pulled.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("w{i} "))
                })
                .boxed())
        }
    }

    #[test]
    fn rechunk_counts_and_concatenation() {
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let chunks = rechunk_words(text, 5);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "one two three four five ");
        assert_eq!(chunks[2], "eleven twelve");
        assert_eq!(chunks.concat(), text);

        for n_words in [1usize, 4, 5, 6, 10, 23] {
            let text: Vec<String> = (0..n_words).map(|i| format!("w{i}")).collect();
            let text = text.join(" ");
            let chunks = rechunk_words(&text, 5);
            assert_eq!(chunks.len(), n_words.div_ceil(5));
            assert_eq!(chunks.concat(), text);
        }
        assert!(rechunk_words("   ", 5).is_empty());
    }

    #[tokio::test]
    async fn batch_backend_is_rechunked() {
        let router = ChatRouter::new(2, Duration::ZERO)
            .with_backend("b", Arc::new(Batch("a b c d e")));
        let parts: Vec<String> = router.stream_chat("hi", "role", None).collect().await;
        assert_eq!(parts, vec!["a b ", "c d ", "e"]);
    }

    #[tokio::test]
    async fn dropped_chat_stream_stops_pulling_from_backend() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let router = ChatRouter::default().with_backend("c", Arc::new(Counting(Arc::clone(&pulled))));
        let mut parts = router.stream_chat("hi", "role", None);
        assert_eq!(parts.next().await.as_deref(), Some("w0 "));
        drop(parts);
        tokio::task::yield_now().await;
        assert_eq!(pulled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn simulated_stream_emits_first_group_without_waiting() {
        let router = ChatRouter::new(1, Duration::from_secs(3600))
            .with_backend("b", Arc::new(Batch("a b c")));
        let mut parts = router.stream_chat("hi", "role", None);
        let first = tokio::time::timeout(Duration::from_secs(1), parts.next())
            .await
            .expect("first group is not delayed");
        assert_eq!(first.as_deref(), Some("a "));
        // The pending sleep goes away with the stream.
        drop(parts);
    }

    #[tokio::test]
    async fn answer_is_tagged_by_capability() {
        let router = ChatRouter::default()
            .with_backend("batch", Arc::new(Batch("done")))
            .with_backend("broken", Arc::new(Broken));
        let prompt = Prompt::new("q");
        assert!(matches!(
            router.answer(&prompt, Some("batch")).await.unwrap(),
            Answer::Complete(ref t) if t == "done"
        ));
        assert!(matches!(
            router.answer(&prompt, Some("broken")).await.unwrap(),
            Answer::Streamed(_)
        ));
    }

    #[tokio::test]
    async fn failure_yields_single_fallback_after_partial_output() {
        let router = ChatRouter::default().with_backend("broken", Arc::new(Broken));
        let parts: Vec<String> = router.stream_chat("hi", "role", None).collect().await;
        assert_eq!(parts, vec!["partial ".to_string(), FALLBACK_MESSAGE.to_string()]);
    }

    #[tokio::test]
    async fn no_backend_yields_fallback() {
        let parts: Vec<String> = ChatRouter::default()
            .stream_chat("hi", "role", None)
            .collect()
            .await;
        assert_eq!(parts, vec![FALLBACK_MESSAGE.to_string()]);
    }

    #[test]
    fn unknown_backend_falls_back_to_default() {
        let router = ChatRouter::default()
            .with_backend("first", Arc::new(Batch("1")))
            .with_backend("second", Arc::new(Batch("2")));
        assert_eq!(router.resolve(Some("missing")).unwrap().name(), "batch");
        assert_eq!(router.default_backend(), Some("first"));
        assert_eq!(router.backend_names(), vec!["first", "second"]);
    }
}
