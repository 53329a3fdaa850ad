//! Language-model backends.
//!
//! Every backend implements [`LanguageModelProvider`]. Backends that can push
//! tokens as they are produced report [`supports_streaming`] and implement
//! [`stream_generate`]; batch-only backends rely on the default, which
//! yields the finished text as a single fragment. The router decides how to
//! present each kind to callers.
//!
//! | Kind | Endpoint | Streaming |
//! |------|----------|-----------|
//! | `openai` | `POST {url}/chat/completions` (SSE) | yes |
//! | `azure` | `POST {url}/openai/deployments/{model}/chat/completions` (SSE) | yes |
//! | `gemini` | `POST {url}/models/{model}:streamGenerateContent?alt=sse` | yes |
//! | `ollama_client` | `POST {url}/api/chat` (NDJSON) | yes |
//! | `ollama_batch` | `POST {url}/api/generate` | no |
//!
//! [`supports_streaming`]: LanguageModelProvider::supports_streaming
//! [`stream_generate`]: LanguageModelProvider::stream_generate

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};

use crate::config::{ChatBackendConfig, ChatBackendKind};
use crate::error::{Error, Result};
use crate::models::FragmentStream;

/// A single-turn prompt with an optional system instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
}

impl Prompt {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            system: None,
            user: user.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    fn chat_messages(&self) -> Vec<Value> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": self.user}));
        messages
    }
}

#[async_trait]
pub trait LanguageModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether [`stream_generate`](Self::stream_generate) yields tokens as the
    /// backend emits them.
    fn supports_streaming(&self) -> bool {
        false
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String>;

    async fn stream_generate(&self, prompt: &Prompt) -> Result<FragmentStream> {
        let text = self.generate(prompt).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}

/// One parsed line of a streaming response.
#[derive(Debug, Clone, PartialEq)]
enum Frame {
    Text(String),
    Done,
    Skip,
}

/// Split a streaming HTTP body into lines and map each through `parse`.
///
/// Lines are cut on raw `\n` bytes and decoded whole, so a character split
/// across network chunks survives. A line that is not UTF-8 is an error.
fn line_fragments<S, B, E>(provider: String, body: S, parse: fn(&str) -> Result<Frame>) -> FragmentStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::try_stream! {
        let mut body = Box::pin(body);
        let mut buffer: Vec<u8> = Vec::new();
        'read: while let Some(bytes) = body.next().await {
            let bytes = bytes.map_err(|e| Error::provider(provider.as_str(), e))?;
            buffer.extend_from_slice(bytes.as_ref());
            while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                match parse(decode_line(&provider, &line)?.trim())? {
                    Frame::Text(text) if !text.is_empty() => yield text,
                    Frame::Done => break 'read,
                    _ => {}
                }
            }
        }
        if let Frame::Text(text) = parse(decode_line(&provider, &buffer)?.trim())? {
            if !text.is_empty() {
                yield text;
            }
        }
    };
    stream.boxed()
}

fn decode_line<'a>(provider: &str, line: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(line)
        .map_err(|e| Error::provider(provider, format!("stream line is not valid UTF-8: {e}")))
}

fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn parse_json(provider: &str, data: &str) -> Result<Value> {
    serde_json::from_str(data)
        .map_err(|e| Error::provider(provider, format!("malformed stream payload: {e}")))
}

async fn check_status(provider: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::provider(provider, format!("API error {status}: {body}")))
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn api_key(name: &str, env_var: &str) -> Result<String> {
    std::env::var(env_var).map_err(|_| {
        Error::Validation(format!(
            "chat backend '{name}' needs the {env_var} environment variable"
        ))
    })
}

// ============ OpenAI-compatible / Azure ============

enum OpenAiAuth {
    Bearer(String),
    AzureKey(String),
}

/// Chat Completions API, either OpenAI (or compatible) or an Azure deployment.
pub struct OpenAiChat {
    name: String,
    model: String,
    endpoint: String,
    auth: OpenAiAuth,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn openai(name: &str, config: &ChatBackendConfig) -> Result<Self> {
        let key = api_key(
            name,
            config.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY"),
        )?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(Self {
            name: name.to_string(),
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            auth: OpenAiAuth::Bearer(key),
            client: http_client(config.timeout_secs)?,
        })
    }

    pub fn azure(name: &str, config: &ChatBackendConfig) -> Result<Self> {
        let key = api_key(
            name,
            config.api_key_env.as_deref().unwrap_or("AZURE_OPENAI_API_KEY"),
        )?;
        let (Some(base), Some(version)) = (&config.url, &config.api_version) else {
            return Err(Error::Validation(format!(
                "chat backend '{name}': azure requires url and api_version"
            )));
        };
        Ok(Self {
            name: name.to_string(),
            model: config.model.clone(),
            endpoint: format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base.trim_end_matches('/'),
                config.model,
                version
            ),
            auth: OpenAiAuth::AzureKey(key),
            client: http_client(config.timeout_secs)?,
        })
    }

    async fn send(&self, prompt: &Prompt, stream: bool) -> Result<reqwest::Response> {
        let body = json!({
            "model": self.model,
            "messages": prompt.chat_messages(),
            "stream": stream,
        });
        let request = self.client.post(&self.endpoint).json(&body);
        let request = match &self.auth {
            OpenAiAuth::Bearer(key) => request.bearer_auth(key),
            OpenAiAuth::AzureKey(key) => request.header("api-key", key),
        };
        let response = request
            .send()
            .await
            .map_err(|e| Error::provider(self.name.as_str(), e))?;
        check_status(&self.name, response).await
    }
}

fn openai_frame(line: &str) -> Result<Frame> {
    let Some(data) = sse_data(line) else {
        return Ok(Frame::Skip);
    };
    if data == "[DONE]" {
        return Ok(Frame::Done);
    }
    let json = parse_json("openai", data)?;
    Ok(json
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .map(|s| Frame::Text(s.to_string()))
        .unwrap_or(Frame::Skip))
}

#[async_trait]
impl LanguageModelProvider for OpenAiChat {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let json: Value = self
            .send(prompt, false)
            .await?
            .json()
            .await
            .map_err(|e| Error::provider(self.name.as_str(), e))?;
        json.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::provider(self.name.as_str(), "response has no message content"))
    }

    async fn stream_generate(&self, prompt: &Prompt) -> Result<FragmentStream> {
        let response = self.send(prompt, true).await?;
        Ok(line_fragments(self.name.clone(), response.bytes_stream(), openai_frame))
    }
}

// ============ Gemini ============

pub struct GeminiChat {
    name: String,
    model: String,
    base_url: String,
    key: String,
    client: reqwest::Client,
}

impl GeminiChat {
    pub fn new(name: &str, config: &ChatBackendConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            model: config.model.clone(),
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            key: api_key(
                name,
                config.api_key_env.as_deref().unwrap_or("GEMINI_API_KEY"),
            )?,
            client: http_client(config.timeout_secs)?,
        })
    }

    async fn send(&self, prompt: &Prompt, method: &str) -> Result<reqwest::Response> {
        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt.user}]}],
        });
        if let Some(system) = &prompt.system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        let url = format!(
            "{}/models/{}:{}",
            self.base_url.trim_end_matches('/'),
            self.model,
            method
        );
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider(self.name.as_str(), e))?;
        check_status(&self.name, response).await
    }
}

fn gemini_text(json: &Value) -> Option<String> {
    let parts = json.pointer("/candidates/0/content/parts")?.as_array()?;
    Some(
        parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
    )
}

fn gemini_frame(line: &str) -> Result<Frame> {
    let Some(data) = sse_data(line) else {
        return Ok(Frame::Skip);
    };
    let json = parse_json("gemini", data)?;
    Ok(gemini_text(&json).map(Frame::Text).unwrap_or(Frame::Skip))
}

#[async_trait]
impl LanguageModelProvider for GeminiChat {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let json: Value = self
            .send(prompt, "generateContent")
            .await?
            .json()
            .await
            .map_err(|e| Error::provider(self.name.as_str(), e))?;
        gemini_text(&json)
            .ok_or_else(|| Error::provider(self.name.as_str(), "response has no candidates"))
    }

    async fn stream_generate(&self, prompt: &Prompt) -> Result<FragmentStream> {
        let response = self.send(prompt, "streamGenerateContent?alt=sse").await?;
        Ok(line_fragments(self.name.clone(), response.bytes_stream(), gemini_frame))
    }
}

// ============ Ollama ============

/// Ollama `/api/chat`, streamed as newline-delimited JSON.
pub struct OllamaChat {
    name: String,
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(name: &str, config: &ChatBackendConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            model: config.model.clone(),
            url: ollama_url(config),
            client: http_client(config.timeout_secs)?,
        })
    }

    async fn send(&self, prompt: &Prompt, stream: bool) -> Result<reqwest::Response> {
        let body = json!({
            "model": self.model,
            "messages": prompt.chat_messages(),
            "stream": stream,
        });
        let response = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::provider(
                    self.name.as_str(),
                    format!("connection error (is Ollama running at {}?): {e}", self.url),
                )
            })?;
        check_status(&self.name, response).await
    }
}

fn ollama_url(config: &ChatBackendConfig) -> String {
    config
        .url
        .as_deref()
        .unwrap_or("http://localhost:11434")
        .trim_end_matches('/')
        .to_string()
}

fn ollama_frame(line: &str) -> Result<Frame> {
    if line.is_empty() {
        return Ok(Frame::Skip);
    }
    let json = parse_json("ollama", line)?;
    if let Some(err) = json.get("error").and_then(Value::as_str) {
        return Err(Error::provider("ollama", err));
    }
    if let Some(text) = json.pointer("/message/content").and_then(Value::as_str) {
        if !text.is_empty() {
            return Ok(Frame::Text(text.to_string()));
        }
    }
    if json.get("done").and_then(Value::as_bool) == Some(true) {
        return Ok(Frame::Done);
    }
    Ok(Frame::Skip)
}

#[async_trait]
impl LanguageModelProvider for OllamaChat {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let json: Value = self
            .send(prompt, false)
            .await?
            .json()
            .await
            .map_err(|e| Error::provider(self.name.as_str(), e))?;
        json.pointer("/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::provider(self.name.as_str(), "response has no message content"))
    }

    async fn stream_generate(&self, prompt: &Prompt) -> Result<FragmentStream> {
        let response = self.send(prompt, true).await?;
        Ok(line_fragments(self.name.clone(), response.bytes_stream(), ollama_frame))
    }
}

/// Ollama `/api/generate` without streaming. Answers arrive whole.
pub struct OllamaGenerate {
    name: String,
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaGenerate {
    pub fn new(name: &str, config: &ChatBackendConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            model: config.model.clone(),
            url: ollama_url(config),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl LanguageModelProvider for OllamaGenerate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let mut body = json!({
            "model": self.model,
            "prompt": prompt.user,
            "stream": false,
        });
        if let Some(system) = &prompt.system {
            body["system"] = json!(system);
        }
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider(self.name.as_str(), e))?;
        let json: Value = check_status(&self.name, response)
            .await?
            .json()
            .await
            .map_err(|e| Error::provider(self.name.as_str(), e))?;
        json.get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::provider(self.name.as_str(), "response field missing"))
    }
}

/// Instantiate the backend described by one `[chat.backends.<name>]` table.
pub fn create_backend(
    name: &str,
    config: &ChatBackendConfig,
) -> Result<Arc<dyn LanguageModelProvider>> {
    Ok(match config.kind {
        ChatBackendKind::Openai => Arc::new(OpenAiChat::openai(name, config)?),
        ChatBackendKind::Azure => Arc::new(OpenAiChat::azure(name, config)?),
        ChatBackendKind::Gemini => Arc::new(GeminiChat::new(name, config)?),
        ChatBackendKind::OllamaClient => Arc::new(OllamaChat::new(name, config)?),
        ChatBackendKind::OllamaBatch => Arc::new(OllamaGenerate::new(name, config)?),
    })
}
