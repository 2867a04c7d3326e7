//! Chat-completion client.
//!
//! `OpenAiClient` posts the assembled messages with `stream: true` and turns the
//! Server-Sent Events body into a stream of text fragments. Failures are returned to
//! the caller as `CompletionError`; nothing here retries.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, instrument};

use crate::config::{Credential, Model};
use crate::constants::DEFAULT_API_BASE;
use crate::conversation::Message;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("the API key was rejected: {0}")]
    Unauthorized(String),
    #[error("rate limited by the provider: {0}")]
    RateLimited(String),
    #[error("the provider rejected the request: {0}")]
    BadRequest(String),
    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("malformed response stream: {0}")]
    MalformedStream(String),
    #[error("the provider reported an error mid-reply: {0}")]
    Stream(String),
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, CompletionError>> + Send>>;

/// Parameters of one completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: Model,
    pub temperature: f32,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Start a streamed completion. Errors before the first fragment come back here;
    /// errors after that arrive as items of the stream.
    async fn complete(
        &self,
        credential: &Credential,
        request: CompletionRequest,
    ) -> Result<FragmentStream, CompletionError>;
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: Model,
    messages: &'a [Message],
    temperature: f32,
    stream: bool,
}

pub struct OpenAiClient {
    client: Client,
    api_base: String,
}

impl OpenAiClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE)
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    #[instrument(skip_all, fields(model = %request.model, messages = request.messages.len()))]
    async fn complete(
        &self,
        credential: &Credential,
        request: CompletionRequest,
    ) -> Result<FragmentStream, CompletionError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = ChatCompletionBody {
            model: request.model,
            messages: &request.messages,
            temperature: request.temperature,
            stream: true,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(credential.expose())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(%status, "Chat completion request failed");
            return Err(status_error(status, &error_body));
        }
        debug!("Chat completion stream opened");

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer = SseBuffer::default();
            let mut ended = false;
            while !ended {
                let lines = match bytes.next().await {
                    Some(Ok(chunk)) => buffer.push(&chunk),
                    Some(Err(e)) => {
                        error!("Stream error: {}", e);
                        yield Err(CompletionError::Network(e));
                        return;
                    }
                    None => {
                        ended = true;
                        buffer.finish().into_iter().collect()
                    }
                };
                for line in lines {
                    match parse_sse_line(&line) {
                        Ok(SseLine::Fragment(text)) => yield Ok(text),
                        Ok(SseLine::Done) => return,
                        Ok(SseLine::Skip) => {}
                        Err(e) => {
                            error!("Chat completion stream failed: {}", e);
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            // Body closed without the [DONE] marker: the reply may be cut short.
            error!("Chat completion stream ended before [DONE]");
            yield Err(CompletionError::MalformedStream(
                "stream ended before [DONE]".to_string(),
            ));
        };
        Ok(Box::pin(stream))
    }
}

/// Map a non-2xx response to an error, preferring the provider's own message.
fn status_error(status: StatusCode, body: &str) -> CompletionError {
    let message = provider_message(body).unwrap_or_else(|| body.trim().to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CompletionError::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => CompletionError::RateLimited(message),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            CompletionError::BadRequest(message)
        }
        other => CompletionError::Provider {
            status: other.as_u16(),
            message,
        },
    }
}

fn provider_message(body: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    parsed["error"]["message"].as_str().map(str::to_string)
}

/// Collects bytes and hands back complete lines; a trailing partial line waits for
/// the next chunk.
#[derive(Default)]
struct SseBuffer {
    pending: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// The unterminated tail left once the body has ended, if any.
    fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, CompletionError> {
    // Comments, event names and ids carry nothing we use.
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let parsed: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| CompletionError::MalformedStream(format!("{}: {}", e, data)))?;

    if let Some(err) = parsed.get("error") {
        let message = err["message"]
            .as_str()
            .unwrap_or("unknown provider error")
            .to_string();
        return Err(CompletionError::Stream(message));
    }

    match parsed["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => Ok(SseLine::Fragment(text.to_string())),
        _ => Ok(SseLine::Skip),
    }
}
