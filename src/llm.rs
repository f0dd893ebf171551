//! Chat-completion models.
//!
//! [`ChatModel::stream_chat`] pushes text deltas into a channel as they
//! arrive and returns the full answer. The OpenAI-compatible client talks to
//! `POST {base_url}/chat/completions` with `stream: true` and reads the
//! server-sent events line by line (see [`parse_sse_line`]) until
//! `data: [DONE]`. Both the `openai` and `ollama` providers use it; Ollama
//! exposes the same API under `/v1`.
//!
//! Establishing the stream is retried like embedding calls; once tokens are
//! flowing a failure ends the answer with an error. `llm.timeout_secs`
//! bounds connecting and each wait for the next piece of the stream, never
//! the length of the whole answer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::embedding::{base_url, send_with_retry};
use crate::error::{KbError, KbResult};
use crate::models::MessageRole;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model used when the assistant doesn't name one.
    fn default_model(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Stream the completion into `sink`, returning the whole text. A closed
    /// `sink` stops generation early without an error.
    async fn stream_chat(&self, request: &ChatRequest, sink: mpsc::Sender<String>)
        -> KbResult<String>;
}

pub fn create_chat_model(config: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChatModel)),
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
            Ok(Arc::new(OpenAiCompatible::new(
                config,
                base_url(config.base_url.as_deref(), OPENAI_BASE_URL),
                Some(api_key),
            )?))
        }
        "ollama" => Ok(Arc::new(OpenAiCompatible::new(
            config,
            base_url(config.base_url.as_deref(), OLLAMA_BASE_URL),
            std::env::var("OLLAMA_API_KEY").ok(),
        )?)),
        other => anyhow::bail!("Unknown llm provider: {}", other),
    }
}

// ============ Disabled ============

pub struct DisabledChatModel;

#[async_trait]
impl ChatModel for DisabledChatModel {
    fn default_model(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn stream_chat(
        &self,
        _request: &ChatRequest,
        _sink: mpsc::Sender<String>,
    ) -> KbResult<String> {
        Err(KbError::Disabled(
            "chat requires an llm provider. Set [llm] provider in config.".to_string(),
        ))
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAiCompatible {
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiCompatible {
    pub fn new(config: &LlmConfig, base_url: String, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            base_url,
            api_key,
            model: config.model.clone(),
            max_retries: config.max_retries,
            client: streaming_client(config.timeout_secs)?,
        })
    }
}

fn streaming_client(timeout_secs: u64) -> Result<reqwest::Client> {
    let limit = Duration::from_secs(timeout_secs);
    Ok(reqwest::Client::builder()
        .connect_timeout(limit)
        .read_timeout(limit)
        .build()?)
}

/// One line of an OpenAI-style event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    Delta(String),
    Done,
    Ignore,
}

/// Interpret one line of a chat-completions event stream.
///
/// Non-`data:` lines (comments, `event:`, blank keep-alives) and chunks
/// without content (role announcements, finish markers) are ignored. An
/// `error` object in a data line is reported as an upstream error.
pub fn parse_sse_line(line: &str) -> KbResult<SseLine> {
    let line = line.trim_end_matches('\r');
    let payload = match line.strip_prefix("data:") {
        Some(p) => p.trim(),
        None => return Ok(SseLine::Ignore),
    };
    if payload == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if payload.is_empty() {
        return Ok(SseLine::Ignore);
    }

    let json: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| KbError::Upstream(format!("malformed stream chunk: {}", e)))?;
    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(KbError::Upstream(message));
    }

    let content = json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    if content.is_empty() {
        Ok(SseLine::Ignore)
    } else {
        Ok(SseLine::Delta(content.to_string()))
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatible {
    fn default_model(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        request: &ChatRequest,
        sink: mpsc::Sender<String>,
    ) -> KbResult<String> {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": true,
        });
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = send_with_retry("LLM", self.max_retries, || {
            let builder = self.client.post(&url).json(&body);
            match &self.api_key {
                Some(key) => builder.bearer_auth(key),
                None => builder,
            }
        })
        .await
        .map_err(|e| KbError::Upstream(e.to_string()))?;

        let mut answer = String::new();
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        'read: while let Some(piece) = stream.next().await {
            let piece = piece.map_err(|e| KbError::Upstream(format!("stream interrupted: {}", e)))?;
            buffer.extend_from_slice(&piece);

            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                match parse_sse_line(&String::from_utf8_lossy(&line[..newline]))? {
                    SseLine::Delta(text) => {
                        answer.push_str(&text);
                        if sink.send(text).await.is_err() {
                            tracing::debug!("chat client went away, stopping stream");
                            break 'read;
                        }
                    }
                    SseLine::Done => break 'read,
                    SseLine::Ignore => {}
                }
            }
        }

        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_lines_yield_content() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"},"index":0}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), SseLine::Delta("Hel".into()));
    }

    #[test]
    fn done_and_noise_lines() {
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line("data:[DONE]\r").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Ignore);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Ignore);
        assert_eq!(parse_sse_line("event: message").unwrap(), SseLine::Ignore);
    }

    #[test]
    fn role_only_chunks_are_ignored() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), SseLine::Ignore);
        let finish = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_sse_line(finish).unwrap(), SseLine::Ignore);
    }

    #[test]
    fn errors_in_stream_are_upstream_errors() {
        let line = r#"data: {"error":{"message":"rate limited"}}"#;
        match parse_sse_line(line) {
            Err(KbError::Upstream(msg)) => assert_eq!(msg, "rate limited"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            parse_sse_line("data: {not json"),
            Err(KbError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn disabled_model_reports_disabled() {
        let model = create_chat_model(&LlmConfig::default()).unwrap();
        assert!(!model.is_enabled());
        let (tx, _rx) = mpsc::channel(1);
        let request = ChatRequest {
            model: "x".into(),
            messages: vec![ChatMessage::new(MessageRole::User, "hi")],
            temperature: 0.2,
            max_tokens: None,
        };
        assert!(matches!(
            model.stream_chat(&request, tx).await,
            Err(KbError::Disabled(_))
        ));
    }

    #[test]
    fn messages_serialize_with_lowercase_roles() {
        let json = serde_json::to_value(ChatMessage::new(MessageRole::System, "be nice")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "system", "content": "be nice"}));
    }
}
