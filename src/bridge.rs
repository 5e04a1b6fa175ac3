//! Conversation bridge between the voice loop and the language model
//!
//! Turns a transcript into a model request built from the user's system
//! prompt, enabled rules and recent history, streams the reply back token by
//! token and persists it once the backend reports completion. A failed or
//! cancelled stream leaves storage untouched.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::LlmConfig;
use crate::db::{ConversationStore, Turn, TurnRole};
use crate::settings::{Settings, SettingsStore};
use crate::{Error, Result};

/// Prior turns included in each request
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Request sent to the model backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRequest {
    pub prompt: String,
    pub conversation_id: String,
}

/// One event from a streaming reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    Token(String),
    Error(String),
    Done,
}

/// Streaming language model endpoint
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Open a reply stream for `request`
    ///
    /// # Errors
    ///
    /// Returns `Error::Agent` if the request cannot be started
    async fn stream(&self, request: ModelRequest) -> Result<BoxStream<'static, Result<ModelEvent>>>;
}

/// Wire format of a streamed line
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Token { content: String },
    Error { message: String },
    Done,
    #[serde(other)]
    Unknown,
}

/// Splits a byte stream into newline-delimited JSON events
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    /// Feed a chunk, returning every event completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<ModelEvent>> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line without a newline
    pub fn finish(&mut self) -> Option<Result<ModelEvent>> {
        let line = std::mem::take(&mut self.buf);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Option<Result<ModelEvent>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    match serde_json::from_str::<WireEvent>(text) {
        Ok(WireEvent::Token { content }) => Some(Ok(ModelEvent::Token(content))),
        Ok(WireEvent::Error { message }) => Some(Ok(ModelEvent::Error(message))),
        Ok(WireEvent::Done) => Some(Ok(ModelEvent::Done)),
        Ok(WireEvent::Unknown) => {
            tracing::debug!(line = %text, "ignoring unknown stream event");
            None
        }
        Err(e) => Some(Err(Error::Agent(format!("malformed stream line: {e}")))),
    }
}

/// Model backend speaking NDJSON over HTTP
pub struct HttpModelBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpModelBackend {
    /// Create a new backend client
    ///
    /// # Errors
    ///
    /// Returns error if the URL is empty
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(Error::Config("llm.url required".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    async fn stream(&self, request: ModelRequest) -> Result<BoxStream<'static, Result<ModelEvent>>> {
        tracing::debug!(conversation_id = %request.conversation_id, "dispatching to model");

        let response = self
            .client
            .post(&self.url)
            .header("Accept", "application/x-ndjson")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("model request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!("model backend error {status}: {body}")));
        }

        let state = (
            response.bytes_stream().boxed(),
            NdjsonDecoder::default(),
            VecDeque::new(),
            false,
        );

        let events = futures::stream::unfold(
            state,
            |(mut bytes, mut decoder, mut pending, mut eof)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((event, (bytes, decoder, pending, eof)));
                    }
                    if eof {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                        Some(Err(e)) => {
                            eof = true;
                            pending.push_back(Err(Error::Agent(format!(
                                "model stream interrupted: {e}"
                            ))));
                        }
                        None => {
                            eof = true;
                            pending.extend(decoder.finish());
                        }
                    }
                }
            },
        );

        Ok(events.boxed())
    }
}

/// Builds requests, streams replies and persists both sides
pub struct ConversationBridge {
    store: Arc<dyn ConversationStore>,
    backend: Arc<dyn ModelBackend>,
    settings: Arc<dyn SettingsStore>,
    history_limit: usize,
}

impl ConversationBridge {
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        backend: Arc<dyn ModelBackend>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            store,
            backend,
            settings,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Reuse `existing` if it is still stored, otherwise create a conversation
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub fn ensure_conversation(&self, existing: Option<&str>) -> Result<String> {
        if let Some(id) = existing {
            if self.store.get_conversation(id)?.is_some() {
                return Ok(id.to_string());
            }
            tracing::warn!(conversation_id = %id, "conversation vanished, starting a new one");
        }

        let conversation = self.store.create_conversation(Some("Voice conversation"))?;
        tracing::info!(conversation_id = %conversation.id, "conversation started");
        Ok(conversation.id)
    }

    /// Persist one turn
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub fn append_turn(&self, conversation_id: &str, role: TurnRole, text: &str) -> Result<Turn> {
        self.store.append_turn(conversation_id, role, text)
    }

    /// Send `transcript` to the model and stream the reply into `on_token`
    ///
    /// The user turn is expected to be persisted already. The concatenated
    /// tokens are persisted verbatim as an assistant turn and returned.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if `cancel` fires, `Error::Agent` if the
    /// backend fails; neither persists anything
    pub async fn dispatch<F>(
        &self,
        conversation_id: &str,
        transcript: &str,
        mut on_token: F,
        cancel: &CancellationToken,
    ) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let settings = self.settings.load();
        let history = self.store.recent_turns(conversation_id, self.history_limit)?;
        let request = ModelRequest {
            prompt: build_prompt(&settings, &history, transcript),
            conversation_id: conversation_id.to_string(),
        };

        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            stream = self.backend.stream(request) => stream?,
        };

        let mut reply = String::new();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!(conversation_id, partial_len = reply.len(), "dispatch cancelled, discarding partial reply");
                    return Err(Error::Cancelled);
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(ModelEvent::Token(token))) => {
                    on_token(&token);
                    reply.push_str(&token);
                }
                Some(Ok(ModelEvent::Done)) => break,
                Some(Ok(ModelEvent::Error(message))) => {
                    tracing::error!(conversation_id, error = %message, "model reported an error");
                    return Err(Error::Agent(message));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(Error::Agent("model stream ended before completion".to_string()));
                }
            }
        }

        if reply.trim().is_empty() {
            return Err(Error::Agent("model returned an empty reply".to_string()));
        }

        self.store
            .append_turn(conversation_id, TurnRole::Assistant, &reply)?;
        tracing::info!(conversation_id, reply_len = reply.len(), "assistant turn persisted");

        Ok(reply)
    }
}

/// Assemble the prompt: system prompt, rules, history, then the new utterance
///
/// A trailing user turn identical to `transcript` is the one just persisted
/// and is left out of the history block.
#[must_use]
pub fn build_prompt(settings: &Settings, history: &[Turn], transcript: &str) -> String {
    let mut parts = vec![settings.system_prompt.clone()];

    let rules = settings.enabled_rules();
    if !rules.is_empty() {
        let list: Vec<String> = rules.iter().map(|r| format!("- {r}")).collect();
        parts.push(format!("<rules>\n{}\n</rules>", list.join("\n")));
    }

    let history = match history.split_last() {
        Some((last, rest)) if last.role == TurnRole::User && last.content == transcript => rest,
        _ => history,
    };
    if !history.is_empty() {
        let lines: Vec<String> = history
            .iter()
            .map(|t| {
                let role = t.role.as_str();
                format!("<{role}>\n{}\n</{role}>", t.content)
            })
            .collect();
        parts.push(format!(
            "<conversation-history>\n{}\n</conversation-history>",
            lines.join("\n")
        ));
    }

    parts.push(transcript.to_string());
    parts.join("\n\n")
}
