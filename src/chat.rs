//! Conversations with assistants and the retrieval-augmented answer stream.
//!
//! A conversation belongs to one user and one assistant; nobody else can
//! read or post to it. [`ChatService::send_message`] checks access, stores
//! the user's message, and hands back a channel of [`ChatEvent`]s fed by a
//! background task:
//!
//! 1. `context`: the chunks retrieved from the assistant's knowledge bases,
//!    numbered as citations;
//! 2. `delta`: answer text as the model produces it;
//! 3. `done` with the stored assistant message id, or `error`.
//!
//! The prompt is the assistant's system prompt, a numbered context block,
//! the last `chat.history_limit` messages, and the new message. If the
//! receiver goes away mid-answer, generation stops and whatever text arrived
//! is still saved.

use std::sync::Arc;

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::assistants::load_assistant;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{KbError, KbResult};
use crate::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::models::{now_ts, ts, Assistant, Citation, Conversation, Message, MessageRole, Role};
use crate::search::{search_chunks, ChunkHit, SearchMode};
use crate::spaces::require_role;

const DEFAULT_TITLE: &str = "New conversation";
const MAX_TITLE_CHARS: usize = 80;
const MAX_MESSAGE_BYTES: usize = 32_000;
const EVENT_BUFFER: usize = 64;

/// One server-sent event of an answer stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    Context { citations: Vec<Citation> },
    Delta { text: String },
    Done { message_id: String },
    Error { message: String },
}

impl ChatEvent {
    /// SSE `event:` name.
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Context { .. } => "context",
            ChatEvent::Delta { .. } => "delta",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Error { .. } => "error",
        }
    }
}

fn conversation_from_row(row: &SqliteRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        space_id: row.get("space_id"),
        assistant_id: row.get("assistant_id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        created_at: ts(row.get("created_at")),
        updated_at: ts(row.get("updated_at")),
    }
}

fn message_from_row(row: &SqliteRow) -> KbResult<Message> {
    let role: String = row.get("role");
    let citations: String = row.get("citations_json");
    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: role.parse().map_err(|e: String| anyhow::anyhow!(e))?,
        content: row.get("content"),
        citations: serde_json::from_str(&citations).unwrap_or_default(),
        created_at: ts(row.get("created_at")),
    })
}

/// First line of `text`, shortened to a title.
fn title_from(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or(DEFAULT_TITLE);
    if line.chars().count() <= MAX_TITLE_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(MAX_TITLE_CHARS - 1).collect();
    title.push('…');
    title
}

pub async fn create_conversation(
    pool: &SqlitePool,
    actor_id: &str,
    assistant_id: &str,
    title: Option<&str>,
) -> KbResult<Conversation> {
    let assistant = load_assistant(pool, assistant_id).await?;
    require_role(pool, &assistant.space_id, actor_id, Role::Viewer)
        .await
        .map_err(|e| match e {
            KbError::NotFound(_) => KbError::not_found(format!("assistant {}", assistant_id)),
            other => other,
        })?;

    let title = match title.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => title_from(t),
        None => DEFAULT_TITLE.to_string(),
    };
    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO conversations (id, space_id, assistant_id, user_id, title, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&assistant.space_id)
    .bind(assistant_id)
    .bind(actor_id)
    .bind(&title)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    tracing::debug!(conversation_id = %id, assistant_id = %assistant_id, "created conversation");
    Ok(Conversation {
        id,
        space_id: assistant.space_id,
        assistant_id: assistant_id.to_string(),
        user_id: actor_id.to_string(),
        title,
        created_at: ts(now),
        updated_at: ts(now),
    })
}

/// The actor's own conversations, most recently active first.
pub async fn list_conversations(
    pool: &SqlitePool,
    actor_id: &str,
    assistant_id: Option<&str>,
) -> KbResult<Vec<Conversation>> {
    let rows = sqlx::query(
        r#"
        SELECT c.* FROM conversations c
        JOIN space_members m ON m.space_id = c.space_id AND m.user_id = c.user_id
        WHERE c.user_id = ? AND (? IS NULL OR c.assistant_id = ?)
        ORDER BY c.updated_at DESC, c.id ASC
        "#,
    )
    .bind(actor_id)
    .bind(assistant_id)
    .bind(assistant_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(conversation_from_row).collect())
}

/// A conversation visible to `actor_id`: their own, in a space they still belong to.
pub async fn get_conversation(
    pool: &SqlitePool,
    actor_id: &str,
    conversation_id: &str,
) -> KbResult<Conversation> {
    let missing = || KbError::not_found(format!("conversation {}", conversation_id));
    let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(missing)?;
    let conversation = conversation_from_row(&row);
    if conversation.user_id != actor_id {
        return Err(missing());
    }
    require_role(pool, &conversation.space_id, actor_id, Role::Viewer)
        .await
        .map_err(|e| match e {
            KbError::NotFound(_) | KbError::Forbidden(_) => missing(),
            other => other,
        })?;
    Ok(conversation)
}

pub async fn list_messages(
    pool: &SqlitePool,
    actor_id: &str,
    conversation_id: &str,
) -> KbResult<Vec<Message>> {
    get_conversation(pool, actor_id, conversation_id).await?;
    let rows = sqlx::query(
        "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(message_from_row).collect()
}

pub async fn delete_conversation(
    pool: &SqlitePool,
    actor_id: &str,
    conversation_id: &str,
) -> KbResult<()> {
    get_conversation(pool, actor_id, conversation_id).await?;
    sqlx::query("DELETE FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn insert_message(
    pool: &SqlitePool,
    conversation_id: &str,
    role: MessageRole,
    content: &str,
    citations: &[Citation],
) -> KbResult<String> {
    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    let citations_json = serde_json::to_string(citations).map_err(anyhow::Error::from)?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO messages (id, conversation_id, role, content, citations_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(conversation_id)
    .bind(role.as_str())
    .bind(content)
    .bind(&citations_json)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(id)
}

/// Up to `limit` messages preceding `before_id`, oldest first.
async fn recent_history(
    pool: &SqlitePool,
    conversation_id: &str,
    before_id: &str,
    limit: i64,
) -> KbResult<Vec<ChatMessage>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        r#"
        SELECT role, content FROM messages
        WHERE conversation_id = ? AND id != ? AND role != 'system'
        ORDER BY created_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(conversation_id)
    .bind(before_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut history = Vec::with_capacity(rows.len());
    for row in rows.iter().rev() {
        let role: String = row.get("role");
        let role: MessageRole = role.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        history.push(ChatMessage::new(role, row.get::<String, _>("content")));
    }
    Ok(history)
}

/// The numbered context block placed after the system prompt.
pub fn context_block(hits: &[ChunkHit]) -> String {
    let mut block = String::from(
        "Use the following context to answer. Cite it with the bracketed numbers.\n",
    );
    for (i, hit) in hits.iter().enumerate() {
        block.push_str(&format!("\n[{}] {}", i + 1, hit.title.as_deref().unwrap_or("Untitled")));
        if let Some(url) = &hit.url {
            block.push_str(&format!(" ({})", url));
        }
        block.push('\n');
        block.push_str(hit.text.trim());
        block.push('\n');
    }
    block
}

pub fn citations_for(hits: &[ChunkHit]) -> Vec<Citation> {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| Citation {
            index: i + 1,
            document_id: hit.document_id.clone(),
            chunk_id: hit.chunk_id.clone(),
            title: hit.title.clone(),
            url: hit.url.clone(),
            score: hit.score,
            snippet: hit.snippet.clone(),
        })
        .collect()
}

/// Runs the answer pipeline; cheap to clone.
#[derive(Clone)]
pub struct ChatService {
    pool: SqlitePool,
    config: Arc<Config>,
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn ChatModel>,
}

impl ChatService {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            pool,
            config,
            embedder,
            model,
        }
    }

    /// Store the user's message and start answering it.
    ///
    /// Errors (access, validation, chat disabled) are returned before
    /// anything is written; afterwards failures arrive as
    /// [`ChatEvent::Error`].
    pub async fn send_message(
        &self,
        actor_id: &str,
        conversation_id: &str,
        content: &str,
    ) -> KbResult<mpsc::Receiver<ChatEvent>> {
        let content = content.trim();
        if content.is_empty() {
            return Err(KbError::bad_request("message content is required"));
        }
        if content.len() > MAX_MESSAGE_BYTES {
            return Err(KbError::bad_request(format!(
                "message must be at most {} bytes",
                MAX_MESSAGE_BYTES
            )));
        }
        if !self.model.is_enabled() {
            return Err(KbError::Disabled(
                "chat requires an llm provider. Set [llm] provider in config.".to_string(),
            ));
        }

        let conversation = get_conversation(&self.pool, actor_id, conversation_id).await?;
        let assistant = load_assistant(&self.pool, &conversation.assistant_id).await?;

        let user_message_id =
            insert_message(&self.pool, conversation_id, MessageRole::User, content, &[]).await?;
        sqlx::query("UPDATE conversations SET title = ? WHERE id = ? AND title = ?")
            .bind(title_from(content))
            .bind(conversation_id)
            .bind(DEFAULT_TITLE)
            .execute(&self.pool)
            .await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let service = self.clone();
        let content = content.to_string();
        tokio::spawn(async move {
            if let Err(e) = service
                .answer(&conversation, &assistant, &user_message_id, &content, &tx)
                .await
            {
                tracing::warn!(conversation_id = %conversation.id, error = %e, "chat answer failed");
                let _ = tx.send(ChatEvent::Error { message: e.to_string() }).await;
            }
        });
        Ok(rx)
    }

    async fn search(&self, assistant: &Assistant, query: &str, mode: SearchMode) -> KbResult<Vec<ChunkHit>> {
        search_chunks(
            &self.pool,
            &self.config.retrieval,
            self.embedder.as_ref(),
            &assistant.knowledge_base_ids,
            query,
            mode,
            self.config.chat.context_chunks,
        )
        .await
    }

    /// Context chunks for `query`. Retrieval problems degrade to less context.
    async fn retrieve(&self, assistant: &Assistant, query: &str) -> Vec<ChunkHit> {
        if assistant.knowledge_base_ids.is_empty() {
            return Vec::new();
        }
        let mode = SearchMode::default_for(self.embedder.as_ref());
        let result = match self.search(assistant, query, mode).await {
            Err(e) if mode != SearchMode::Keyword => {
                tracing::warn!(error = %e, "semantic retrieval failed, falling back to keyword");
                self.search(assistant, query, SearchMode::Keyword).await
            }
            other => other,
        };
        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "keyword retrieval failed");
            Vec::new()
        })
    }

    async fn answer(
        &self,
        conversation: &Conversation,
        assistant: &Assistant,
        user_message_id: &str,
        content: &str,
        events: &mpsc::Sender<ChatEvent>,
    ) -> KbResult<()> {
        let hits = self.retrieve(assistant, content).await;
        let citations = citations_for(&hits);
        if events
            .send(ChatEvent::Context {
                citations: citations.clone(),
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        let mut messages = vec![ChatMessage::new(
            MessageRole::System,
            assistant.system_prompt.clone(),
        )];
        if !hits.is_empty() {
            messages.push(ChatMessage::new(MessageRole::System, context_block(&hits)));
        }
        messages.extend(
            recent_history(
                &self.pool,
                &conversation.id,
                user_message_id,
                self.config.chat.history_limit,
            )
            .await?,
        );
        messages.push(ChatMessage::new(MessageRole::User, content));

        let request = ChatRequest {
            model: assistant
                .model
                .clone()
                .unwrap_or_else(|| self.model.default_model().to_string()),
            messages,
            temperature: assistant.temperature,
            max_tokens: self.config.llm.max_tokens,
        };

        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(EVENT_BUFFER);
        let forward = async move {
            while let Some(text) = delta_rx.recv().await {
                if events.send(ChatEvent::Delta { text }).await.is_err() {
                    // Dropping delta_rx makes the model stop.
                    break;
                }
            }
        };
        let (result, ()) = tokio::join!(self.model.stream_chat(&request, delta_tx), forward);
        let answer = result?;

        let message_id = insert_message(
            &self.pool,
            &conversation.id,
            MessageRole::Assistant,
            &answer,
            &citations,
        )
        .await?;
        tracing::info!(
            conversation_id = %conversation.id,
            model = %request.model,
            citations = citations.len(),
            chars = answer.len(),
            "answer stored"
        );
        let _ = events.send(ChatEvent::Done { message_id }).await;
        Ok(())
    }
}
