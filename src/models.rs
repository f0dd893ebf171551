//! Core data models.
//!
//! Rows are stored with unix-second timestamps and surface here as
//! `DateTime<Utc>`; enums round-trip through the lowercase strings kept in
//! SQLite via `as_str` / `parse`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Convert a stored unix timestamp to `DateTime<Utc>`, clamping bad values to the epoch.
pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("invalid {}: '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
    #[serde(skip)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Space {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Membership role within a space. Declaration order is rank order
/// (Viewer lowest), so `Ord` compares privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
    Owner,
}

string_enum!(Role {
    Viewer => "viewer",
    Editor => "editor",
    Admin => "admin",
    Owner => "owner",
});

#[derive(Debug, Clone, Serialize)]
pub struct SpaceMember {
    pub space_id: String,
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub space_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Text,
    Upload,
    Url,
}

string_enum!(SourceKind {
    Text => "text",
    Upload => "upload",
    Url => "url",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

string_enum!(SourceStatus {
    Pending => "pending",
    Processing => "processing",
    Ready => "ready",
    Failed => "failed",
});

/// A unit of content attached to a knowledge base.
///
/// What `location` holds depends on `kind`: the URL for `url`, the stored
/// file path for `upload`, nothing for `text` (the body lives in `content`).
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeSource {
    pub id: String,
    pub knowledge_base_id: String,
    pub space_id: String,
    pub kind: SourceKind,
    pub title: String,
    #[serde(skip)]
    pub content: Option<String>,
    pub location: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub status: SourceStatus,
    pub error: Option<String>,
    pub document_count: i64,
    pub chunk_count: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Text produced by a source before chunking (one page, file, or note).
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Stable key within the source (URL, filename, or `"body"`).
    pub key: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub content_type: String,
    pub body: String,
}

/// A stored document row.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub knowledge_base_id: String,
    pub source_id: String,
    pub doc_key: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub content_type: String,
    pub body: String,
    pub dedup_hash: String,
    pub updated_at: i64,
}

/// A chunk of a document's body text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Assistant {
    pub id: String,
    pub space_id: String,
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: String,
    pub model: Option<String>,
    pub temperature: f64,
    pub knowledge_base_ids: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub space_id: String,
    pub assistant_id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

string_enum!(MessageRole {
    System => "system",
    User => "user",
    Assistant => "assistant",
});

/// Reference from an assistant answer back to the chunk it drew on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    /// 1-based marker used in the prompt (`[1]`, `[2]`, ...).
    pub index: usize,
    pub document_id: String,
    pub chunk_id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub score: f64,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub citations: Vec<Citation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

string_enum!(JobStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub space_id: Option<String>,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
