//! Knowledge bases and the sources that feed them.
//!
//! Creating or reindexing a source only records it as `pending` and enqueues
//! an [`INGEST_SOURCE`](crate::queue::INGEST_SOURCE) job in the same
//! transaction; the worker does the actual fetching, extraction, and
//! indexing (see [`crate::ingest`]).
//!
//! ```text
//! pending ──▶ processing ──▶ ready
//!    ▲             │
//!    │             └──────▶ failed
//!    └── reindex ◀─────────────┘ (also from ready)
//! ```

use std::path::{Path, PathBuf};

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::Config;
use crate::crawl;
use crate::error::{is_unique_violation, KbError, KbResult};
use crate::extract;
use crate::index;
use crate::models::{
    now_ts, ts, KnowledgeBase, KnowledgeSource, Role, SourceKind, SourceStatus,
};
use crate::queue;
use crate::spaces::{clean_optional, require_role};

const MAX_NAME_LEN: usize = 120;
const MAX_TITLE_LEN: usize = 300;

fn parse_err(e: String) -> KbError {
    KbError::Internal(anyhow::anyhow!(e))
}

fn kb_from_row(row: &SqliteRow) -> KnowledgeBase {
    KnowledgeBase {
        id: row.get("id"),
        space_id: row.get("space_id"),
        name: row.get("name"),
        description: row.get("description"),
        created_by: row.get("created_by"),
        created_at: ts(row.get("created_at")),
        updated_at: ts(row.get("updated_at")),
    }
}

fn source_from_row(row: &SqliteRow) -> KbResult<KnowledgeSource> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    Ok(KnowledgeSource {
        id: row.get("id"),
        knowledge_base_id: row.get("knowledge_base_id"),
        space_id: row.get("space_id"),
        kind: kind.parse().map_err(parse_err)?,
        title: row.get("title"),
        content: row.get("content"),
        location: row.get("location"),
        content_type: row.get("content_type"),
        size_bytes: row.get("size_bytes"),
        status: status.parse().map_err(parse_err)?,
        error: row.get("error"),
        document_count: row.get("document_count"),
        chunk_count: row.get("chunk_count"),
        created_by: row.get("created_by"),
        created_at: ts(row.get("created_at")),
        updated_at: ts(row.get("updated_at")),
    })
}

fn bounded(field: &str, value: &str, max: usize) -> KbResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(KbError::bad_request(format!("{} must not be empty", field)));
    }
    if value.chars().count() > max {
        return Err(KbError::bad_request(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(value.to_string())
}

// ============ Knowledge bases ============

async fn load_knowledge_base(pool: &SqlitePool, kb_id: &str) -> KbResult<KnowledgeBase> {
    let row = sqlx::query("SELECT * FROM knowledge_bases WHERE id = ?")
        .bind(kb_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| KbError::not_found(format!("knowledge base {}", kb_id)))?;
    Ok(kb_from_row(&row))
}

/// Load a knowledge base the actor may access with at least `min`.
/// Non-members see `NotFound`.
async fn authorized_kb(
    pool: &SqlitePool,
    actor_id: &str,
    kb_id: &str,
    min: Role,
) -> KbResult<KnowledgeBase> {
    let kb = load_knowledge_base(pool, kb_id).await?;
    require_role(pool, &kb.space_id, actor_id, min)
        .await
        .map_err(|e| match e {
            KbError::NotFound(_) => KbError::not_found(format!("knowledge base {}", kb_id)),
            other => other,
        })?;
    Ok(kb)
}

pub async fn create_knowledge_base(
    pool: &SqlitePool,
    actor_id: &str,
    space_id: &str,
    name: &str,
    description: Option<&str>,
) -> KbResult<KnowledgeBase> {
    require_role(pool, space_id, actor_id, Role::Editor).await?;
    let now = now_ts();
    let kb = KnowledgeBase {
        id: Uuid::new_v4().to_string(),
        space_id: space_id.to_string(),
        name: bounded("name", name, MAX_NAME_LEN)?,
        description: clean_optional(description),
        created_by: actor_id.to_string(),
        created_at: ts(now),
        updated_at: ts(now),
    };

    sqlx::query(
        r#"
        INSERT INTO knowledge_bases (id, space_id, name, description, created_by, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&kb.id)
    .bind(&kb.space_id)
    .bind(&kb.name)
    .bind(&kb.description)
    .bind(&kb.created_by)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            KbError::conflict(format!("a knowledge base named '{}' already exists", kb.name))
        } else {
            e.into()
        }
    })?;

    tracing::info!(kb_id = %kb.id, space_id = %space_id, "created knowledge base");
    Ok(kb)
}

pub async fn list_knowledge_bases(
    pool: &SqlitePool,
    actor_id: &str,
    space_id: &str,
) -> KbResult<Vec<KnowledgeBase>> {
    require_role(pool, space_id, actor_id, Role::Viewer).await?;
    let rows = sqlx::query(
        "SELECT * FROM knowledge_bases WHERE space_id = ? ORDER BY name COLLATE NOCASE ASC, id ASC",
    )
    .bind(space_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(kb_from_row).collect())
}

pub async fn get_knowledge_base(
    pool: &SqlitePool,
    actor_id: &str,
    kb_id: &str,
) -> KbResult<KnowledgeBase> {
    authorized_kb(pool, actor_id, kb_id, Role::Viewer).await
}

pub async fn update_knowledge_base(
    pool: &SqlitePool,
    actor_id: &str,
    kb_id: &str,
    name: Option<&str>,
    description: Option<&str>,
) -> KbResult<KnowledgeBase> {
    let kb = authorized_kb(pool, actor_id, kb_id, Role::Editor).await?;
    let name = match name {
        Some(n) => bounded("name", n, MAX_NAME_LEN)?,
        None => kb.name,
    };
    let description = match description {
        Some(d) => clean_optional(Some(d)),
        None => kb.description,
    };

    sqlx::query("UPDATE knowledge_bases SET name = ?, description = ?, updated_at = ? WHERE id = ?")
        .bind(&name)
        .bind(&description)
        .bind(now_ts())
        .bind(kb_id)
        .execute(pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                KbError::conflict(format!("a knowledge base named '{}' already exists", name))
            } else {
                e.into()
            }
        })?;

    load_knowledge_base(pool, kb_id).await
}

/// Delete a knowledge base with all its sources and indexed content.
pub async fn delete_knowledge_base(pool: &SqlitePool, actor_id: &str, kb_id: &str) -> KbResult<()> {
    authorized_kb(pool, actor_id, kb_id, Role::Editor).await?;

    let upload_paths: Vec<Option<String>> = sqlx::query_scalar(
        "SELECT location FROM knowledge_sources WHERE knowledge_base_id = ? AND kind = 'upload'",
    )
    .bind(kb_id)
    .fetch_all(pool)
    .await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunks_fts WHERE knowledge_base_id = ?")
        .bind(kb_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM knowledge_bases WHERE id = ?")
        .bind(kb_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    for path in upload_paths.into_iter().flatten() {
        remove_upload(Path::new(&path));
    }
    tracing::info!(kb_id = %kb_id, "deleted knowledge base");
    Ok(())
}

// ============ Sources ============

struct NewSource<'a> {
    kind: SourceKind,
    title: String,
    content: Option<&'a str>,
    location: Option<String>,
    content_type: Option<String>,
    size_bytes: Option<i64>,
}

/// Insert a pending source and its ingest job in one transaction.
async fn insert_source(
    pool: &SqlitePool,
    config: &Config,
    actor_id: &str,
    kb: &KnowledgeBase,
    id: &str,
    new: NewSource<'_>,
) -> KbResult<KnowledgeSource> {
    let now = now_ts();
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO knowledge_sources (id, knowledge_base_id, space_id, kind, title, content, location,
                                       content_type, size_bytes, status, created_by, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(&kb.id)
    .bind(&kb.space_id)
    .bind(new.kind.as_str())
    .bind(&new.title)
    .bind(new.content)
    .bind(&new.location)
    .bind(&new.content_type)
    .bind(new.size_bytes)
    .bind(actor_id)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let job_id = queue::enqueue(
        &mut *tx,
        queue::INGEST_SOURCE,
        &serde_json::json!({ "source_id": id }),
        Some(&kb.space_id),
        config.worker.max_attempts,
    )
    .await?;
    tx.commit().await?;

    tracing::info!(source_id = %id, kind = %new.kind, job_id = %job_id, "created source");
    load_source(pool, id).await
}

/// A pasted text note.
pub async fn create_text_source(
    pool: &SqlitePool,
    config: &Config,
    actor_id: &str,
    kb_id: &str,
    title: &str,
    content: &str,
) -> KbResult<KnowledgeSource> {
    let kb = authorized_kb(pool, actor_id, kb_id, Role::Editor).await?;
    if content.trim().is_empty() {
        return Err(KbError::bad_request("content must not be empty"));
    }
    if content.len() > config.upload.max_file_size {
        return Err(KbError::PayloadTooLarge(format!(
            "content exceeds {} bytes",
            config.upload.max_file_size
        )));
    }
    let new = NewSource {
        kind: SourceKind::Text,
        title: bounded("title", title, MAX_TITLE_LEN)?,
        content: Some(content),
        location: None,
        content_type: Some("text/plain".to_string()),
        size_bytes: Some(content.len() as i64),
    };
    let id = Uuid::new_v4().to_string();
    insert_source(pool, config, actor_id, &kb, &id, new).await
}

/// Validate a crawl seed: absolute http(s) URL with a host.
pub fn validate_url(url: &str) -> KbResult<reqwest::Url> {
    let parsed = reqwest::Url::parse(url.trim())
        .map_err(|e| KbError::bad_request(format!("invalid url '{}': {}", url.trim(), e)))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(KbError::bad_request("url must be an absolute http(s) URL"));
    }
    Ok(parsed)
}

/// A web page (crawled with same-origin links).
pub async fn create_url_source(
    pool: &SqlitePool,
    config: &Config,
    actor_id: &str,
    kb_id: &str,
    url: &str,
    title: Option<&str>,
) -> KbResult<KnowledgeSource> {
    let kb = authorized_kb(pool, actor_id, kb_id, Role::Editor).await?;
    let url = validate_url(url)?;
    if !config.crawl.allow_private_hosts {
        crawl::ensure_public_host(&url)
            .await
            .map_err(|e| KbError::bad_request(format!("{:#}", e)))?;
    }
    let title = match clean_optional(title) {
        Some(t) => bounded("title", &t, MAX_TITLE_LEN)?,
        None => url.to_string(),
    };
    let new = NewSource {
        kind: SourceKind::Url,
        title,
        content: None,
        location: Some(url.to_string()),
        content_type: None,
        size_bytes: None,
    };
    let id = Uuid::new_v4().to_string();
    insert_source(pool, config, actor_id, &kb, &id, new).await
}

/// Keep only the final path component and replace anything unusual.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.chars().take(200).collect()
    }
}

/// Decide the stored content type: the client's, unless missing or generic,
/// then one guessed from the filename.
fn resolve_content_type(filename: &str, declared: Option<&str>) -> KbResult<String> {
    let declared = declared
        .map(extract::base_content_type)
        .filter(|ct| !ct.is_empty() && ct != "application/octet-stream");
    let ct = declared
        .or_else(|| extract::guess_content_type(filename).map(str::to_string))
        .ok_or_else(|| {
            KbError::bad_request(format!("cannot determine content type of '{}'", filename))
        })?;
    if !extract::is_supported(&ct) {
        return Err(KbError::bad_request(format!(
            "unsupported content-type: {}",
            ct
        )));
    }
    Ok(ct)
}

/// An uploaded file, written under `upload.dir/<space_id>/`.
pub async fn create_upload_source(
    pool: &SqlitePool,
    config: &Config,
    actor_id: &str,
    kb_id: &str,
    filename: &str,
    content_type: Option<&str>,
    bytes: &[u8],
) -> KbResult<KnowledgeSource> {
    let kb = authorized_kb(pool, actor_id, kb_id, Role::Editor).await?;
    if bytes.is_empty() {
        return Err(KbError::bad_request("uploaded file is empty"));
    }
    if bytes.len() > config.upload.max_file_size {
        return Err(KbError::PayloadTooLarge(format!(
            "file exceeds the upload limit of {} bytes",
            config.upload.max_file_size
        )));
    }

    let filename = sanitize_filename(filename);
    let content_type = resolve_content_type(&filename, content_type)?;

    let id = Uuid::new_v4().to_string();
    let dir = config.upload.dir.join(&kb.space_id);
    let path: PathBuf = dir.join(format!("{}-{}", id, filename));
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| anyhow::anyhow!("creating {}: {}", dir.display(), e))?;
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| anyhow::anyhow!("writing {}: {}", path.display(), e))?;

    let new = NewSource {
        kind: SourceKind::Upload,
        title: filename,
        content: None,
        location: Some(path.to_string_lossy().into_owned()),
        content_type: Some(content_type),
        size_bytes: Some(bytes.len() as i64),
    };
    match insert_source(pool, config, actor_id, &kb, &id, new).await {
        Ok(source) => Ok(source),
        Err(e) => {
            remove_upload(&path);
            Err(e)
        }
    }
}

/// Load a source without a permission check (worker side).
pub async fn load_source(pool: &SqlitePool, source_id: &str) -> KbResult<KnowledgeSource> {
    let row = sqlx::query("SELECT * FROM knowledge_sources WHERE id = ?")
        .bind(source_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| KbError::not_found(format!("source {}", source_id)))?;
    source_from_row(&row)
}

async fn authorized_source(
    pool: &SqlitePool,
    actor_id: &str,
    source_id: &str,
    min: Role,
) -> KbResult<KnowledgeSource> {
    let source = load_source(pool, source_id).await?;
    require_role(pool, &source.space_id, actor_id, min)
        .await
        .map_err(|e| match e {
            KbError::NotFound(_) => KbError::not_found(format!("source {}", source_id)),
            other => other,
        })?;
    Ok(source)
}

pub async fn get_source(
    pool: &SqlitePool,
    actor_id: &str,
    source_id: &str,
) -> KbResult<KnowledgeSource> {
    authorized_source(pool, actor_id, source_id, Role::Viewer).await
}

pub async fn list_sources(
    pool: &SqlitePool,
    actor_id: &str,
    kb_id: &str,
) -> KbResult<Vec<KnowledgeSource>> {
    authorized_kb(pool, actor_id, kb_id, Role::Viewer).await?;
    let rows = sqlx::query(
        "SELECT * FROM knowledge_sources WHERE knowledge_base_id = ? ORDER BY created_at DESC, id ASC",
    )
    .bind(kb_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(source_from_row).collect()
}

async fn active_job_count(pool: &SqlitePool, source_id: &str) -> KbResult<i64> {
    let n: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM jobs
        WHERE kind = ? AND json_extract(payload_json, '$.source_id') = ?
          AND status IN ('queued', 'running')
        "#,
    )
    .bind(queue::INGEST_SOURCE)
    .bind(source_id)
    .fetch_one(pool)
    .await?;
    Ok(n)
}

/// Queue a fresh ingestion of an existing source.
pub async fn reindex_source(
    pool: &SqlitePool,
    config: &Config,
    actor_id: &str,
    source_id: &str,
) -> KbResult<KnowledgeSource> {
    let source = authorized_source(pool, actor_id, source_id, Role::Editor).await?;
    if active_job_count(pool, source_id).await? > 0 {
        return Err(KbError::conflict(format!(
            "source {} is already queued for ingestion",
            source_id
        )));
    }

    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE knowledge_sources SET status = 'pending', error = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(now_ts())
    .bind(source_id)
    .execute(&mut *tx)
    .await?;
    queue::enqueue(
        &mut *tx,
        queue::INGEST_SOURCE,
        &serde_json::json!({ "source_id": source_id }),
        Some(&source.space_id),
        config.worker.max_attempts,
    )
    .await?;
    tx.commit().await?;

    tracing::info!(source_id = %source_id, "queued reindex");
    load_source(pool, source_id).await
}

/// Delete a source, its indexed content, pending jobs, and stored file.
pub async fn delete_source(pool: &SqlitePool, actor_id: &str, source_id: &str) -> KbResult<()> {
    let source = authorized_source(pool, actor_id, source_id, Role::Editor).await?;

    sqlx::query(
        r#"
        UPDATE jobs SET status = 'cancelled', updated_at = ?
        WHERE kind = ? AND json_extract(payload_json, '$.source_id') = ? AND status = 'queued'
        "#,
    )
    .bind(now_ts())
    .bind(queue::INGEST_SOURCE)
    .bind(source_id)
    .execute(pool)
    .await?;

    index::delete_source_documents(pool, source_id).await?;
    sqlx::query("DELETE FROM knowledge_sources WHERE id = ?")
        .bind(source_id)
        .execute(pool)
        .await?;

    if source.kind == SourceKind::Upload {
        if let Some(path) = &source.location {
            remove_upload(Path::new(path));
        }
    }
    tracing::info!(source_id = %source_id, "deleted source");
    Ok(())
}

/// Record a status transition made by the worker.
pub async fn set_source_status(
    pool: &SqlitePool,
    source_id: &str,
    status: SourceStatus,
    error: Option<&str>,
) -> KbResult<()> {
    sqlx::query("UPDATE knowledge_sources SET status = ?, error = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(now_ts())
        .bind(source_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a source ready with its current document and chunk counts.
pub async fn mark_source_ready(
    pool: &SqlitePool,
    source_id: &str,
    document_count: i64,
    chunk_count: i64,
) -> KbResult<()> {
    sqlx::query(
        r#"
        UPDATE knowledge_sources
        SET status = 'ready', error = NULL, document_count = ?, chunk_count = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(document_count)
    .bind(chunk_count)
    .bind(now_ts())
    .bind(source_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn remove_upload(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "could not remove upload");
        }
    }
}
