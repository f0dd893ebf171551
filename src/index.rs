//! Storage for ingested content: documents, chunks, the FTS5 keyword index,
//! and chunk embeddings.
//!
//! Every chunk row has a twin in `chunks_fts`; the two are always written and
//! deleted in the same transaction. Embeddings live in `chunk_vectors` and
//! record the chunk hash and model they were computed from, so
//! [`embed_pending`] can find chunks whose vector is missing or stale.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::chunk::{chunk_text, hash_text};
use crate::embedding::{self, EmbeddingProvider};
use crate::models::{now_ts, Chunk, Document, SourceItem};

/// Longest snippet returned with a vector hit.
const SNIPPET_CHARS: usize = 240;

/// A chunk returned by one retrieval channel, before score fusion.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    /// Channel-specific score; higher is better.
    pub raw_score: f64,
    pub snippet: String,
}

/// Display metadata for a document in search results.
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    pub id: String,
    pub knowledge_base_id: String,
    pub source_id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub updated_at: i64,
}

/// Result of [`write_document`].
#[derive(Debug, Clone)]
pub struct DocumentWrite {
    pub document: Document,
    /// False when the stored row and its chunks already matched.
    pub changed: bool,
    pub chunks_written: u64,
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn document_from_row(row: &SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        knowledge_base_id: row.get("knowledge_base_id"),
        source_id: row.get("source_id"),
        doc_key: row.get("doc_key"),
        title: row.get("title"),
        url: row.get("url"),
        content_type: row.get("content_type"),
        body: row.get("body"),
        dedup_hash: row.get("dedup_hash"),
        updated_at: row.get("updated_at"),
    }
}

pub fn dedup_hash(item: &SourceItem) -> String {
    hash_text(&format!(
        "{}\n{}\n{}",
        item.title.as_deref().unwrap_or_default(),
        item.url.as_deref().unwrap_or_default(),
        item.body
    ))
}

/// Store `item` as a document of `source_id` together with its chunks and
/// FTS rows, in one transaction. Callers must not write the same source
/// concurrently (the queue keeps one active ingest job per source).
///
/// The write is skipped (`changed: false`) only when the stored hash matches
/// and the stored chunk sequence equals what chunking `item` produces now, so
/// a half-written document or a change of chunking settings is repaired on the
/// next run.
pub async fn write_document(
    pool: &SqlitePool,
    knowledge_base_id: &str,
    source_id: &str,
    item: &SourceItem,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Result<DocumentWrite> {
    let hash = dedup_hash(item);
    let now = now_ts();

    let existing = sqlx::query("SELECT * FROM documents WHERE source_id = ? AND doc_key = ?")
        .bind(source_id)
        .bind(&item.key)
        .fetch_optional(pool)
        .await?
        .map(|r| document_from_row(&r));

    let document_id = existing
        .as_ref()
        .map(|d| d.id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let chunks = chunk_text(&document_id, &item.body, max_tokens, overlap_tokens);

    if let Some(doc) = &existing {
        if doc.dedup_hash == hash {
            let stored: Vec<String> = sqlx::query_scalar(
                "SELECT hash FROM chunks WHERE document_id = ? ORDER BY chunk_index",
            )
            .bind(&doc.id)
            .fetch_all(pool)
            .await?;
            if stored.iter().eq(chunks.iter().map(|c| &c.hash)) {
                return Ok(DocumentWrite {
                    document: doc.clone(),
                    changed: false,
                    chunks_written: 0,
                });
            }
        }
    }

    let document = Document {
        id: document_id,
        knowledge_base_id: knowledge_base_id.to_string(),
        source_id: source_id.to_string(),
        doc_key: item.key.clone(),
        title: item.title.clone(),
        url: item.url.clone(),
        content_type: item.content_type.clone(),
        body: item.body.clone(),
        dedup_hash: hash,
        updated_at: now,
    };

    // Writes only from here on, so the transaction takes the write lock with
    // its first statement.
    let mut tx = pool.begin().await?;
    if existing.is_some() {
        sqlx::query(
            r#"
            UPDATE documents SET title = ?, url = ?, content_type = ?, body = ?, dedup_hash = ?,
                                 updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&document.title)
        .bind(&document.url)
        .bind(&document.content_type)
        .bind(&document.body)
        .bind(&document.dedup_hash)
        .bind(now)
        .bind(&document.id)
        .execute(&mut *tx)
        .await?;
    } else {
        sqlx::query(
            r#"
            INSERT INTO documents (id, knowledge_base_id, source_id, doc_key, title, url,
                                   content_type, body, dedup_hash, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document.id)
        .bind(&document.knowledge_base_id)
        .bind(&document.source_id)
        .bind(&document.doc_key)
        .bind(&document.title)
        .bind(&document.url)
        .bind(&document.content_type)
        .bind(&document.body)
        .bind(&document.dedup_hash)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    replace_chunks(&mut tx, &document, &chunks).await?;
    tx.commit().await?;

    Ok(DocumentWrite {
        document,
        changed: true,
        chunks_written: chunks.len() as u64,
    })
}

/// Replace all chunks (and their FTS rows) of `doc`. Vectors of the old
/// chunks go with them via `ON DELETE CASCADE`.
async fn replace_chunks(conn: &mut SqliteConnection, doc: &Document, chunks: &[Chunk]) -> Result<()> {
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(&doc.id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(&doc.id)
        .execute(&mut *conn)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, knowledge_base_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&doc.id)
        .bind(&doc.knowledge_base_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO chunks_fts (chunk_id, document_id, knowledge_base_id, text) VALUES (?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&doc.id)
        .bind(&doc.knowledge_base_id)
        .bind(&chunk.text)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn upsert_embedding(
    pool: &SqlitePool,
    chunk_id: &str,
    document_id: &str,
    knowledge_base_id: &str,
    model: &str,
    content_hash: &str,
    vector: &[f32],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, knowledge_base_id, model, dims,
                                   content_hash, embedding, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            content_hash = excluded.content_hash,
            embedding = excluded.embedding,
            created_at = excluded.created_at
        "#,
    )
    .bind(chunk_id)
    .bind(document_id)
    .bind(knowledge_base_id)
    .bind(model)
    .bind(vector.len() as i64)
    .bind(content_hash)
    .bind(embedding::vec_to_blob(vector))
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(())
}

const PENDING_FILTER: &str = r#"
    FROM chunks c
    LEFT JOIN chunk_vectors v ON v.chunk_id = c.id
    WHERE (?1 IS NULL OR c.knowledge_base_id = ?1)
      AND (v.chunk_id IS NULL OR v.content_hash != c.hash OR v.model != ?2)
"#;

/// Chunks whose embedding is missing or was computed from other text or
/// another model.
pub async fn count_pending_embeddings(
    pool: &SqlitePool,
    knowledge_base_id: Option<&str>,
    model: &str,
) -> Result<i64> {
    let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) {}", PENDING_FILTER))
        .bind(knowledge_base_id)
        .bind(model)
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// Embed every pending chunk, optionally limited to one knowledge base.
/// Returns the number of vectors written.
pub async fn embed_pending(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    knowledge_base_id: Option<&str>,
    batch_size: usize,
) -> Result<u64> {
    if !provider.is_enabled() {
        return Ok(0);
    }

    let rows = sqlx::query(&format!(
        "SELECT c.id, c.document_id, c.knowledge_base_id, c.text, c.hash {} ORDER BY c.document_id, c.chunk_index",
        PENDING_FILTER
    ))
    .bind(knowledge_base_id)
    .bind(provider.model_name())
    .fetch_all(pool)
    .await?;

    let mut written = 0u64;
    for batch in rows.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|r| r.get::<String, _>("text")).collect();
        let vectors = embedding::embed_texts(provider, &texts, batch_size).await?;
        for (row, vector) in batch.iter().zip(vectors.iter()) {
            upsert_embedding(
                pool,
                row.get::<&str, _>("id"),
                row.get::<&str, _>("document_id"),
                row.get::<&str, _>("knowledge_base_id"),
                provider.model_name(),
                row.get::<&str, _>("hash"),
                vector,
            )
            .await?;
            written += 1;
        }
    }

    if written > 0 {
        tracing::debug!(written, "embedded pending chunks");
    }
    Ok(written)
}

// ============ Retrieval channels ============

/// Top `k` FTS5 matches for an already-sanitized MATCH expression.
pub async fn keyword_candidates(
    pool: &SqlitePool,
    fts_query: &str,
    knowledge_base_ids: &[String],
    k: i64,
) -> Result<Vec<ChunkCandidate>> {
    if knowledge_base_ids.is_empty() || fts_query.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        r#"
        SELECT chunk_id, document_id, rank,
               snippet(chunks_fts, 3, '', '', '…', 48) AS snippet
        FROM chunks_fts
        WHERE chunks_fts MATCH ? AND knowledge_base_id IN ({})
        ORDER BY rank
        LIMIT ?
        "#,
        placeholders(knowledge_base_ids.len())
    );

    let mut query = sqlx::query(&sql).bind(fts_query);
    for id in knowledge_base_ids {
        query = query.bind(id);
    }
    let rows = query.bind(k).fetch_all(pool).await?;

    Ok(rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                // bm25 rank: lower is better
                raw_score: -rank,
                snippet: row.get("snippet"),
            }
        })
        .collect())
}

/// Top `k` chunks by cosine similarity to `query_vec`, brute force over the
/// vectors of the given knowledge bases computed with `model`.
pub async fn vector_candidates(
    pool: &SqlitePool,
    query_vec: &[f32],
    model: &str,
    knowledge_base_ids: &[String],
    k: i64,
) -> Result<Vec<ChunkCandidate>> {
    if knowledge_base_ids.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        r#"
        SELECT cv.chunk_id, cv.document_id, cv.embedding,
               COALESCE(substr(c.text, 1, {}), '') AS snippet
        FROM chunk_vectors cv
        JOIN chunks c ON c.id = cv.chunk_id
        WHERE cv.model = ? AND cv.knowledge_base_id IN ({})
        "#,
        SNIPPET_CHARS,
        placeholders(knowledge_base_ids.len())
    );

    let mut query = sqlx::query(&sql).bind(model);
    for id in knowledge_base_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;

    let mut candidates: Vec<ChunkCandidate> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = embedding::blob_to_vec(&blob);
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                raw_score: embedding::cosine_similarity(query_vec, &vec) as f64,
                snippet: row.get("snippet"),
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(k.max(0) as usize);
    Ok(candidates)
}

pub async fn document_meta(
    pool: &SqlitePool,
    document_ids: &[String],
) -> Result<HashMap<String, DocumentMeta>> {
    if document_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT id, knowledge_base_id, source_id, title, url, updated_at FROM documents WHERE id IN ({})",
        placeholders(document_ids.len())
    );
    let mut query = sqlx::query(&sql);
    for id in document_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;

    Ok(rows
        .iter()
        .map(|row| {
            let meta = DocumentMeta {
                id: row.get("id"),
                knowledge_base_id: row.get("knowledge_base_id"),
                source_id: row.get("source_id"),
                title: row.get("title"),
                url: row.get("url"),
                updated_at: row.get("updated_at"),
            };
            (meta.id.clone(), meta)
        })
        .collect())
}

/// Full text of the given chunks, keyed by chunk id.
pub async fn chunk_texts(pool: &SqlitePool, chunk_ids: &[String]) -> Result<HashMap<String, String>> {
    if chunk_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT id, text FROM chunks WHERE id IN ({})",
        placeholders(chunk_ids.len())
    );
    let mut query = sqlx::query(&sql);
    for id in chunk_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("id"), r.get::<String, _>("text")))
        .collect())
}

// ============ Removal ============

async fn delete_documents_by_id(conn: &mut SqliteConnection, ids: &[String]) -> Result<()> {
    for id in ids {
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Remove every document of a source together with its chunks, FTS rows,
/// and vectors. Returns the number of documents removed.
pub async fn delete_source_documents(pool: &SqlitePool, source_id: &str) -> Result<u64> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM documents WHERE source_id = ?")
        .bind(source_id)
        .fetch_all(pool)
        .await?;

    let mut tx = pool.begin().await?;
    delete_documents_by_id(&mut tx, &ids).await?;
    tx.commit().await?;
    Ok(ids.len() as u64)
}

/// Remove documents of a source whose key is not in `keep`.
pub async fn prune_documents(pool: &SqlitePool, source_id: &str, keep: &[String]) -> Result<u64> {
    let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
    let rows = sqlx::query("SELECT id, doc_key FROM documents WHERE source_id = ?")
        .bind(source_id)
        .fetch_all(pool)
        .await?;
    let stale: Vec<String> = rows
        .iter()
        .filter(|r| !keep.contains(r.get::<&str, _>("doc_key")))
        .map(|r| r.get::<String, _>("id"))
        .collect();

    if stale.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    delete_documents_by_id(&mut tx, &stale).await?;
    tx.commit().await?;
    Ok(stale.len() as u64)
}

/// `(documents, chunks)` currently stored for a source.
pub async fn source_counts(pool: &SqlitePool, source_id: &str) -> Result<(i64, i64)> {
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM documents WHERE source_id = ?1) AS docs,
            (SELECT COUNT(*) FROM chunks c JOIN documents d ON d.id = c.document_id
             WHERE d.source_id = ?1) AS chunks
        "#,
    )
    .bind(source_id)
    .fetch_one(pool)
    .await?;
    Ok((row.get("docs"), row.get("chunks")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_comma_separated() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn dedup_hash_covers_title_and_body() {
        let item = SourceItem {
            key: "body".into(),
            title: Some("A".into()),
            url: None,
            content_type: "text/plain".into(),
            body: "hello".into(),
        };
        let retitled = SourceItem {
            title: Some("B".into()),
            ..item.clone()
        };
        assert_ne!(dedup_hash(&item), dedup_hash(&retitled));
        assert_eq!(dedup_hash(&item), dedup_hash(&item.clone()));
    }
}
