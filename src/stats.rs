//! Index and queue statistics.
//!
//! [`space_stats`] backs `GET /api/v1/spaces/{id}/stats`; [`run_stats`]
//! prints the same numbers for every space plus the job queue for
//! `kb stats`, so operators can confirm that ingestion and embedding keep up.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::KbResult;
use crate::queue;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    pub pending: i64,
    pub processing: i64,
    pub ready: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpaceStats {
    pub space_id: String,
    pub name: String,
    pub knowledge_bases: i64,
    pub sources: SourceCounts,
    pub documents: i64,
    pub chunks: i64,
    pub embedded_chunks: i64,
}

/// Counts for one space. No permission check; callers do that.
pub async fn space_stats(pool: &SqlitePool, space_id: &str) -> KbResult<SpaceStats> {
    let name: String = sqlx::query_scalar("SELECT name FROM spaces WHERE id = ?")
        .bind(space_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| crate::error::KbError::not_found(format!("space {}", space_id)))?;

    let knowledge_bases: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_bases WHERE space_id = ?")
            .bind(space_id)
            .fetch_one(pool)
            .await?;

    let mut sources = SourceCounts::default();
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM knowledge_sources WHERE space_id = ? GROUP BY status",
    )
    .bind(space_id)
    .fetch_all(pool)
    .await?;
    for row in &rows {
        let n: i64 = row.get("n");
        match row.get::<String, _>("status").as_str() {
            "pending" => sources.pending = n,
            "processing" => sources.processing = n,
            "ready" => sources.ready = n,
            "failed" => sources.failed = n,
            _ => {}
        }
    }

    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM documents d
               JOIN knowledge_bases kb ON kb.id = d.knowledge_base_id
              WHERE kb.space_id = ?1) AS documents,
            (SELECT COUNT(*) FROM chunks c
               JOIN knowledge_bases kb ON kb.id = c.knowledge_base_id
              WHERE kb.space_id = ?1) AS chunks,
            (SELECT COUNT(*) FROM chunk_vectors v
               JOIN knowledge_bases kb ON kb.id = v.knowledge_base_id
              WHERE kb.space_id = ?1) AS embedded
        "#,
    )
    .bind(space_id)
    .fetch_one(pool)
    .await?;

    Ok(SpaceStats {
        space_id: space_id.to_string(),
        name,
        knowledge_bases,
        sources,
        documents: row.get("documents"),
        chunks: row.get("chunks"),
        embedded_chunks: row.get("embedded"),
    })
}

pub async fn all_space_stats(pool: &SqlitePool) -> KbResult<Vec<SpaceStats>> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT id FROM spaces ORDER BY name COLLATE NOCASE ASC, id ASC")
            .fetch_all(pool)
            .await?;
    let mut out = Vec::with_capacity(ids.len());
    for id in &ids {
        out.push(space_stats(pool, id).await?);
    }
    Ok(out)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let spaces = all_space_stats(&pool).await?;
    let jobs = queue::counts(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Knowledge Space — Database Stats");
    println!("================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Spaces:      {}", spaces.len());

    if !spaces.is_empty() {
        println!();
        println!(
            "  {:<24} {:>4} {:>7} {:>7} {:>6} {:>8} {:>10}",
            "SPACE", "KBS", "SOURCES", "FAILED", "DOCS", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(72));
        for s in &spaces {
            let total_sources =
                s.sources.pending + s.sources.processing + s.sources.ready + s.sources.failed;
            println!(
                "  {:<24} {:>4} {:>7} {:>7} {:>6} {:>8} {:>10}",
                truncate(&s.name, 24),
                s.knowledge_bases,
                total_sources,
                s.sources.failed,
                s.documents,
                s.chunks,
                format!("{}%", percent(s.embedded_chunks, s.chunks)),
            );
        }
    }

    println!();
    if jobs.is_empty() {
        println!("  Jobs:        none");
    } else {
        println!("  Jobs:");
        for (status, n) in &jobs {
            println!("    {:<12} {}", status, n);
        }
    }
    println!();

    pool.close().await;
    Ok(())
}

fn percent(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        (part * 100) / whole
    } else {
        0
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(width - 1).collect();
        out.push('…');
        out
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
