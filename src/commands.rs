//! Operator commands behind the `kb` binary.
//!
//! These talk to the database directly and skip space permissions; they are
//! for whoever holds the config file, not for API users.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::index;
use crate::models::JobStatus;
use crate::queue;
use crate::search::{search_documents, SearchMode};
use crate::users;
use crate::worker::{self, Worker};

fn create_embedder(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    Ok(Arc::from(embedding::create_provider(&config.embedding)?))
}

/// Run a worker pool in the foreground until Ctrl-C.
pub async fn run_worker(config: &Config, concurrency: Option<usize>) -> Result<()> {
    let config = Arc::new(config.clone());
    let pool = db::connect(&config).await?;
    let embedder = create_embedder(&config)?;
    let concurrency = concurrency.unwrap_or(config.worker.concurrency);

    let worker = Arc::new(Worker::with_default_handlers(
        pool.clone(),
        config.clone(),
        embedder,
    )?);
    worker.run_pool(concurrency, worker::ctrl_c_shutdown()).await?;
    pool.close().await;
    Ok(())
}

pub async fn run_user_create(
    config: &Config,
    email: &str,
    password: &str,
    name: Option<&str>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let user = users::register(&pool, email, password, name.unwrap_or_default()).await?;
    println!("Created user {} ({})", user.email, user.id);
    pool.close().await;
    Ok(())
}

pub async fn run_user_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let all = users::list_users(&pool).await?;
    if all.is_empty() {
        println!("No users.");
    }
    for user in &all {
        println!(
            "{}  {:<32} {}",
            user.id,
            user.email,
            user.display_name
        );
    }
    pool.close().await;
    Ok(())
}

pub async fn run_search(
    config: &Config,
    kb_id: &str,
    query: &str,
    mode: Option<&str>,
    limit: Option<i64>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let embedder = create_embedder(config)?;
    let mode = match mode {
        Some(m) => m.parse::<SearchMode>()?,
        None => SearchMode::default_for(embedder.as_ref()),
    };

    let results = search_documents(
        &pool,
        &config.retrieval,
        embedder.as_ref(),
        &[kb_id.to_string()],
        query,
        mode,
        limit,
    )
    .await?;

    if results.is_empty() {
        println!("No results.");
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}",
            i + 1,
            r.score,
            r.title.as_deref().unwrap_or("(untitled)")
        );
        if let Some(url) = &r.url {
            println!("    url: {}", url);
        }
        println!("    document: {}  source: {}", r.document_id, r.source_id);
        println!("    updated: {}", r.updated_at.format("%Y-%m-%d %H:%M"));
        println!("    > {}", r.snippet.replace('\n', " "));
        println!();
    }

    pool.close().await;
    Ok(())
}

/// Embed chunks that are missing vectors for the configured model.
pub async fn run_embed_pending(
    config: &Config,
    kb_id: Option<&str>,
    batch_size: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let pool = db::connect(config).await?;
    let embedder = create_embedder(config)?;
    let pending = index::count_pending_embeddings(&pool, kb_id, embedder.model_name()).await?;

    if dry_run || pending == 0 {
        println!("embed pending{}", if dry_run { " (dry-run)" } else { "" });
        println!("  chunks needing embeddings: {}", pending);
        pool.close().await;
        return Ok(());
    }

    let batch_size = batch_size.unwrap_or(config.embedding.batch_size).max(1);
    let embedded = index::embed_pending(&pool, embedder.as_ref(), kb_id, batch_size).await?;
    let remaining = index::count_pending_embeddings(&pool, kb_id, embedder.model_name()).await?;

    println!("embed pending");
    println!("  total pending: {}", pending);
    println!("  embedded: {}", embedded);
    println!("  remaining: {}", remaining);

    pool.close().await;
    Ok(())
}

pub async fn run_jobs_list(
    config: &Config,
    space_id: Option<&str>,
    status: Option<&str>,
    limit: i64,
) -> Result<()> {
    let status = status
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let pool = db::connect(config).await?;
    let jobs = queue::list_jobs(&pool, space_id, status, limit).await?;

    if jobs.is_empty() {
        println!("No jobs.");
    } else {
        println!(
            "{:<36}  {:<14} {:<10} {:>8}  {}",
            "ID", "KIND", "STATUS", "ATTEMPTS", "LAST ERROR"
        );
    }
    for job in &jobs {
        println!(
            "{:<36}  {:<14} {:<10} {:>5}/{:<2}  {}",
            job.id,
            job.kind,
            job.status,
            job.attempts,
            job.max_attempts,
            job.last_error.as_deref().unwrap_or("-")
        );
    }

    pool.close().await;
    Ok(())
}

pub async fn run_job_retry(config: &Config, job_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let job = queue::retry(&pool, job_id).await?;
    println!("Job {} requeued ({})", job.id, job.status);
    pool.close().await;
    Ok(())
}

pub async fn run_job_cancel(config: &Config, job_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let job = queue::cancel(&pool, job_id).await?;
    println!("Job {} {}", job.id, job.status);
    pool.close().await;
    Ok(())
}
