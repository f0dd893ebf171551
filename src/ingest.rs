//! Ingestion pipeline for one knowledge source.
//!
//! gather (text body / extracted upload / crawled pages) → upsert documents →
//! chunk → replace chunks → prune documents the source no longer produces →
//! embed (non-fatal) → mark the source ready.
//!
//! Any failure before the source is marked ready sets it to `failed` with the
//! error message and is returned, so the job is retried with backoff.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::crawl::Crawler;
use crate::embedding::EmbeddingProvider;
use crate::error::KbError;
use crate::extract;
use crate::index;
use crate::knowledge;
use crate::models::{KnowledgeSource, SourceItem, SourceKind, SourceStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub documents: u64,
    pub documents_changed: u64,
    pub documents_removed: u64,
    pub chunks_written: u64,
    pub embeddings_written: u64,
    pub embeddings_pending: i64,
}

pub struct Ingestor {
    pool: SqlitePool,
    config: Arc<Config>,
    embedder: Arc<dyn EmbeddingProvider>,
    crawler: Crawler,
}

impl Ingestor {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let crawler = Crawler::new(&config.crawl)?;
        Ok(Self {
            pool,
            config,
            embedder,
            crawler,
        })
    }

    /// Ingest a source. Returns `None` if the source was deleted meanwhile.
    pub async fn ingest_source(&self, source_id: &str) -> Result<Option<IngestReport>> {
        let source = match knowledge::load_source(&self.pool, source_id).await {
            Ok(s) => s,
            Err(KbError::NotFound(_)) => {
                tracing::info!(source_id = %source_id, "source no longer exists, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        knowledge::set_source_status(&self.pool, source_id, SourceStatus::Processing, None).await?;
        tracing::info!(source_id = %source_id, kind = %source.kind, "ingesting source");

        match self.run(&source).await {
            Ok(report) => {
                let (docs, chunks) = index::source_counts(&self.pool, source_id).await?;
                knowledge::mark_source_ready(&self.pool, source_id, docs, chunks).await?;
                tracing::info!(
                    source_id = %source_id,
                    documents = report.documents,
                    changed = report.documents_changed,
                    removed = report.documents_removed,
                    chunks = report.chunks_written,
                    embeddings_written = report.embeddings_written,
                    embeddings_pending = report.embeddings_pending,
                    "source ready"
                );
                Ok(Some(report))
            }
            Err(e) => {
                let message = format!("{:#}", e);
                knowledge::set_source_status(
                    &self.pool,
                    source_id,
                    SourceStatus::Failed,
                    Some(&message),
                )
                .await?;
                tracing::warn!(source_id = %source_id, error = %message, "ingestion failed");
                Err(e)
            }
        }
    }

    /// Mark a source failed after its ingestion was cut off from outside.
    pub async fn abandon(&self, source_id: &str, message: &str) -> Result<()> {
        knowledge::set_source_status(&self.pool, source_id, SourceStatus::Failed, Some(message))
            .await?;
        tracing::warn!(source_id = %source_id, error = %message, "ingestion abandoned");
        Ok(())
    }

    async fn run(&self, source: &KnowledgeSource) -> Result<IngestReport> {
        let items: Vec<SourceItem> = self
            .gather(source)
            .await?
            .into_iter()
            .filter(|item| !item.body.trim().is_empty())
            .collect();
        if items.is_empty() {
            bail!("no text could be extracted from this source");
        }

        let chunking = &self.config.chunking;
        let mut report = IngestReport::default();

        for item in &items {
            let written = index::write_document(
                &self.pool,
                &source.knowledge_base_id,
                &source.id,
                item,
                chunking.max_tokens,
                chunking.overlap_tokens,
            )
            .await?;
            report.documents += 1;
            if written.changed {
                report.documents_changed += 1;
                report.chunks_written += written.chunks_written;
            }
        }

        let keys: Vec<String> = items.iter().map(|i| i.key.clone()).collect();
        report.documents_removed = index::prune_documents(&self.pool, &source.id, &keys).await?;

        if self.embedder.is_enabled() {
            let kb = Some(source.knowledge_base_id.as_str());
            match index::embed_pending(
                &self.pool,
                self.embedder.as_ref(),
                kb,
                self.config.embedding.batch_size,
            )
            .await
            {
                Ok(n) => report.embeddings_written = n,
                Err(e) => {
                    tracing::warn!(source_id = %source.id, error = %e, "embedding failed, chunks stay keyword-searchable")
                }
            }
            report.embeddings_pending =
                index::count_pending_embeddings(&self.pool, kb, self.embedder.model_name())
                    .await?;
        }

        Ok(report)
    }

    async fn gather(&self, source: &KnowledgeSource) -> Result<Vec<SourceItem>> {
        match source.kind {
            SourceKind::Text => Ok(vec![SourceItem {
                key: "body".to_string(),
                title: Some(source.title.clone()),
                url: None,
                content_type: "text/plain".to_string(),
                body: source.content.clone().unwrap_or_default(),
            }]),
            SourceKind::Upload => {
                let path = source
                    .location
                    .clone()
                    .context("upload source has no stored file")?;
                let content_type = source
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "text/plain".to_string());
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path))?;
                let ct = content_type.clone();
                let body = tokio::task::spawn_blocking(move || extract::extract_text(&bytes, &ct))
                    .await??;
                Ok(vec![SourceItem {
                    key: "file".to_string(),
                    title: Some(source.title.clone()),
                    url: None,
                    content_type,
                    body,
                }])
            }
            SourceKind::Url => {
                let location = source.location.as_deref().context("url source has no url")?;
                let seed = reqwest::Url::parse(location)
                    .with_context(|| format!("invalid url: {}", location))?;
                let pages = self.crawler.crawl(&seed).await?;
                Ok(pages
                    .into_iter()
                    .map(|page| SourceItem {
                        key: page.url.clone(),
                        title: page.title.or_else(|| Some(page.url.clone())),
                        url: Some(page.url),
                        content_type: page.content_type,
                        body: page.text,
                    })
                    .collect())
            }
        }
    }
}
