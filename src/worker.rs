//! Background workers consuming the job queue.
//!
//! A [`Worker`] owns a set of [`JobHandler`]s keyed by job kind. Each of
//! its concurrent loops repeatedly claims a due job, runs the matching
//! handler under `worker.job_timeout_secs`, and records the outcome in the
//! queue. An idle loop sleeps `worker.poll_interval_ms`. A separate task
//! periodically calls [`queue::reap_stale`] so jobs held by a crashed
//! process are retried.
//!
//! Any number of worker processes (and the server's embedded pool) can share
//! one database; claims are atomic.
//!
//! Shutdown is cooperative: once the `watch` channel flips to `true`, loops
//! finish the job in hand and exit.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{Config, WorkerConfig};
use crate::embedding::EmbeddingProvider;
use crate::ingest::Ingestor;
use crate::models::{Job, JobStatus};
use crate::queue;

const REAP_INTERVAL: Duration = Duration::from_secs(30);

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job kind this handler processes.
    fn kind(&self) -> &str;
    async fn handle(&self, job: &Job) -> Result<()>;

    /// Called when `handle` was dropped for exceeding `worker.job_timeout_secs`.
    /// Handlers that track state outside the job row settle it here, since
    /// their own error path never ran.
    async fn timed_out(&self, _job: &Job, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Handles [`queue::INGEST_SOURCE`] jobs.
pub struct IngestHandler {
    ingestor: Ingestor,
}

impl IngestHandler {
    pub fn new(ingestor: Ingestor) -> Self {
        Self { ingestor }
    }
}

#[async_trait]
impl JobHandler for IngestHandler {
    fn kind(&self) -> &str {
        queue::INGEST_SOURCE
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        self.ingestor.ingest_source(source_id(job)?).await?;
        Ok(())
    }

    async fn timed_out(&self, job: &Job, message: &str) -> Result<()> {
        self.ingestor.abandon(source_id(job)?, message).await
    }
}

fn source_id(job: &Job) -> Result<&str> {
    job.payload
        .get("source_id")
        .and_then(|v| v.as_str())
        .context("ingest job payload has no source_id")
}

/// Result of processing one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: String,
    pub kind: String,
    /// `Queued` means the job failed and will be retried.
    pub status: JobStatus,
}

pub struct Worker {
    pool: SqlitePool,
    config: WorkerConfig,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    name: String,
}

impl Worker {
    pub fn new(pool: SqlitePool, config: WorkerConfig) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        Self {
            pool,
            config,
            handlers: HashMap::new(),
            name: format!("{}-{}-{}", host, std::process::id(), &Uuid::new_v4().to_string()[..8]),
        }
    }

    /// A worker with the built-in handlers for every job kind this crate enqueues.
    pub fn with_default_handlers(
        pool: SqlitePool,
        config: Arc<Config>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let ingestor = Ingestor::new(pool.clone(), config.clone(), embedder)?;
        let mut worker = Worker::new(pool, config.worker.clone());
        worker.register(Arc::new(IngestHandler::new(ingestor)));
        Ok(worker)
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    /// Claim and process at most one job. `None` when nothing is due.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<JobOutcome>> {
        let job = match queue::claim(&self.pool, worker_id).await? {
            Some(job) => job,
            None => return Ok(None),
        };
        tracing::info!(job_id = %job.id, kind = %job.kind, attempt = job.attempts, worker = %worker_id, "claimed job");

        let result = match self.handlers.get(&job.kind) {
            Some(handler) => {
                let limit = Duration::from_secs(self.config.job_timeout_secs);
                match tokio::time::timeout(limit, handler.handle(&job)).await {
                    Ok(r) => r,
                    Err(_) => {
                        let message =
                            format!("job timed out after {}s", self.config.job_timeout_secs);
                        if let Err(e) = handler.timed_out(&job, &message).await {
                            tracing::warn!(job_id = %job.id, error = %e, "timeout cleanup failed");
                        }
                        Err(anyhow::anyhow!(message))
                    }
                }
            }
            None => Err(anyhow::anyhow!("no handler registered for job kind '{}'", job.kind)),
        };

        let status = match result {
            Ok(()) => {
                if queue::complete(&self.pool, &job.id, worker_id).await? {
                    tracing::info!(job_id = %job.id, "job succeeded");
                } else {
                    tracing::warn!(job_id = %job.id, "job finished after losing its lock");
                }
                JobStatus::Succeeded
            }
            Err(e) => {
                let message = format!("{:#}", e);
                let status = queue::fail(&self.pool, &job, worker_id, &message, &self.config).await?;
                match status {
                    JobStatus::Queued => tracing::warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        max_attempts = job.max_attempts,
                        error = %message,
                        "job failed, will retry"
                    ),
                    _ => tracing::error!(job_id = %job.id, error = %message, "job failed permanently"),
                }
                status
            }
        };

        Ok(Some(JobOutcome {
            job_id: job.id,
            kind: job.kind,
            status,
        }))
    }

    /// Process due jobs until none remain. Returns how many were processed.
    pub async fn drain(&self) -> Result<usize> {
        let mut n = 0;
        while self.run_once(&self.name).await?.is_some() {
            n += 1;
        }
        Ok(n)
    }

    /// Run `concurrency` polling loops plus the stale-job reaper until
    /// `shutdown` becomes `true`.
    pub async fn run_pool(
        self: Arc<Self>,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let concurrency = concurrency.max(1);
        tracing::info!(worker = %self.name, concurrency, "worker pool started");

        let mut handles = Vec::with_capacity(concurrency + 1);
        for slot in 0..concurrency {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.poll_loop(slot, shutdown).await;
            }));
        }

        let reaper = self.clone();
        let mut reaper_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if let Err(e) = queue::reap_stale(&reaper.pool, reaper.config.stale_after_secs).await {
                    tracing::warn!(error = %e, "reaping stale jobs failed");
                }
                tokio::select! {
                    res = reaper_shutdown.changed() => if res.is_err() { break },
                    _ = tokio::time::sleep(REAP_INTERVAL) => {}
                }
                if *reaper_shutdown.borrow() {
                    break;
                }
            }
        }));

        for handle in handles {
            handle.await?;
        }
        tracing::info!(worker = %self.name, "worker pool stopped");
        Ok(())
    }

    async fn poll_loop(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        let worker_id = format!("{}/{}", self.name, slot);
        let idle = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let sleep_for = match self.run_once(&worker_id).await {
                Ok(Some(_)) => continue,
                Ok(None) => idle,
                Err(e) => {
                    tracing::error!(worker = %worker_id, error = %e, "queue error");
                    idle * 4
                }
            };
            tokio::select! {
                // A dropped sender can never signal again; treat it as shutdown.
                res = shutdown.changed() => if res.is_err() { break },
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }
}

/// A shutdown channel that flips to `true` on Ctrl-C.
pub fn ctrl_c_shutdown() -> watch::Receiver<bool> {
    shutdown_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
}

/// A shutdown channel that flips to `true` once `signal` completes.
pub fn shutdown_on<F>(signal: F) -> watch::Receiver<bool>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        signal.await;
        tracing::info!("shutdown requested");
        let _ = tx.send(true);
    });
    rx
}
