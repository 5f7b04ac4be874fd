//! Message queue between the request surface and the background workers.
//!
//! Besides moving job envelopes, the queue holds job state (so any process
//! can answer a status poll) and short-lived submission keys used to collapse
//! identical in-flight analysis requests onto one job.

pub mod memory;
pub mod redis_queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use thiserror::Error;

use crate::core::config::Settings;
use crate::core::jobs::{JobEnvelope, JobId, JobState};

pub use memory::MemoryJobQueue;
pub use redis_queue::RedisJobQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed queue payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("submission key {0} keeps changing hands")]
    Contended(String),
}

/// Outcome of claiming a submission key
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    Acquired,
    /// Someone else holds the key; carries the holder's job id
    Held(JobId),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Record the job as pending and make it visible to consumers
    async fn enqueue(&self, job: JobEnvelope) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next job
    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobEnvelope>, QueueError>;

    async fn set_state(&self, id: &JobId, state: JobState) -> Result<(), QueueError>;

    /// `None` when the id was never enqueued or its state expired
    async fn state(&self, id: &JobId) -> Result<Option<JobState>, QueueError>;

    /// Drop the state of a job that was never enqueued
    async fn discard_state(&self, id: &JobId) -> Result<(), QueueError>;

    async fn claim_key(&self, key: &str, id: &JobId, ttl: Duration) -> Result<Claim, QueueError>;

    /// Release `key` only if `id` still holds it
    async fn release_key(&self, key: &str, id: &JobId) -> Result<(), QueueError>;

    fn backend(&self) -> &'static str;
}

/// Pick the queue backend from settings
pub async fn connect(settings: &Settings) -> Result<Arc<dyn JobQueue>, QueueError> {
    match &settings.redis_url {
        Some(url) => {
            info!("Using redis job queue");
            Ok(Arc::new(RedisJobQueue::connect(url, "scdata", settings.job_result_ttl).await?))
        }
        None => {
            info!("Using in-process job queue");
            Ok(Arc::new(MemoryJobQueue::new(settings.job_result_ttl)))
        }
    }
}
