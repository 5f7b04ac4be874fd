pub mod analysis;
pub mod method;
pub mod similarity;
pub mod storage;

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::context::ServiceContext;
use crate::core::jobs::{JobEnvelope, JobId, JobKind, JobStage, JobState};
use analysis::AnalysisPipeline;
use method::MethodPipeline;

/// How long a consumer blocks on an empty queue before checking for shutdown
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Writes intermediate job states
pub struct ProgressReporter<'a> {
    ctx: &'a ServiceContext,
    job_id: &'a JobId,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(ctx: &'a ServiceContext, job_id: &'a JobId) -> Self {
        Self { ctx, job_id }
    }

    pub fn job_id(&self) -> &JobId {
        self.job_id
    }

    /// Best effort: a lost progress update never fails the job
    pub async fn report(&self, stage: JobStage, message: &str) {
        info!("Job {} [{:?}] {}", self.job_id, stage, message);
        let state = JobState::Progress {
            stage,
            message: message.to_string(),
        };
        if let Err(e) = self.ctx.queue.set_state(self.job_id, state).await {
            warn!("Could not record progress for job {}: {}", self.job_id, e);
        }
    }
}

/// Run one job to a terminal state and record it
pub async fn execute(ctx: &ServiceContext, envelope: JobEnvelope) -> JobState {
    let started = Instant::now();
    let label = envelope.kind.label();
    info!("Job {} ({}) started", envelope.id, label);

    let result = match &envelope.kind {
        JobKind::Analysis(job) => AnalysisPipeline::new(ctx, &envelope.id).run(job).await,
        JobKind::MethodDownload(job) => MethodPipeline::new(ctx, &envelope.id).run(job).await,
    };

    let state = match result {
        Ok(output) => {
            info!("Job {} ({}) finished in {:?}", envelope.id, label, started.elapsed());
            JobState::Success { output }
        }
        Err(e) => {
            error!("Job {} ({}) failed: {}", envelope.id, label, e);
            JobState::Failure { error: e.to_string() }
        }
    };
    ctx.metrics.job_finished(label, !state.is_failure(), started.elapsed());

    if let Err(e) = ctx.queue.set_state(&envelope.id, state.clone()).await {
        error!("Could not record final state of job {}: {}", envelope.id, e);
    }
    if let Some(key) = envelope.kind.submission_key() {
        if let Err(e) = ctx.queue.release_key(&key, &envelope.id).await {
            warn!("Could not release submission key {}: {}", key, e);
        }
    }
    state
}

/// Queue consumers running inside this process
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(ctx: ServiceContext, concurrency: usize) -> Self {
        Self::spawn_with_timeout(ctx, concurrency, DEQUEUE_TIMEOUT)
    }

    pub fn spawn_with_timeout(ctx: ServiceContext, concurrency: usize, dequeue_timeout: Duration) -> Self {
        let concurrency = concurrency.max(1);
        let (shutdown, signal) = watch::channel(false);
        let handles = (0..concurrency)
            .map(|worker| {
                let ctx = ctx.clone();
                let signal = signal.clone();
                tokio::spawn(consume(ctx, worker, signal, dequeue_timeout))
            })
            .collect();
        info!(
            "Started {} worker(s) on the {} queue",
            concurrency,
            ctx.queue.backend()
        );
        Self { shutdown, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop taking jobs and wait for running ones to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Workers stopped");
    }
}

async fn consume(ctx: ServiceContext, worker: usize, signal: watch::Receiver<bool>, timeout: Duration) {
    debug!("Worker {} waiting for jobs", worker);
    while !*signal.borrow() {
        match ctx.queue.dequeue(timeout).await {
            Ok(Some(envelope)) => {
                execute(&ctx, envelope).await;
            }
            Ok(None) => {}
            Err(e) => {
                error!("Worker {} could not read the queue: {}", worker, e);
                tokio::time::sleep(timeout).await;
            }
        }
    }
    debug!("Worker {} exiting", worker);
}
