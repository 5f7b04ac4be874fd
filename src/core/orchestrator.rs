use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::core::access::{ensure_can_analyze, Principal};
use crate::core::error::{ServiceError, ServiceResult};
use crate::core::jobs::{
    analysis_submission_key, AnalysisJob, JobEnvelope, JobId, JobKind, JobOutput, JobState, MethodJob,
};
use crate::core::metrics::ServiceMetrics;
use crate::db::models::{Analysis, Dataset};
use crate::db::{queries, Database};
use crate::queue::{Claim, JobQueue, QueueError};

pub const PENDING_MESSAGE: &str = "Task is waiting to be executed.";

/// Outcome of an analysis request
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// A stored result already exists for the (dataset, parameter) pair
    Cached(Analysis),
    /// A job is running for the pair; `deduplicated` when it was already in flight
    Started { job_id: JobId, deduplicated: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollStatus {
    Pending,
    Progress,
    Success,
    Failure,
}

/// Poll answer for an analysis job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisStatus {
    pub status: PollStatus,
    pub image_urls: Option<Vec<String>>,
    pub csv_url: Option<String>,
    pub message: Option<String>,
}

/// Poll answer for a method download job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodStatus {
    pub status: PollStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Submits jobs and answers status polls
#[derive(Clone)]
pub struct JobOrchestrator {
    db: Database,
    queue: Arc<dyn JobQueue>,
    metrics: ServiceMetrics,
    submission_ttl: Duration,
}

impl JobOrchestrator {
    pub fn new(
        db: Database,
        queue: Arc<dyn JobQueue>,
        metrics: ServiceMetrics,
        submission_ttl: Duration,
    ) -> Self {
        Self {
            db,
            queue,
            metrics,
            submission_ttl,
        }
    }

    /// Look up the dataset, check access, then submit
    pub async fn start_analysis(
        &self,
        dataset_id: i64,
        analysis_param: &str,
        caller: &Principal,
    ) -> ServiceResult<Submission> {
        let dataset = self
            .db
            .call(move |conn| Ok(queries::get_dataset_by_id(conn, dataset_id)?))
            .await?
            .ok_or_else(|| ServiceError::NotFound("Dataset not found".to_string()))?;
        ensure_can_analyze(&dataset, caller)?;
        self.submit_analysis(&dataset, analysis_param).await
    }

    pub async fn submit_analysis(&self, dataset: &Dataset, analysis_param: &str) -> ServiceResult<Submission> {
        let analysis_param = analysis_param.trim();
        if analysis_param.is_empty() {
            return Err(ServiceError::Validation("analysis_param is required".to_string()));
        }

        // cached result
        let dataset_id = dataset.id;
        let param = analysis_param.to_string();
        let existing = self
            .db
            .call(move |conn| Ok(queries::get_analysis_by_param(conn, dataset_id, &param)?))
            .await?;
        if let Some(analysis) = existing {
            info!("Analysis {} for dataset {} served from cache", analysis_param, dataset.id);
            self.metrics.cache_hit();
            return Ok(Submission::Cached(analysis));
        }

        // claim the submission key so identical requests share one job
        let envelope = JobEnvelope::new(JobKind::Analysis(AnalysisJob {
            dataset_id: dataset.id,
            h5ad_file_path: dataset.file_path.clone(),
            csv_file_path: dataset.csv_file_path.clone(),
            analysis_param: analysis_param.to_string(),
            tissue_info: dataset.tissue_info.clone(),
        }));
        let key = analysis_submission_key(dataset.id, analysis_param);

        // visible before the key is, so a holder without state is stale
        self.queue.set_state(&envelope.id, JobState::Pending).await?;

        for _ in 0..3 {
            match self.queue.claim_key(&key, &envelope.id, self.submission_ttl).await? {
                Claim::Acquired => {
                    let job_id = envelope.id.clone();
                    self.enqueue_claimed(envelope, &key).await?;
                    return Ok(Submission::Started {
                        job_id,
                        deduplicated: false,
                    });
                }
                Claim::Held(holder) => match self.queue.state(&holder).await? {
                    Some(state) if !state.is_failure() => {
                        info!("Analysis {} for dataset {} joins job {}", analysis_param, dataset.id, holder);
                        self.queue.discard_state(&envelope.id).await?;
                        self.metrics.deduplicated();
                        return Ok(Submission::Started {
                            job_id: holder,
                            deduplicated: true,
                        });
                    }
                    _ => {
                        warn!("Taking over stale submission key {} from job {}", key, holder);
                        self.queue.release_key(&key, &holder).await?;
                    }
                },
            }
        }
        self.queue.discard_state(&envelope.id).await?;
        Err(QueueError::Contended(key).into())
    }

    async fn enqueue_claimed(&self, envelope: JobEnvelope, key: &str) -> ServiceResult<()> {
        let job_id = envelope.id.clone();
        let label = envelope.kind.label();
        if let Err(e) = self.queue.enqueue(envelope).await {
            if let Err(release) = self.queue.release_key(key, &job_id).await {
                warn!("Could not release submission key {}: {}", key, release);
            }
            return Err(e.into());
        }
        self.metrics.job_submitted(label);
        info!("Enqueued {} job {}", label, job_id);
        Ok(())
    }

    pub async fn analysis_status(&self, job_id: &JobId) -> ServiceResult<AnalysisStatus> {
        let state = self.job_state(job_id).await?;
        let status = match state {
            JobState::Pending => AnalysisStatus {
                status: PollStatus::Pending,
                image_urls: None,
                csv_url: None,
                message: Some(PENDING_MESSAGE.to_string()),
            },
            JobState::Progress { message, .. } => AnalysisStatus {
                status: PollStatus::Progress,
                image_urls: None,
                csv_url: None,
                message: Some(message),
            },
            JobState::Success {
                output: JobOutput::Analysis { csv_url, image_urls },
            } => AnalysisStatus {
                status: PollStatus::Success,
                image_urls: Some(image_urls),
                csv_url: Some(csv_url),
                message: None,
            },
            JobState::Success { .. } => return Err(task_not_found()),
            JobState::Failure { error } => AnalysisStatus {
                status: PollStatus::Failure,
                image_urls: None,
                csv_url: None,
                message: Some(error),
            },
        };
        Ok(status)
    }

    pub async fn submit_method_download(&self, atlas_dataset_id: i64, tissue_info: &str) -> ServiceResult<JobId> {
        if tissue_info.trim().is_empty() {
            return Err(ServiceError::Validation("tissue_info is required".to_string()));
        }
        let envelope = JobEnvelope::new(JobKind::MethodDownload(MethodJob {
            atlas_dataset_id,
            tissue_info: tissue_info.trim().to_string(),
        }));
        let job_id = envelope.id.clone();
        let label = envelope.kind.label();
        self.queue.enqueue(envelope).await?;
        self.metrics.job_submitted(label);
        info!("Enqueued {} job {}", label, job_id);
        Ok(job_id)
    }

    pub async fn method_status(&self, job_id: &JobId) -> ServiceResult<MethodStatus> {
        let state = self.job_state(job_id).await?;
        let status = match state {
            JobState::Pending => MethodStatus {
                status: PollStatus::Pending,
                result: None,
                error: None,
            },
            JobState::Progress { .. } => MethodStatus {
                status: PollStatus::Progress,
                result: None,
                error: None,
            },
            JobState::Success {
                output: JobOutput::Method { result },
            } => MethodStatus {
                status: PollStatus::Success,
                result: Some(result),
                error: None,
            },
            JobState::Success { .. } => return Err(task_not_found()),
            JobState::Failure { error } => MethodStatus {
                status: PollStatus::Failure,
                result: None,
                error: Some(error),
            },
        };
        Ok(status)
    }

    async fn job_state(&self, job_id: &JobId) -> ServiceResult<JobState> {
        self.queue.state(job_id).await?.ok_or_else(task_not_found)
    }
}

fn task_not_found() -> ServiceError {
    ServiceError::NotFound("Task not found".to_string())
}
