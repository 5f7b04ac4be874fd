use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque job identifier handed back to clients
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for JobId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for JobId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run one analysis parameter against a stored dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub dataset_id: i64,
    pub h5ad_file_path: String,
    pub csv_file_path: Option<String>,
    pub analysis_param: String,
    pub tissue_info: String,
}

/// Fetch the method description for an atlas dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodJob {
    pub atlas_dataset_id: i64,
    pub tissue_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    Analysis(AnalysisJob),
    MethodDownload(MethodJob),
}

impl JobKind {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::Analysis(_) => "analysis",
            JobKind::MethodDownload(_) => "method_download",
        }
    }

    /// Key shared by identical in-flight submissions
    pub fn submission_key(&self) -> Option<String> {
        match self {
            JobKind::Analysis(job) => Some(analysis_submission_key(job.dataset_id, &job.analysis_param)),
            JobKind::MethodDownload(_) => None,
        }
    }
}

pub fn analysis_submission_key(dataset_id: i64, analysis_param: &str) -> String {
    format!("analysis:{}:{}", dataset_id, analysis_param)
}

/// What travels through the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: JobId,
    pub kind: JobKind,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(kind: JobKind) -> Self {
        Self {
            id: JobId::new(),
            kind,
            enqueued_at: Utc::now(),
        }
    }
}

/// Progression of a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    LoadingInput,
    CallingExternalApi,
    GeneratingArtifacts,
    UploadingArtifacts,
    PersistingResult,
    Done,
}

/// Result of a successful job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutput {
    Analysis {
        csv_url: String,
        image_urls: Vec<String>,
    },
    Method {
        result: serde_json::Value,
    },
}

/// Observable state of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Progress { stage: JobStage, message: String },
    Success { output: JobOutput },
    Failure { error: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success { .. } | JobState::Failure { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobState::Failure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_submission_key_only_for_analysis() {
        let analysis = JobKind::Analysis(AnalysisJob {
            dataset_id: 7,
            h5ad_file_path: "a.h5ad".into(),
            csv_file_path: None,
            analysis_param: "wasserstein".into(),
            tissue_info: "Brain".into(),
        });
        assert_eq!(analysis.submission_key().as_deref(), Some("analysis:7:wasserstein"));
        assert_eq!(analysis.label(), "analysis");

        let method = JobKind::MethodDownload(MethodJob {
            atlas_dataset_id: 3,
            tissue_info: "Brain".into(),
        });
        assert!(method.submission_key().is_none());
    }

    #[test]
    fn test_state_wire_format() {
        let state = JobState::Progress {
            stage: JobStage::CallingExternalApi,
            message: "Running analysis with param: wasserstein...".into(),
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["state"], "progress");
        assert_eq!(value["stage"], "calling_external_api");
        assert!(!state.is_terminal());

        let done: JobState = serde_json::from_value(serde_json::json!({
            "state": "failure",
            "error": "boom"
        }))
        .unwrap();
        assert!(done.is_terminal());
        assert!(done.is_failure());
    }
}
