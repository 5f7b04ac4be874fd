use serde::{Deserialize, Deserializer, Serialize};

use crate::core::datasets::IngestOutcome;
use crate::db::models::{Analysis, DatasetDetail, User};

/// Registration request
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub message: String,
    pub user: User,
}

/// Login response
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

/// Plain acknowledgement
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Upload acknowledgement
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub dataset: DatasetDetail,
    pub warnings: Vec<String>,
}

impl UploadResponse {
    pub fn from_outcome(outcome: IngestOutcome, dataset: DatasetDetail) -> Self {
        Self {
            message: format!("Files for '{}' uploaded successfully", outcome.dataset.filename),
            dataset,
            warnings: outcome.warnings,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UmapPathResponse {
    pub id: i64,
    pub umap_csv_path: Option<String>,
}

/// Answer to an analysis start request
#[derive(Debug, Serialize)]
pub struct StartAnalysisResponse {
    pub task_id: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csv_url: Option<String>,
    /// Set when an identical request was already running
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deduplicated: bool,
}

impl StartAnalysisResponse {
    pub fn cached(analysis: &Analysis) -> Self {
        Self {
            task_id: None,
            status: "CACHED",
            image_urls: Some(analysis.image_url_list()),
            csv_url: Some(analysis.csv_url.clone()),
            deduplicated: false,
        }
    }

    pub fn started(task_id: String, deduplicated: bool) -> Self {
        Self {
            task_id: Some(task_id),
            status: "STARTED",
            image_urls: None,
            csv_url: None,
            deduplicated,
        }
    }
}

/// Method download request; the id may arrive as a number or a string
#[derive(Debug, Deserialize)]
pub struct FunctionDownloadRequest {
    #[serde(deserialize_with = "numeric_id")]
    pub dataset_id: i64,
    pub tissue_info: String,
}

#[derive(Debug, Serialize)]
pub struct TaskAccepted {
    pub task_id: String,
    pub status: &'static str,
}

pub(crate) fn numeric_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(id) => Ok(id),
        Raw::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("dataset_id is not a number: {}", text))),
    }
}

/// Health probe
#[derive(Debug, Serialize)]
pub struct SystemStatusResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: i64,
    pub queue_backend: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_download_accepts_string_ids() {
        let req: FunctionDownloadRequest =
            serde_json::from_str(r#"{"dataset_id": "42", "tissue_info": "Brain"}"#).unwrap();
        assert_eq!(req.dataset_id, 42);
        let req: FunctionDownloadRequest =
            serde_json::from_str(r#"{"dataset_id": 7, "tissue_info": "Brain"}"#).unwrap();
        assert_eq!(req.dataset_id, 7);
        assert!(serde_json::from_str::<FunctionDownloadRequest>(r#"{"dataset_id": "x", "tissue_info": "B"}"#).is_err());
    }

    #[test]
    fn test_started_response_shape() {
        let value = serde_json::to_value(StartAnalysisResponse::started("abc".into(), false)).unwrap();
        assert_eq!(value, serde_json::json!({"task_id": "abc", "status": "STARTED"}));
    }
}
