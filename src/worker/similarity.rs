use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::io::ReaderStream;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("cannot read {path}: {source}")]
    Input {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },
    #[error("unexpected response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

/// One similarity request for an uploaded dataset
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityRequest {
    pub h5ad_path: PathBuf,
    pub tissue: String,
    pub feature_name: String,
    /// JSON object of per-sample sweep ids from the side table
    pub sweep_dict_json: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SimilarityResponse {
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub plot1_png_base64: Option<String>,
    #[serde(default)]
    pub plot2_png_base64: Option<String>,
}

/// The external similarity analysis API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SimilarityApi: Send + Sync {
    async fn get_similarity(&self, request: SimilarityRequest) -> Result<SimilarityResponse, ApiError>;

    /// Raw method description for an atlas dataset
    async fn get_method(&self, atlas_id: i64, tissue: &str) -> Result<Value, ApiError>;
}

pub struct HttpSimilarityApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSimilarityApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body: truncate(&body, 512),
        })
    }
}

#[async_trait]
impl SimilarityApi for HttpSimilarityApi {
    async fn get_similarity(&self, request: SimilarityRequest) -> Result<SimilarityResponse, ApiError> {
        let url = format!("{}/api/get_similarity", self.base_url);
        let path_text = request.h5ad_path.display().to_string();
        let input_error = |source| ApiError::Input {
            path: path_text.clone(),
            source,
        };

        let file = tokio::fs::File::open(&request.h5ad_path).await.map_err(input_error)?;
        let length = file.metadata().await.map_err(input_error)?.len();
        let file_name = request
            .h5ad_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data.h5ad".to_string());

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(ReaderStream::new(file)), length)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(ApiError::Client)?;

        let mut form = Form::new()
            .part("h5ad_file", part)
            .text("tissue", request.tissue)
            .text("feature_name", request.feature_name)
            .text("use_sim_cache", "True");
        if let Some(sweep) = request.sweep_dict_json {
            form = form.text("sweep_dict_json", sweep);
        }

        debug!("POST {} ({} bytes)", url, length);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        let response = Self::check_status(&url, response).await?;
        response
            .json::<SimilarityResponse>()
            .await
            .map_err(|e| ApiError::Malformed {
                url,
                reason: e.to_string(),
            })
    }

    async fn get_method(&self, atlas_id: i64, tissue: &str) -> Result<Value, ApiError> {
        let url = format!("{}/api/get_method", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("atlas_id", atlas_id.to_string()), ("tissue", tissue.to_lowercase())])
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        let response = Self::check_status(&url, response).await?;
        response.json::<Value>().await.map_err(|e| ApiError::Malformed {
            url,
            reason: e.to_string(),
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
