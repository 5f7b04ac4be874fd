use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::core::access::Principal;
use crate::core::context::ServiceContext;
use crate::core::datasets::{self, IncomingFile, IngestRequest, StagedFile};
use crate::core::error::{ServiceError, ServiceResult};
use crate::core::jobs::JobId;
use crate::core::orchestrator::{PollStatus, Submission};
use crate::tools::protocol::{EventSink, Level};
use crate::web::models::numeric_id;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {source}")]
    Arguments {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Background analysis task failed: {0}")]
    AnalysisFailed(String),
    #[error("Failed to get atlas method: {0}")]
    MethodFailed(String),
    #[error("Client disconnected while waiting for job {0}")]
    Disconnected(JobId),
}

type ToolResult = Result<Value, ToolError>;

pub fn tool_list() -> Value {
    json!([
        {
            "name": "register_dataset",
            "title": "Register Dataset",
            "description": "Download an .h5ad file (and optional .csv side table) from URLs and register it as a dataset.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "h5ad_file_url": { "type": "string", "description": "http(s) URL of the .h5ad expression file." },
                    "tissue_info": { "type": "string", "description": "Tissue the cells come from, e.g. 'Lung'." },
                    "dataset_name": { "type": "string" },
                    "description": { "type": "string" },
                    "csv_file_url": { "type": "string", "description": "Optional URL of a CSV side table with a sweep_id column." },
                    "is_public": { "type": "boolean", "description": "Only honoured for admin callers; anonymous registrations are always public." }
                },
                "required": ["h5ad_file_url", "tissue_info", "dataset_name", "description"],
                "additionalProperties": false
            }
        },
        {
            "name": "start_analysis",
            "title": "Start Analysis",
            "description": "Run a similarity analysis on a dataset and stream its progress until the result URLs are ready.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "dataset_id": { "type": "integer" },
                    "analysis_param": { "type": "string", "description": "Feature name passed to the similarity service." }
                },
                "required": ["dataset_id", "analysis_param"],
                "additionalProperties": false
            }
        },
        {
            "name": "get_atlas_method",
            "title": "Get Atlas Method",
            "description": "Fetch the recommended annotation method of an atlas dataset for a tissue.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tissue_info": { "type": "string" },
                    "atlas_dataset_id": { "type": ["integer", "string"] }
                },
                "required": ["tissue_info", "atlas_dataset_id"],
                "additionalProperties": false
            }
        }
    ])
}

#[derive(Debug, Deserialize)]
struct RegisterDatasetArgs {
    h5ad_file_url: String,
    tissue_info: String,
    dataset_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    csv_file_url: Option<String>,
    #[serde(default)]
    is_public: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StartAnalysisArgs {
    #[serde(deserialize_with = "numeric_id")]
    dataset_id: i64,
    analysis_param: String,
}

#[derive(Debug, Deserialize)]
struct AtlasMethodArgs {
    tissue_info: String,
    #[serde(deserialize_with = "numeric_id")]
    atlas_dataset_id: i64,
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|source| ToolError::Arguments {
        tool: tool.to_string(),
        source,
    })
}

/// Run one tool on behalf of `caller`
pub async fn call_tool(
    ctx: &ServiceContext,
    caller: &Principal,
    name: &str,
    arguments: Value,
    events: &EventSink,
) -> ToolResult {
    info!("Tool {} called by {}", name, caller.describe());
    match name {
        "register_dataset" => register_dataset(ctx, caller, parse_args(name, arguments)?, events).await,
        "start_analysis" => start_analysis(ctx, caller, parse_args(name, arguments)?, events).await,
        "get_atlas_method" => get_atlas_method(ctx, parse_args(name, arguments)?, events).await,
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

async fn register_dataset(
    ctx: &ServiceContext,
    caller: &Principal,
    args: RegisterDatasetArgs,
    events: &EventSink,
) -> ToolResult {
    events.info(format!("Registering dataset {}...", args.dataset_name));
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| ServiceError::Internal(format!("download client: {}", e)))?;
    let upload_dir = ctx.settings.upload_dir.as_path();

    let h5ad = IncomingFile {
        filename: remote_file_name(&args.h5ad_file_url, ".h5ad")
            .unwrap_or_else(|| format!("{}.h5ad", args.dataset_name.trim())),
        staged: download(&client, upload_dir, &args.h5ad_file_url).await?,
    };
    let csv = match &args.csv_file_url {
        Some(url) => Some(IncomingFile {
            filename: remote_file_name(url, ".csv").unwrap_or_else(|| "side_table.csv".to_string()),
            staged: download(&client, upload_dir, url).await?,
        }),
        None => None,
    };
    let is_public = match caller {
        Principal::System => true,
        Principal::User(_) => args.is_public.unwrap_or(false),
    };

    let outcome = datasets::ingest(
        ctx,
        caller,
        IngestRequest {
            h5ad,
            csv,
            dataset_name: args.dataset_name,
            tissue_info: args.tissue_info,
            description: args.description,
            is_public,
        },
    )
    .await?;
    for warning in &outcome.warnings {
        events.info(warning.clone());
    }
    events.info(format!(
        "Dataset {} registered with ID {}",
        outcome.dataset.dataset_name, outcome.dataset.id
    ));
    Ok(serde_json::to_value(&outcome).map_err(ServiceError::from)?)
}

/// Last path segment of `url` when it carries `extension`
fn remote_file_name(url: &str, extension: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path_segments()?.last()?;
    (name.len() > extension.len() && name.ends_with(extension)).then(|| name.to_string())
}

/// Stream `url` into the staging area
async fn download(client: &reqwest::Client, upload_dir: &Path, url: &str) -> ServiceResult<StagedFile> {
    let parsed = Url::parse(url)
        .map_err(|e| ServiceError::Validation(format!("Invalid file URL {}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ServiceError::Validation(format!(
            "Unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }
    let failed = |e: reqwest::Error| ServiceError::Validation(format!("Could not download {}: {}", url, e));

    let mut response = client.get(parsed).send().await.map_err(failed)?;
    if !response.status().is_success() {
        return Err(ServiceError::Validation(format!(
            "Could not download {}: HTTP {}",
            url,
            response.status()
        )));
    }
    let (staged, mut file) = StagedFile::create(upload_dir).await?;
    while let Some(chunk) = response.chunk().await.map_err(failed)? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    info!("Downloaded {} to {}", url, staged.path().display());
    Ok(staged)
}

/// Submit (or reuse) an analysis, then follow it to completion
async fn start_analysis(
    ctx: &ServiceContext,
    caller: &Principal,
    args: StartAnalysisArgs,
    events: &EventSink,
) -> ToolResult {
    let submission = ctx
        .jobs
        .start_analysis(args.dataset_id, &args.analysis_param, caller)
        .await?;
    let job_id = match submission {
        Submission::Cached(analysis) => {
            events.info("Found a stored result for this analysis.");
            return Ok(json!({
                "status": "CACHED",
                "image_urls": analysis.image_url_list(),
                "csv_url": analysis.csv_url,
            }));
        }
        Submission::Started { job_id, deduplicated } => {
            if deduplicated {
                events.info(format!("Joining running analysis task {}", job_id));
            } else {
                events.info(format!("Analysis task started, ID: {}. Waiting for a worker...", job_id));
            }
            job_id
        }
    };

    let mut last_message: Option<String> = None;
    loop {
        let status = ctx.jobs.analysis_status(&job_id).await?;
        match status.status {
            PollStatus::Pending => {}
            PollStatus::Progress => {
                if status.message.is_some() && status.message != last_message {
                    if let Some(message) = &status.message {
                        events.info(message.clone());
                    }
                    last_message = status.message;
                }
            }
            PollStatus::Success => {
                events.info("Analysis task completed successfully.");
                return Ok(json!({
                    "status": "SUCCESS",
                    "task_id": job_id.to_string(),
                    "image_urls": status.image_urls.unwrap_or_default(),
                    "csv_url": status.csv_url,
                }));
            }
            PollStatus::Failure => {
                let error = status.message.unwrap_or_default();
                events.log(Level::Error, "Analysis task failed.");
                return Err(ToolError::AnalysisFailed(error));
            }
        }
        if events.disconnected() {
            warn!("Client left; no longer following job {}", job_id);
            return Err(ToolError::Disconnected(job_id));
        }
        tokio::time::sleep(ctx.settings.tool_poll_interval).await;
    }
}

async fn get_atlas_method(ctx: &ServiceContext, args: AtlasMethodArgs, events: &EventSink) -> ToolResult {
    events.info(format!("Fetching the atlas method for tissue '{}'...", args.tissue_info));
    let job_id = ctx
        .jobs
        .submit_method_download(args.atlas_dataset_id, &args.tissue_info)
        .await?;
    loop {
        let status = ctx.jobs.method_status(&job_id).await?;
        match status.status {
            PollStatus::Success => {
                events.info("Atlas method retrieved.");
                return Ok(status.result.unwrap_or(Value::Null));
            }
            PollStatus::Failure => {
                return Err(ToolError::MethodFailed(status.error.unwrap_or_default()));
            }
            PollStatus::Pending | PollStatus::Progress => {}
        }
        if events.disconnected() {
            return Err(ToolError::Disconnected(job_id));
        }
        tokio::time::sleep(ctx.settings.tool_poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_file_name() {
        assert_eq!(
            remote_file_name("https://host/files/pbmc.h5ad?sig=1", ".h5ad").as_deref(),
            Some("pbmc.h5ad")
        );
        assert_eq!(remote_file_name("https://host/download", ".h5ad"), None);
        assert_eq!(remote_file_name("https://host/.h5ad", ".h5ad"), None);
        assert_eq!(remote_file_name("not a url", ".csv"), None);
    }

    #[test]
    fn test_tool_list_names() {
        let names: Vec<String> = tool_list()
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["register_dataset", "start_analysis", "get_atlas_method"]);
    }

    #[test]
    fn test_arguments_are_checked() {
        let err = parse_args::<StartAnalysisArgs>("start_analysis", json!({"dataset_id": "x"})).unwrap_err();
        assert!(err.to_string().starts_with("Invalid arguments for start_analysis"));
        let args: AtlasMethodArgs =
            parse_args("get_atlas_method", json!({"tissue_info": "Lung", "atlas_dataset_id": "3"})).unwrap();
        assert_eq!(args.atlas_dataset_id, 3);
    }
}
