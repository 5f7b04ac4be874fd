use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use log::{info, warn};
use serde_json::{Map, Value};

use crate::core::context::ServiceContext;
use crate::core::error::{ServiceError, ServiceResult};
use crate::core::jobs::{AnalysisJob, JobId, JobOutput, JobStage};
use crate::db::models::NewAnalysis;
use crate::db::queries;
use crate::worker::similarity::{SimilarityRequest, SimilarityResponse};
use crate::worker::storage::ArtifactStore;
use crate::worker::ProgressReporter;

const SWEEP_COLUMN: &str = "sweep_id";

/// Runs one analysis job end to end
pub struct AnalysisPipeline<'a> {
    ctx: &'a ServiceContext,
    progress: ProgressReporter<'a>,
}

impl<'a> AnalysisPipeline<'a> {
    pub fn new(ctx: &'a ServiceContext, job_id: &'a JobId) -> Self {
        Self {
            ctx,
            progress: ProgressReporter::new(ctx, job_id),
        }
    }

    pub async fn run(&self, job: &AnalysisJob) -> ServiceResult<JobOutput> {
        let job_id = self.progress.job_id();

        // Step 1: optional side table
        self.progress.report(JobStage::LoadingInput, "Loading data...").await;
        let sweep_dict_json = match &job.csv_file_path {
            Some(path) => {
                let sweep = load_sweep_dict(Path::new(path)).await?;
                info!("Job {} loaded side table {} ({} rows)", job_id, path, sweep.len());
                Some(serde_json::to_string(&Value::Object(sweep))?)
            }
            None => None,
        };

        // Step 2: external similarity API
        self.progress
            .report(
                JobStage::CallingExternalApi,
                &format!("Running analysis with param: {}...", job.analysis_param),
            )
            .await;
        let response = self
            .ctx
            .similarity
            .get_similarity(SimilarityRequest {
                h5ad_path: PathBuf::from(&job.h5ad_file_path),
                tissue: job.tissue_info.clone(),
                feature_name: job.analysis_param.clone(),
                sweep_dict_json,
            })
            .await?;

        // Step 3: artifacts in memory
        self.progress.report(JobStage::GeneratingArtifacts, "Generating CSV data...").await;
        let table = build_result_table(&response)?;
        self.progress.report(JobStage::GeneratingArtifacts, "Generating plots...").await;
        let plots = decode_plots(&response)?;

        // Step 4: object storage
        self.progress.report(JobStage::UploadingArtifacts, "Uploading results...").await;
        let mut artifacts = vec![(format!("analysis_results/{}_data.csv", job_id), table)];
        for (name, data) in plots {
            artifacts.push((format!("analysis_results/{}_{}.png", job_id, name), data));
        }
        let uploaded = upload_all(&self.ctx.artifacts, artifacts).await?;
        let csv_url = uploaded[0].clone();
        let image_urls: Vec<String> = uploaded[1..].to_vec();

        // Step 5: persist
        self.progress.report(JobStage::PersistingResult, "Saving results...").await;
        let record = NewAnalysis {
            dataset_id: job.dataset_id,
            analysis_param: job.analysis_param.clone(),
            csv_url,
            image_urls,
        };
        let stored = self
            .ctx
            .db
            .call(move |conn| Ok(queries::insert_analysis(conn, &record)?))
            .await;
        let (analysis, inserted) = match stored {
            Ok(stored) => stored,
            Err(e) => {
                remove_uploaded(&self.ctx.artifacts, &uploaded).await;
                return Err(e);
            }
        };
        if !inserted {
            info!(
                "Job {}: dataset {} already has a result for {}, keeping it",
                job_id, job.dataset_id, job.analysis_param
            );
            remove_uploaded(&self.ctx.artifacts, &uploaded).await;
        }

        self.progress.report(JobStage::Done, "Analysis complete.").await;
        Ok(JobOutput::Analysis {
            image_urls: analysis.image_url_list(),
            csv_url: analysis.csv_url,
        })
    }
}

/// Side table: first column is the sample index, `sweep_id` holds the value
pub async fn load_sweep_dict(path: &Path) -> ServiceResult<Map<String, Value>> {
    let raw = tokio::fs::read(path).await?;
    parse_sweep_dict(&raw).map_err(|reason| {
        ServiceError::Validation(format!("Side table {}: {}", path.display(), reason))
    })
}

fn parse_sweep_dict(raw: &[u8]) -> Result<Map<String, Value>, String> {
    let mut reader = csv::ReaderBuilder::new().flexible(false).from_reader(raw);
    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    let column = headers
        .iter()
        .position(|h| h.trim() == SWEEP_COLUMN)
        .filter(|&i| i > 0)
        .ok_or_else(|| format!("no {} column", SWEEP_COLUMN))?;

    let mut sweep = Map::new();
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        let index = record.get(0).unwrap_or_default().to_string();
        let value = record.get(column).map(cell_value).unwrap_or(Value::Null);
        sweep.insert(index, value);
    }
    Ok(sweep)
}

/// Numbers stay numbers, blanks become null
fn cell_value(cell: &str) -> Value {
    let cell = cell.trim();
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = cell.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    Value::String(cell.to_string())
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `,Method,Preprocessing Step,dataset_id` with one row per metadata entry
pub fn build_result_table(response: &SimilarityResponse) -> ServiceResult<Bytes> {
    let mut metadata = response
        .metadata
        .clone()
        .ok_or_else(|| ServiceError::Internal("similarity response has no metadata".to_string()))?;
    let atlas_dataset_id = metadata.shift_remove("dataset_id").map(|v| text_of(&v)).unwrap_or_default();

    let mut writer = csv::Writer::from_writer(Vec::new());
    let csv_error = |e: csv::Error| ServiceError::Internal(format!("cannot write result table: {}", e));
    writer
        .write_record(["", "Method", "Preprocessing Step", "dataset_id"])
        .map_err(csv_error)?;
    for (row, (method, step)) in metadata.iter().enumerate() {
        writer
            .write_record([row.to_string(), method.clone(), text_of(step), atlas_dataset_id.clone()])
            .map_err(csv_error)?;
    }
    let data = writer
        .into_inner()
        .map_err(|e| ServiceError::Internal(format!("cannot write result table: {}", e)))?;
    Ok(Bytes::from(data))
}

/// Decoded `plot1`/`plot2` images; absent or empty plots are skipped
pub fn decode_plots(response: &SimilarityResponse) -> ServiceResult<Vec<(&'static str, Bytes)>> {
    let mut plots = Vec::new();
    for (name, encoded) in [
        ("plot1", &response.plot1_png_base64),
        ("plot2", &response.plot2_png_base64),
    ] {
        let Some(encoded) = encoded.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            continue;
        };
        let data = BASE64
            .decode(encoded)
            .map_err(|e| ServiceError::Internal(format!("{} is not valid base64: {}", name, e)))?;
        plots.push((name, Bytes::from(data)));
    }
    Ok(plots)
}

/// Upload everything or nothing
async fn upload_all(store: &ArtifactStore, artifacts: Vec<(String, Bytes)>) -> ServiceResult<Vec<String>> {
    let mut urls = Vec::with_capacity(artifacts.len());
    for (key, data) in artifacts {
        match store.put(&key, data).await {
            Ok(url) => urls.push(url),
            Err(e) => {
                remove_uploaded(store, &urls).await;
                return Err(e.into());
            }
        }
    }
    Ok(urls)
}

async fn remove_uploaded(store: &ArtifactStore, urls: &[String]) {
    for url in urls {
        if let Err(e) = store.delete_url(url).await {
            warn!("Could not remove artifact {}: {}", url, e);
        }
    }
}
