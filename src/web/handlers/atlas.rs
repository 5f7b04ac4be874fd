use actix_web::{web, HttpResponse};

use crate::core::context::ServiceContext;
use crate::core::error::{ServiceError, ServiceResult};
use crate::core::jobs::JobId;
use crate::db::queries;
use crate::web::models::{FunctionDownloadRequest, TaskAccepted, UmapPathResponse};

fn atlas_not_found() -> ServiceError {
    ServiceError::NotFound("Atlas dataset not found".to_string())
}

pub async fn list_atlas_datasets(data: web::Data<ServiceContext>) -> ServiceResult<HttpResponse> {
    let details = data
        .db
        .call(|conn| {
            let atlas = queries::get_atlas_datasets(conn)?;
            Ok(queries::load_details(conn, atlas)?)
        })
        .await?;
    Ok(HttpResponse::Ok().json(details))
}

pub async fn get_single_atlas(
    data: web::Data<ServiceContext>,
    path: web::Path<i64>,
) -> ServiceResult<HttpResponse> {
    let dataset_id = path.into_inner();
    let detail = data
        .db
        .call(move |conn| {
            let dataset = queries::get_atlas_dataset_by_id(conn, dataset_id)?.ok_or_else(atlas_not_found)?;
            Ok(queries::load_detail(conn, dataset)?)
        })
        .await?;
    Ok(HttpResponse::Ok().json(detail))
}

/// Id and coordinate table of every atlas dataset for a tissue
pub async fn get_umaps_by_tissue(
    data: web::Data<ServiceContext>,
    path: web::Path<String>,
) -> ServiceResult<HttpResponse> {
    let tissue = path.into_inner();
    let datasets = data
        .db
        .call(move |conn| Ok(queries::get_atlas_datasets_by_tissue(conn, &tissue)?))
        .await?;
    let umaps: Vec<UmapPathResponse> = datasets
        .into_iter()
        .map(|d| UmapPathResponse {
            id: d.id,
            umap_csv_path: d.umap_csv_path,
        })
        .collect();
    Ok(HttpResponse::Ok().json(umaps))
}

/// Atlas dataset stored as `{name}.h5ad`, with its metadata
pub async fn get_atlas_metadata(
    data: web::Data<ServiceContext>,
    path: web::Path<String>,
) -> ServiceResult<HttpResponse> {
    let filename = format!("{}.h5ad", path.into_inner());
    let detail = data
        .db
        .call(move |conn| {
            let dataset = queries::get_atlas_dataset_by_filename(conn, &filename)?.ok_or_else(atlas_not_found)?;
            Ok(queries::load_detail(conn, dataset)?)
        })
        .await?;
    Ok(HttpResponse::Ok().json(detail))
}

pub async fn start_function_download(
    data: web::Data<ServiceContext>,
    body: web::Json<FunctionDownloadRequest>,
) -> ServiceResult<HttpResponse> {
    let req = body.into_inner();
    let job_id = data.jobs.submit_method_download(req.dataset_id, &req.tissue_info).await?;
    Ok(HttpResponse::Ok().json(TaskAccepted {
        task_id: job_id.to_string(),
        status: "PENDING",
    }))
}

pub async fn get_function_download_status(
    data: web::Data<ServiceContext>,
    path: web::Path<String>,
) -> ServiceResult<HttpResponse> {
    let job_id = JobId::from(path.into_inner());
    let status = data.jobs.method_status(&job_id).await?;
    Ok(HttpResponse::Ok().json(status))
}
