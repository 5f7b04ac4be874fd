use std::path::PathBuf;

use actix_files::NamedFile;
use actix_web::{web, HttpRequest, HttpResponse};

use crate::core::access::{can_view, Principal};
use crate::core::context::ServiceContext;
use crate::core::datasets::{self, IngestRequest, DELETED_MESSAGE};
use crate::core::error::{ServiceError, ServiceResult};
use crate::db::queries;
use crate::web::auth::{CurrentUser, MaybeUser};
use crate::web::form::read_form;
use crate::web::models::{MessageResponse, UploadResponse};

/// Multipart upload: `h5ad_file`, optional `csv_file`, and the descriptive fields
pub async fn upload_dataset(
    data: web::Data<ServiceContext>,
    user: CurrentUser,
    req: HttpRequest,
    payload: web::Payload,
) -> ServiceResult<HttpResponse> {
    let mut form = read_form(&req, payload, Some(data.settings.upload_dir.as_path())).await?;
    let h5ad = form
        .take_file("h5ad_file")
        .ok_or_else(|| ServiceError::Validation("Field required: h5ad_file".to_string()))?;
    let request = IngestRequest {
        h5ad,
        csv: form.take_file("csv_file"),
        dataset_name: form.required("dataset_name")?,
        tissue_info: form.required("tissue_info")?,
        description: form.text("description").map(str::to_string),
        is_public: form.flag("is_public")?,
    };

    let outcome = datasets::ingest(&data, &Principal::User(user.0), request).await?;
    let dataset = outcome.dataset.clone();
    let detail = data
        .db
        .call(move |conn| Ok(queries::load_detail(conn, dataset)?))
        .await?;
    Ok(HttpResponse::Ok().json(UploadResponse::from_outcome(outcome, detail)))
}

/// The caller's datasets plus every public one
pub async fn list_datasets(data: web::Data<ServiceContext>, user: CurrentUser) -> ServiceResult<HttpResponse> {
    let user_id = user.0.id;
    let details = data
        .db
        .call(move |conn| {
            let visible = queries::get_datasets_visible_to(conn, user_id)?;
            Ok(queries::load_details(conn, visible)?)
        })
        .await?;
    Ok(HttpResponse::Ok().json(details))
}

/// Public datasets are open to everyone; private ones only to their owner
pub async fn get_dataset(
    data: web::Data<ServiceContext>,
    path: web::Path<i64>,
    caller: MaybeUser,
) -> ServiceResult<HttpResponse> {
    let dataset_id = path.into_inner();
    let principal = caller.principal();
    let detail = data
        .db
        .call(move |conn| {
            let dataset = queries::get_dataset_by_id(conn, dataset_id)?
                .filter(|dataset| can_view(dataset, &principal))
                .ok_or_else(|| ServiceError::NotFound("Dataset not found".to_string()))?;
            Ok(queries::load_detail(conn, dataset)?)
        })
        .await?;
    Ok(HttpResponse::Ok().json(detail))
}

fn upload_not_found() -> ServiceError {
    ServiceError::NotFound("File not found".to_string())
}

/// Path below the upload directory; hidden entries and traversal are refused
fn upload_relative_path(tail: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for part in tail.split('/') {
        if part.is_empty() || part.starts_with('.') || part.contains('\\') {
            return None;
        }
        relative.push(part);
    }
    (!relative.as_os_str().is_empty()).then_some(relative)
}

/// Serve an uploaded file to callers who may view the dataset it belongs to
pub async fn download_upload(
    data: web::Data<ServiceContext>,
    path: web::Path<String>,
    caller: MaybeUser,
    req: HttpRequest,
) -> ServiceResult<HttpResponse> {
    let relative = upload_relative_path(&path.into_inner()).ok_or_else(upload_not_found)?;
    let full_path = data.settings.upload_dir.join(relative);
    let stored = full_path.display().to_string();
    let principal = caller.principal();
    let visible = data
        .db
        .call(move |conn| {
            Ok(queries::get_dataset_by_stored_path(conn, &stored)?
                .is_some_and(|dataset| can_view(&dataset, &principal)))
        })
        .await?;
    if !visible {
        return Err(upload_not_found());
    }
    let file = NamedFile::open_async(&full_path)
        .await
        .map_err(|_| upload_not_found())?;
    Ok(file.into_response(&req))
}

pub async fn delete_dataset(
    data: web::Data<ServiceContext>,
    path: web::Path<i64>,
    user: CurrentUser,
) -> ServiceResult<HttpResponse> {
    datasets::delete(&data, path.into_inner(), &user.0).await?;
    Ok(HttpResponse::Ok().json(MessageResponse::new(DELETED_MESSAGE)))
}
