use actix_web::{web, HttpResponse};
use chrono::Utc;
use log::error;

use crate::core::context::ServiceContext;
use crate::core::error::{ServiceError, ServiceResult};
use crate::web::models::SystemStatusResponse;

/// Get the overall service status
pub async fn get_system_status(data: web::Data<ServiceContext>) -> ServiceResult<HttpResponse> {
    let response = SystemStatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (Utc::now() - data.started_at).num_seconds(),
        queue_backend: data.queue.backend().to_string(),
    };
    Ok(HttpResponse::Ok().json(response))
}

/// Prometheus scrape endpoint
pub async fn get_metrics(data: web::Data<ServiceContext>) -> ServiceResult<HttpResponse> {
    let body = data.metrics.render().map_err(|e| {
        error!("Failed to render metrics: {}", e);
        ServiceError::Internal(format!("metrics: {}", e))
    })?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}
