use actix_web::{web, HttpRequest, HttpResponse};

use crate::core::access::Principal;
use crate::core::context::ServiceContext;
use crate::core::error::ServiceResult;
use crate::core::jobs::JobId;
use crate::core::orchestrator::Submission;
use crate::web::auth::CurrentUser;
use crate::web::form::read_form;
use crate::web::models::StartAnalysisResponse;

/// Form field `analysis_param`; answers with the cached result or a task id
pub async fn start_analysis(
    data: web::Data<ServiceContext>,
    path: web::Path<i64>,
    user: CurrentUser,
    req: HttpRequest,
    payload: web::Payload,
) -> ServiceResult<HttpResponse> {
    let form = read_form(&req, payload, None).await?;
    let analysis_param = form.required("analysis_param")?;
    let submission = data
        .jobs
        .start_analysis(path.into_inner(), &analysis_param, &Principal::User(user.0))
        .await?;

    let response = match submission {
        Submission::Cached(analysis) => StartAnalysisResponse::cached(&analysis),
        Submission::Started { job_id, deduplicated } => {
            StartAnalysisResponse::started(job_id.to_string(), deduplicated)
        }
    };
    Ok(HttpResponse::Ok().json(response))
}

pub async fn get_analysis_status(
    data: web::Data<ServiceContext>,
    path: web::Path<String>,
) -> ServiceResult<HttpResponse> {
    let job_id = JobId::from(path.into_inner());
    let status = data.jobs.analysis_status(&job_id).await?;
    Ok(HttpResponse::Ok().json(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::testing::test_context;
    use crate::core::jobs::{JobOutput, JobState};
    use crate::db::models::{NewAnalysis, NewDataset};
    use crate::db::queries;
    use crate::queue::JobQueue;
    use crate::web::handlers::{seed_user, test_app};
    use actix_web::http::{header, StatusCode};
    use actix_web::test;
    use serde_json::{json, Value};

    async fn dataset(ctx: &ServiceContext, owner: i64, is_public: bool) -> i64 {
        ctx.db
            .call(move |conn| {
                Ok(queries::create_dataset(
                    conn,
                    &NewDataset {
                        filename: "sample.h5ad".into(),
                        file_path: "uploads/sample.h5ad".into(),
                        dataset_name: "Sample".into(),
                        tissue_info: "Brain".into(),
                        is_public,
                        owner_id: Some(owner),
                        ..Default::default()
                    },
                )?
                .id)
            })
            .await
            .unwrap()
    }

    fn start(id: i64, token: &str, param: &str) -> test::TestRequest {
        test::TestRequest::post()
            .uri(&format!("/api/analysis/start/{}", id))
            .insert_header((header::AUTHORIZATION, format!("Bearer {}", token)))
            .set_form([("analysis_param", param)])
    }

    #[actix_web::test]
    async fn test_private_dataset_rejects_other_users() {
        let t = test_context();
        let (alice, _) = seed_user(&t.ctx, "alice", false).await;
        let (_, bob_token) = seed_user(&t.ctx, "bob", false).await;
        let id = dataset(&t.ctx, alice.id, false).await;
        let app = test_app!(t.ctx);

        let resp = test::call_service(&app, start(id, &bob_token, "wasserstein").to_request()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["detail"], "Access denied. You can only analyze your own or public datasets.");
        assert!(t.queue.is_empty());

        let resp = test::call_service(&app, start(id + 100, &bob_token, "wasserstein").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_start_then_poll() {
        let t = test_context();
        let (alice, alice_token) = seed_user(&t.ctx, "alice", false).await;
        let (_, bob_token) = seed_user(&t.ctx, "bob", false).await;
        let id = dataset(&t.ctx, alice.id, true).await;
        let app = test_app!(t.ctx);

        let first: Value = test::call_and_read_body_json(&app, start(id, &bob_token, "wasserstein").to_request()).await;
        assert_eq!(first["status"], "STARTED");
        let task_id = first["task_id"].as_str().unwrap().to_string();

        // identical request while the first is in flight shares the job
        let second: Value = test::call_and_read_body_json(&app, start(id, &alice_token, "wasserstein").to_request()).await;
        assert_eq!(second["task_id"], task_id.as_str());
        assert_eq!(second["deduplicated"], true);
        assert_eq!(t.queue.len(), 1);

        let req = test::TestRequest::get()
            .uri(&format!("/api/analysis/status/{}", task_id))
            .to_request();
        let status: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["status"], "PENDING");
        assert_eq!(status["message"], "Task is waiting to be executed.");

        let job_id = JobId::from(task_id.as_str());
        t.queue
            .set_state(
                &job_id,
                JobState::Success {
                    output: JobOutput::Analysis {
                        csv_url: "https://bucket/a.csv".into(),
                        image_urls: vec!["https://bucket/a.png".into()],
                    },
                },
            )
            .await
            .unwrap();
        let req = test::TestRequest::get()
            .uri(&format!("/api/analysis/status/{}", task_id))
            .to_request();
        let status: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(
            status,
            json!({"status": "SUCCESS", "image_urls": ["https://bucket/a.png"], "csv_url": "https://bucket/a.csv", "message": null})
        );
    }

    #[actix_web::test]
    async fn test_cached_result_skips_queue() {
        let t = test_context();
        let (alice, token) = seed_user(&t.ctx, "alice", false).await;
        let id = dataset(&t.ctx, alice.id, false).await;
        let record = NewAnalysis {
            dataset_id: id,
            analysis_param: "wasserstein".into(),
            csv_url: "https://bucket/r.csv".into(),
            image_urls: vec!["https://bucket/p1.png".into(), "https://bucket/p2.png".into()],
        };
        t.ctx
            .db
            .call(move |conn| Ok(queries::insert_analysis(conn, &record)?))
            .await
            .unwrap();
        let app = test_app!(t.ctx);

        let body: Value = test::call_and_read_body_json(&app, start(id, &token, "wasserstein").to_request()).await;
        assert_eq!(
            body,
            json!({
                "task_id": null,
                "status": "CACHED",
                "image_urls": ["https://bucket/p1.png", "https://bucket/p2.png"],
                "csv_url": "https://bucket/r.csv"
            })
        );
        assert!(t.queue.is_empty());
    }

    #[actix_web::test]
    async fn test_unknown_task_is_404() {
        let t = test_context();
        let app = test_app!(t.ctx);
        let req = test::TestRequest::get().uri("/api/analysis/status/nope").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }
}
