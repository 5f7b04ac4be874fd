use crate::core::context::ServiceContext;
use crate::core::error::ServiceResult;
use crate::core::jobs::{JobId, JobOutput, JobStage, MethodJob};
use crate::worker::ProgressReporter;

/// Fetches the method description of an atlas dataset; nothing is stored
pub struct MethodPipeline<'a> {
    ctx: &'a ServiceContext,
    progress: ProgressReporter<'a>,
}

impl<'a> MethodPipeline<'a> {
    pub fn new(ctx: &'a ServiceContext, job_id: &'a JobId) -> Self {
        Self {
            ctx,
            progress: ProgressReporter::new(ctx, job_id),
        }
    }

    pub async fn run(&self, job: &MethodJob) -> ServiceResult<JobOutput> {
        self.progress
            .report(
                JobStage::CallingExternalApi,
                &format!("Fetching method for atlas dataset {}...", job.atlas_dataset_id),
            )
            .await;
        let result = self
            .ctx
            .similarity
            .get_method(job.atlas_dataset_id, &job.tissue_info)
            .await?;
        Ok(JobOutput::Method { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::testing::{test_context_with, TestOptions};
    use crate::worker::similarity::{ApiError, MockSimilarityApi};

    #[tokio::test]
    async fn test_api_error_surfaces_verbatim() {
        let mut similarity = MockSimilarityApi::new();
        similarity.expect_get_method().times(1).returning(|_, _| {
            Err(ApiError::Status {
                url: "http://api/api/get_method".into(),
                status: 404,
                body: "no such atlas".into(),
            })
        });
        let t = test_context_with(TestOptions {
            similarity,
            ..Default::default()
        });
        let job_id = JobId::from("m-1");
        let err = MethodPipeline::new(&t.ctx, &job_id)
            .run(&MethodJob {
                atlas_dataset_id: 12,
                tissue_info: "Kidney".into(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such atlas"));
    }
}
