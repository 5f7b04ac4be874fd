use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::auth::{generate_random_token, TokenIssuer};
use crate::core::config::Settings;
use crate::core::error::{ServiceError, ServiceResult};
use crate::core::metrics::ServiceMetrics;
use crate::core::orchestrator::JobOrchestrator;
use crate::core::remap::{CommandRemapper, FeatureRemapper};
use crate::db::Database;
use crate::notify::Notifier;
use crate::queue::{self, JobQueue};
use crate::worker::similarity::{HttpSimilarityApi, SimilarityApi};
use crate::worker::storage::ArtifactStore;

/// Every long-lived handle the service needs, built once at startup and
/// shared by the HTTP surface, the tool surface and the workers.
#[derive(Clone)]
pub struct ServiceContext {
    pub settings: Arc<Settings>,
    pub db: Database,
    pub queue: Arc<dyn JobQueue>,
    pub jobs: JobOrchestrator,
    pub artifacts: ArtifactStore,
    pub similarity: Arc<dyn SimilarityApi>,
    pub notifier: Arc<Notifier>,
    pub remapper: Option<Arc<dyn FeatureRemapper>>,
    pub tokens: TokenIssuer,
    pub metrics: ServiceMetrics,
    pub started_at: DateTime<Utc>,
}

/// Collaborators that differ between production and tests
pub struct Collaborators {
    pub db: Database,
    pub queue: Arc<dyn JobQueue>,
    pub artifacts: ArtifactStore,
    pub similarity: Arc<dyn SimilarityApi>,
    pub notifier: Notifier,
    pub remapper: Option<Arc<dyn FeatureRemapper>>,
}

impl ServiceContext {
    /// Connect every collaborator described by `settings`.
    ///
    /// `require_secret` is set for processes that issue or verify session
    /// tokens; worker-only processes run with a throwaway secret.
    pub async fn connect(settings: Settings, require_secret: bool) -> ServiceResult<Self> {
        let db = Database::open(settings.database_path())?;
        let queue = queue::connect(&settings).await?;
        let artifacts = ArtifactStore::from_settings(&settings)?;
        let similarity: Arc<dyn SimilarityApi> = Arc::new(HttpSimilarityApi::new(
            &settings.demo_url,
            settings.external_api_timeout,
        )?);
        let notifier = Notifier::from_settings(&settings.mail, &settings.frontend_base_url)?;
        let remapper: Option<Arc<dyn FeatureRemapper>> =
            match (&settings.remap_command, &settings.gene_map_path) {
                (Some(command), Some(gene_map)) => {
                    info!("Uploads are remapped with {} using {}", command, gene_map.display());
                    Some(Arc::new(CommandRemapper::new(command.clone(), gene_map.clone())))
                }
                (Some(_), None) => {
                    warn!("REMAP_COMMAND is set without GENE_MAP_PATH; remapping disabled");
                    None
                }
                _ => None,
            };

        Self::assemble(
            settings,
            require_secret,
            Collaborators {
                db,
                queue,
                artifacts,
                similarity,
                notifier,
                remapper,
            },
        )
    }

    pub fn assemble(settings: Settings, require_secret: bool, parts: Collaborators) -> ServiceResult<Self> {
        let secret = match (&settings.secret_key, require_secret) {
            (Some(secret), _) => secret.clone(),
            (None, true) => {
                return Err(ServiceError::Config("SECRET_KEY must be set".to_string()));
            }
            (None, false) => {
                warn!("SECRET_KEY not set; using a random key for this process");
                generate_random_token(64)
            }
        };
        let tokens = TokenIssuer::new(&secret, settings.algorithm, settings.access_token_expire_minutes);
        let metrics = ServiceMetrics::new()
            .map_err(|e| ServiceError::Internal(format!("metrics registry: {}", e)))?;
        let jobs = JobOrchestrator::new(
            parts.db.clone(),
            parts.queue.clone(),
            metrics.clone(),
            settings.submission_lease,
        );

        Ok(Self {
            settings: Arc::new(settings),
            db: parts.db,
            queue: parts.queue,
            jobs,
            artifacts: parts.artifacts,
            similarity: parts.similarity,
            notifier: Arc::new(parts.notifier),
            remapper: parts.remapper,
            tokens,
            metrics,
            started_at: Utc::now(),
        })
    }
}
