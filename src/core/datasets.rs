//! Dataset ingest, removal and atlas seeding.
//!
//! Uploaded files are first written to a staging area under the upload
//! directory and only moved into `{upload_dir}/{owner}/` once every check
//! passed, so a rejected upload leaves nothing behind.

use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::core::access::{can_delete, can_publish, Principal};
use crate::core::context::ServiceContext;
use crate::core::error::{ServiceError, ServiceResult};
use crate::db::models::{AtlasMetadataFields, Dataset, NewDataset, User};
use crate::db::queries;

const STAGING_DIR: &str = ".incoming";
/// Directory for datasets registered without an owner
const ANONYMOUS_DIR: &str = "llm";

pub const DELETED_MESSAGE: &str = "Dataset and all associated analysis results deleted successfully";

/// A file written to the staging area; removed on drop unless persisted
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    persisted: bool,
}

impl StagedFile {
    /// Create an empty staged file and hand back a writer for it
    pub async fn create(upload_dir: &Path) -> ServiceResult<(Self, tokio::fs::File)> {
        let dir = upload_dir.join(STAGING_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(Uuid::new_v4().simple().to_string());
        let file = tokio::fs::File::create(&path).await?;
        Ok((
            Self {
                path,
                persisted: false,
            },
            file,
        ))
    }

    pub async fn with_contents(upload_dir: &Path, contents: &[u8]) -> ServiceResult<Self> {
        let (staged, mut file) = Self::create(upload_dir).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the file to `dest`
    pub async fn persist(mut self, dest: &Path) -> ServiceResult<()> {
        tokio::fs::rename(&self.path, dest).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// An uploaded file and the name the client gave it
#[derive(Debug)]
pub struct IncomingFile {
    pub filename: String,
    pub staged: StagedFile,
}

#[derive(Debug)]
pub struct IngestRequest {
    pub h5ad: IncomingFile,
    pub csv: Option<IncomingFile>,
    pub dataset_name: String,
    pub tissue_info: String,
    pub description: Option<String>,
    pub is_public: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub dataset: Dataset,
    /// Non-fatal problems, e.g. a failed feature remap
    pub warnings: Vec<String>,
}

/// Rejects anything that is not a plain file name
fn plain_file_name(name: &str) -> ServiceResult<&str> {
    let plain = Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name);
    if name.is_empty() || !plain || name.starts_with('.') || name.contains('\\') {
        return Err(ServiceError::Validation(format!("Invalid file name: {}", name)));
    }
    Ok(name)
}

fn split_extension<'a>(name: &'a str, extension: &str) -> Option<&'a str> {
    name.strip_suffix(extension).filter(|stem| !stem.is_empty())
}

/// `{stem}.h5ad`, or `{stem}_{8 hex}.h5ad` when that name is taken
async fn free_destination(dir: &Path, stem: &str) -> ServiceResult<(String, PathBuf)> {
    let name = format!("{}.h5ad", stem);
    let path = dir.join(&name);
    if !tokio::fs::try_exists(&path).await? {
        return Ok((name, path));
    }
    let suffix = Uuid::new_v4().simple().to_string();
    let name = format!("{}_{}.h5ad", stem, &suffix[..8]);
    let path = dir.join(&name);
    Ok((name, path))
}

fn required(value: &str, field: &str) -> ServiceResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ServiceError::Validation(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

/// Store an uploaded dataset and register it for `caller`
pub async fn ingest(ctx: &ServiceContext, caller: &Principal, req: IngestRequest) -> ServiceResult<IngestOutcome> {
    if req.is_public {
        if let Principal::User(user) = caller {
            if !can_publish(user) {
                return Err(ServiceError::Forbidden(
                    "Only admins can upload public datasets.".to_string(),
                ));
            }
        }
    }

    let h5ad_name = plain_file_name(&req.h5ad.filename)?;
    let stem = split_extension(h5ad_name, ".h5ad")
        .ok_or_else(|| ServiceError::Validation("Invalid H5AD file format.".to_string()))?
        .to_string();
    if let Some(csv) = &req.csv {
        let csv_name = plain_file_name(&csv.filename)?;
        if split_extension(csv_name, ".csv").is_none() {
            return Err(ServiceError::Validation("Invalid CSV file format.".to_string()));
        }
    }
    let dataset_name = required(&req.dataset_name, "dataset_name")?;
    let tissue_info = required(&req.tissue_info, "tissue_info")?;

    let owner_dir = match caller.user_id() {
        Some(id) => id.to_string(),
        None => ANONYMOUS_DIR.to_string(),
    };
    let dir = ctx.settings.upload_dir.join(owner_dir);
    tokio::fs::create_dir_all(&dir).await?;

    let (filename, h5ad_path) = free_destination(&dir, &stem).await?;
    req.h5ad.staged.persist(&h5ad_path).await?;

    let mut csv_path = None;
    if let Some(csv) = req.csv {
        let stored_stem = filename.trim_end_matches(".h5ad");
        let path = dir.join(format!("{}.csv", stored_stem));
        if let Err(e) = csv.staged.persist(&path).await {
            remove_local(&h5ad_path).await;
            return Err(e);
        }
        csv_path = Some(path);
    }

    let mut warnings = Vec::new();
    if let Some(remapper) = &ctx.remapper {
        if let Err(e) = remapper.remap(&h5ad_path).await {
            warn!("Feature remapping of {} failed, keeping the original: {}", h5ad_path.display(), e);
            warnings.push(format!("Feature remapping failed; the original file was kept ({})", e));
        }
    }

    let record = NewDataset {
        filename: filename.clone(),
        file_path: h5ad_path.display().to_string(),
        dataset_name,
        csv_file_path: csv_path.as_ref().map(|p| p.display().to_string()),
        umap_csv_path: None,
        tissue_info,
        description: req.description.filter(|d| !d.trim().is_empty()),
        is_public: req.is_public,
        is_atlas: false,
        owner_id: caller.user_id(),
    };
    let created = ctx
        .db
        .call(move |conn| Ok(queries::create_dataset(conn, &record)?))
        .await;
    let dataset = match created {
        Ok(dataset) => dataset,
        Err(e) => {
            remove_local(&h5ad_path).await;
            if let Some(path) = &csv_path {
                remove_local(path).await;
            }
            return Err(e);
        }
    };

    info!(
        "Dataset {} ({}) registered by {}",
        dataset.id,
        dataset.filename,
        caller.describe()
    );
    Ok(IngestOutcome { dataset, warnings })
}

async fn remove_local(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}

/// Remove a dataset, its result artifacts and its local files
pub async fn delete(ctx: &ServiceContext, dataset_id: i64, user: &User) -> ServiceResult<()> {
    let (dataset, analyses) = ctx
        .db
        .call(move |conn| {
            let dataset = queries::get_dataset_by_id(conn, dataset_id)?
                .ok_or_else(|| ServiceError::NotFound("Dataset not found".to_string()))?;
            let analyses = queries::get_analyses_for_dataset(conn, dataset_id)?;
            Ok((dataset, analyses))
        })
        .await?;
    if !can_delete(&dataset, user) {
        return Err(ServiceError::Forbidden(
            "Not authorized to delete this dataset".to_string(),
        ));
    }

    for analysis in &analyses {
        let urls = std::iter::once(analysis.csv_url.clone()).chain(analysis.image_url_list());
        for url in urls {
            if let Err(e) = ctx.artifacts.delete_url(&url).await {
                warn!("Failed to delete {} for dataset {}: {}", url, dataset.id, e);
            }
        }
    }

    remove_local(Path::new(&dataset.file_path)).await;
    if let Some(csv) = &dataset.csv_file_path {
        remove_local(Path::new(csv)).await;
    }

    ctx.db
        .call(move |conn| Ok(queries::delete_dataset(conn, dataset_id)?))
        .await?;
    info!("Dataset {} deleted by {}", dataset.id, user.username);
    Ok(())
}

/// One entry of an atlas seed file
#[derive(Debug, Clone, Deserialize)]
pub struct AtlasSeed {
    pub filename: String,
    pub file_path: String,
    pub dataset_name: String,
    pub tissue_info: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub umap_csv_path: Option<String>,
    #[serde(default)]
    pub metadata: Option<AtlasMetadataFields>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
}

/// Register atlas datasets from a JSON array of seeds. Existing atlas
/// datasets (matched by filename) only get their metadata refreshed.
pub async fn import_atlas(ctx: &ServiceContext, path: &Path) -> ServiceResult<ImportSummary> {
    let raw = tokio::fs::read(path).await?;
    let seeds: Vec<AtlasSeed> = serde_json::from_slice(&raw)
        .map_err(|e| ServiceError::Validation(format!("{}: {}", path.display(), e)))?;

    let summary = ctx
        .db
        .call(move |conn| {
            let tx = conn.transaction()?;
            let mut summary = ImportSummary::default();
            for seed in seeds {
                let dataset = match queries::get_atlas_dataset_by_filename(&tx, &seed.filename)? {
                    Some(existing) => {
                        summary.updated += 1;
                        existing
                    }
                    None => {
                        summary.created += 1;
                        queries::create_dataset(
                            &tx,
                            &NewDataset {
                                filename: seed.filename.clone(),
                                file_path: seed.file_path.clone(),
                                dataset_name: seed.dataset_name.clone(),
                                csv_file_path: None,
                                umap_csv_path: seed.umap_csv_path.clone(),
                                tissue_info: seed.tissue_info.clone(),
                                description: seed.description.clone(),
                                is_public: true,
                                is_atlas: true,
                                owner_id: None,
                            },
                        )?
                    }
                };
                if let Some(fields) = &seed.metadata {
                    queries::upsert_atlas_metadata(&tx, dataset.id, fields)?;
                }
            }
            tx.commit()?;
            Ok(summary)
        })
        .await?;

    info!(
        "Atlas import from {}: {} created, {} updated",
        path.display(),
        summary.created,
        summary.updated
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::testing::{test_context, test_context_with, TestContext, TestOptions};
    use crate::core::remap::{MockFeatureRemapper, RemapError};
    use crate::db::models::{NewAnalysis, NewUser};
    use bytes::Bytes;
    use std::sync::Arc;

    async fn user(t: &TestContext, name: &str, is_admin: bool) -> User {
        let record = NewUser {
            username: name.to_string(),
            email: format!("{}@example.org", name),
            hashed_password: "x".to_string(),
            is_admin,
        };
        t.ctx
            .db
            .call(move |conn| Ok(queries::create_user(conn, &record)?))
            .await
            .unwrap()
    }

    async fn incoming(t: &TestContext, filename: &str, contents: &[u8]) -> IncomingFile {
        IncomingFile {
            filename: filename.to_string(),
            staged: StagedFile::with_contents(&t.ctx.settings.upload_dir, contents).await.unwrap(),
        }
    }

    async fn request(t: &TestContext, is_public: bool) -> IngestRequest {
        IngestRequest {
            h5ad: incoming(t, "sample.h5ad", b"h5ad").await,
            csv: None,
            dataset_name: "Sample".into(),
            tissue_info: "Brain".into(),
            description: Some("test upload".into()),
            is_public,
        }
    }

    #[tokio::test]
    async fn test_private_upload_by_user() {
        let t = test_context();
        let alice = user(&t, "alice", false).await;
        let mut req = request(&t, false).await;
        req.csv = Some(incoming(&t, "whatever.csv", b"cell,sweep_id\n").await);

        let outcome = ingest(&t.ctx, &Principal::User(alice.clone()), req).await.unwrap();
        let dataset = outcome.dataset;
        assert_eq!(dataset.owner_id, Some(alice.id));
        assert!(!dataset.is_public);
        assert!(outcome.warnings.is_empty());

        let dir = t.ctx.settings.upload_dir.join(alice.id.to_string());
        assert_eq!(PathBuf::from(&dataset.file_path), dir.join("sample.h5ad"));
        assert_eq!(dataset.csv_file_path, Some(dir.join("sample.csv").display().to_string()));
        assert_eq!(std::fs::read(dir.join("sample.h5ad")).unwrap(), b"h5ad");
        // staging area is empty
        let staged = std::fs::read_dir(t.ctx.settings.upload_dir.join(STAGING_DIR)).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn test_non_admin_cannot_publish() {
        let t = test_context();
        let bob = user(&t, "bob", false).await;
        let err = ingest(&t.ctx, &Principal::User(bob), request(&t, true).await)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Only admins can upload public datasets.");

        let admin = user(&t, "root", true).await;
        let outcome = ingest(&t.ctx, &Principal::User(admin), request(&t, true).await).await.unwrap();
        assert!(outcome.dataset.is_public);
    }

    #[tokio::test]
    async fn test_anonymous_registrations_go_to_llm_dir() {
        let t = test_context();
        let outcome = ingest(&t.ctx, &Principal::System, request(&t, true).await).await.unwrap();
        assert_eq!(outcome.dataset.owner_id, None);
        assert!(outcome.dataset.file_path.contains("/llm/"));
    }

    #[tokio::test]
    async fn test_bad_names_are_rejected() {
        let t = test_context();
        let caller = Principal::User(user(&t, "carol", false).await);

        let mut req = request(&t, false).await;
        req.h5ad.filename = "sample.txt".into();
        let err = ingest(&t.ctx, &caller, req).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid H5AD file format.");

        let mut req = request(&t, false).await;
        req.h5ad.filename = "../escape.h5ad".into();
        assert!(matches!(ingest(&t.ctx, &caller, req).await, Err(ServiceError::Validation(_))));

        let mut req = request(&t, false).await;
        req.csv = Some(incoming(&t, "side.tsv", b"").await);
        let err = ingest(&t.ctx, &caller, req).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid CSV file format.");

        // rejected uploads leave no staged files
        let staged = std::fs::read_dir(t.ctx.settings.upload_dir.join(STAGING_DIR)).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn test_existing_file_is_not_overwritten() {
        let t = test_context();
        let caller = Principal::User(user(&t, "dave", false).await);
        let first = ingest(&t.ctx, &caller, request(&t, false).await).await.unwrap();
        let second = ingest(&t.ctx, &caller, request(&t, false).await).await.unwrap();
        assert_eq!(first.dataset.filename, "sample.h5ad");
        assert_ne!(second.dataset.filename, "sample.h5ad");
        assert!(second.dataset.filename.starts_with("sample_"));
        assert!(Path::new(&first.dataset.file_path).exists());
    }

    #[tokio::test]
    async fn test_remap_failure_is_a_warning() {
        let mut remapper = MockFeatureRemapper::new();
        remapper
            .expect_remap()
            .times(1)
            .returning(|_| Err(RemapError::MissingOutput));
        let t = test_context_with(TestOptions {
            remapper: Some(Arc::new(remapper)),
            ..Default::default()
        });
        let caller = Principal::User(user(&t, "erin", false).await);
        let outcome = ingest(&t.ctx, &caller, request(&t, false).await).await.unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(std::fs::read(&outcome.dataset.file_path).unwrap(), b"h5ad");
    }

    #[tokio::test]
    async fn test_delete_removes_artifacts_and_rows() {
        let t = test_context();
        let owner = user(&t, "frank", false).await;
        let other = user(&t, "grace", false).await;
        let dataset = ingest(&t.ctx, &Principal::User(owner.clone()), request(&t, false).await)
            .await
            .unwrap()
            .dataset;

        let csv_url = t.ctx.artifacts.put("analysis_results/j_data.csv", Bytes::from_static(b"csv")).await.unwrap();
        let plot_url = t.ctx.artifacts.put("analysis_results/j_plot1.png", Bytes::from_static(b"png")).await.unwrap();
        let record = NewAnalysis {
            dataset_id: dataset.id,
            analysis_param: "wasserstein".into(),
            csv_url,
            // a foreign URL cannot be deleted but must not abort the removal
            image_urls: vec![plot_url, "https://elsewhere.example.com/x.png".into()],
        };
        t.ctx
            .db
            .call(move |conn| Ok(queries::insert_analysis(conn, &record)?))
            .await
            .unwrap();

        let err = delete(&t.ctx, dataset.id, &other).await.unwrap_err();
        assert_eq!(err.to_string(), "Not authorized to delete this dataset");

        delete(&t.ctx, dataset.id, &owner).await.unwrap();
        assert!(t.ctx.artifacts.get("analysis_results/j_data.csv").await.is_err());
        assert!(t.ctx.artifacts.get("analysis_results/j_plot1.png").await.is_err());
        assert!(!Path::new(&dataset.file_path).exists());
        let id = dataset.id;
        let left = t
            .ctx
            .db
            .call(move |conn| Ok(queries::get_analyses_for_dataset(conn, id)?.len()))
            .await
            .unwrap();
        assert_eq!(left, 0);

        assert!(matches!(delete(&t.ctx, dataset.id, &owner).await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_admin_may_delete_any_dataset() {
        let t = test_context();
        let owner = user(&t, "heidi", false).await;
        let admin = user(&t, "ivan", true).await;
        let dataset = ingest(&t.ctx, &Principal::User(owner), request(&t, false).await)
            .await
            .unwrap()
            .dataset;
        delete(&t.ctx, dataset.id, &admin).await.unwrap();
    }

    #[tokio::test]
    async fn test_import_atlas_is_repeatable() {
        let t = test_context();
        let seed = t.dir.path().join("atlas.json");
        std::fs::write(
            &seed,
            r#"[
                {"filename": "brain_1.h5ad", "file_path": "atlas/brain_1.h5ad", "dataset_name": "Brain 1",
                 "tissue_info": "Brain", "umap_csv_path": "umaps/brain_1.csv",
                 "metadata": {"species": "human", "number_of_cells": 1200.0, "cta_actinn_check": true}},
                {"filename": "heart_1.h5ad", "file_path": "atlas/heart_1.h5ad", "dataset_name": "Heart 1",
                 "tissue_info": "Heart"}
            ]"#,
        )
        .unwrap();

        let first = import_atlas(&t.ctx, &seed).await.unwrap();
        assert_eq!(first, ImportSummary { created: 2, updated: 0 });
        let second = import_atlas(&t.ctx, &seed).await.unwrap();
        assert_eq!(second, ImportSummary { created: 0, updated: 2 });

        let detail = t
            .ctx
            .db
            .call(|conn| {
                let dataset = queries::get_atlas_dataset_by_filename(conn, "brain_1.h5ad")?
                    .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                Ok(queries::load_detail(conn, dataset)?)
            })
            .await
            .unwrap();
        assert!(detail.dataset.is_public && detail.dataset.is_atlas);
        let metadata = detail.atlas_metadata.unwrap();
        assert_eq!(metadata.fields.species.as_deref(), Some("human"));
        assert_eq!(metadata.fields.number_of_cells, Some(1200.0));
    }

    #[tokio::test]
    async fn test_import_rejects_malformed_seed_file() {
        let t = test_context();
        let seed = t.dir.path().join("atlas.json");
        std::fs::write(&seed, "{\"not\": \"a list\"}").unwrap();
        assert!(matches!(import_atlas(&t.ctx, &seed).await, Err(ServiceError::Validation(_))));
    }
}
