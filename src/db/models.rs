use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Registered account
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub hashed_password: String,
    pub is_admin: bool,
    pub is_email_verified: bool,
    #[serde(skip)]
    pub email_verification_token: Option<String>,
    #[serde(skip)]
    pub email_verification_expires: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub password_reset_token: Option<String>,
    #[serde(skip)]
    pub password_reset_expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            username: row.get("username")?,
            email: row.get("email")?,
            hashed_password: row.get("hashed_password")?,
            is_admin: row.get("is_admin")?,
            is_email_verified: row.get("is_email_verified")?,
            email_verification_token: row.get("email_verification_token")?,
            email_verification_expires: row.get("email_verification_expires")?,
            password_reset_token: row.get("password_reset_token")?,
            password_reset_expires: row.get("password_reset_expires")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub hashed_password: String,
    pub is_admin: bool,
}

/// Uploaded or seeded dataset
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Dataset {
    pub id: i64,
    pub filename: String,
    pub file_path: String,
    pub dataset_name: String,
    pub csv_file_path: Option<String>,
    pub umap_csv_path: Option<String>,
    pub tissue_info: String,
    pub description: Option<String>,
    pub upload_time: DateTime<Utc>,
    pub is_public: bool,
    pub is_atlas: bool,
    /// `None` for system-seeded and anonymous tool registrations
    pub owner_id: Option<i64>,
}

impl Dataset {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            filename: row.get("filename")?,
            file_path: row.get("file_path")?,
            dataset_name: row.get("dataset_name")?,
            csv_file_path: row.get("csv_file_path")?,
            umap_csv_path: row.get("umap_csv_path")?,
            tissue_info: row.get("tissue_info")?,
            description: row.get("description")?,
            upload_time: row.get("upload_time")?,
            is_public: row.get("is_public")?,
            is_atlas: row.get("is_atlas")?,
            owner_id: row.get("owner_id")?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewDataset {
    pub filename: String,
    pub file_path: String,
    pub dataset_name: String,
    pub csv_file_path: Option<String>,
    pub umap_csv_path: Option<String>,
    pub tissue_info: String,
    pub description: Option<String>,
    pub is_public: bool,
    pub is_atlas: bool,
    pub owner_id: Option<i64>,
}

/// Result of one analysis parameter run against one dataset
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Analysis {
    pub id: i64,
    pub dataset_id: i64,
    pub analysis_param: String,
    pub csv_url: String,
    /// Comma-joined plot URLs
    pub image_urls: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Analysis {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            dataset_id: row.get("dataset_id")?,
            analysis_param: row.get("analysis_param")?,
            csv_url: row.get("csv_url")?,
            image_urls: row.get("image_urls")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn image_url_list(&self) -> Vec<String> {
        self.image_urls
            .as_deref()
            .map(|joined| {
                joined
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub dataset_id: i64,
    pub analysis_param: String,
    pub csv_url: String,
    pub image_urls: Vec<String>,
}

impl NewAnalysis {
    pub(crate) fn joined_image_urls(&self) -> Option<String> {
        if self.image_urls.is_empty() {
            None
        } else {
            Some(self.image_urls.join(","))
        }
    }
}

macro_rules! atlas_columns {
    ($($field:ident : $kind:ident),* $(,)?) => {
        /// Precomputed benchmark statistics and per-method scores of an atlas dataset
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct AtlasMetadataFields {
            $(pub $field: Option<atlas_columns!(@rust $kind)>,)*
        }

        impl AtlasMetadataFields {
            /// Column names and SQL types, in table order
            pub const COLUMNS: &'static [(&'static str, &'static str)] = &[
                $((stringify!($field), atlas_columns!(@sql $kind)),)*
            ];

            pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
                Ok(Self {
                    $($field: row.get(stringify!($field))?,)*
                })
            }

            /// Values in `COLUMNS` order
            pub(crate) fn values(&self) -> Vec<&dyn ToSql> {
                vec![$(&self.$field as &dyn ToSql,)*]
            }
        }
    };
    (@rust text) => { String };
    (@rust real) => { f64 };
    (@rust integer) => { i64 };
    (@rust boolean) => { bool };
    (@sql text) => { "TEXT" };
    (@sql real) => { "REAL" };
    (@sql integer) => { "INTEGER" };
    (@sql boolean) => { "INTEGER" };
}

atlas_columns! {
    preview_image_url: text,
    postive_pattern_image_url: text,
    negative_pattern_image_url: text,
    postive_pattern_csv_url: text,
    negative_pattern_csv_url: text,

    species: text,
    tissue: text,
    dataset_col: integer,
    split: text,
    data_fname: text,
    data_url: text,
    dataset_name: text,
    dataset_id_col: text,

    unnamed_0: real,
    number_of_cells: real,
    number_of_genes: real,
    number_of_cell_types: real,
    number_of_non_zero_entries: real,
    cell: real,
    sampled_cell: real,

    cell_type: text,
    disease_origin: text,
    tissuecta: text,
    cell_type_sampled: text,
    disease_sampled: text,
    assay: text,
    assay_sampled: text,
    dataset_idcta: text,
    queryed: text,

    cta_actinn: text,
    cta_actinn_best_yaml: text,
    cta_actinn_best_res: real,
    cta_actinn_run_stats: text,
    cta_actinn_check: boolean,
    cta_actinn_step2_best_yaml: text,
    cta_actinn_step2_best_res: real,

    cta_celltypist: text,
    cta_celltypist_best_yaml: text,
    cta_celltypist_best_res: real,
    cta_celltypist_run_stats: text,
    cta_celltypist_check: text,
    cta_celltypist_step2_best_yaml: text,
    cta_celltypist_step2_best_res: real,

    cta_scdeepsort: text,
    cta_scdeepsort_best_yaml: text,
    cta_scdeepsort_best_res: real,
    cta_scdeepsort_run_stats: text,
    cta_scdeepsort_check: boolean,
    cta_scdeepsort_step2_best_yaml: text,
    cta_scdeepsort_step2_best_res: real,

    cta_singlecellnet: text,
    cta_singlecellnet_best_yaml: text,
    cta_singlecellnet_best_res: real,
    cta_singlecellnet_run_stats: text,
    cta_singlecellnet_check: boolean,
    cta_singlecellnet_step2_best_yaml: text,
    cta_singlecellnet_step2_best_res: real,
}

/// Atlas side table row, 1:1 with an atlas dataset
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AtlasMetadata {
    pub id: i64,
    pub dataset_id: i64,
    #[serde(flatten)]
    pub fields: AtlasMetadataFields,
}

impl AtlasMetadata {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            dataset_id: row.get("dataset_id")?,
            fields: AtlasMetadataFields::from_row(row)?,
        })
    }
}

/// Dataset with its analyses and optional atlas metadata
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DatasetDetail {
    #[serde(flatten)]
    pub dataset: Dataset,
    pub analyses: Vec<Analysis>,
    pub atlas_metadata: Option<AtlasMetadata>,
}
