use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::models::{
    Analysis, AtlasMetadata, AtlasMetadataFields, Dataset, DatasetDetail, NewAnalysis, NewDataset,
    NewUser, User,
};

// Users

pub fn get_user_by_username(conn: &Connection, username: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row("SELECT * FROM users WHERE username = ?1", [username], User::from_row)
        .optional()
}

pub fn get_user_by_email(conn: &Connection, email: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row("SELECT * FROM users WHERE email = ?1", [email], User::from_row)
        .optional()
}

pub fn get_user_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<User>> {
    conn.query_row("SELECT * FROM users WHERE id = ?1", [id], User::from_row)
        .optional()
}

pub fn create_user(conn: &Connection, user: &NewUser) -> rusqlite::Result<User> {
    conn.execute(
        "INSERT INTO users (username, email, hashed_password, is_admin, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![user.username, user.email, user.hashed_password, user.is_admin, Utc::now()],
    )?;
    let id = conn.last_insert_rowid();
    get_user_by_id(conn, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

pub fn set_email_verification(
    conn: &Connection,
    user_id: i64,
    token: &str,
    expires: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET email_verification_token = ?1, email_verification_expires = ?2
         WHERE id = ?3",
        params![token, expires, user_id],
    )?;
    Ok(())
}

/// Marks the address verified and burns the token
pub fn mark_email_verified(conn: &Connection, user_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET is_email_verified = 1, email_verification_token = NULL,
         email_verification_expires = NULL WHERE id = ?1",
        [user_id],
    )?;
    Ok(())
}

pub fn get_user_by_verification_token(
    conn: &Connection,
    token: &str,
) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        "SELECT * FROM users WHERE email_verification_token = ?1",
        [token],
        User::from_row,
    )
    .optional()
}

pub fn set_password_reset(
    conn: &Connection,
    user_id: i64,
    token: &str,
    expires: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET password_reset_token = ?1, password_reset_expires = ?2 WHERE id = ?3",
        params![token, expires, user_id],
    )?;
    Ok(())
}

pub fn get_user_by_reset_token(conn: &Connection, token: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        "SELECT * FROM users WHERE password_reset_token = ?1",
        [token],
        User::from_row,
    )
    .optional()
}

/// Stores the new hash and burns any outstanding reset token
pub fn update_password(conn: &Connection, user_id: i64, hashed_password: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET hashed_password = ?1, password_reset_token = NULL,
         password_reset_expires = NULL WHERE id = ?2",
        params![hashed_password, user_id],
    )?;
    Ok(())
}

// Datasets

pub fn create_dataset(conn: &Connection, dataset: &NewDataset) -> rusqlite::Result<Dataset> {
    conn.execute(
        "INSERT INTO datasets (filename, file_path, dataset_name, csv_file_path, umap_csv_path,
         tissue_info, description, upload_time, is_public, is_atlas, owner_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            dataset.filename,
            dataset.file_path,
            dataset.dataset_name,
            dataset.csv_file_path,
            dataset.umap_csv_path,
            dataset.tissue_info,
            dataset.description,
            Utc::now(),
            dataset.is_public,
            dataset.is_atlas,
            dataset.owner_id,
        ],
    )?;
    let id = conn.last_insert_rowid();
    get_dataset_by_id(conn, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

pub fn get_dataset_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<Dataset>> {
    conn.query_row("SELECT * FROM datasets WHERE id = ?1", [id], Dataset::from_row)
        .optional()
}

/// The dataset whose primary file or side table is stored at `path`
pub fn get_dataset_by_stored_path(conn: &Connection, path: &str) -> rusqlite::Result<Option<Dataset>> {
    conn.query_row(
        "SELECT * FROM datasets WHERE file_path = ?1 OR csv_file_path = ?1 ORDER BY id LIMIT 1",
        [path],
        Dataset::from_row,
    )
    .optional()
}

/// Datasets owned by `user_id` plus every public dataset, newest first
pub fn get_datasets_visible_to(conn: &Connection, user_id: i64) -> rusqlite::Result<Vec<Dataset>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM datasets WHERE owner_id = ?1 OR is_public = 1
         ORDER BY upload_time DESC, id DESC",
    )?;
    let rows = stmt.query_map([user_id], Dataset::from_row)?;
    rows.collect()
}

pub fn get_atlas_datasets(conn: &Connection) -> rusqlite::Result<Vec<Dataset>> {
    let mut stmt = conn.prepare("SELECT * FROM datasets WHERE is_atlas = 1 ORDER BY id")?;
    let rows = stmt.query_map([], Dataset::from_row)?;
    rows.collect()
}

pub fn get_atlas_dataset_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<Dataset>> {
    conn.query_row(
        "SELECT * FROM datasets WHERE id = ?1 AND is_atlas = 1",
        [id],
        Dataset::from_row,
    )
    .optional()
}

pub fn get_atlas_datasets_by_tissue(conn: &Connection, tissue: &str) -> rusqlite::Result<Vec<Dataset>> {
    let mut stmt =
        conn.prepare("SELECT * FROM datasets WHERE tissue_info = ?1 AND is_atlas = 1 ORDER BY id")?;
    let rows = stmt.query_map([tissue], Dataset::from_row)?;
    rows.collect()
}

pub fn get_atlas_dataset_by_filename(
    conn: &Connection,
    filename: &str,
) -> rusqlite::Result<Option<Dataset>> {
    conn.query_row(
        "SELECT * FROM datasets WHERE filename = ?1 AND is_atlas = 1 ORDER BY id LIMIT 1",
        [filename],
        Dataset::from_row,
    )
    .optional()
}

/// Deletes the dataset; analyses and atlas metadata cascade
pub fn delete_dataset(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    Ok(conn.execute("DELETE FROM datasets WHERE id = ?1", [id])? > 0)
}

pub fn load_detail(conn: &Connection, dataset: Dataset) -> rusqlite::Result<DatasetDetail> {
    let analyses = get_analyses_for_dataset(conn, dataset.id)?;
    let atlas_metadata = get_atlas_metadata(conn, dataset.id)?;
    Ok(DatasetDetail {
        dataset,
        analyses,
        atlas_metadata,
    })
}

pub fn load_details(conn: &Connection, datasets: Vec<Dataset>) -> rusqlite::Result<Vec<DatasetDetail>> {
    datasets.into_iter().map(|d| load_detail(conn, d)).collect()
}

// Analyses

pub fn get_analysis_by_param(
    conn: &Connection,
    dataset_id: i64,
    analysis_param: &str,
) -> rusqlite::Result<Option<Analysis>> {
    conn.query_row(
        "SELECT * FROM analyses WHERE dataset_id = ?1 AND analysis_param = ?2",
        params![dataset_id, analysis_param],
        Analysis::from_row,
    )
    .optional()
}

pub fn get_analyses_for_dataset(conn: &Connection, dataset_id: i64) -> rusqlite::Result<Vec<Analysis>> {
    let mut stmt = conn.prepare("SELECT * FROM analyses WHERE dataset_id = ?1 ORDER BY id")?;
    let rows = stmt.query_map([dataset_id], Analysis::from_row)?;
    rows.collect()
}

/// Insert the analysis unless the (dataset, parameter) pair already has one.
/// Returns the stored row and whether this call created it.
pub fn insert_analysis(conn: &Connection, analysis: &NewAnalysis) -> rusqlite::Result<(Analysis, bool)> {
    let inserted = conn.execute(
        "INSERT INTO analyses (dataset_id, analysis_param, csv_url, image_urls, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(dataset_id, analysis_param) DO NOTHING",
        params![
            analysis.dataset_id,
            analysis.analysis_param,
            analysis.csv_url,
            analysis.joined_image_urls(),
            Utc::now(),
        ],
    )? > 0;
    let row = get_analysis_by_param(conn, analysis.dataset_id, &analysis.analysis_param)?
        .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
    Ok((row, inserted))
}

// Atlas metadata

pub fn upsert_atlas_metadata(
    conn: &Connection,
    dataset_id: i64,
    fields: &AtlasMetadataFields,
) -> rusqlite::Result<AtlasMetadata> {
    let names: Vec<&str> = AtlasMetadataFields::COLUMNS.iter().map(|(name, _)| *name).collect();
    let placeholders: Vec<String> = (0..names.len()).map(|i| format!("?{}", i + 2)).collect();
    let updates: Vec<String> = names.iter().map(|n| format!("{n} = excluded.{n}")).collect();
    let sql = format!(
        "INSERT INTO atlas_metadata (dataset_id, {}) VALUES (?1, {})
         ON CONFLICT(dataset_id) DO UPDATE SET {}",
        names.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    );

    let mut values: Vec<&dyn ToSql> = vec![&dataset_id];
    values.extend(fields.values());
    conn.execute(&sql, &values[..])?;

    get_atlas_metadata(conn, dataset_id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

pub fn get_atlas_metadata(conn: &Connection, dataset_id: i64) -> rusqlite::Result<Option<AtlasMetadata>> {
    conn.query_row(
        "SELECT * FROM atlas_metadata WHERE dataset_id = ?1",
        [dataset_id],
        AtlasMetadata::from_row,
    )
    .optional()
}
