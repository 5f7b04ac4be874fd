use rusqlite::Connection;

use crate::db::models::AtlasMetadataFields;

const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    hashed_password TEXT NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    is_email_verified INTEGER NOT NULL DEFAULT 0,
    email_verification_token TEXT,
    email_verification_expires TEXT,
    password_reset_token TEXT,
    password_reset_expires TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_users_email_verification_token ON users(email_verification_token);
CREATE INDEX IF NOT EXISTS ix_users_password_reset_token ON users(password_reset_token);

CREATE TABLE IF NOT EXISTS datasets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    file_path TEXT NOT NULL,
    dataset_name TEXT NOT NULL,
    csv_file_path TEXT,
    umap_csv_path TEXT,
    tissue_info TEXT NOT NULL,
    description TEXT,
    upload_time TEXT NOT NULL,
    is_public INTEGER NOT NULL DEFAULT 0,
    is_atlas INTEGER NOT NULL DEFAULT 0,
    owner_id INTEGER REFERENCES users(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS ix_datasets_filename ON datasets(filename);
CREATE INDEX IF NOT EXISTS ix_datasets_owner ON datasets(owner_id);

CREATE TABLE IF NOT EXISTS analyses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset_id INTEGER NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    analysis_param TEXT NOT NULL,
    csv_url TEXT NOT NULL,
    image_urls TEXT,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_analyses_dataset_param ON analyses(dataset_id, analysis_param);
"#;

/// DDL for the atlas side table, one column per metadata field
fn atlas_metadata_ddl() -> String {
    let columns: Vec<String> = AtlasMetadataFields::COLUMNS
        .iter()
        .map(|(name, sql_type)| format!("    {} {}", name, sql_type))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS atlas_metadata (\n    \
         id INTEGER PRIMARY KEY AUTOINCREMENT,\n    \
         dataset_id INTEGER NOT NULL UNIQUE REFERENCES datasets(id) ON DELETE CASCADE,\n{}\n);",
        columns.join(",\n")
    )
}

pub fn apply(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(BASE_SCHEMA)?;
    conn.execute_batch(&atlas_metadata_ddl())?;
    Ok(())
}
