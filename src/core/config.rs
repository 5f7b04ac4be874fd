use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use log::warn;

use crate::core::error::{ServiceError, ServiceResult};

/// Where analysis artifacts are written
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectStoreSettings {
    /// S3-compatible OSS bucket
    Oss {
        access_key_id: String,
        access_key_secret: String,
        /// Endpoint host without scheme, e.g. `oss-cn-hangzhou.aliyuncs.com`
        endpoint: String,
        bucket: String,
        region: String,
    },
    /// Local directory, served under `/objects`
    Local { root: PathBuf },
}

/// SMTP transport settings; any missing piece disables delivery
#[derive(Debug, Clone, PartialEq)]
pub struct MailSettings {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sender: Option<String>,
}

impl MailSettings {
    pub fn is_complete(&self) -> bool {
        self.username.is_some()
            && self.password.is_some()
            && self.sender.is_some()
    }
}

/// Process-wide configuration, read once at startup
#[derive(Debug, Clone)]
pub struct Settings {
    /// Token signing secret; required for `serve`
    pub secret_key: Option<String>,
    pub algorithm: Algorithm,
    pub access_token_expire_minutes: i64,
    pub database_url: String,
    /// Base URL of the similarity analysis API
    pub demo_url: String,
    pub external_api_timeout: Duration,
    /// `None` selects the in-process queue
    pub redis_url: Option<String>,
    pub object_store: ObjectStoreSettings,
    pub mail: MailSettings,
    pub frontend_base_url: String,
    pub upload_dir: PathBuf,
    pub static_root: PathBuf,
    pub gene_map_path: Option<PathBuf>,
    pub remap_command: Option<String>,
    pub bind_addr: String,
    pub public_base_url: String,
    pub cors_origins: Vec<String>,
    pub worker_concurrency: usize,
    pub job_result_ttl: Duration,
    /// How long a submission key outlives a job that never releases it
    pub submission_lease: Duration,
    pub tool_poll_interval: Duration,
    pub require_email_verification: bool,
}

impl Settings {
    /// Load settings from the process environment (and `.env` if present)
    pub fn from_env() -> ServiceResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!("Ignoring unreadable .env file: {}", e);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> ServiceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let algorithm = match get("ALGORITHM").as_deref() {
            None => Algorithm::HS256,
            Some(name) => parse_hmac_algorithm(name)?,
        };

        let object_store = match (
            get("OSS_ACCESS_KEY_ID"),
            get("OSS_ACCESS_KEY_SECRET"),
            get("OSS_ENDPOINT"),
            get("OSS_BUCKET_NAME"),
        ) {
            (Some(access_key_id), Some(access_key_secret), Some(endpoint), Some(bucket)) => {
                let endpoint = strip_scheme(&endpoint).trim_end_matches('/').to_string();
                let region = get("OSS_REGION").unwrap_or_else(|| region_from_endpoint(&endpoint));
                ObjectStoreSettings::Oss {
                    access_key_id,
                    access_key_secret,
                    endpoint,
                    bucket,
                    region,
                }
            }
            _ => ObjectStoreSettings::Local {
                root: PathBuf::from(get("OBJECT_STORE_DIR").unwrap_or_else(|| "object_store".to_string())),
            },
        };

        let mail = MailSettings {
            server: get("SMTP_SERVER").unwrap_or_else(|| "smtp.gmail.com".to_string()),
            port: parse_or("SMTP_PORT", get("SMTP_PORT"), 587)?,
            username: get("SMTP_USERNAME"),
            password: get("SMTP_PASSWORD"),
            sender: get("SENDER_EMAIL"),
        };

        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string());
        let public_base_url = get("PUBLIC_BASE_URL")
            .unwrap_or_else(|| "http://localhost:8000".to_string())
            .trim_end_matches('/')
            .to_string();

        let redis_url = get("REDIS_URL").filter(|url| !url.starts_with("memory://"));

        let cors_origins = get("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|o| o.trim().trim_end_matches('/').to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![
                    "http://localhost:5173".to_string(),
                    "http://127.0.0.1:5173".to_string(),
                ]
            });

        Ok(Self {
            secret_key: get("SECRET_KEY"),
            algorithm,
            access_token_expire_minutes: parse_or(
                "ACCESS_TOKEN_EXPIRE_MINUTES",
                get("ACCESS_TOKEN_EXPIRE_MINUTES"),
                30,
            )?,
            database_url: get("DATABASE_URL").unwrap_or_else(|| "sqlite:///./sql_app.db".to_string()),
            demo_url: get("DEMO_URL")
                .unwrap_or_else(|| "http://localhost:8100".to_string())
                .trim_end_matches('/')
                .to_string(),
            external_api_timeout: Duration::from_secs(parse_or(
                "EXTERNAL_API_TIMEOUT_SECS",
                get("EXTERNAL_API_TIMEOUT_SECS"),
                3600,
            )?),
            redis_url,
            object_store,
            mail,
            frontend_base_url: get("FRONTEND_BASE_URL")
                .unwrap_or_else(|| "http://localhost:5173".to_string())
                .trim_end_matches('/')
                .to_string(),
            upload_dir: PathBuf::from(get("UPLOAD_DIR").unwrap_or_else(|| "user_uploads".to_string())),
            static_root: PathBuf::from(get("STATIC_ROOT").unwrap_or_else(|| ".".to_string())),
            gene_map_path: get("GENE_MAP_PATH").map(PathBuf::from),
            remap_command: get("REMAP_COMMAND"),
            bind_addr,
            public_base_url,
            cors_origins,
            worker_concurrency: parse_or("WORKER_CONCURRENCY", get("WORKER_CONCURRENCY"), 2)?,
            job_result_ttl: Duration::from_secs(parse_or(
                "JOB_RESULT_TTL_SECS",
                get("JOB_RESULT_TTL_SECS"),
                86_400,
            )?),
            submission_lease: Duration::from_secs(parse_or(
                "SUBMISSION_LEASE_SECS",
                get("SUBMISSION_LEASE_SECS"),
                1_800,
            )?),
            tool_poll_interval: Duration::from_millis(parse_or(
                "TOOL_POLL_INTERVAL_MS",
                get("TOOL_POLL_INTERVAL_MS"),
                2_000,
            )?),
            require_email_verification: parse_or(
                "REQUIRE_EMAIL_VERIFICATION",
                get("REQUIRE_EMAIL_VERIFICATION"),
                false,
            )?,
        })
    }

    /// Filesystem path of the sqlite database
    pub fn database_path(&self) -> &Path {
        let raw = self.database_url.as_str();
        let path = raw
            .strip_prefix("sqlite:///")
            .or_else(|| raw.strip_prefix("sqlite://"))
            .unwrap_or(raw);
        Path::new(path)
    }

    pub fn cors_origins(&self) -> &[String] {
        &self.cors_origins
    }

    /// Absolute URL for a path served by this process
    pub fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.public_base_url, path.trim_start_matches('/'))
    }

    /// Settings for unit tests: everything local, nothing external
    #[cfg(test)]
    pub fn for_tests(root: &Path) -> Self {
        let mut settings = Self::from_lookup(|_| None).expect("default settings");
        settings.secret_key = Some("test-secret".to_string());
        settings.database_url = ":memory:".to_string();
        settings.upload_dir = root.join("uploads");
        settings.static_root = root.to_path_buf();
        settings.object_store = ObjectStoreSettings::Local { root: root.join("objects") };
        settings.tool_poll_interval = Duration::from_millis(10);
        settings
    }
}

fn parse_hmac_algorithm(name: &str) -> ServiceResult<Algorithm> {
    let algorithm = Algorithm::from_str(name)
        .map_err(|_| ServiceError::Config(format!("unknown ALGORITHM {}", name)))?;
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(algorithm),
        other => Err(ServiceError::Config(format!(
            "ALGORITHM {:?} needs a key pair; only HS256, HS384 and HS512 are supported",
            other
        ))),
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> ServiceResult<T> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ServiceError::Config(format!("{} has an invalid value: {}", key, value))),
    }
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint)
}

/// `oss-cn-hangzhou.aliyuncs.com` -> `oss-cn-hangzhou`
fn region_from_endpoint(endpoint: &str) -> String {
    endpoint
        .split('.')
        .next()
        .filter(|label| !label.is_empty())
        .unwrap_or("us-east-1")
        .to_string()
}
