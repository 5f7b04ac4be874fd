use std::collections::HashMap;
use std::path::Path;

use actix_multipart::Multipart;
use actix_web::http::header;
use actix_web::{web, HttpRequest};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::core::datasets::{IncomingFile, StagedFile};
use crate::core::error::{ServiceError, ServiceResult};

/// Upper bound for urlencoded bodies and multipart text fields
const MAX_TEXT_BYTES: usize = 64 * 1024;

/// Fields of a form body, either urlencoded or multipart
#[derive(Debug, Default)]
pub struct FormData {
    fields: HashMap<String, String>,
    files: HashMap<String, IncomingFile>,
}

impl FormData {
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn required(&self, name: &str) -> ServiceResult<String> {
        match self.text(name).map(str::trim) {
            Some(value) if !value.is_empty() => Ok(value.to_string()),
            _ => Err(ServiceError::Validation(format!("Field required: {}", name))),
        }
    }

    pub fn flag(&self, name: &str) -> ServiceResult<bool> {
        match self.text(name) {
            None => Ok(false),
            Some(raw) => parse_flag(raw)
                .ok_or_else(|| ServiceError::Validation(format!("{} must be a boolean", name))),
        }
    }

    pub fn take_file(&mut self, name: &str) -> Option<IncomingFile> {
        self.files.remove(name)
    }
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn malformed(e: impl std::fmt::Display) -> ServiceError {
    ServiceError::Validation(format!("Malformed form body: {}", e))
}

/// Read a form body. File parts are streamed into the staging area of
/// `upload_dir`; without one, file parts are rejected.
pub async fn read_form(
    req: &HttpRequest,
    mut payload: web::Payload,
    upload_dir: Option<&Path>,
) -> ServiceResult<FormData> {
    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);

    if is_multipart {
        let multipart = Multipart::new(req.headers(), payload);
        return read_multipart(multipart, upload_dir).await;
    }

    let mut body = bytes::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(malformed)?;
        if body.len() + chunk.len() > MAX_TEXT_BYTES {
            return Err(ServiceError::Validation("Form body too large".to_string()));
        }
        body.extend_from_slice(&chunk);
    }
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&body).map_err(malformed)?;
    Ok(FormData {
        fields: pairs.into_iter().collect(),
        files: HashMap::new(),
    })
}

async fn read_multipart(mut multipart: Multipart, upload_dir: Option<&Path>) -> ServiceResult<FormData> {
    let mut form = FormData::default();
    while let Some(item) = multipart.next().await {
        let mut field = item.map_err(malformed)?;
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);

        match (filename, upload_dir) {
            // browsers send an empty part for an unselected optional file
            (Some(filename), _) if filename.is_empty() => {
                while let Some(chunk) = field.next().await {
                    chunk.map_err(malformed)?;
                }
            }
            (Some(filename), Some(dir)) => {
                let (staged, mut file) = StagedFile::create(dir).await?;
                while let Some(chunk) = field.next().await {
                    file.write_all(&chunk.map_err(malformed)?).await?;
                }
                file.flush().await?;
                form.files.insert(name, IncomingFile { filename, staged });
            }
            (Some(_), None) => {
                return Err(ServiceError::Validation(format!("Unexpected file field: {}", name)));
            }
            (None, _) => {
                let mut value = Vec::new();
                while let Some(chunk) = field.next().await {
                    let chunk = chunk.map_err(malformed)?;
                    if value.len() + chunk.len() > MAX_TEXT_BYTES {
                        return Err(ServiceError::Validation(format!("Field {} is too large", name)));
                    }
                    value.extend_from_slice(&chunk);
                }
                let value = String::from_utf8(value).map_err(malformed)?;
                form.fields.insert(name, value);
            }
        }
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("True"), Some(true));
        assert_eq!(parse_flag("on"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag(""), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_required_field() {
        let mut form = FormData::default();
        form.fields.insert("analysis_param".into(), "  wasserstein ".into());
        form.fields.insert("blank".into(), "   ".into());
        assert_eq!(form.required("analysis_param").unwrap(), "wasserstein");
        assert!(form.required("blank").is_err());
        assert!(form.required("missing").is_err());
        assert!(!form.flag("missing").unwrap());
    }
}
