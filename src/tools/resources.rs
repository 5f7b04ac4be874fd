use serde_json::{json, Value};

use crate::core::access::{can_view, Principal};
use crate::core::context::ServiceContext;
use crate::db::queries;
use crate::tools::protocol::{RpcError, RESOURCE_NOT_FOUND};

const SCHEME: &str = "dataset://";

pub fn list() -> Value {
    json!({
        "resources": [{
            "uri": SCHEME,
            "name": "atlas_datasets",
            "title": "Atlas datasets",
            "description": "Every atlas dataset with its benchmark metadata.",
            "mimeType": "application/json"
        }]
    })
}

pub fn templates() -> Value {
    json!({
        "resourceTemplates": [{
            "uriTemplate": "dataset://{dataset_id}",
            "name": "dataset",
            "title": "Dataset",
            "description": "One dataset with its analyses, if visible to the caller.",
            "mimeType": "application/json"
        }]
    })
}

#[derive(Debug, PartialEq)]
enum DatasetUri {
    Atlas,
    One(i64),
}

fn parse_uri(uri: &str) -> Option<DatasetUri> {
    let rest = uri.strip_prefix(SCHEME)?;
    if rest.is_empty() {
        return Some(DatasetUri::Atlas);
    }
    rest.parse().ok().map(DatasetUri::One)
}

pub async fn read(ctx: &ServiceContext, caller: &Principal, uri: &str) -> Result<Value, RpcError> {
    let target = parse_uri(uri)
        .ok_or_else(|| RpcError::new(RESOURCE_NOT_FOUND, format!("Unknown resource: {}", uri)))?;
    let body = match target {
        DatasetUri::Atlas => {
            let details = ctx
                .db
                .call(|conn| {
                    let atlas = queries::get_atlas_datasets(conn)?;
                    Ok(queries::load_details(conn, atlas)?)
                })
                .await
                .map_err(RpcError::internal)?;
            serde_json::to_value(details).map_err(RpcError::internal)?
        }
        DatasetUri::One(id) => {
            let principal = caller.clone();
            let detail = ctx
                .db
                .call(move |conn| {
                    match queries::get_dataset_by_id(conn, id)?.filter(|d| can_view(d, &principal)) {
                        Some(dataset) => Ok(Some(queries::load_detail(conn, dataset)?)),
                        None => Ok(None),
                    }
                })
                .await
                .map_err(RpcError::internal)?
                .ok_or_else(|| {
                    RpcError::new(RESOURCE_NOT_FOUND, format!("Dataset with ID {} not found.", id))
                })?;
            serde_json::to_value(detail).map_err(RpcError::internal)?
        }
    };
    Ok(json!({
        "contents": [{
            "uri": uri,
            "mimeType": "application/json",
            "text": body.to_string()
        }]
    }))
}
