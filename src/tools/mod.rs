//! Tool-calling surface: JSON-RPC 2.0 messages in the MCP dialect.
//!
//! Offers the same operations as the HTTP routes to LLM clients. Long
//! running tools follow their background job and narrate its progress as
//! `notifications/message` events when the transport can carry them.

pub mod catalog;
pub mod protocol;
pub mod resources;

use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::access::Principal;
use crate::core::context::ServiceContext;
use protocol::{EventSink, RpcError, RpcMessage, INVALID_REQUEST, METHOD_NOT_FOUND};

const SERVER_NAME: &str = "scdata-hub";

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ReadParams {
    uri: String,
}

/// Only tool calls produce intermediate events worth streaming
pub fn streams(message: &Value) -> bool {
    message.get("method").and_then(Value::as_str) == Some("tools/call")
}

/// Answer one message; `None` for notifications
pub async fn handle(
    ctx: &ServiceContext,
    caller: &Principal,
    message: Value,
    events: &EventSink,
) -> Option<Value> {
    let message: RpcMessage = match serde_json::from_value(message) {
        Ok(message) => message,
        Err(e) => {
            return Some(RpcError {
                code: INVALID_REQUEST,
                message: "Invalid Request".to_string(),
                data: Some(json!({ "details": e.to_string() })),
            }
            .into_response(None));
        }
    };
    let outcome = dispatch(ctx, caller, &message, events).await;
    let id = message.id?;
    Some(match outcome {
        Ok(result) => protocol::response(id, result),
        Err(e) => e.into_response(Some(id)),
    })
}

async fn dispatch(
    ctx: &ServiceContext,
    caller: &Principal,
    message: &RpcMessage,
    events: &EventSink,
) -> Result<Value, RpcError> {
    match message.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": protocol::PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "listChanged": false, "subscribe": false },
                "logging": {}
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Tools for registering single-cell datasets and running similarity analyses against the atlas."
        })),
        "notifications/initialized" => Ok(Value::Null),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": catalog::tool_list() })),
        "tools/call" => {
            let params: ToolCallParams =
                serde_json::from_value(message.params.clone()).map_err(RpcError::invalid_params)?;
            let result = catalog::call_tool(ctx, caller, params.name.trim(), params.arguments, events).await;
            Ok(match result {
                Ok(value) => protocol::tool_result_json(value),
                Err(e) => {
                    warn!("Tool {} failed: {}", params.name, e);
                    protocol::tool_result_text(e.to_string(), true)
                }
            })
        }
        "resources/list" => Ok(resources::list()),
        "resources/templates/list" => Ok(resources::templates()),
        "resources/read" => {
            let params: ReadParams =
                serde_json::from_value(message.params.clone()).map_err(RpcError::invalid_params)?;
            resources::read(ctx, caller, &params.uri).await
        }
        other => Err(RpcError::new(
            METHOD_NOT_FOUND,
            format!("Method '{}' not found", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::testing::test_context;
    use crate::core::jobs::{JobOutput, JobStage, JobState};
    use crate::db::models::{NewAnalysis, NewDataset};
    use crate::db::queries;
    use crate::queue::JobQueue;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    fn call(id: i64, name: &str, arguments: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments }
        })
    }

    async fn dataset(ctx: &ServiceContext, is_public: bool) -> i64 {
        ctx.db
            .call(move |conn| {
                Ok(queries::create_dataset(
                    conn,
                    &NewDataset {
                        filename: "lung.h5ad".into(),
                        file_path: "uploads/lung.h5ad".into(),
                        dataset_name: "Lung".into(),
                        tissue_info: "Lung".into(),
                        is_public,
                        ..Default::default()
                    },
                )?
                .id)
            })
            .await
            .unwrap()
    }

    /// Serves `body` to every connection on a loopback port
    async fn file_server(body: &'static [u8]) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = vec![0u8; 4096];
                let _ = socket.read(&mut request).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_initialize_and_listing() {
        let t = test_context();
        let reply = handle(
            &t.ctx,
            &Principal::System,
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            &EventSink::discard(),
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["protocolVersion"], protocol::PROTOCOL_VERSION);
        assert_eq!(reply["result"]["serverInfo"]["name"], SERVER_NAME);

        let reply = handle(
            &t.ctx,
            &Principal::System,
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            &EventSink::discard(),
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["tools"].as_array().unwrap().len(), 3);

        let reply = handle(
            &t.ctx,
            &Principal::System,
            json!({"jsonrpc": "2.0", "id": 3, "method": "resources/templates/list"}),
            &EventSink::discard(),
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["resourceTemplates"][0]["uriTemplate"], "dataset://{dataset_id}");
    }

    #[tokio::test]
    async fn test_notifications_and_unknown_methods() {
        let t = test_context();
        let none = handle(
            &t.ctx,
            &Principal::System,
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            &EventSink::discard(),
        )
        .await;
        assert!(none.is_none());

        let reply = handle(
            &t.ctx,
            &Principal::System,
            json!({"jsonrpc": "2.0", "id": 9, "method": "prompts/list"}),
            &EventSink::discard(),
        )
        .await
        .unwrap();
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(reply["id"], 9);

        let reply = handle(&t.ctx, &Principal::System, json!([1, 2]), &EventSink::discard())
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_read_dataset_resource_respects_visibility() {
        let t = test_context();
        let public = dataset(&t.ctx, true).await;
        let private = dataset(&t.ctx, false).await;

        let read = |id: i64| {
            json!({"jsonrpc": "2.0", "id": 1, "method": "resources/read", "params": {"uri": format!("dataset://{}", id)}})
        };
        let reply = handle(&t.ctx, &Principal::System, read(public), &EventSink::discard())
            .await
            .unwrap();
        let text = reply["result"]["contents"][0]["text"].as_str().unwrap();
        let detail: Value = serde_json::from_str(text).unwrap();
        assert_eq!(detail["id"], public);

        let reply = handle(&t.ctx, &Principal::System, read(private), &EventSink::discard())
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], protocol::RESOURCE_NOT_FOUND);
        assert_eq!(
            reply["error"]["message"],
            format!("Dataset with ID {} not found.", private)
        );
    }

    #[tokio::test]
    async fn test_start_analysis_returns_cached_result() {
        let t = test_context();
        let id = dataset(&t.ctx, true).await;
        let record = NewAnalysis {
            dataset_id: id,
            analysis_param: "wasserstein".into(),
            csv_url: "https://bucket/r.csv".into(),
            image_urls: vec!["https://bucket/p1.png".into()],
        };
        t.ctx
            .db
            .call(move |conn| Ok(queries::insert_analysis(conn, &record)?))
            .await
            .unwrap();

        let reply = handle(
            &t.ctx,
            &Principal::System,
            call(1, "start_analysis", json!({"dataset_id": id, "analysis_param": "wasserstein"})),
            &EventSink::discard(),
        )
        .await
        .unwrap();
        let result = &reply["result"]["structuredContent"];
        assert_eq!(result["status"], "CACHED");
        assert_eq!(result["csv_url"], "https://bucket/r.csv");
        assert!(t.queue.is_empty());
    }

    #[tokio::test]
    async fn test_start_analysis_streams_progress() {
        let t = test_context();
        let id = dataset(&t.ctx, true).await;

        // stands in for a worker
        let queue = t.queue.clone();
        let worker = tokio::spawn(async move {
            let job = queue.dequeue(Duration::from_secs(5)).await.unwrap().unwrap();
            for message in ["Loading data...", "Loading data...", "Uploading results..."] {
                queue
                    .set_state(
                        &job.id,
                        JobState::Progress {
                            stage: JobStage::LoadingInput,
                            message: message.to_string(),
                        },
                    )
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
            queue
                .set_state(
                    &job.id,
                    JobState::Success {
                        output: JobOutput::Analysis {
                            csv_url: "https://bucket/x.csv".into(),
                            image_urls: vec!["https://bucket/x.png".into()],
                        },
                    },
                )
                .await
                .unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply = handle(
            &t.ctx,
            &Principal::System,
            call(4, "start_analysis", json!({"dataset_id": id, "analysis_param": "wasserstein"})),
            &EventSink::streaming(tx),
        )
        .await
        .unwrap();
        worker.await.unwrap();

        let result = &reply["result"];
        assert_eq!(result["isError"], false);
        assert_eq!(result["structuredContent"]["status"], "SUCCESS");
        assert_eq!(result["structuredContent"]["csv_url"], "https://bucket/x.csv");

        let mut messages = Vec::new();
        while let Ok(note) = rx.try_recv() {
            messages.push(note["params"]["data"].as_str().unwrap().to_string());
        }
        assert_eq!(messages.iter().filter(|m| *m == "Loading data...").count(), 1);
        assert!(messages.contains(&"Uploading results...".to_string()));
        assert_eq!(messages.last().unwrap(), "Analysis task completed successfully.");
    }

    #[tokio::test]
    async fn test_failed_analysis_is_a_tool_error() {
        let t = test_context();
        let id = dataset(&t.ctx, true).await;
        let queue = t.queue.clone();
        tokio::spawn(async move {
            let job = queue.dequeue(Duration::from_secs(5)).await.unwrap().unwrap();
            queue
                .set_state(&job.id, JobState::Failure { error: "boom".into() })
                .await
                .unwrap();
        });

        let reply = handle(
            &t.ctx,
            &Principal::System,
            call(5, "start_analysis", json!({"dataset_id": id, "analysis_param": "wasserstein"})),
            &EventSink::discard(),
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["isError"], true);
        assert_eq!(
            reply["result"]["content"][0]["text"],
            "Background analysis task failed: boom"
        );
    }

    #[tokio::test]
    async fn test_anonymous_analysis_of_private_dataset_is_refused() {
        let t = test_context();
        let id = dataset(&t.ctx, false).await;
        let reply = handle(
            &t.ctx,
            &Principal::System,
            call(6, "start_analysis", json!({"dataset_id": id, "analysis_param": "wasserstein"})),
            &EventSink::discard(),
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["isError"], true);
        assert!(t.queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_atlas_method_waits_for_result() {
        let t = test_context();
        let queue = t.queue.clone();
        tokio::spawn(async move {
            let job = queue.dequeue(Duration::from_secs(5)).await.unwrap().unwrap();
            queue
                .set_state(
                    &job.id,
                    JobState::Success {
                        output: JobOutput::Method {
                            result: json!({"method": "celltypist"}),
                        },
                    },
                )
                .await
                .unwrap();
        });
        let reply = handle(
            &t.ctx,
            &Principal::System,
            call(7, "get_atlas_method", json!({"tissue_info": "Lung", "atlas_dataset_id": "2"})),
            &EventSink::discard(),
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["structuredContent"], json!({"method": "celltypist"}));
    }

    #[tokio::test]
    async fn test_register_dataset_downloads_and_ingests() {
        let t = test_context();
        let base = file_server(b"h5ad-bytes").await;

        let reply = handle(
            &t.ctx,
            &Principal::System,
            call(
                8,
                "register_dataset",
                json!({
                    "h5ad_file_url": format!("{}/files/pbmc.h5ad", base),
                    "tissue_info": "Blood",
                    "dataset_name": "PBMC",
                    "description": "from a URL"
                }),
            ),
            &EventSink::discard(),
        )
        .await
        .unwrap();
        let outcome = &reply["result"]["structuredContent"];
        assert_eq!(reply["result"]["isError"], false, "{}", reply);
        assert_eq!(outcome["dataset"]["filename"], "pbmc.h5ad");
        assert_eq!(outcome["dataset"]["is_public"], true);
        assert_eq!(outcome["dataset"]["owner_id"], Value::Null);

        let stored = t.ctx.settings.upload_dir.join("llm").join("pbmc.h5ad");
        assert_eq!(std::fs::read(stored).unwrap(), b"h5ad-bytes");
    }

    #[tokio::test]
    async fn test_register_dataset_rejects_non_http_urls() {
        let t = test_context();
        let reply = handle(
            &t.ctx,
            &Principal::System,
            call(
                9,
                "register_dataset",
                json!({
                    "h5ad_file_url": "file:///etc/passwd",
                    "tissue_info": "Blood",
                    "dataset_name": "PBMC",
                    "description": ""
                }),
            ),
            &EventSink::discard(),
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["isError"], true);
        assert_eq!(reply["result"]["content"][0]["text"], "Unsupported URL scheme: file");
    }
}
