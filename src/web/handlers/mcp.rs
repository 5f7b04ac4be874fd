use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use futures::stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::core::access::Principal;
use crate::core::context::ServiceContext;
use crate::core::error::ServiceResult;
use crate::tools::{self, protocol};
use crate::web::auth::MaybeUser;

fn accepts_event_stream(req: &HttpRequest) -> bool {
    req.headers()
        .get_all(header::ACCEPT)
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("text/event-stream"))
}

/// JSON-RPC endpoint of the tool surface. Tool calls stream their
/// notifications as server-sent events when the client accepts them.
pub async fn mcp_endpoint(
    data: web::Data<ServiceContext>,
    caller: MaybeUser,
    req: HttpRequest,
    body: web::Bytes,
) -> ServiceResult<HttpResponse> {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            return Ok(HttpResponse::BadRequest().json(protocol::error(
                None,
                protocol::PARSE_ERROR,
                "Parse error",
                Some(json!({ "details": e.to_string() })),
            )));
        }
    };
    let principal = caller.principal();

    if accepts_event_stream(&req) && tools::streams(&message) {
        return Ok(event_stream(data, principal, message));
    }
    match tools::handle(&data, &principal, message, &protocol::EventSink::discard()).await {
        Some(reply) => Ok(HttpResponse::Ok().json(reply)),
        None => Ok(HttpResponse::Accepted().finish()),
    }
}

fn event_stream(data: web::Data<ServiceContext>, principal: Principal, message: Value) -> HttpResponse {
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    actix_web::rt::spawn(async move {
        let events = protocol::EventSink::streaming(tx.clone());
        if let Some(reply) = tools::handle(&data, &principal, message, &events).await {
            let _ = tx.send(reply);
        }
    });

    let body = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let frame = web::Bytes::from(format!("event: message\ndata: {}\n\n", event));
        Some((Ok::<_, actix_web::Error>(frame), rx))
    });
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(body)
}
