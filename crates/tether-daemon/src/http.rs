//! HTTP fallback surface
//!
//! Exposes the same endpoint table as the socket over plain request/response
//! HTTP, for callers that cannot hold a persistent socket (health probes,
//! curl, supervisors). Endpoints are resolved dynamically against the
//! dispatch hub, so anything registered there is reachable here under its
//! `/{service}/{method}` path with the HTTP method and response shape it
//! declared. Events never flow over this surface.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::Value;
use tracing::{info, warn};

use crate::dispatch::{DispatchError, DispatchHub, HttpMethod};

/// Build the fallback router. Every request lands in one handler that
/// resolves the path against the hub's endpoint table.
pub fn router(hub: Arc<DispatchHub>) -> Router {
    Router::new().fallback(handle).with_state(hub)
}

/// Serve the fallback surface on an already-bound listener.
pub async fn serve(hub: Arc<DispatchHub>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP fallback listening");
    }
    axum::serve(listener, router(hub)).await?;
    Ok(())
}

async fn handle(
    State(hub): State<Arc<DispatchHub>>,
    method: Method,
    uri: Uri,
    body: String,
) -> Response {
    let path = uri.path().to_string();
    let Some(meta) = hub.endpoint_meta(&path) else {
        return (StatusCode::NOT_FOUND, format!("no such endpoint: {}", path)).into_response();
    };

    if !method_matches(&method, meta.http_method) {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            format!("{} requires {}", path, meta.http_method.as_str()),
        )
            .into_response();
    }

    let (args, options) = match parse_call(uri.query(), &body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    match hub.call_endpoint(&path, args, options).await {
        Ok(result) => {
            if meta.text_response {
                text_body(result)
            } else {
                Json(result).into_response()
            }
        }
        Err(DispatchError::NoSuchService(name)) => (
            StatusCode::NOT_FOUND,
            format!("No service registered with name: {}", name),
        )
            .into_response(),
        Err(DispatchError::Handler(e)) => {
            warn!(endpoint = %path, error = %e, "Handler failed on HTTP surface");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn method_matches(method: &Method, expected: HttpMethod) -> bool {
    matches!(
        (method, expected),
        (&Method::GET, HttpMethod::Get)
            | (&Method::POST, HttpMethod::Post)
            | (&Method::PUT, HttpMethod::Put)
            | (&Method::DELETE, HttpMethod::Delete)
    )
}

/// Extract positional args and call options from the request.
///
/// Query parameters: `args` is a url-encoded JSON array, `options` a
/// url-encoded JSON object. A non-empty body on methods that carry one is
/// treated as the JSON args array when the query omits it.
fn parse_call(query: Option<&str>, body: &str) -> anyhow::Result<(Vec<Value>, Value)> {
    let mut args: Option<Vec<Value>> = None;
    let mut options = Value::Null;

    for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
        let (key, raw) = pair.split_once('=').unwrap_or((pair, ""));
        let decoded = urlencoding::decode(raw)?;
        match key {
            "args" => {
                args = Some(serde_json::from_str(&decoded)?);
            }
            "options" => {
                options = serde_json::from_str(&decoded)?;
            }
            _ => {}
        }
    }

    if args.is_none() && !body.trim().is_empty() {
        args = Some(serde_json::from_str(body)?);
    }

    Ok((args.unwrap_or_default(), options))
}

/// Text responses carry strings raw rather than JSON-quoted.
fn text_body(result: Value) -> Response {
    let text = match result {
        Value::String(s) => s,
        other => other.to_string(),
    };
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(text))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
