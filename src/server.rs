//! HTTP host: mounts the [`ContentDispatcher`] on an axum router.
//!
//! Every request goes through the dispatcher first. Delegated requests fall
//! through to plain static files under the project root.

use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{debug, error, warn};

use crate::dispatch::{BufferedResponse, ContentDispatcher, DevRequest, Dispatch};
use crate::source::ResourceReader;
use crate::PipelineError;

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<ContentDispatcher>,
    reader: ResourceReader,
}

/// Router that sends every path through `dispatcher`.
pub fn router(dispatcher: Arc<ContentDispatcher>) -> Router {
    let reader = ResourceReader::new(dispatcher.root());
    Router::new()
        .fallback(handle_request)
        .with_state(AppState { dispatcher, reader })
}

async fn handle_request(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let request = DevRequest::new(method.as_str(), target);
    let mut sink = BufferedResponse::new();

    match state.dispatcher.handle(&request, &mut sink).await {
        Ok(Dispatch::Handled) => {
            debug!(path = %request.path, "served by pipeline");
            sink.into_response()
        }
        Ok(Dispatch::Next) => serve_static(&state.reader, &request.path).await,
        Err(err) => {
            error!(path = %request.path, error = %err, "request failed");
            (status_for(&err), err.to_string()).into_response()
        }
    }
}

/// HTTP status for a failed request.
pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::NotFound { .. } | PipelineError::UnsupportedPackage { .. } => {
            StatusCode::NOT_FOUND
        }
        PipelineError::PathEscapesRoot { .. } => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for BufferedResponse {
    fn into_response(self) -> Response {
        let body = self.body.as_deref().map(str::to_string).unwrap_or_default();
        let mut response = body.into_response();
        for (name, value) in &self.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().insert(name, value);
                }
                _ => warn!(header = %name, "dropping invalid response header"),
            }
        }
        response
    }
}

async fn serve_static(reader: &ResourceReader, request_path: &str) -> Response {
    let mut full = match reader.resolve(request_path) {
        Ok(path) => path,
        Err(err) => return (status_for(&err), err.to_string()).into_response(),
    };

    if tokio::fs::metadata(&full)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        full = full.join("index.html");
    }

    let bytes = match tokio::fs::read(&full).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return (StatusCode::NOT_FOUND, "not found").into_response();
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to read {}: {e}", full.display()),
            )
                .into_response();
        }
    };

    let mut response = bytes.into_response();
    if let Ok(value) = HeaderValue::from_str(content_type_for(&full)) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
    {
        "html" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}
