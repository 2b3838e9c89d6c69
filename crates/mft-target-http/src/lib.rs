//! # MFT Target HTTP
//!
//! HTTP surface of the file-transfer test target. `POST` stores the body in
//! the receive directory: `Content-Length` is required (411 when absent,
//! 400 when malformed), the filename comes from `Content-Disposition` when
//! present and a timestamp otherwise, and the response body is the stored
//! virtual path. `GET` serves previously received files back.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use mft_target_core::{
    Error, OpenRequest, Result, SandboxFs, TargetConfig, VirtualFs, normalize_virtual,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Upload cap; test transfers stay well under this.
const MAX_UPLOAD_BYTES: usize = 1 << 30;

/// The HTTP listener.
pub struct HttpServer {
    config: Arc<TargetConfig>,
    fs: Arc<SandboxFs>,
}

#[derive(Clone)]
struct AppState {
    fs: Arc<SandboxFs>,
}

impl HttpServer {
    pub fn new(config: Arc<TargetConfig>, fs: Arc<SandboxFs>) -> Self {
        Self { config, fs }
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<()> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.http_port);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Connection(format!("bind {addr}: {e}")))?;
        info!(%addr, root = %self.fs.root().display(), "http server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Connection(format!("http server: {e}")))
    }

    /// The router, exposed separately so tests can drive it in-process.
    pub fn router(&self) -> Router {
        let state = AppState {
            fs: self.fs.clone(),
        };

        Router::new()
            .route("/", post(upload))
            .route("/{*path}", post(upload))
            // Downloads of previously received files.
            .fallback_service(ServeDir::new(self.fs.root().to_path_buf()))
            .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

async fn upload(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Content-Length is part of the upload contract: absent is 411,
    // unparseable is 400.
    let Some(length) = headers.get(header::CONTENT_LENGTH) else {
        return (StatusCode::LENGTH_REQUIRED, "Content-Length required\n").into_response();
    };
    let length = length.to_str().unwrap_or("").parse::<u64>();
    let Ok(declared) = length else {
        return (StatusCode::BAD_REQUEST, "Malformed Content-Length\n").into_response();
    };
    if declared != body.len() as u64 {
        return (StatusCode::BAD_REQUEST, "Content-Length mismatch\n").into_response();
    }

    let filename = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(disposition_filename)
        .unwrap_or_else(generated_filename);

    let target = format!("{}/{}", uri.path().trim_end_matches('/'), filename);

    match store(&state.fs, &target, &body).await {
        Ok(stored) => {
            info!(path = stored, bytes = body.len(), "upload stored");
            (StatusCode::OK, stored).into_response()
        }
        Err(e @ (Error::AccessDenied(_) | Error::InvalidPath(_))) => {
            warn!(path = target, error = %e, "upload rejected");
            (StatusCode::BAD_REQUEST, "Invalid file name\n").into_response()
        }
        Err(e) => {
            warn!(path = target, error = %e, "upload failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Upload failed\n").into_response()
        }
    }
}

async fn store(fs: &SandboxFs, target: &str, body: &[u8]) -> Result<String> {
    let handle = fs.open(target, OpenRequest::create_truncate()).await?;
    handle.write_at(0, body).await?;
    handle.close().await?;
    Ok(normalize_virtual(target))
}

/// Pull a filename out of a `Content-Disposition` header value.
fn disposition_filename(value: &str) -> Option<String> {
    let (_, rest) = value.split_once("filename=")?;
    let name = rest.split(';').next()?.trim().trim_matches('"');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Timestamp-derived name for uploads without a disposition header.
fn generated_filename() -> String {
    format!(
        "upload-{}.bin",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%3f")
    )
}
