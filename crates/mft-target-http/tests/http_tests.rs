//! In-process router tests for the HTTP upload contract.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use mft_target_core::{SandboxFs, TargetConfig};
use mft_target_http::HttpServer;
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

fn server(dir: &TempDir) -> HttpServer {
    let config = Arc::new(TargetConfig {
        receive_dir: dir.path().to_path_buf(),
        ..TargetConfig::default()
    });
    let fs = Arc::new(SandboxFs::new(config.sandbox()));
    HttpServer::new(config, fs)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn upload_with_disposition_filename() {
    let dir = TempDir::new().unwrap();
    let app = server(&dir).router();

    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_LENGTH, "5")
        .header(
            header::CONTENT_DISPOSITION,
            r#"attachment; filename="report.txt""#,
        )
        .body(Body::from("hello"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = body_string(response).await;
    assert_eq!(stored, "/report.txt");
    assert_eq!(
        std::fs::read(dir.path().join("report.txt")).unwrap(),
        b"hello"
    );
}

#[tokio::test]
async fn missing_content_length_is_411() {
    let dir = TempDir::new().unwrap();
    let app = server(&dir).router();

    let request = Request::builder()
        .method("POST")
        .uri("/")
        .body(Body::from("hello"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);
}

#[tokio::test]
async fn malformed_content_length_is_400() {
    let dir = TempDir::new().unwrap();
    let app = server(&dir).router();

    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_LENGTH, "not-a-number")
        .body(Body::from("hello"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_without_disposition_gets_generated_name() {
    let dir = TempDir::new().unwrap();
    let app = server(&dir).router();

    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_LENGTH, "4")
        .body(Body::from("data"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = body_string(response).await;
    assert!(stored.starts_with("/upload-"), "got {stored}");
    assert!(stored.ends_with(".bin"));

    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn upload_into_subdirectory_path() {
    let dir = TempDir::new().unwrap();
    let app = server(&dir).router();

    let request = Request::builder()
        .method("POST")
        .uri("/inbound/batch1")
        .header(header::CONTENT_LENGTH, "3")
        .header(header::CONTENT_DISPOSITION, r#"filename="part.bin""#)
        .body(Body::from("abc"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "/inbound/batch1/part.bin");
    assert_eq!(
        std::fs::read(dir.path().join("inbound/batch1/part.bin")).unwrap(),
        b"abc"
    );
}

#[tokio::test]
async fn traversal_filename_is_rejected() {
    let dir = TempDir::new().unwrap();
    let app = server(&dir).router();

    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_LENGTH, "5")
        .header(
            header::CONTENT_DISPOSITION,
            r#"attachment; filename="../../evil.sh""#,
        )
        .body(Body::from("hello"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(!dir.path().parent().unwrap().join("evil.sh").exists());
}

#[tokio::test]
async fn stored_files_can_be_downloaded() {
    let dir = TempDir::new().unwrap();
    let app = server(&dir).router();

    std::fs::create_dir_all(dir.path().join("out")).unwrap();
    std::fs::write(dir.path().join("out/seed.bin"), b"payload").unwrap();

    let request = Request::builder()
        .method("GET")
        .uri("/out/seed.bin")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "payload");
}

#[tokio::test]
async fn download_of_missing_file_is_404() {
    let dir = TempDir::new().unwrap();
    let app = server(&dir).router();

    let request = Request::builder()
        .method("GET")
        .uri("/nothing-here.bin")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
