//! Router assembly: routes, static file serving and the middleware stack.

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::{HeaderValue, Request, header};
use axum::routing::post;
use axum::{Router, middleware};
use std::path::Path;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeader;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::config::AppConfig;
use crate::http::{add_security_headers, build_cors_layer, request_client_ip};
use crate::limiter::{RateLimiter, rate_limit_middleware};
use crate::storage::UploadStore;
use crate::upload;

/// Builds the application router around a shared rate limiter.
pub fn build_router(config: &AppConfig, limiter: Arc<RateLimiter>) -> Router {
    let upload_config = Arc::new(config.upload.clone());
    let store = Arc::new(UploadStore::new(config.upload.upload_dir.clone()));
    let body_limit = usize::try_from(config.upload.max_upload_size).unwrap_or(usize::MAX);
    let trust_proxy = config.server.trust_proxy;

    Router::new()
        .route(
            "/upload",
            post(upload::upload_file).layer(DefaultBodyLimit::max(body_limit)),
        )
        .nest_service("/uploads", uploads_service(&config.upload.upload_dir))
        .fallback_service(ServeDir::new(&config.server.public_dir))
        .layer(middleware::from_fn(rate_limit_middleware))
        .layer(middleware::from_fn(add_security_headers))
        .layer(RequestBodyTimeoutLayer::new(config.server.read_timeout))
        .layer(TimeoutLayer::new(config.server.write_timeout))
        .layer(build_cors_layer(config.server.cors_origins.as_deref()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let client_ip = request_client_ip(request, trust_proxy)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        "request",
                        client_ip,
                        method = %request.method(),
                        path = request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(upload_config))
        .layer(Extension(store))
        .layer(Extension(limiter))
}

/// Stored files, sandboxed so an uploaded document never runs script on this origin.
fn uploads_service(upload_dir: &Path) -> SetResponseHeader<ServeDir, HeaderValue> {
    SetResponseHeader::overriding(
        ServeDir::new(upload_dir),
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("sandbox"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, Bytes};
    use axum::extract::connect_info::ConnectInfo;
    use axum::http::{Method, StatusCode};
    use std::net::SocketAddr;
    use axum::response::Response;
    use serde_json::Value;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    use crate::config::{BYTES_PER_MB, LogFormat, RateLimitConfig, ServerConfig, UploadConfig};

    const BOUNDARY: &str = "nyx-test-boundary";
    const BASE_URL: &str = "http://uploads.test";

    struct TestApp {
        _temp: TempDir,
        router: Router,
        upload_dir: PathBuf,
        public_dir: PathBuf,
    }

    fn test_app(max_upload_size: u64, burst: u32) -> TestApp {
        let temp = tempdir().expect("tempdir");
        let upload_dir = temp.path().join("uploads");
        let public_dir = temp.path().join("public");
        std::fs::create_dir_all(&public_dir).expect("public dir");

        let config = AppConfig {
            server: ServerConfig {
                addr: "127.0.0.1:0".parse().expect("addr"),
                public_dir: public_dir.clone(),
                read_timeout: Duration::from_secs(15),
                write_timeout: Duration::from_secs(15),
                idle_timeout: Duration::from_secs(60),
                shutdown_grace: Duration::from_secs(5),
                cors_origins: None,
                trust_proxy: false,
            },
            upload: UploadConfig {
                upload_dir: upload_dir.clone(),
                base_url: BASE_URL.into(),
                max_upload_size,
            },
            rate_limit: RateLimitConfig {
                rate: 0.001,
                burst,
                ..RateLimitConfig::default()
            },
            log_format: LogFormat::Text,
        };
        let limiter = Arc::new(RateLimiter::new(config.rate_limit, false));
        TestApp {
            router: build_router(&config, limiter),
            _temp: temp,
            upload_dir,
            public_dir,
        }
    }

    fn with_peer(mut request: Request<Body>, last_octet: u8) -> Request<Body> {
        let addr = SocketAddr::from(([192, 0, 2, last_octet], 40000));
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            let disposition = match filename {
                Some(filename) => format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                ),
                None => format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"),
            };
            body.extend_from_slice(disposition.as_bytes());
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(parts: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .expect("request");
        with_peer(request, 1)
    }

    /// Delivers `body` in small frames, yielding between them like a socket would.
    fn chunked_upload_request(body: Vec<u8>, frame: usize) -> Request<Body> {
        let frames: Vec<Bytes> = body.chunks(frame).map(Bytes::copy_from_slice).collect();
        let stream = futures_util::stream::unfold(frames.into_iter(), |mut frames| async move {
            tokio::task::yield_now().await;
            frames
                .next()
                .map(|frame| (Ok::<_, std::io::Error>(frame), frames))
        });
        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from_stream(stream))
            .expect("request");
        with_peer(request, 1)
    }

    fn elf_bytes(len: usize) -> Vec<u8> {
        let mut elf = vec![0x7F, b'E', b'L', b'F', 2, 1, 1, 0];
        elf.resize(len, 0);
        elf
    }

    fn get_request(uri: &str, last_octet: u8) -> Request<Body> {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        with_peer(request, last_octet)
    }

    async fn send(app: &TestApp, request: Request<Body>) -> Response {
        app.router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible router")
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body")
            .to_vec()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).expect("json body")
    }

    fn stored_files(dir: &Path) -> Vec<String> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn jpeg_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];
        data.extend((0..len.saturating_sub(data.len())).map(|i| (i % 251) as u8));
        data
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let app = test_app(300 * BYTES_PER_MB, 100);
        let content = jpeg_bytes(2 * BYTES_PER_MB as usize);

        let response = send(&app, upload_request(&[("file", Some("photo.jpg"), content.as_slice())])).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "File uploaded successfully!");

        let path = json["data"]["path"].as_str().expect("path");
        let name = path
            .strip_prefix(&format!("{BASE_URL}/uploads/"))
            .expect("public url prefix");
        assert!(name.ends_with(".jpg"));
        assert_eq!(stored_files(&app.upload_dir), vec![name.to_string()]);

        let response = send(&app, get_request(&format!("/uploads/{name}"), 2)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, content);
    }

    #[tokio::test]
    async fn other_fields_are_skipped() {
        let app = test_app(BYTES_PER_MB, 100);
        let content = b"col_a,col_b\n1,2\n";
        let response = send(
            &app,
            upload_request(&[
                ("note", None, b"hello".as_slice()),
                ("file", Some("data.csv"), content.as_slice()),
            ]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let name = json["data"]["path"]
            .as_str()
            .and_then(|path| path.rsplit('/').next())
            .expect("name")
            .to_string();
        assert!(name.ends_with(".csv"));
        let stored = std::fs::read(app.upload_dir.join(name)).expect("stored");
        assert_eq!(stored, content);
    }

    #[tokio::test]
    async fn missing_file_field_is_bad_request() {
        let app = test_app(BYTES_PER_MB, 100);
        let response = send(&app, upload_request(&[("document", Some("a.txt"), b"hello".as_slice())])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert!(json["message"].as_str().expect("message").contains("'file'"));
        assert!(json.get("data").is_none());
    }

    #[tokio::test]
    async fn disallowed_content_is_rejected_regardless_of_extension() {
        let app = test_app(BYTES_PER_MB, 100);
        let elf = elf_bytes(600);
        let response = send(&app, upload_request(&[("file", Some("cat.jpg"), elf.as_slice())])).await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let json = body_json(response).await;
        assert!(json["message"].as_str().expect("message").contains("is not allowed"));
        assert!(stored_files(&app.upload_dir).is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_without_writing() {
        let app = test_app(BYTES_PER_MB, 100);
        let content = jpeg_bytes(BYTES_PER_MB as usize + BYTES_PER_MB as usize / 2);
        let response = send(&app, upload_request(&[("file", Some("big.jpg"), content.as_slice())])).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let json = body_json(response).await;
        assert_eq!(json["message"], "File is too large. Max size is 1 MB.");
        assert!(stored_files(&app.upload_dir).is_empty());
    }

    #[tokio::test]
    async fn oversized_disallowed_stream_is_too_large() {
        let app = test_app(BYTES_PER_MB, 100);
        let elf = elf_bytes(2 * BYTES_PER_MB as usize);
        let body = multipart_body(&[("file", Some("tool.bin"), elf.as_slice())]);
        let response = send(&app, chunked_upload_request(body, 16 * 1024)).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let json = body_json(response).await;
        assert_eq!(json["message"], "File is too large. Max size is 1 MB.");
        assert!(stored_files(&app.upload_dir).is_empty());
    }

    #[tokio::test]
    async fn small_disallowed_stream_is_unsupported() {
        let app = test_app(BYTES_PER_MB, 100);
        let elf = elf_bytes(64 * 1024);
        let body = multipart_body(&[("file", Some("tool.bin"), elf.as_slice())]);
        let response = send(&app, chunked_upload_request(body, 4 * 1024)).await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(stored_files(&app.upload_dir).is_empty());
    }

    #[tokio::test]
    async fn declared_length_over_limit_is_too_large() {
        let app = test_app(BYTES_PER_MB, 100);
        let mut request = upload_request(&[("file", Some("a.jpg"), jpeg_bytes(1024).as_slice())]);
        request.headers_mut().insert(
            header::CONTENT_LENGTH,
            HeaderValue::from(2 * BYTES_PER_MB),
        );
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(stored_files(&app.upload_dir).is_empty());
    }

    #[tokio::test]
    async fn uploaded_markup_is_served_sandboxed() {
        let app = test_app(BYTES_PER_MB, 100);
        let content = b"hello <script>alert(document.cookie)</script>";
        let response = send(&app, upload_request(&[("file", Some("evil.html"), content.as_slice())])).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let name = json["data"]["path"]
            .as_str()
            .and_then(|path| path.rsplit('/').next())
            .expect("name")
            .to_string();

        let response = send(&app, get_request(&format!("/uploads/{name}"), 2)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(
            headers.get(header::CONTENT_SECURITY_POLICY).map(|v| v.as_bytes()),
            Some(&b"sandbox"[..])
        );
        assert_eq!(
            headers.get(header::X_CONTENT_TYPE_OPTIONS).map(|v| v.as_bytes()),
            Some(&b"nosniff"[..])
        );
    }

    #[tokio::test]
    async fn empty_file_is_bad_request() {
        let app = test_app(BYTES_PER_MB, 100);
        let response = send(&app, upload_request(&[("file", Some("empty.txt"), b"".as_slice())])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(stored_files(&app.upload_dir).is_empty());
    }

    #[tokio::test]
    async fn non_multipart_request_is_bad_request() {
        let app = test_app(BYTES_PER_MB, 100);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .expect("request");
        let response = send(&app, with_peer(request, 1)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["message"], "Invalid request.");
    }

    #[tokio::test]
    async fn traversal_filename_is_neutralized() {
        let app = test_app(BYTES_PER_MB, 100);
        let response = send(
            &app,
            upload_request(&[("file", Some("a/../../etc/passwd"), b"root:x:0:0\n".as_slice())]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let files = stored_files(&app.upload_dir);
        assert_eq!(files.len(), 1);
        assert!(!files[0].contains("passwd"));
        assert!(!files[0].contains('.'));
    }

    #[tokio::test]
    async fn concurrent_uploads_get_distinct_names() {
        let app = test_app(BYTES_PER_MB, 100);
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let router = app.router.clone();
            tasks.spawn(async move {
                let content = jpeg_bytes(4096);
                let request = upload_request(&[("file", Some("same.png"), content.as_slice())]);
                router.oneshot(request).await.expect("infallible router").status()
            });
        }
        while let Some(status) = tasks.join_next().await {
            assert_eq!(status.expect("task"), StatusCode::OK);
        }
        assert_eq!(stored_files(&app.upload_dir).len(), 8);
    }

    #[tokio::test]
    async fn missing_upload_is_not_found() {
        let app = test_app(BYTES_PER_MB, 100);
        let response = send(&app, get_request("/uploads/0-0000000000000000.jpg", 1)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn public_assets_are_served_with_security_headers() {
        let app = test_app(BYTES_PER_MB, 100);
        std::fs::write(app.public_dir.join("index.html"), "<h1>nyx</h1>").expect("index");

        let response = send(&app, get_request("/", 1)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::X_CONTENT_TYPE_OPTIONS)
                .map(|v| v.as_bytes()),
            Some(&b"nosniff"[..])
        );
        assert_eq!(body_bytes(response).await, b"<h1>nyx</h1>");
    }

    #[tokio::test]
    async fn burst_exhaustion_returns_plain_429() {
        let app = test_app(BYTES_PER_MB, 2);
        for _ in 0..2 {
            let response = send(&app, get_request("/missing.txt", 9)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        let response = send(&app, get_request("/missing.txt", 9)).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(body_bytes(response).await, b"too many requests");

        let response = send(&app, get_request("/missing.txt", 10)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rate_limit_runs_before_upload() {
        let app = test_app(BYTES_PER_MB, 1);
        let first = send(&app, upload_request(&[("file", Some("a.txt"), b"one".as_slice())])).await;
        assert_eq!(first.status(), StatusCode::OK);
        let second = send(&app, upload_request(&[("file", Some("b.txt"), b"two".as_slice())])).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(stored_files(&app.upload_dir).len(), 1);
    }

    #[tokio::test]
    async fn missing_peer_address_fails_closed() {
        let app = test_app(BYTES_PER_MB, 100);
        let request = Request::builder()
            .uri("/")
            .body(Body::empty())
            .expect("request");
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
