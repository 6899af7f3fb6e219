//! End-to-end URL model flow over HTTP: 202 on submit, observable
//! progress, pause/resume/cancel control, and eventual engine creation.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use kolosal_inference::mock::MockBackendProvider;
use kolosal_server::config::ServerConfig;
use kolosal_server::routes;
use kolosal_server::state::AppState;

fn no_gpu() -> bool {
    false
}

#[derive(Clone)]
struct Fixture {
    data: Arc<Vec<u8>>,
    chunk: usize,
    delay: Duration,
}

async fn serve_model(State(fixture): State<Fixture>, headers: HeaderMap) -> Response {
    let total = fixture.data.len();
    let offset = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("bytes="))
        .and_then(|s| s.split('-').next())
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|o| *o < total)
        .unwrap_or(0);

    let remaining = fixture.data[offset..].to_vec();
    let len = remaining.len();
    let status = if offset > 0 {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let chunk = fixture.chunk;
    let delay = fixture.delay;
    let stream = futures::stream::unfold((remaining, 0usize), move |(data, pos)| async move {
        if pos >= data.len() {
            return None;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let end = (pos + chunk).min(data.len());
        let bytes = bytes::Bytes::copy_from_slice(&data[pos..end]);
        Some((Ok::<_, std::io::Error>(bytes), (data, end)))
    });

    Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, len)
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn spawn_fixture(data: Vec<u8>, chunk: usize, delay: Duration) -> String {
    let app = Router::new()
        .route("/m.gguf", get(serve_model))
        .with_state(Fixture {
            data: Arc::new(data),
            chunk,
            delay,
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/m.gguf")
}

async fn test_app(dir: &tempfile::TempDir) -> Router {
    let provider = Arc::new(MockBackendProvider::with_default_backends());
    let mut config = ServerConfig::default();
    config.server.models_dir = dir.path().to_path_buf();
    config.default_inference_engine = Some("llama-cpu".to_string());

    let state = AppState::build(
        config,
        dir.path().join("config.toml"),
        provider,
        &no_gpu,
    )
    .await
    .unwrap();
    routes::router(state)
}

async fn request(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(json!(null));
    (status, value)
}

async fn wait_for_status(app: &Router, model_id: &str, wanted: &str, timeout: Duration) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (status, body) = request(app, "GET", &format!("/downloads/{model_id}"), None).await;
        if status == StatusCode::OK && body["status"] == wanted {
            return body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for download status '{wanted}', last: {body}"
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn url_model_add_returns_202_and_eventually_loads() {
    let url = spawn_fixture(payload(64 * 1024), 8 * 1024, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;

    let (status, body) = request(
        &app,
        "POST",
        "/models",
        Some(json!({
            "model_id": "m1",
            "model_path": url,
            "load_immediately": true,
            "main_gpu_id": -1,
            "loading_parameters": { "n_ctx": 4096 },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "downloading");
    assert!(body["local_path"].as_str().unwrap().ends_with("m.gguf"));

    wait_for_status(&app, "m1", "engine_created", Duration::from_secs(10)).await;

    let (status, model) = request(&app, "GET", "/models/m1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(model["status"], "loaded");
    assert_eq!(model["inference_ready"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_progress_is_monotone_and_pausable() {
    let url = spawn_fixture(payload(300 * 1024), 1024, Duration::from_millis(5)).await;
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;

    let (status, _) = request(
        &app,
        "POST",
        "/models",
        Some(json!({ "model_id": "m1", "model_path": url })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // Progress percentages never move backwards across polls
    let mut last = -1.0f64;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (_, body) = request(&app, "GET", "/downloads/m1", None).await;
        if body["status"] == "downloading" {
            let pct = body["progress"]["percentage"].as_f64().unwrap();
            assert!(pct >= last, "percentage went backwards: {pct} < {last}");
            assert!((0.0..=100.0).contains(&pct));
            last = pct;
            if pct > 0.0 {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "no progress observed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let (status, body) = request(&app, "POST", "/downloads/m1/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "paused");

    tokio::time::sleep(Duration::from_millis(500)).await;
    let (_, first) = request(&app, "GET", "/downloads/m1", None).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let (_, second) = request(&app, "GET", "/downloads/m1", None).await;
    assert_eq!(
        first["progress"]["downloaded_bytes"],
        second["progress"]["downloaded_bytes"],
        "paused download must stop growing"
    );

    let (status, _) = request(&app, "POST", "/downloads/m1/resume", None).await;
    assert_eq!(status, StatusCode::OK);

    wait_for_status(&app, "m1", "engine_created", Duration::from_secs(20)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_download_preserves_partial_and_resumes_on_retry() {
    let data = payload(200 * 1024);
    let url = spawn_fixture(data.clone(), 1024, Duration::from_millis(5)).await;
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir).await;

    let (status, body) = request(
        &app,
        "POST",
        "/models",
        Some(json!({ "model_id": "m1", "model_path": url })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let local_path = body["local_path"].as_str().unwrap().to_string();

    // Wait for some bytes, then cancel
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (_, body) = request(&app, "GET", "/downloads/m1", None).await;
        if body["progress"]["downloaded_bytes"].as_u64().unwrap_or(0) > 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let (status, _) = request(&app, "DELETE", "/downloads/m1", None).await;
    assert_eq!(status, StatusCode::OK);

    // Cancelling twice is a 400, the record being terminal now
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (status, error) = request(&app, "POST", "/downloads/m1/cancel", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"]["code"], "download_not_cancellable");

    let partial = std::fs::metadata(&local_path).unwrap().len();
    assert!(partial > 0 && partial < data.len() as u64);

    // Re-submitting the same model resumes from the partial file
    let (status, _) = request(
        &app,
        "POST",
        "/models",
        Some(json!({ "model_id": "m1", "model_path": url })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    wait_for_status(&app, "m1", "engine_created", Duration::from_secs(20)).await;
    assert_eq!(std::fs::read(&local_path).unwrap(), data);
}
