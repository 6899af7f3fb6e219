//! Coordinator URL resolution: direct add/register calls with HTTP model
//! paths download (or resume) synchronously before the engine is built.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use kolosal_engines::{NodeError, NodeManager, NodeManagerConfig};
use kolosal_inference::mock::MockBackendProvider;

fn no_gpu() -> bool {
    false
}

#[derive(Clone)]
struct Fixture {
    data: Arc<Vec<u8>>,
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

    let body = fixture.data[offset..].to_vec();
    let status = if offset > 0 {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

async fn spawn_fixture(data: Vec<u8>) -> String {
    let app = Router::new()
        .route("/weights.gguf", get(serve_model))
        .with_state(Fixture {
            data: Arc::new(data),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/weights.gguf")
}

fn make_manager(dir: &tempfile::TempDir) -> (Arc<NodeManager>, Arc<MockBackendProvider>) {
    let provider = Arc::new(MockBackendProvider::with_default_backends());
    let config = NodeManagerConfig {
        idle_timeout: Duration::from_secs(300),
        default_backend: Some("llama-cpu".to_string()),
        models_dir: dir.path().to_path_buf(),
    };
    let manager = Arc::new(NodeManager::new(provider.clone(), config, &no_gpu));
    (manager, provider)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn add_with_url_downloads_into_models_dir() {
    let data: Vec<u8> = (0..32 * 1024).map(|i| (i % 253) as u8).collect();
    let url = spawn_fixture(data.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = make_manager(&dir);

    manager
        .add("m1", &url, Default::default(), -1, None)
        .await
        .unwrap();

    assert_eq!(manager.get_status("m1"), (true, true));
    let downloaded = dir.path().join("weights.gguf");
    assert_eq!(std::fs::read(&downloaded).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn register_with_url_reuses_complete_local_file() {
    let data: Vec<u8> = (0..16 * 1024).map(|i| (i % 253) as u8).collect();
    let url = spawn_fixture(data.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (manager, provider) = make_manager(&dir);

    // Pre-seed a complete file at the deterministic download path
    std::fs::write(dir.path().join("weights.gguf"), &data).unwrap();

    manager
        .register("m1", &url, Default::default(), -1, None)
        .await
        .unwrap();
    assert_eq!(manager.get_status("m1"), (true, false));

    manager.get("m1").await.unwrap();
    assert_eq!(
        provider
            .stats()
            .load_model_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn add_with_partial_local_file_resumes_before_loading() {
    let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 253) as u8).collect();
    let url = spawn_fixture(data.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = make_manager(&dir);

    // Half the file is already on disk; the add call must complete it
    std::fs::write(dir.path().join("weights.gguf"), &data[..32 * 1024]).unwrap();

    manager
        .add("m1", &url, Default::default(), -1, None)
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(dir.path().join("weights.gguf")).unwrap(),
        data,
        "resumed file must be byte-identical to a full download"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_url_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = make_manager(&dir);

    let err = manager
        .add(
            "m1",
            "http://127.0.0.1:1/missing.gguf",
            Default::default(),
            -1,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Download(_)));
    assert_eq!(manager.get_status("m1"), (false, false));
}
