//! Engine lifecycle integration tests driven through a mock backend
//! provider with load-count instrumentation.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use kolosal_engines::{
    EngineState, ModelPersistence, NodeError, NodeManager, NodeManagerConfig, PersistedModel,
};
use kolosal_inference::mock::MockBackendProvider;
use kolosal_inference::LoadingParameters;

fn no_gpu() -> bool {
    false
}

fn test_config(dir: &tempfile::TempDir) -> NodeManagerConfig {
    NodeManagerConfig {
        idle_timeout: Duration::from_secs(300),
        default_backend: Some("llama-cpu".to_string()),
        models_dir: dir.path().to_path_buf(),
    }
}

fn make_manager(config: NodeManagerConfig) -> (Arc<NodeManager>, Arc<MockBackendProvider>) {
    let provider = Arc::new(MockBackendProvider::with_default_backends());
    let manager = Arc::new(NodeManager::new(provider.clone(), config, &no_gpu));
    (manager, provider)
}

fn model_file(dir: &tempfile::TempDir, name: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, b"gguf-bytes").unwrap();
    path.to_string_lossy().to_string()
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, pred: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !pred() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[derive(Default)]
struct RecordingPersistence {
    persisted: Mutex<Vec<PersistedModel>>,
    removed: Mutex<Vec<String>>,
}

impl ModelPersistence for RecordingPersistence {
    fn persist_model(&self, model: &PersistedModel) {
        self.persisted.lock().push(model.clone());
    }

    fn remove_model(&self, engine_id: &str) {
        self.removed.lock().push(engine_id.to_string());
    }
}

#[tokio::test]
async fn add_loads_immediately_and_get_returns_handle() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, provider) = make_manager(test_config(&dir));
    let path = model_file(&dir, "m1.gguf");

    manager
        .add("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();

    assert_eq!(manager.get_status("m1"), (true, true));
    assert_eq!(provider.stats().load_model_calls.load(Ordering::SeqCst), 1);

    let engine = manager.get("m1").await.unwrap();
    assert!(!engine.has_active_jobs());
    // The handle was served from the record, not a fresh load
    assert_eq!(provider.stats().load_model_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_add_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = make_manager(test_config(&dir));
    let path = model_file(&dir, "m1.gguf");

    manager
        .add("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();
    let err = manager
        .add("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::AlreadyExists(_)));
}

#[tokio::test]
async fn add_with_missing_file_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, provider) = make_manager(test_config(&dir));

    let err = manager
        .add(
            "m1",
            "/nonexistent/m1.gguf",
            LoadingParameters::default(),
            -1,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Validation(_)));
    assert_eq!(provider.stats().load_model_calls.load(Ordering::SeqCst), 0);
    assert_eq!(manager.get_status("m1"), (false, false));
}

#[tokio::test]
async fn add_with_unknown_backend_fails_selection() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = make_manager(test_config(&dir));
    let path = model_file(&dir, "m1.gguf");

    let err = manager
        .add("m1", &path, LoadingParameters::default(), -1, Some("onnx"))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::BackendSelection(_)));
}

#[tokio::test]
async fn failed_load_leaves_no_record_and_unloads_defensively() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, provider) = make_manager(test_config(&dir));
    let path = model_file(&dir, "m1.gguf");

    provider.set_fail_loads(true);
    let err = manager
        .add("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::LoadFailed { .. }));
    assert_eq!(manager.get_status("m1"), (false, false));
    assert!(provider.stats().unload_model_calls.load(Ordering::SeqCst) >= 1);

    // A later attempt with working parameters succeeds
    provider.set_fail_loads(false);
    manager
        .add("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();
    assert_eq!(manager.get_status("m1"), (true, true));
}

#[tokio::test]
async fn register_defers_load_until_first_get() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, provider) = make_manager(test_config(&dir));
    let path = model_file(&dir, "m1.gguf");

    manager
        .register("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();

    assert_eq!(manager.get_status("m1"), (true, false));
    assert_eq!(provider.stats().load_model_calls.load(Ordering::SeqCst), 0);

    manager.get("m1").await.unwrap();
    assert_eq!(manager.get_status("m1"), (true, true));
    assert_eq!(provider.stats().load_model_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn get_status_never_triggers_a_load() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, provider) = make_manager(test_config(&dir));
    let path = model_file(&dir, "m1.gguf");

    manager
        .register("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();

    for _ in 0..5 {
        assert_eq!(manager.get_status("m1"), (true, false));
    }
    assert_eq!(provider.stats().load_model_calls.load(Ordering::SeqCst), 0);
    assert_eq!(manager.get_status("missing"), (false, false));
}

#[tokio::test]
async fn register_persists_caller_params_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockBackendProvider::with_default_backends());
    let persistence = Arc::new(RecordingPersistence::default());
    let manager = Arc::new(
        NodeManager::new(provider.clone(), test_config(&dir), &no_gpu)
            .with_persistence(persistence.clone()),
    );
    let path = model_file(&dir, "m1.gguf");

    let params = LoadingParameters {
        n_gpu_layers: 0,
        n_ctx: 1234,
        ..Default::default()
    };
    manager
        .register("lazy", &path, params.clone(), -1, Some("llama-vulkan"))
        .await
        .unwrap();
    manager
        .add("eager", &path, params.clone(), -1, Some("llama-vulkan"))
        .await
        .unwrap();

    let persisted = persistence.persisted.lock();
    let lazy = persisted.iter().find(|m| m.id == "lazy").unwrap();
    let eager = persisted.iter().find(|m| m.id == "eager").unwrap();

    // Registration keeps the caller's parameters verbatim; the eager add
    // persists the effective (GPU-overridden) parameters it loaded with.
    assert_eq!(lazy.load_params.n_gpu_layers, 0);
    assert!(!lazy.load_immediately);
    assert_eq!(eager.load_params.n_gpu_layers, 100);
    assert!(eager.load_immediately);
    assert_eq!(lazy.load_params.n_ctx, 1234);
}

#[tokio::test]
async fn gpu_override_is_applied_at_lazy_load_time() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, provider) = make_manager(test_config(&dir));
    let path = model_file(&dir, "m1.gguf");

    manager
        .register(
            "m1",
            &path,
            LoadingParameters {
                n_gpu_layers: 0,
                ..Default::default()
            },
            -1,
            Some("llama-vulkan"),
        )
        .await
        .unwrap();

    manager.get("m1").await.unwrap();
    assert_eq!(provider.stats().last_gpu_layers.load(Ordering::SeqCst), 100);
}

#[tokio::test]
async fn cpu_backend_never_gets_gpu_override() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, provider) = make_manager(test_config(&dir));
    let path = model_file(&dir, "m1.gguf");

    manager
        .add(
            "m1",
            &path,
            LoadingParameters {
                n_gpu_layers: 0,
                ..Default::default()
            },
            -1,
            Some("llama-cpu"),
        )
        .await
        .unwrap();
    assert_eq!(provider.stats().last_gpu_layers.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gets_trigger_exactly_one_load() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, provider) = make_manager(test_config(&dir));
    provider.set_load_delay(Duration::from_millis(100));
    let path = model_file(&dir, "m1.gguf");

    manager
        .register("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move { manager.get("m1").await }));
    }
    for task in tasks {
        task.await.unwrap().expect("every waiter shares the successful load");
    }

    assert_eq!(provider.stats().load_model_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_observe_a_failed_load() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, provider) = make_manager(test_config(&dir));
    provider.set_load_delay(Duration::from_millis(100));
    provider.set_fail_loads(true);
    let path = model_file(&dir, "m1.gguf");

    manager
        .register("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move { manager.get("m1").await }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_err());
    }
    assert_eq!(
        provider.stats().load_model_calls.load(Ordering::SeqCst),
        1,
        "only the claiming task should have attempted the load"
    );
    // The record survives for retries with different parameters
    assert_eq!(manager.get_status("m1"), (true, false));
}

#[tokio::test]
async fn remove_unloads_and_forgets_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockBackendProvider::with_default_backends());
    let persistence = Arc::new(RecordingPersistence::default());
    let manager = Arc::new(
        NodeManager::new(provider.clone(), test_config(&dir), &no_gpu)
            .with_persistence(persistence.clone()),
    );
    let path = model_file(&dir, "m1.gguf");

    manager
        .add("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();
    manager.remove("m1").await.unwrap();

    assert_eq!(manager.get_status("m1"), (false, false));
    assert!(matches!(
        manager.get("m1").await.unwrap_err(),
        NodeError::NotFound(_)
    ));
    assert_eq!(provider.stats().unload_model_calls.load(Ordering::SeqCst), 1);
    assert_eq!(persistence.removed.lock().as_slice(), ["m1".to_string()]);

    assert!(matches!(
        manager.remove("m1").await.unwrap_err(),
        NodeError::NotFound(_)
    ));
}

#[tokio::test]
async fn embedding_models_use_the_embedding_entry_point() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, provider) = make_manager(test_config(&dir));
    let path = model_file(&dir, "embed.gguf");

    manager
        .add_embedding("e1", &path, LoadingParameters::default(), -1)
        .await
        .unwrap();
    assert_eq!(
        provider.stats().embedding_load_calls.load(Ordering::SeqCst),
        1
    );

    manager
        .register_embedding("e2", &path, LoadingParameters::default(), -1)
        .await
        .unwrap();
    manager.get("e2").await.unwrap();
    assert_eq!(
        provider.stats().embedding_load_calls.load(Ordering::SeqCst),
        2
    );
}

#[tokio::test]
async fn directory_model_path_resolves_to_contained_gguf() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = make_manager(test_config(&dir));

    let model_dir = dir.path().join("weights");
    std::fs::create_dir(&model_dir).unwrap();
    std::fs::write(model_dir.join("notes.txt"), b"readme").unwrap();
    std::fs::write(model_dir.join("model.gguf"), b"gguf").unwrap();

    manager
        .add(
            "m1",
            &model_dir.to_string_lossy(),
            LoadingParameters::default(),
            -1,
            None,
        )
        .await
        .unwrap();

    let summary = manager
        .engine_summaries()
        .into_iter()
        .find(|s| s.id == "m1")
        .unwrap();
    assert!(summary.model_path.ends_with("model.gguf"));
}

#[tokio::test]
async fn directory_without_gguf_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = make_manager(test_config(&dir));

    let model_dir = dir.path().join("empty");
    std::fs::create_dir(&model_dir).unwrap();

    let err = manager
        .add(
            "m1",
            &model_dir.to_string_lossy(),
            LoadingParameters::default(),
            -1,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Validation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_engine_is_unloaded_and_reloaded_on_next_get() {
    let dir = tempfile::tempdir().unwrap();
    let config = NodeManagerConfig {
        idle_timeout: Duration::from_secs(1),
        ..test_config(&dir)
    };
    let (manager, provider) = make_manager(config);
    let path = model_file(&dir, "m1.gguf");

    manager
        .add("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();
    Arc::clone(&manager).start_autoscaler();

    wait_until("idle eviction", Duration::from_secs(8), || {
        manager.get_status("m1") == (true, false)
    })
    .await;
    assert_eq!(provider.stats().unload_model_calls.load(Ordering::SeqCst), 1);

    // First use after eviction pays the reload and succeeds
    manager.get("m1").await.unwrap();
    assert_eq!(manager.get_status("m1"), (true, true));
    assert_eq!(provider.stats().load_model_calls.load(Ordering::SeqCst), 2);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engines_with_active_jobs_are_not_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let config = NodeManagerConfig {
        idle_timeout: Duration::from_secs(1),
        ..test_config(&dir)
    };
    let (manager, provider) = make_manager(config);
    provider.set_hold_jobs(true);
    let path = model_file(&dir, "m1.gguf");

    manager
        .add("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();
    Arc::clone(&manager).start_autoscaler();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(
        manager.get_status("m1"),
        (true, true),
        "active jobs must block idle eviction"
    );

    // Once the jobs drain the next pass unloads it
    provider.set_hold_jobs(false);
    wait_until("eviction after jobs drain", Duration::from_secs(8), || {
        manager.get_status("m1") == (true, false)
    })
    .await;

    manager.shutdown().await;
}

#[tokio::test]
async fn recent_activity_defers_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let config = NodeManagerConfig {
        idle_timeout: Duration::from_secs(2),
        ..test_config(&dir)
    };
    let (manager, _) = make_manager(config);
    let path = model_file(&dir, "m1.gguf");

    manager
        .add("m1", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();

    // Touch the engine, then run a pass: nothing is idle enough yet
    manager.get("m1").await.unwrap();
    let next = manager.autoscale_pass();
    assert_eq!(manager.get_status("m1"), (true, true));
    assert!(next >= Duration::from_secs(1));
}

#[tokio::test]
async fn list_ids_and_summaries_reflect_state() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = make_manager(test_config(&dir));
    let path = model_file(&dir, "m1.gguf");

    manager
        .add("b-engine", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();
    manager
        .register("a-engine", &path, LoadingParameters::default(), -1, None)
        .await
        .unwrap();

    assert_eq!(manager.list_ids(), vec!["a-engine", "b-engine"]);

    let summaries = manager.engine_summaries();
    assert_eq!(summaries[0].state, EngineState::Registered);
    assert_eq!(summaries[1].state, EngineState::Loaded);

    let backends = manager.list_available_backends();
    assert!(backends.iter().any(|b| b.name == "llama-cpu"));
}
