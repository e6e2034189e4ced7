//! End-to-end tests for the message router
//!
//! Drives the full deploy/delete/snapshot pipelines against the real
//! on-disk store with mocked platform and engine collaborators.

use pipeagent::agent::MessageRouter;
use pipeagent::protocol::frames::{ControlFrame, ErrorPayload};
use pipeagent::protocol::model::{AgentStatus, PipelineConfig};
use pipeagent::services::MetricsService;
use pipeagent::store::ConfigStore;
use pipeagent::testing::mocks::{MockEngine, MockPlatform};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

struct Harness {
    router: Arc<MessageRouter>,
    platform: Arc<MockPlatform>,
    engine: Arc<MockEngine>,
    store: Arc<ConfigStore>,
    status: Arc<RwLock<AgentStatus>>,
    _dir: tempfile::TempDir,
}

async fn harness(engine: MockEngine) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new());
    let engine = Arc::new(engine);
    let store = Arc::new(ConfigStore::open(dir.path(), 3).await.unwrap());
    let status = Arc::new(RwLock::new(AgentStatus::new("a-1")));
    let metrics = Arc::new(MetricsService::new(
        platform.clone(),
        engine.clone(),
        "a-1",
        Duration::from_secs(60),
        CancellationToken::new(),
    ));

    let router = Arc::new(MessageRouter::new(
        platform.clone(),
        store.clone(),
        engine.clone(),
        metrics,
        status.clone(),
        "a-1",
        true,
    ));

    Harness {
        router,
        platform,
        engine,
        store,
        status,
        _dir: dir,
    }
}

fn pipeline(id: &str, version: u64, content: &str) -> PipelineConfig {
    PipelineConfig {
        id: id.to_string(),
        version,
        content: content.to_string(),
        name: None,
    }
}

fn deploy_frame(id: &str, version: u64) -> ControlFrame {
    ControlFrame::new("config_deploy", json!({"config_id": id, "version": version}))
}

#[tokio::test]
async fn test_deploy_end_to_end() {
    let h = harness(MockEngine::running()).await;
    h.platform.put_config(pipeline("c", 7, "input{stdin{}}")).await;

    h.router.dispatch(deploy_frame("c", 7)).await;

    // Saved to disk
    let on_disk = std::fs::read_to_string(h.store.file_path("c")).unwrap();
    assert_eq!(on_disk, "input{stdin{}}");

    // Validated against the saved file
    let validated = h.engine.validated_paths.lock().await.clone();
    assert_eq!(validated, vec![h.store.file_path("c")]);

    // Engine running with auto-reload: exactly one reload
    assert_eq!(h.engine.reloads(), 1);

    // Applied record upserted and reported
    let status = h.status.read().await;
    assert_eq!(status.applied_configs.len(), 1);
    assert_eq!(status.applied_configs[0].config_id, "c");
    assert_eq!(status.applied_configs[0].version, 7);

    let reported = h.platform.applied_reports.lock().await.clone();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].1.version, 7);
}

#[tokio::test]
async fn test_deploy_version_mismatch_rejected() {
    let h = harness(MockEngine::running()).await;
    h.platform.set_channel_connected(true);
    h.platform.put_config(pipeline("c", 8, "newer")).await;

    h.router.dispatch(deploy_frame("c", 7)).await;

    // Nothing applied, nothing saved
    assert!(h.status.read().await.applied_configs.is_empty());
    assert!(!h.store.file_path("c").exists());
    assert_eq!(h.engine.reloads(), 0);

    // The platform got an error frame naming the config
    let frames = h.platform.sent_frames.lock().await.clone();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].frame_type, "error");
    let payload: ErrorPayload = serde_json::from_value(frames[0].payload.clone()).unwrap();
    assert_eq!(payload.code, "config_invalid");
    assert_eq!(payload.config_id.as_deref(), Some("c"));
}

#[tokio::test]
async fn test_deploy_force_skips_version_check() {
    let h = harness(MockEngine::running()).await;
    h.platform.put_config(pipeline("c", 8, "newer")).await;

    let frame = ControlFrame::new(
        "config_deploy",
        json!({"config_id": "c", "version": 7, "force": true}),
    );
    h.router.dispatch(frame).await;

    let status = h.status.read().await;
    assert_eq!(status.applied_configs.len(), 1);
    // The fetched version is what got applied
    assert_eq!(status.applied_configs[0].version, 8);
}

#[tokio::test]
async fn test_deploy_validation_failure_restores_previous_bytes() {
    let h = harness(MockEngine::running()).await;
    h.platform.set_channel_connected(true);

    // A good config is live first
    h.platform.put_config(pipeline("c", 1, "good config")).await;
    h.router.dispatch(deploy_frame("c", 1)).await;
    assert_eq!(h.engine.reloads(), 1);

    // The next version fails validation
    h.engine
        .fail_validation
        .store(true, std::sync::atomic::Ordering::SeqCst);
    h.platform.put_config(pipeline("c", 2, "broken config")).await;
    h.router.dispatch(deploy_frame("c", 2)).await;

    // On-disk bytes equal the pre-deploy bytes
    let on_disk = std::fs::read_to_string(h.store.file_path("c")).unwrap();
    assert_eq!(on_disk, "good config");

    // AppliedConfig was not updated
    let status = h.status.read().await;
    assert_eq!(status.applied_configs.len(), 1);
    assert_eq!(status.applied_configs[0].version, 1);

    // No second reload, and an engine_validation_failed error frame
    assert_eq!(h.engine.reloads(), 1);
    let frames = h.platform.sent_frames.lock().await.clone();
    let payload: ErrorPayload =
        serde_json::from_value(frames.last().unwrap().payload.clone()).unwrap();
    assert_eq!(payload.code, "engine_validation_failed");
}

#[tokio::test]
async fn test_deploy_reload_failure_restores_previous_bytes() {
    let h = harness(MockEngine::running()).await;

    h.platform.put_config(pipeline("c", 1, "v1")).await;
    h.router.dispatch(deploy_frame("c", 1)).await;

    h.engine
        .fail_reload
        .store(true, std::sync::atomic::Ordering::SeqCst);
    h.platform.put_config(pipeline("c", 2, "v2")).await;
    h.router.dispatch(deploy_frame("c", 2)).await;

    let on_disk = std::fs::read_to_string(h.store.file_path("c")).unwrap();
    assert_eq!(on_disk, "v1");
    assert_eq!(h.status.read().await.applied_configs[0].version, 1);
}

#[tokio::test]
async fn test_deploy_when_engine_stopped_skips_reload() {
    let h = harness(MockEngine::new()).await;
    h.platform.put_config(pipeline("c", 3, "content")).await;

    h.router.dispatch(deploy_frame("c", 3)).await;

    assert_eq!(h.engine.reloads(), 0);
    assert_eq!(h.status.read().await.applied_configs.len(), 1);
}

#[tokio::test]
async fn test_delete_removes_config_and_reloads() {
    let h = harness(MockEngine::running()).await;
    h.platform.put_config(pipeline("c", 1, "content")).await;
    h.router.dispatch(deploy_frame("c", 1)).await;
    assert_eq!(h.engine.reloads(), 1);

    let frame = ControlFrame::new("config_delete", json!({"config_id": "c"}));
    h.router.dispatch(frame).await;

    assert!(!h.store.file_path("c").exists());
    assert!(h.status.read().await.applied_configs.is_empty());
    assert_eq!(h.engine.reloads(), 2);
}

#[tokio::test]
async fn test_delete_reload_failure_is_not_fatal() {
    let h = harness(MockEngine::running()).await;
    h.platform.set_channel_connected(true);
    h.platform.put_config(pipeline("c", 1, "content")).await;
    h.router.dispatch(deploy_frame("c", 1)).await;

    h.engine
        .fail_reload
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let frame = ControlFrame::new("config_delete", json!({"config_id": "c"}));
    h.router.dispatch(frame).await;

    // Delete succeeded; no error frame beyond what deploy may have sent
    assert!(!h.store.file_path("c").exists());
    let frames = h.platform.sent_frames.lock().await.clone();
    assert!(frames.iter().all(|f| f.frame_type != "error"));
}

#[tokio::test]
async fn test_reload_request_rejected_when_engine_stopped() {
    let h = harness(MockEngine::new()).await;
    h.platform.set_channel_connected(true);

    let frame = ControlFrame::new("reload_request", json!({}));
    h.router.dispatch(frame).await;

    assert_eq!(h.engine.reloads(), 0);
    let frames = h.platform.sent_frames.lock().await.clone();
    let payload: ErrorPayload =
        serde_json::from_value(frames.last().unwrap().payload.clone()).unwrap();
    assert_eq!(payload.code, "engine_not_running");
}

#[tokio::test]
async fn test_reload_request_signals_running_engine() {
    let h = harness(MockEngine::running()).await;
    let frame = ControlFrame::new("reload_request", json!({}));
    h.router.dispatch(frame).await;
    assert_eq!(h.engine.reloads(), 1);
}

#[tokio::test]
async fn test_status_request_reports_agent_and_engine() {
    let h = harness(MockEngine::running()).await;

    let frame = ControlFrame::new("status_request", json!({}));
    h.router.dispatch(frame).await;

    let reports = h.platform.status_reports.lock().await.clone();
    assert_eq!(reports.len(), 1);
    let (agent_id, report) = &reports[0];
    assert_eq!(agent_id, "a-1");
    assert_eq!(report.agent.agent_id, "a-1");
    assert!(report.engine.running);
    assert_eq!(report.engine.pid, 4242);
}

#[tokio::test]
async fn test_metrics_request_reports_fresh_sample() {
    let h = harness(MockEngine::new()).await;

    let frame = ControlFrame::new("metrics_request", json!({}));
    h.router.dispatch(frame).await;

    let reports = h.platform.metrics_reports.lock().await.clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].1.events_received, 0);
}

#[tokio::test]
async fn test_unknown_frame_type_answers_error() {
    let h = harness(MockEngine::new()).await;
    h.platform.set_channel_connected(true);

    let frame = ControlFrame::new("launch_missiles", json!({}));
    h.router.dispatch(frame).await;

    let frames = h.platform.sent_frames.lock().await.clone();
    assert_eq!(frames.len(), 1);
    let payload: ErrorPayload = serde_json::from_value(frames[0].payload.clone()).unwrap();
    assert_eq!(payload.code, "config_invalid");
    assert!(payload.message.contains("launch_missiles"));
}

#[tokio::test]
async fn test_worker_drains_frames_sequentially() {
    let h = harness(MockEngine::running()).await;
    h.platform.put_config(pipeline("c", 1, "cc")).await;
    h.platform.put_config(pipeline("d", 1, "dd")).await;

    let (tx, rx) = MessageRouter::inbound_queue();
    let cancel = CancellationToken::new();
    let worker = h.router.clone().spawn(rx, cancel.clone());

    // Deploys for two ids and a delete for the first, in order
    tx.send(deploy_frame("c", 1)).await.unwrap();
    tx.send(deploy_frame("d", 1)).await.unwrap();
    tx.send(ControlFrame::new("config_delete", json!({"config_id": "c"})))
        .await
        .unwrap();
    drop(tx); // closing the queue ends the worker

    tokio::time::timeout(Duration::from_secs(10), worker)
        .await
        .expect("worker should exit when the queue closes")
        .unwrap();

    // The delete for "c" committed after its deploy; "d" is untouched
    assert!(!h.store.file_path("c").exists());
    assert_eq!(std::fs::read_to_string(h.store.file_path("d")).unwrap(), "dd");
    let status = h.status.read().await;
    assert_eq!(status.applied_configs.len(), 1);
    assert_eq!(status.applied_configs[0].config_id, "d");
    // Two deploy reloads plus one delete reload, strictly in order
    assert_eq!(h.engine.reloads(), 3);
}
