//! Worker loop, control flags and the submission surface

mod common;

use common::Harness;
use pretty_assertions::assert_eq;
use prompt_executor::events::Event;
use prompt_executor::queue::{JobState, StatusOutcome};
use prompt_executor::server::{PromptServer, SubmitRequest};
use prompt_executor::worker::WorkerState;
use prompt_executor::{ExecutorError, ModelManager, Notifier, PromptWorker, WorkerConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn config() -> WorkerConfig {
    WorkerConfig::default()
        .with_max_idle_wait(Duration::from_millis(20))
        .with_gc_collect_interval(Duration::from_secs(1000))
}

fn const_add() -> Value {
    json!({
        "1": {"class_type": "const", "inputs": {"value": 5}},
        "2": {"class_type": "add", "inputs": {"a": ["1", 0], "b": ["1", 0]}}
    })
}

fn submit(server: &PromptServer, prompt: Value, id: &str, outputs: &[&str]) -> String {
    server
        .submit(SubmitRequest {
            prompt,
            prompt_id: Some(id.to_string()),
            outputs: outputs.iter().map(|o| o.to_string()).collect(),
            ..Default::default()
        })
        .unwrap()
        .prompt_id
}

fn setup(h: &Harness, config: WorkerConfig) -> (PromptServer, PromptWorker) {
    let server = PromptServer::new(config, h.registry.clone(), h.notifier.clone()).unwrap();
    let worker = server.build_worker(h.models.clone()).unwrap();
    (server, worker)
}

#[test]
fn test_step_runs_job_and_records_history() {
    let h = Harness::new();
    let (server, mut worker) = setup(&h, config());
    let rt = runtime();

    submit(&server, const_add(), "p1", &["2"]);
    let report = worker.step(&rt).unwrap();

    assert_eq!(report.job, Some(("p1".to_string(), StatusOutcome::Success)));
    assert_eq!(worker.state(), WorkerState::Idle);
    let entry = server.get_history_item("p1").unwrap();
    assert!(entry.status.completed);
    assert_eq!(entry.outputs["2"].values, vec![json!(10)]);
    assert_eq!(server.get_tasks_remaining(), 0);
    assert_eq!(
        server.job_state("p1"),
        Some(JobState::History(StatusOutcome::Success))
    );

    let kinds = h.sink.kinds();
    let success = kinds.iter().position(|k| *k == "execution_success").unwrap();
    assert_eq!(&kinds[success + 1..], &["executing", "status"]);
    assert_eq!(
        h.sink.events_of("executing").last(),
        Some(&Event::Executing {
            prompt_id: "p1".into(),
            node: None,
        })
    );
    assert_eq!(
        h.sink.events_of("status").last(),
        Some(&Event::Status { queue_remaining: 0 })
    );
}

#[test]
fn test_free_memory_with_empty_queue() {
    let h = Harness::new();
    let (server, mut worker) = setup(&h, config());
    let rt = runtime();

    submit(&server, const_add(), "p1", &["2"]);
    worker.step(&rt).unwrap();
    assert!(worker.executor().cache_len() > 0);

    server.request_free_memory();
    let report = worker.step(&rt).unwrap();

    assert_eq!(report.job, None);
    assert!(report.freed_memory);
    assert!(report.unloaded_models);
    assert!(report.reclaimed);
    assert_eq!(worker.executor().cache_len(), 0);
    assert_eq!(h.models.unload_count(), 1);
    assert_eq!(h.models.soft_empty_count(), 1);
    assert!(server
        .get_history(None)
        .iter()
        .all(|entry| entry.status.outcome == StatusOutcome::Success));
    assert!(h.sink.events_of("execution_error").is_empty());
}

#[test]
fn test_unload_models_alone_keeps_cache() {
    let h = Harness::new();
    let (server, mut worker) = setup(&h, config());
    let rt = runtime();

    submit(&server, const_add(), "p1", &["2"]);
    worker.step(&rt).unwrap();
    server.request_unload_models();
    let report = worker.step(&rt).unwrap();

    assert!(report.unloaded_models);
    assert!(!report.freed_memory);
    assert!(worker.executor().cache_len() > 0);
    assert_eq!(h.models.residency_generation(), 1);
}

#[test]
fn test_failure_then_next_submission() {
    let h = Harness::new();
    let (server, mut worker) = setup(&h, config());
    let rt = runtime();

    submit(
        &server,
        json!({"5": {"class_type": "fail", "inputs": {}}}),
        "bad",
        &["5"],
    );
    let report = worker.step(&rt).unwrap();
    assert_eq!(report.job, Some(("bad".to_string(), StatusOutcome::Error)));

    let entry = server.get_history_item("bad").unwrap();
    assert!(!entry.status.completed);
    let diagnostic = entry
        .status
        .messages
        .iter()
        .find(|m| m.data["node_id"] == json!("5"))
        .unwrap();
    assert!(diagnostic.data["exception_message"]
        .as_str()
        .unwrap()
        .contains("boom"));

    submit(&server, const_add(), "good", &["2"]);
    let report = worker.step(&rt).unwrap();
    assert_eq!(report.job, Some(("good".to_string(), StatusOutcome::Success)));
}

#[test]
fn test_reclaim_debounced() {
    let h = Harness::new();
    let (server, mut worker) = setup(&h, config());
    let rt = runtime();

    submit(&server, const_add(), "p1", &["2"]);
    let report = worker.step(&rt).unwrap();
    assert!(!report.reclaimed);
    assert!(worker.timer().is_needed());
    assert_eq!(h.models.soft_empty_count(), 0);

    let h = Harness::new();
    let (server, mut worker) = setup(&h, config().with_gc_collect_interval(Duration::ZERO));
    submit(&server, const_add(), "p1", &["2"]);
    let report = worker.step(&rt).unwrap();
    assert!(report.reclaimed);
    assert!(!worker.timer().is_needed());
    assert_eq!(h.models.soft_empty_count(), 1);
}

#[test]
fn test_submission_rejects_invalid_prompts() {
    let h = Harness::new();
    let (server, _worker) = setup(&h, config());

    let err = server
        .submit(SubmitRequest::new(json!({"1": {"class_type": "missing"}})))
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Validation { .. }));

    let err = server
        .submit(SubmitRequest::new(json!({"1": {"inputs": {}}})))
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Validation { .. }));

    let err = server
        .submit(SubmitRequest::new(json!({
            "1": {"class_type": "add", "inputs": {"a": ["1", 0], "b": 1}}
        })))
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Validation { .. }));
    assert_eq!(server.get_tasks_remaining(), 0);
}

#[test]
fn test_submission_numbers_and_front() {
    let h = Harness::new();
    let (server, _worker) = setup(&h, config());

    let first = server.submit(SubmitRequest {
        outputs: vec!["2".into()],
        ..SubmitRequest::new(const_add())
    });
    let first = first.unwrap();
    assert_eq!(first.number, 0);
    assert!(uuid::Uuid::parse_str(&first.prompt_id).is_ok());
    assert!(first.node_errors.is_empty());

    let front = server
        .submit(SubmitRequest {
            prompt_id: Some("urgent".into()),
            front: true,
            outputs: vec!["2".into()],
            client_id: Some("c1".into()),
            ..SubmitRequest::new(const_add())
        })
        .unwrap();
    assert_eq!(front.number, -1);

    let state = server.get_queue_state();
    assert_eq!(state.running, None);
    let pending: Vec<String> = state
        .pending
        .iter()
        .map(|e| e.job.prompt_id.clone())
        .collect();
    assert_eq!(pending, vec!["urgent".to_string(), first.prompt_id.clone()]);
    assert_eq!(state.pending[0].job.client_id(), Some("c1"));
    assert_eq!(
        h.sink.events_of("status").last(),
        Some(&Event::Status { queue_remaining: 2 })
    );

    assert!(server.delete_pending("urgent"));
    assert_eq!(server.wipe_pending(), 1);
}

#[test]
fn test_targeted_interrupt_requires_running_prompt() {
    let h = Harness::new();
    let (server, _worker) = setup(&h, config());

    assert!(!server.request_interrupt(Some("nobody")));
    assert!(!server.flags().is_interrupted());
    assert!(server.request_interrupt(None));
    assert!(server.flags().is_interrupted());
}

#[test]
fn test_interrupt_cleared_at_job_start() {
    let h = Harness::new();
    let (server, mut worker) = setup(&h, config());
    let rt = runtime();

    server.request_interrupt(None);
    submit(&server, const_add(), "p1", &["2"]);
    let report = worker.step(&rt).unwrap();
    assert_eq!(report.job, Some(("p1".to_string(), StatusOutcome::Success)));
}

#[test]
fn test_spawned_worker_drains_queue() {
    let h = Harness::new();
    let server = PromptServer::new(
        WorkerConfig::default().with_max_idle_wait(Duration::from_millis(50)),
        h.registry.clone(),
        Notifier::logging(),
    )
    .unwrap();
    let models: Arc<dyn ModelManager> = h.models.clone();
    let handle = server.spawn_worker(models).unwrap();

    submit(&server, const_add(), "a", &["2"]);
    submit(&server, const_add(), "b", &["2"]);
    assert!(server.queue().join(Some(Duration::from_secs(10))));

    handle.shutdown().unwrap();
    assert_eq!(h.calls("add"), 1);
    assert_eq!(server.get_history(None).len(), 2);
    assert!(server
        .get_history(None)
        .iter()
        .all(|entry| entry.status.is_success()));
}

#[test]
fn test_spawned_worker_survives_panicking_node() {
    let h = Harness::new();
    let server = PromptServer::new(
        WorkerConfig::default().with_max_idle_wait(Duration::from_millis(50)),
        h.registry.clone(),
        h.notifier.clone(),
    )
    .unwrap();
    let models: Arc<dyn ModelManager> = h.models.clone();
    let handle = server.spawn_worker(models).unwrap();

    submit(
        &server,
        json!({"1": {"class_type": "panic", "inputs": {}}}),
        "bad",
        &["1"],
    );
    submit(&server, const_add(), "after", &["2"]);
    assert!(server.queue().join(Some(Duration::from_secs(10))));
    assert!(!handle.is_finished());

    assert_eq!(
        server.job_state("bad"),
        Some(JobState::History(StatusOutcome::Error))
    );
    assert_eq!(
        server.job_state("after"),
        Some(JobState::History(StatusOutcome::Success))
    );
    let entry = server.get_history_item("bad").unwrap();
    let diagnostic = entry
        .status
        .messages
        .iter()
        .find(|m| m.data["node_id"] == json!("1"))
        .unwrap();
    assert!(diagnostic.data["exception_message"]
        .as_str()
        .unwrap()
        .contains("panicked"));

    handle.shutdown().unwrap();
}

#[test]
fn test_flag_set_before_step_is_handled_promptly() {
    let h = Harness::new();
    let (server, mut worker) = setup(&h, config().with_max_idle_wait(Duration::from_secs(30)));
    let rt = runtime();

    server.request_free_memory();
    let started = std::time::Instant::now();
    let report = worker.step(&rt).unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.job, None);
    assert!(report.freed_memory);
}

#[test]
fn test_flag_set_during_idle_gap_is_handled_promptly() {
    let h = Harness::new();
    let (server, mut worker) = setup(&h, config().with_max_idle_wait(Duration::from_secs(30)));
    let rt = runtime();

    submit(&server, const_add(), "p1", &["2"]);
    worker.step(&rt).unwrap();
    server.request_unload_models();

    let started = std::time::Instant::now();
    let report = worker.step(&rt).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(report.unloaded_models);
    assert_eq!(h.models.unload_count(), 1);
}

#[test]
fn test_explicit_number_used_as_given() {
    let h = Harness::new();
    let (server, _worker) = setup(&h, config());

    let explicit = server
        .submit(SubmitRequest {
            number: Some(7),
            front: true,
            outputs: vec!["2".into()],
            ..SubmitRequest::new(const_add())
        })
        .unwrap();
    assert_eq!(explicit.number, 7);

    let counted = server
        .submit(SubmitRequest {
            outputs: vec!["2".into()],
            ..SubmitRequest::new(const_add())
        })
        .unwrap();
    assert_eq!(counted.number, 0);
}
