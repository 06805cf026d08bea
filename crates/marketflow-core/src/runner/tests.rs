use super::plan_batches;
use crate::event_bus::{EventBus, EventKind, EventStream, OperationEvent};
use crate::executor::ExecutorRegistry;
use crate::manager::{ManagerConfig, OperationManager};
use crate::operation::{MetadataValue, Operation, OperationRequest, Status, StepSpec};
use crate::runner::RetryPolicy;
use crate::testing::ScriptedExecutor;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn manager(executors: Vec<(&str, Arc<ScriptedExecutor>)>) -> (OperationManager, EventStream) {
    let mut registry = ExecutorRegistry::new();
    for (step_type, executor) in executors {
        registry.register(step_type, executor);
    }
    let (bus, stream) = EventBus::channel();
    let config = ManagerConfig {
        retry: RetryPolicy::immediate(),
        ..ManagerConfig::default()
    };
    (OperationManager::with_config(registry, bus, config), stream)
}

async fn finish(manager: &OperationManager, id: Uuid) -> Operation {
    tokio::time::timeout(Duration::from_secs(5), manager.wait(id))
        .await
        .expect("operation did not finish in time")
        .unwrap()
}

fn drain(stream: &mut EventStream) -> Vec<OperationEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.try_recv() {
        events.push(event);
    }
    events
}

fn names(events: &[OperationEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| match e.kind.step() {
            Some(step) => format!("{}:{}", e.kind.name(), step),
            None => e.kind.name().to_string(),
        })
        .collect()
}

async fn wait_for_step_start(stream: &mut EventStream, step: &str) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("step did not start")
            .expect("bus closed");
        if matches!(&event.kind, EventKind::StepStarted { step: s, .. } if s == step) {
            return;
        }
    }
}

async fn wait_for_step_failed(stream: &mut EventStream, step: &str) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("step did not fail")
            .expect("bus closed");
        if matches!(&event.kind, EventKind::StepFailed { step: s, .. } if s == step) {
            return;
        }
    }
}

/// Operation status must agree with its steps in every terminal state.
fn assert_status_agrees_with_steps(op: &Operation) {
    let any_failed = op.steps.iter().any(|s| s.status == Status::Failed);
    let all_completed = op.steps.iter().all(|s| s.status == Status::Completed);
    let steps: Vec<Status> = op.steps.iter().map(|s| s.status).collect();
    assert_eq!(op.status == Status::Failed, any_failed, "{} with steps {:?}", op.status, steps);
    assert_eq!(op.status == Status::Completed, all_completed, "{} with steps {:?}", op.status, steps);
    assert_eq!(op.failure.is_some(), any_failed);
}

#[tokio::test]
async fn test_sequential_success_event_order() {
    let ok = Arc::new(ScriptedExecutor::succeeding());
    let (manager, mut stream) = manager(vec![
        ("scraping", ok.clone()),
        ("processing", ok.clone()),
        ("indexing", ok.clone()),
    ]);

    let request = OperationRequest::new("daily")
        .with_step(StepSpec::new("scrape", "scraping"))
        .with_step(StepSpec::new("process", "processing"))
        .with_step(StepSpec::new("index", "indexing"));
    let id = manager.start(request).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(op.status, Status::Completed);
    assert!(op.steps.iter().all(|s| s.status == Status::Completed));
    assert_eq!(op.metrics.progress, 100);
    assert!(op.started_at.is_some());
    assert!(op.completed_at.is_some());

    let events = drain(&mut stream);
    assert_eq!(
        names(&events),
        vec![
            "operation_started",
            "step_started:scrape",
            "step_completed:scrape",
            "step_started:process",
            "step_completed:process",
            "step_started:index",
            "step_completed:index",
            "operation_completed",
        ]
    );
    assert!(events.windows(2).all(|w| w[0].version < w[1].version));
    assert_eq!(events.last().unwrap().version, op.version);
}

#[tokio::test]
async fn test_required_failure_after_retries() {
    let ok = Arc::new(ScriptedExecutor::succeeding());
    let broken = Arc::new(ScriptedExecutor::failing("upstream timeout"));
    let tail = Arc::new(ScriptedExecutor::succeeding());
    let (manager, mut stream) = manager(vec![
        ("scraping", ok.clone()),
        ("processing", broken.clone()),
        ("indexing", tail.clone()),
    ]);

    let request = OperationRequest::new("daily")
        .with_step(StepSpec::new("step1", "scraping"))
        .with_step(StepSpec::new("step2", "processing"))
        .with_step(StepSpec::new("step3", "indexing"))
        .with_option("max_retries", 2);
    let id = manager.start(request).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(op.status, Status::Failed);
    let failure = op.failure.clone().unwrap();
    assert_eq!(failure.failed_step, "step2");
    assert_eq!(failure.error_code, "execution_failed");
    assert!(failure.can_retry);
    assert_eq!(broken.calls(), 3);
    assert_eq!(tail.calls(), 0);

    let step2 = op.step_by_name("step2").unwrap();
    assert_eq!(step2.status, Status::Failed);
    assert_eq!(step2.retry_count, 2);
    assert_eq!(step2.last_error.as_deref(), Some("upstream timeout"));
    assert_eq!(op.step_by_name("step1").unwrap().status, Status::Completed);
    assert_eq!(op.step_by_name("step3").unwrap().status, Status::Cancelled);

    let events = drain(&mut stream);
    let retries = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::StepRetrying { .. }))
        .count();
    assert_eq!(retries, 2);
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::OperationFailed { ref failed_step, can_retry: true, .. } if failed_step == "step2"
    ));
    assert!(!names(&events).contains(&"step_started:step3".to_string()));
}

#[tokio::test]
async fn test_invocations_are_retries_plus_one() {
    let broken = Arc::new(ScriptedExecutor::failing("flaky"));
    let (manager, _stream) = manager(vec![("scraping", broken.clone())]);

    let request = OperationRequest::new("scraping").with_step(StepSpec::new("scrape", "scraping"));
    let id = manager.start(request).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(op.status, Status::Failed);
    assert_eq!(broken.calls(), 4);
    assert_eq!(op.metrics.total_retries, 3);
}

#[tokio::test]
async fn test_step_level_retry_cap_wins() {
    let broken = Arc::new(ScriptedExecutor::failing("flaky"));
    let (manager, _stream) = manager(vec![("scraping", broken.clone())]);

    let request = OperationRequest::new("scraping")
        .with_step(StepSpec::new("scrape", "scraping").with_max_retries(0))
        .with_option("max_retries", 5);
    let id = manager.start(request).await.unwrap();
    finish(&manager, id).await;

    assert_eq!(broken.calls(), 1);
}

#[tokio::test]
async fn test_recovers_after_transient_failures() {
    let flaky = Arc::new(ScriptedExecutor::failing_times(2, "locked file"));
    let (manager, _stream) = manager(vec![("processing", flaky.clone())]);

    let request =
        OperationRequest::new("processing").with_step(StepSpec::new("process", "processing"));
    let id = manager.start(request).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(op.status, Status::Completed);
    assert_eq!(flaky.calls(), 3);
    let step = op.step_by_name("process").unwrap();
    assert_eq!(step.retry_count, 2);
    assert_eq!(step.status, Status::Completed);
    assert!(op.failure.is_none());
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let bad = Arc::new(ScriptedExecutor::permanent("source file missing"));
    let (manager, _stream) = manager(vec![("scraping", bad.clone())]);

    let request = OperationRequest::new("scraping").with_step(StepSpec::new("scrape", "scraping"));
    let id = manager.start(request).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(bad.calls(), 1);
    let failure = op.failure.unwrap();
    assert_eq!(failure.error_code, "permanent_failure");
    assert!(!failure.can_retry);
}

#[tokio::test]
async fn test_executor_panic_is_contained() {
    let panicky = Arc::new(ScriptedExecutor::panicking("index out of bounds"));
    let ok = Arc::new(ScriptedExecutor::succeeding());
    let (manager, _stream) = manager(vec![("indexing", panicky.clone()), ("analysis", ok.clone())]);

    let request = OperationRequest::new("daily")
        .with_step(StepSpec::new("index", "indexing").with_max_retries(1))
        .with_step(StepSpec::new("analyze", "analysis"));
    let id = manager.start(request).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(op.status, Status::Failed);
    assert_eq!(panicky.calls(), 2);
    assert_eq!(ok.calls(), 0);
    let failure = op.failure.unwrap();
    assert_eq!(failure.failed_step, "index");
    assert_eq!(failure.error_code, "internal_error");
    assert!(failure.message.contains("index out of bounds"));
    // Panics are retried like any execution error
    assert!(failure.can_retry);

    // The engine keeps serving new operations
    let request = OperationRequest::new("analysis").with_step(StepSpec::new("analyze", "analysis"));
    let id = manager.start(request).await.unwrap();
    assert_eq!(finish(&manager, id).await.status, Status::Completed);
}

#[tokio::test]
async fn test_optional_failure_does_not_stop_later_steps() {
    let broken = Arc::new(ScriptedExecutor::failing("no data"));
    let ok = Arc::new(ScriptedExecutor::succeeding());
    let (manager, mut stream) = manager(vec![("analysis", broken.clone()), ("indexing", ok.clone())]);

    let request = OperationRequest::new("daily")
        .with_step(StepSpec::new("analyze", "analysis").optional().with_max_retries(0))
        .with_step(StepSpec::new("index", "indexing"));
    let id = manager.start(request).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(ok.calls(), 1);
    assert_eq!(op.step_by_name("index").unwrap().status, Status::Completed);
    assert_eq!(op.step_by_name("analyze").unwrap().status, Status::Failed);
    // Completed is reserved for runs where every step completed
    assert_eq!(op.status, Status::Failed);
    assert_eq!(op.failure.unwrap().failed_step, "analyze");

    let events = drain(&mut stream);
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::StepFailed { optional: true, .. }
    )));
}

#[tokio::test]
async fn test_parallel_batch_respects_worker_limit() {
    let slow = Arc::new(ScriptedExecutor::succeeding().with_delay(Duration::from_millis(50)));
    let (manager, _stream) = manager(vec![("scraping", slow.clone())]);

    let mut request = OperationRequest::new("scraping")
        .with_option("parallel", true)
        .with_option("max_workers", 2);
    for symbol in ["ECOPETROL", "PFBCOLOM", "ISA", "NUTRESA"] {
        request = request.with_step(StepSpec::new(symbol, "scraping").parallel());
    }
    let id = manager.start(request).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(op.status, Status::Completed);
    assert_eq!(slow.calls(), 4);
    assert_eq!(slow.peak_concurrency(), 2);
}

#[tokio::test]
async fn test_sequential_without_parallel_flag() {
    let slow = Arc::new(ScriptedExecutor::succeeding().with_delay(Duration::from_millis(10)));
    let (manager, _stream) = manager(vec![("scraping", slow.clone())]);

    let request = OperationRequest::new("scraping")
        .with_step(StepSpec::new("a", "scraping").parallel())
        .with_step(StepSpec::new("b", "scraping").parallel())
        .with_step(StepSpec::new("c", "scraping").parallel());
    let id = manager.start(request).await.unwrap();
    finish(&manager, id).await;

    assert_eq!(slow.peak_concurrency(), 1);
}

#[tokio::test]
async fn test_plan_batches() {
    let ok = Arc::new(ScriptedExecutor::succeeding());
    let (manager, _stream) = manager(vec![("scraping", ok.clone())]);

    let request = OperationRequest::new("scraping")
        .with_option("parallel", true)
        .with_step(StepSpec::new("a", "scraping").parallel())
        .with_step(StepSpec::new("b", "scraping").parallel())
        .with_step(StepSpec::new("c", "scraping"))
        .with_step(StepSpec::new("d", "scraping").parallel())
        .with_step(StepSpec::new("e", "scraping").parallel());
    let id = manager.start(request).await.unwrap();
    let op = manager.get_status(id).await.unwrap();

    assert_eq!(plan_batches(&op), vec![vec![0, 1], vec![2], vec![3, 4]]);

    let mut sequential = op.clone();
    sequential.config.parallel = false;
    assert_eq!(
        plan_batches(&sequential),
        vec![vec![0], vec![1], vec![2], vec![3], vec![4]]
    );
}

#[tokio::test]
async fn test_progress_events() {
    let reporting = Arc::new(
        ScriptedExecutor::succeeding()
            .with_progress(&[25, 50])
            .with_output("files_processed", 12i64),
    );
    let (manager, mut stream) = manager(vec![("processing", reporting.clone())]);

    let request =
        OperationRequest::new("processing").with_step(StepSpec::new("process", "processing"));
    let id = manager.start(request).await.unwrap();
    let op = finish(&manager, id).await;

    let progress: Vec<(u8, u8)> = drain(&mut stream)
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::StepProgress {
                percent,
                operation_progress,
                ..
            } => Some((percent, operation_progress)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(25, 25), (50, 50)]);

    let step = op.step_by_name("process").unwrap();
    assert_eq!(step.progress, 100);
    assert_eq!(
        step.metadata.get("files_processed"),
        Some(&MetadataValue::Integer(12))
    );
}

#[tokio::test]
async fn test_graceful_stop_while_running() {
    let waiting = Arc::new(ScriptedExecutor::until_cancelled());
    let next = Arc::new(ScriptedExecutor::succeeding());
    let (manager, mut stream) = manager(vec![("scraping", waiting.clone()), ("processing", next.clone())]);

    let request = OperationRequest::new("daily")
        .with_step(StepSpec::new("scrape", "scraping"))
        .with_step(StepSpec::new("process", "processing"));
    let id = manager.start(request).await.unwrap();
    wait_for_step_start(&mut stream, "scrape").await;

    manager.stop(id, false).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(op.status, Status::Cancelled);
    assert_eq!(
        op.metadata.get("cancel_reason"),
        Some(&MetadataValue::Text("user".to_string()))
    );
    assert!(op.steps.iter().all(|s| s.status == Status::Cancelled));
    assert_eq!(next.calls(), 0);
    assert!(op.failure.is_none());
}

#[tokio::test]
async fn test_force_stop_aborts_hung_executor() {
    let hung = Arc::new(ScriptedExecutor::hanging());
    let (manager, mut stream) = manager(vec![("scraping", hung.clone())]);

    let request = OperationRequest::new("scraping").with_step(StepSpec::new("scrape", "scraping"));
    let id = manager.start(request).await.unwrap();
    wait_for_step_start(&mut stream, "scrape").await;

    let snapshot = manager.stop(id, true).await.unwrap();
    assert_eq!(snapshot.status, Status::Cancelled);
    assert_eq!(snapshot.steps[0].status, Status::Cancelled);

    let op = finish(&manager, id).await;
    assert_eq!(op.status, Status::Cancelled);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let events = drain(&mut stream);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0].kind,
        EventKind::OperationCancelled { reason, .. } if reason == "forced"
    ));
    // Nothing changes after the terminal state
    assert_eq!(manager.get_status(id).await.unwrap().version, op.version);
}

#[tokio::test]
async fn test_timeout_cancels_operation() {
    let waiting = Arc::new(ScriptedExecutor::until_cancelled());
    let (manager, _stream) = manager(vec![("scraping", waiting.clone())]);

    let request = OperationRequest::new("scraping")
        .with_step(StepSpec::new("scrape", "scraping"))
        .with_option("timeout_secs", 1);
    let id = manager.start(request).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(op.status, Status::Cancelled);
    assert_eq!(
        op.metadata.get("cancel_reason"),
        Some(&MetadataValue::Text("timeout".to_string()))
    );
}

#[tokio::test]
async fn test_notify_flag_on_terminal_event() {
    let ok = Arc::new(ScriptedExecutor::succeeding());
    let (manager, mut stream) = manager(vec![("indexing", ok.clone())]);

    let request = OperationRequest::new("indexing")
        .with_step(StepSpec::new("index", "indexing"))
        .with_option("notify_on_complete", true);
    let id = manager.start(request).await.unwrap();
    finish(&manager, id).await;

    let last = drain(&mut stream).pop().unwrap();
    assert!(matches!(
        last.kind,
        EventKind::OperationCompleted { notify: true, .. }
    ));
}

#[tokio::test]
async fn test_optional_failure_then_graceful_stop_is_failed() {
    let broken = Arc::new(ScriptedExecutor::failing("no data"));
    let waiting = Arc::new(ScriptedExecutor::until_cancelled());
    let (manager, mut stream) = manager(vec![("analysis", broken.clone()), ("scraping", waiting.clone())]);

    let request = OperationRequest::new("daily")
        .with_step(StepSpec::new("analyze", "analysis").optional().with_max_retries(0))
        .with_step(StepSpec::new("scrape", "scraping"));
    let id = manager.start(request).await.unwrap();
    wait_for_step_start(&mut stream, "scrape").await;

    manager.stop(id, false).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(op.status, Status::Failed);
    assert_eq!(op.step_by_name("analyze").unwrap().status, Status::Failed);
    assert_eq!(op.step_by_name("scrape").unwrap().status, Status::Cancelled);
    assert_eq!(op.failure.as_ref().unwrap().failed_step, "analyze");
    assert_status_agrees_with_steps(&op);

    let last = drain(&mut stream).pop().unwrap();
    assert!(matches!(
        &last.kind,
        EventKind::OperationFailed { failed_step, .. } if failed_step == "analyze"
    ));
}

#[tokio::test]
async fn test_optional_failure_then_force_stop_is_failed() {
    let broken = Arc::new(ScriptedExecutor::failing("no data"));
    let hung = Arc::new(ScriptedExecutor::hanging());
    let (manager, mut stream) = manager(vec![("analysis", broken.clone()), ("scraping", hung.clone())]);

    let request = OperationRequest::new("daily")
        .with_step(StepSpec::new("analyze", "analysis").optional().with_max_retries(0))
        .with_step(StepSpec::new("scrape", "scraping"));
    let id = manager.start(request).await.unwrap();
    wait_for_step_start(&mut stream, "scrape").await;

    let snapshot = manager.stop(id, true).await.unwrap();
    assert_eq!(snapshot.status, Status::Failed);
    assert_status_agrees_with_steps(&snapshot);

    let op = finish(&manager, id).await;
    assert_eq!(op.status, Status::Failed);
    assert_eq!(op.step_by_name("scrape").unwrap().status, Status::Cancelled);
    assert_status_agrees_with_steps(&op);
}

#[tokio::test]
async fn test_executor_cancelled_without_stop_is_failure() {
    let quitter = Arc::new(ScriptedExecutor::giving_up());
    let ok = Arc::new(ScriptedExecutor::succeeding());
    let (manager, _stream) = manager(vec![("scraping", quitter.clone()), ("processing", ok.clone())]);

    let request = OperationRequest::new("daily")
        .with_step(StepSpec::new("scrape", "scraping").with_max_retries(2))
        .with_step(StepSpec::new("process", "processing"));
    let id = manager.start(request).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(op.status, Status::Failed);
    assert_eq!(op.step_by_name("scrape").unwrap().status, Status::Failed);
    assert_eq!(op.step_by_name("process").unwrap().status, Status::Cancelled);
    // Not retried and not invented after the fact
    assert_eq!(quitter.calls(), 1);
    assert_eq!(ok.calls(), 0);
    let failure = op.failure.as_ref().unwrap();
    assert_eq!(failure.failed_step, "scrape");
    assert_eq!(failure.error_code, "internal_error");
    assert!(!failure.can_retry);
    assert_ne!(failure.message, "step finished without reporting an outcome");
    assert_status_agrees_with_steps(&op);
}

#[tokio::test]
async fn test_required_failure_wins_over_later_stop() {
    let broken = Arc::new(ScriptedExecutor::permanent("schema mismatch"));
    let waiting = Arc::new(ScriptedExecutor::until_cancelled());
    let (manager, mut stream) = manager(vec![("processing", broken.clone()), ("scraping", waiting.clone())]);

    let request = OperationRequest::new("daily")
        .with_option("parallel", true)
        .with_option("max_workers", 2)
        .with_step(StepSpec::new("process", "processing").parallel())
        .with_step(StepSpec::new("scrape", "scraping").parallel());
    let id = manager.start(request).await.unwrap();
    wait_for_step_failed(&mut stream, "process").await;

    manager.stop(id, false).await.unwrap();
    let op = finish(&manager, id).await;

    assert_eq!(op.status, Status::Failed);
    assert_eq!(op.failure.as_ref().unwrap().failed_step, "process");
    assert_eq!(op.step_by_name("scrape").unwrap().status, Status::Cancelled);
    assert!(op.metadata.get("cancel_reason").is_none());
    assert_status_agrees_with_steps(&op);
}

#[tokio::test]
async fn test_terminal_states_agree_with_steps() {
    let ok = Arc::new(ScriptedExecutor::succeeding());
    let broken = Arc::new(ScriptedExecutor::failing("upstream timeout"));
    let waiting = Arc::new(ScriptedExecutor::until_cancelled());
    let (manager, mut stream) = manager(vec![
        ("scraping", ok.clone()),
        ("processing", broken.clone()),
        ("indexing", waiting.clone()),
    ]);

    let completed = manager
        .start(OperationRequest::new("a").with_step(StepSpec::new("scrape", "scraping")))
        .await
        .unwrap();
    let failed = manager
        .start(
            OperationRequest::new("b")
                .with_step(StepSpec::new("process", "processing").with_max_retries(1)),
        )
        .await
        .unwrap();
    let cancelled = manager
        .start(OperationRequest::new("c").with_step(StepSpec::new("index", "indexing")))
        .await
        .unwrap();
    wait_for_step_start(&mut stream, "index").await;
    manager.stop(cancelled, false).await.unwrap();

    for (id, expected) in [
        (completed, Status::Completed),
        (failed, Status::Failed),
        (cancelled, Status::Cancelled),
    ] {
        let op = finish(&manager, id).await;
        assert_eq!(op.status, expected);
        assert_status_agrees_with_steps(&op);
    }
}
