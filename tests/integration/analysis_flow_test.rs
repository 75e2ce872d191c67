//! Analysis Flow Integration Tests
//!
//! Drives the orchestrator with a scripted runner:
//! - Admission bound and queue hand-off between three sessions
//! - Result order within a session and isolation between sessions
//! - Slot release after a panicking runner
//! - Cancellation convergence for cooperative and stubborn runners

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use insight_core::{channels, EventEmitter, MemoryEventSink, ResultItemType};
use insight_desktop::services::analysis::{AdmissionConfig, AdmissionController, SessionAggregator};
use insight_desktop::{
    AnalysisOrchestrator, AnalysisOutput, AnalysisRequest, AnalysisRunner, AppError, AppResult,
    MemoryResultStore, RunContext, RunOutcome, WaitOptions,
};

// ============================================================================
// Helpers
// ============================================================================

/// Behaviour is picked from the request input:
/// `hold:<ms>` sleeps while honouring cancellation, `stubborn:<ms>` ignores
/// it, `panic` panics, `ordered` emits a table, a chart and an image.
#[derive(Default)]
struct ScriptedRunner {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn millis(input: &str, prefix: &str) -> Option<u64> {
    input.strip_prefix(prefix).and_then(|ms| ms.parse().ok())
}

#[async_trait]
impl AnalysisRunner for ScriptedRunner {
    async fn run(&self, ctx: RunContext) -> AppResult<AnalysisOutput> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = async {
            ctx.results
                .table(json!({"columns": ["session"], "rows": [[ctx.session_id.clone()]]}));

            if let Some(ms) = millis(&ctx.input, "hold:") {
                let deadline = Instant::now() + Duration::from_millis(ms);
                while Instant::now() < deadline {
                    ctx.checkpoint()?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            } else if let Some(ms) = millis(&ctx.input, "stubborn:") {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            } else if ctx.input == "panic" {
                panic!("scripted panic");
            } else if ctx.input == "ordered" {
                ctx.results.echarts(json!({"series": [{"type": "line"}]}));
                ctx.results.image("aGVsbG8=", Some("chart.png"));
            }
            Ok::<_, AppError>(AnalysisOutput::new(ctx.input.clone()))
        }
        .await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct Harness {
    orchestrator: AnalysisOrchestrator,
    runner: Arc<ScriptedRunner>,
    store: Arc<MemoryResultStore>,
    sink: Arc<MemoryEventSink>,
}

fn harness(max_concurrent: usize, cancel_wait: Duration) -> Harness {
    let sink = Arc::new(MemoryEventSink::new());
    let emitter = EventEmitter::new(sink.clone());
    let runner = Arc::new(ScriptedRunner::default());
    let store = Arc::new(MemoryResultStore::new());

    let admission = AdmissionController::new(
        AdmissionConfig {
            max_concurrent,
            cancel_wait,
            cancel_check_interval: Duration::from_millis(10),
        },
        emitter.clone(),
    );
    let aggregator = SessionAggregator::new(Duration::from_millis(20), emitter.clone());
    let orchestrator = AnalysisOrchestrator::new(
        admission,
        aggregator,
        emitter,
        runner.clone(),
        store.clone(),
    )
    .with_wait_options(WaitOptions {
        max_wait: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        status_interval: Duration::from_secs(5),
    });

    Harness {
        orchestrator,
        runner,
        store,
        sink,
    }
}

fn request(session: &str, input: &str) -> AnalysisRequest {
    AnalysisRequest::new(session, format!("{}-msg", session), input)
}

async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_third_session_waits_then_takes_freed_slot() {
    let h = harness(2, Duration::from_secs(1));
    let admission = h.orchestrator.admission().clone();

    let a = h.orchestrator.spawn(request("A", "hold:300"));
    let b = h.orchestrator.spawn(request("B", "hold:1000"));
    wait_until(|| admission.active_count() == 2, "A and B to start").await;

    let c = h.orchestrator.spawn(request("C", "hold:10"));
    wait_until(|| admission.waiting_count() == 1, "C to queue").await;

    let waiting: Vec<_> = h
        .sink
        .payloads(channels::QUEUE_STATUS)
        .into_iter()
        .filter(|p| p["threadId"] == "C" && p["status"] == "waiting")
        .collect();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0]["position"], 1);
    assert_eq!(waiting[0]["activeCount"], 2);
    assert_eq!(waiting[0]["maxConcurrent"], 2);

    assert_eq!(a.wait().await.unwrap().outcome, RunOutcome::Completed);
    let released = Instant::now();
    wait_until(
        || admission.is_active("C") || !h.store.items_for("C").is_empty(),
        "C to be admitted",
    )
    .await;
    assert!(released.elapsed() < Duration::from_millis(500));

    assert_eq!(c.wait().await.unwrap().outcome, RunOutcome::Completed);
    let starting = h
        .sink
        .payloads(channels::QUEUE_STATUS)
        .into_iter()
        .filter(|p| p["threadId"] == "C" && p["status"] == "starting")
        .count();
    assert_eq!(starting, 1);

    assert_eq!(b.wait().await.unwrap().outcome, RunOutcome::Completed);
    assert_eq!(h.runner.peak(), 2);
    assert_eq!(admission.active_count(), 0);
    assert_eq!(admission.waiting_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admission_bound_under_load() {
    let h = harness(3, Duration::from_secs(1));

    let handles: Vec<_> = (0..10)
        .map(|i| h.orchestrator.spawn(request(&format!("s{}", i), "hold:40")))
        .collect();
    for handle in handles {
        assert!(handle.wait().await.unwrap().is_success());
    }

    assert!(h.runner.peak() <= 3);
    assert_eq!(h.orchestrator.admission().active_count(), 0);
    assert_eq!(h.sink.count(channels::COMPLETED), 10);
}

// ============================================================================
// Aggregation
// ============================================================================

#[tokio::test]
async fn test_items_reach_store_in_emission_order() {
    let h = harness(2, Duration::from_secs(1));

    let report = h.orchestrator.run(request("s1", "ordered")).await.unwrap();
    assert_eq!(report.item_count, 3);

    let kinds: Vec<ResultItemType> = h
        .store
        .items_for("s1")
        .iter()
        .map(|item| item.item_type)
        .collect();
    assert_eq!(
        kinds,
        vec![ResultItemType::Table, ResultItemType::Echarts, ResultItemType::Image]
    );

    // The UI sees the same order across batches.
    let streamed: Vec<String> = h
        .sink
        .payloads(channels::RESULT_UPDATE)
        .iter()
        .flat_map(|batch| batch["items"].as_array().cloned().unwrap_or_default())
        .filter_map(|item| item["type"].as_str().map(str::to_string))
        .collect();
    assert_eq!(streamed, vec!["table", "echarts", "image"]);

    let ids: Vec<String> = h.store.items_for("s1").into_iter().map(|i| i.id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sessions_do_not_share_results() {
    let h = harness(4, Duration::from_secs(1));

    let handles: Vec<_> = ["x", "y", "z"]
        .iter()
        .map(|s| h.orchestrator.spawn(request(s, "ordered")))
        .collect();
    for handle in handles {
        handle.wait().await.unwrap();
    }

    for session in ["x", "y", "z"] {
        let items = h.store.items_for(session);
        assert_eq!(items.len(), 3);
        assert!(items
            .iter()
            .all(|item| item.metadata_str("sessionId") == Some(session)));
    }
    for batch in h.sink.payloads(channels::RESULT_UPDATE) {
        let session = batch["sessionId"].as_str().unwrap().to_string();
        for item in batch["items"].as_array().unwrap() {
            assert_eq!(item["metadata"]["sessionId"], session.as_str());
        }
    }
}

// ============================================================================
// Failure and cancellation
// ============================================================================

#[tokio::test]
async fn test_panicking_run_frees_its_slot() {
    let h = harness(1, Duration::from_secs(1));

    let report = h.orchestrator.run(request("s1", "panic")).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Panicked);
    assert_eq!(h.store.items_for("s1").len(), 1);

    let started = Instant::now();
    let next = h.orchestrator.run(request("s2", "hold:10")).await.unwrap();
    assert!(next.is_success());
    // Granted on the fast path, no queueing.
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(h
        .sink
        .payloads(channels::QUEUE_STATUS)
        .iter()
        .all(|p| p["threadId"] != "s2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_stops_cooperative_runs() {
    let h = harness(2, Duration::from_secs(2));
    let admission = h.orchestrator.admission().clone();

    let a = h.orchestrator.spawn(request("A", "hold:5000"));
    let b = h.orchestrator.spawn(request("B", "hold:5000"));
    wait_until(|| admission.active_count() == 2, "both runs to start").await;

    let started = Instant::now();
    h.orchestrator.cancel().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(admission.active_count(), 0);

    assert_eq!(a.wait().await.unwrap().outcome, RunOutcome::Cancelled);
    assert_eq!(b.wait().await.unwrap().outcome, RunOutcome::Cancelled);
    assert_eq!(h.sink.count(channels::CANCELLED), 2);

    // The flag does not leak into the next run.
    let next = h.orchestrator.run(request("C", "hold:30")).await.unwrap();
    assert!(next.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_force_clears_stubborn_run() {
    let h = harness(1, Duration::from_millis(200));
    let admission = h.orchestrator.admission().clone();

    let stubborn = h.orchestrator.spawn(request("A", "stubborn:1500"));
    wait_until(|| admission.active_count() == 1, "stubborn run to start").await;

    let started = Instant::now();
    h.orchestrator.cancel().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(1000));
    assert_eq!(admission.active_count(), 0);

    // The freed slot is usable while the stubborn run is still going.
    assert!(h.orchestrator.run(request("B", "hold:10")).await.unwrap().is_success());

    // Its late release leaves the newer slot accounting intact.
    let report = stubborn.wait().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(admission.active_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rerun_waits_for_force_cleared_run_of_same_session() {
    let h = harness(2, Duration::from_millis(200));
    let admission = h.orchestrator.admission().clone();

    let stubborn = h
        .orchestrator
        .spawn(AnalysisRequest::new("A", "A-old", "stubborn:800"));
    wait_until(|| admission.active_count() == 1, "stubborn run to start").await;
    h.orchestrator.cancel().await.unwrap();
    assert_eq!(admission.active_count(), 0);

    let rerun = h
        .orchestrator
        .spawn(AnalysisRequest::new("A", "A-new", "ordered"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(admission.is_draining("A"));
    assert!(!admission.is_active("A"));
    assert!(!rerun.is_finished());

    let old = stubborn.wait().await.unwrap();
    let new = rerun.wait().await.unwrap();
    assert_eq!(old.item_count, 1);
    assert_eq!(new.outcome, RunOutcome::Completed);
    assert_eq!(new.item_count, 3);
    assert_eq!(h.runner.peak(), 1);

    // Each message keeps exactly the items its own run produced.
    let saved = h.store.saved();
    let types_for = |message: &str| -> Vec<ResultItemType> {
        saved
            .iter()
            .filter(|record| record.message_id == message)
            .flat_map(|record| record.items.iter().map(|item| item.item_type))
            .collect()
    };
    assert_eq!(types_for("A-old"), vec![ResultItemType::Table]);
    assert_eq!(
        types_for("A-new"),
        vec![ResultItemType::Table, ResultItemType::Echarts, ResultItemType::Image]
    );
    assert!(!admission.is_draining("A"));
    assert_eq!(h.orchestrator.aggregator().session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_reaches_queued_request() {
    let h = harness(1, Duration::from_secs(1));
    let admission = h.orchestrator.admission().clone();

    let running = h.orchestrator.spawn(request("A", "hold:5000"));
    wait_until(|| admission.active_count() == 1, "A to start").await;
    let queued = h.orchestrator.spawn(request("B", "hold:10"));
    wait_until(|| admission.waiting_count() == 1, "B to queue").await;

    h.orchestrator.cancel().await.unwrap();

    assert!(matches!(queued.wait().await, Err(AppError::AdmissionCancelled)));
    assert_eq!(running.wait().await.unwrap().outcome, RunOutcome::Cancelled);
    assert_eq!(admission.waiting_count(), 0);

    let queue_errors: Vec<_> = h
        .sink
        .payloads(channels::ERROR)
        .into_iter()
        .filter(|p| p["threadId"] == "B")
        .collect();
    assert_eq!(queue_errors.len(), 1);
    assert_eq!(queue_errors[0]["code"], "QUEUE_CANCELLED");
}
