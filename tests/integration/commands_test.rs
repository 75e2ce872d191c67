//! Command Layer Integration Tests
//!
//! Runs analyses through the command functions with a file-backed config and
//! the JSON result store, then reads the persisted files back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use insight_core::{channels, EventEmitter, Insight, MemoryEventSink, Metric, DashboardData};
use insight_desktop::{
    can_start_new_analysis, cancel_analysis, get_settings, run_analysis, submit_analysis,
    update_settings, AnalysisConfigUpdate, AnalysisOutput, AnalysisRequest, AnalysisRunner,
    AppResult, AppState, ConfigService, JsonResultStore, RunContext,
};

struct DashboardRunner;

#[async_trait]
impl AnalysisRunner for DashboardRunner {
    async fn run(&self, ctx: RunContext) -> AppResult<AnalysisOutput> {
        ctx.progress.stage("query", 50, "Querying");
        ctx.results.table(json!({"columns": ["k"], "rows": [["v"]]}));
        ctx.results.dashboard(&DashboardData {
            metrics: vec![Metric {
                title: "Rows".to_string(),
                value: "1".to_string(),
                change: String::new(),
            }],
            insights: vec![Insight {
                text: "Only one row".to_string(),
                icon: String::new(),
                data_source_id: None,
                source_name: None,
            }],
        });
        for _ in 0..20 {
            ctx.checkpoint()?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(AnalysisOutput::new("done"))
    }
}

async fn setup(dir: &TempDir) -> (AppState, JsonResultStore, Arc<MemoryEventSink>) {
    let sink = Arc::new(MemoryEventSink::new());
    let store = JsonResultStore::with_root(dir.path().join("results"));
    let state = AppState::new(
        EventEmitter::new(sink.clone()),
        Arc::new(DashboardRunner),
        Arc::new(store.clone()),
    );
    let config = ConfigService::with_path(dir.path().join("config.json")).unwrap();
    state.initialize_with(config).await.unwrap();
    (state, store, sink)
}

#[tokio::test]
async fn test_run_analysis_writes_json_results() {
    let dir = TempDir::new().unwrap();
    let (state, store, sink) = setup(&dir).await;

    let response = run_analysis(&state, AnalysisRequest::new("thread-1", "msg-1", "rows?"))
        .await
        .unwrap();
    assert!(response.success);
    let report = response.data.unwrap();
    assert_eq!(report.item_count, 3);

    let persisted = store.load("thread-1", "msg-1").await.unwrap();
    assert_eq!(persisted.items.len(), 3);
    assert_eq!(store.list_messages("thread-1").await.unwrap(), vec!["msg-1"]);

    assert_eq!(sink.count(channels::COMPLETED), 1);
    assert_eq!(sink.count(channels::PROGRESS), 1);
}

#[tokio::test]
async fn test_settings_round_trip_through_state() {
    let dir = TempDir::new().unwrap();
    let (state, _, _) = setup(&dir).await;

    let settings = get_settings(&state).await.unwrap().data.unwrap();
    assert_eq!(settings.max_concurrent_analysis, 5);

    let updated = update_settings(
        &state,
        AnalysisConfigUpdate {
            max_concurrent_analysis: Some(1),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(updated.success);

    let capacity = can_start_new_analysis(&state).await.unwrap().data.unwrap();
    assert!(capacity.allowed);
    assert_eq!(capacity.max, 1);

    // The change is persisted for the next start.
    let reloaded = ConfigService::with_path(dir.path().join("config.json")).unwrap();
    assert_eq!(reloaded.get_config().max_concurrent_analysis, 1);

    let rejected = update_settings(
        &state,
        AnalysisConfigUpdate {
            queue_max_wait_secs: Some(0),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(!rejected.success);
    assert_eq!(rejected.code.as_deref(), Some("DATA_INVALID"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submit_then_cancel() {
    let dir = TempDir::new().unwrap();
    let (state, _, sink) = setup(&dir).await;

    let submitted = submit_analysis(&state, AnalysisRequest::new("thread-2", "msg-2", "rows?"))
        .await
        .unwrap()
        .data
        .unwrap();
    assert!(!submitted.request_id.is_empty());

    let orchestrator = state.orchestrator().await.unwrap();
    for _ in 0..100 {
        if orchestrator.admission().is_active("thread-2") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let cancelled = cancel_analysis(&state).await.unwrap();
    if cancelled.success {
        assert_eq!(sink.count(channels::CANCELLED), 1);
        let payload = &sink.payloads(channels::CANCELLED)[0];
        assert_eq!(payload["requestId"], submitted.request_id.as_str());
        assert_eq!(payload["code"], "ANALYSIS_CANCELLED");
    } else {
        // The run finished before the cancel arrived.
        assert_eq!(cancelled.code.as_deref(), Some("RESOURCE_NOT_FOUND"));
    }
    assert_eq!(orchestrator.admission().active_count(), 0);
}
