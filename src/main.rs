// Insight Desktop - headless entry point
//
// Runs a handful of simulated analyses through the full admission,
// aggregation and persistence pipeline and logs every UI event.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use insight_core::{ChannelEventSink, DashboardData, EventEmitter, Insight, Metric, ProgressUpdate};
use insight_desktop::{
    AnalysisOutput, AnalysisRequest, AnalysisRunner, AppResult, AppState, JsonResultStore,
    RunContext,
};

/// Stands in for the query and plotting pipeline.
struct SimulatedRunner {
    step_delay: Duration,
}

#[async_trait]
impl AnalysisRunner for SimulatedRunner {
    async fn run(&self, ctx: RunContext) -> AppResult<AnalysisOutput> {
        let stages = [
            ("understand", 10, "Reading the question"),
            ("query", 40, "Querying data"),
            ("chart", 80, "Building charts"),
        ];
        for (index, (stage, progress, message)) in stages.iter().enumerate() {
            ctx.checkpoint()?;
            ctx.progress.report(
                ProgressUpdate::new(*stage, *progress, *message)
                    .with_step(index as u32 + 1, stages.len() as u32),
            );
            tokio::time::sleep(self.step_delay).await;
        }

        ctx.results.table(json!({
            "columns": ["region", "revenue"],
            "rows": [["north", 1200], ["south", 950], ["west", 1430]],
        }));
        ctx.results.echarts(json!({
            "xAxis": {"type": "category", "data": ["north", "south", "west"]},
            "series": [{"type": "bar", "data": [1200, 950, 1430]}],
        }));
        ctx.results.dashboard(&DashboardData {
            metrics: vec![Metric {
                title: "Total revenue".to_string(),
                value: "3580".to_string(),
                change: "+4.2%".to_string(),
            }],
            insights: vec![Insight {
                text: format!("West leads for \"{}\"", ctx.input),
                icon: "trend".to_string(),
                data_source_id: None,
                source_name: None,
            }],
        });

        ctx.checkpoint()?;
        Ok(AnalysisOutput::new(format!("Answered: {}", ctx.input)))
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let (sink, mut events) = ChannelEventSink::new();
    let bridge = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!("[UI] {} {}", event.channel, event.payload);
        }
    });

    let store = JsonResultStore::new().context("failed to resolve results directory")?;
    tracing::info!("[Main] Persisting results under {}", store.root().display());

    let state = AppState::new(
        EventEmitter::new(Arc::new(sink)),
        Arc::new(SimulatedRunner {
            step_delay: Duration::from_millis(200),
        }),
        Arc::new(store),
    );
    state
        .initialize()
        .await
        .context("failed to initialize application state")?;
    let orchestrator = state.orchestrator().await?;

    let mut questions: Vec<String> = std::env::args().skip(1).collect();
    if questions.is_empty() {
        questions = vec![
            "revenue by region".to_string(),
            "top customers this quarter".to_string(),
            "churn trend".to_string(),
        ];
    }

    let handles: Vec<_> = questions
        .into_iter()
        .enumerate()
        .map(|(index, question)| {
            orchestrator.spawn(AnalysisRequest::new(
                format!("session-{}", index + 1),
                format!("message-{}", index + 1),
                question,
            ))
        })
        .collect();

    for handle in handles {
        let session_id = handle.session_id.clone();
        match handle.wait().await {
            Ok(report) => tracing::info!(
                "[Main] {}: {:?} with {} item(s){}",
                session_id,
                report.outcome,
                report.item_count,
                report
                    .persist_error
                    .map(|e| format!(" (not persisted: {})", e))
                    .unwrap_or_default()
            ),
            Err(e) => tracing::warn!("[Main] {}: {}", session_id, e),
        }
    }

    // Dropping the state closes the event channel once in-flight timers finish.
    drop(orchestrator);
    drop(state);
    tokio::time::timeout(Duration::from_secs(1), bridge).await.ok();
    Ok(())
}
