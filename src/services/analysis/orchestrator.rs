//! Analysis Orchestrator
//!
//! Ties admission, result aggregation, and cancellation to the externally
//! supplied unit of work ([`AnalysisRunner`]) and persistence sink
//! ([`ResultStore`]).
//!
//! Every admitted run goes through the same completion path whatever its
//! outcome: final flush, persist the flushed history, clear it, notify the UI,
//! release the slot. The runner executes on its own task so a panic comes
//! back as a `JoinError` and cannot skip that path.

use std::any::Any;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use insight_core::events::CompletedEvent;
use insight_core::{ErrorCode, EventEmitter, ResultItem};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::settings::AnalysisConfig;
use crate::services::analysis::admission::{AdmissionConfig, AdmissionController, WaitOptions};
use crate::services::analysis::aggregator::{ResultEmitter, SessionAggregator};
use crate::services::analysis::cancellation::{CancelProbe, ProgressReporter};
use crate::utils::error::{AppError, AppResult};

// ============================================================================
// External collaborators
// ============================================================================

/// The long-running, cancellable unit of work.
///
/// Implementations should poll `ctx.cancel` at their own checkpoints and
/// return early (any error) once it reports cancellation.
#[async_trait]
pub trait AnalysisRunner: Send + Sync {
    async fn run(&self, ctx: RunContext) -> AppResult<AnalysisOutput>;
}

/// Durable sink for a finished run's results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn persist(&self, session_id: &str, message_id: &str, items: &[ResultItem])
        -> AppResult<()>;
}

/// What a successful run returns besides its streamed items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutput {
    pub summary: String,
    #[serde(default)]
    pub data: Value,
}

impl AnalysisOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            data: Value::Null,
        }
    }
}

/// A request to analyse `input` within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub session_id: String,
    pub message_id: String,
    /// Generated when absent
    #[serde(default)]
    pub request_id: Option<String>,
    pub input: String,
}

impl AnalysisRequest {
    pub fn new(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            request_id: None,
            input: input.into(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    fn ensure_request_id(&mut self) -> String {
        self.request_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }
}

/// Everything the runner gets for one admitted analysis.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub session_id: String,
    pub message_id: String,
    pub request_id: String,
    pub input: String,
    pub cancel: CancelProbe,
    pub progress: ProgressReporter,
    pub results: ResultEmitter,
}

impl RunContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Checkpoint helper: `Err(RunCancelled)` once cancellation is requested.
    pub fn checkpoint(&self) -> AppResult<()> {
        if self.cancel.is_cancelled() {
            Err(AppError::RunCancelled)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Terminal state of an admitted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
    Panicked,
}

/// Summary of one admitted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub session_id: String,
    pub message_id: String,
    pub request_id: String,
    pub outcome: RunOutcome,
    pub output: Option<AnalysisOutput>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    /// Items handed to the result store
    pub item_count: usize,
    /// Set when the result store rejected the items
    pub persist_error: Option<String>,
    pub duration_ms: u64,
}

impl AnalysisReport {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

/// Handle to an analysis started with [`AnalysisOrchestrator::spawn`].
#[derive(Debug)]
pub struct AnalysisHandle {
    pub request_id: String,
    pub session_id: String,
    join: tokio::task::JoinHandle<AppResult<AnalysisReport>>,
}

impl AnalysisHandle {
    /// Wait for the run to finish.
    pub async fn wait(self) -> AppResult<AnalysisReport> {
        self.join
            .await
            .map_err(|e| AppError::internal(format!("analysis task failed: {}", e)))?
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Cheap to clone; clones share the admission controller, the aggregator and
/// the queue wait options.
#[derive(Clone)]
pub struct AnalysisOrchestrator {
    admission: AdmissionController,
    aggregator: SessionAggregator,
    emitter: EventEmitter,
    runner: Arc<dyn AnalysisRunner>,
    store: Arc<dyn ResultStore>,
    wait_options: Arc<RwLock<WaitOptions>>,
}

impl std::fmt::Debug for AnalysisOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisOrchestrator")
            .field("admission", &self.admission)
            .field("aggregator", &self.aggregator)
            .field("wait_options", &self.wait_options())
            .finish_non_exhaustive()
    }
}

impl AnalysisOrchestrator {
    pub fn new(
        admission: AdmissionController,
        aggregator: SessionAggregator,
        emitter: EventEmitter,
        runner: Arc<dyn AnalysisRunner>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            admission,
            aggregator,
            emitter,
            runner,
            store,
            wait_options: Arc::new(RwLock::new(WaitOptions::default())),
        }
    }

    /// Build the admission controller and aggregator from config.
    pub fn from_config(
        config: &AnalysisConfig,
        emitter: EventEmitter,
        runner: Arc<dyn AnalysisRunner>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let admission = AdmissionController::new(AdmissionConfig::from(config), emitter.clone());
        let aggregator = SessionAggregator::new(config.flush_delay(), emitter.clone());
        Self::new(admission, aggregator, emitter, runner, store)
            .with_wait_options(WaitOptions::from(config))
    }

    /// Give this handle its own wait options, detached from the clones it
    /// was made from.
    pub fn with_wait_options(mut self, options: WaitOptions) -> Self {
        self.wait_options = Arc::new(RwLock::new(options));
        self
    }

    pub fn wait_options(&self) -> WaitOptions {
        self.wait_options
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Apply changed settings in place. Every clone keeps sharing the same
    /// admission controller, so the concurrency bound holds across the change.
    /// Runs already admitted are not affected.
    pub fn apply_config(&self, config: &AnalysisConfig) {
        self.admission.reconfigure(&AdmissionConfig::from(config));
        self.aggregator.set_flush_delay(config.flush_delay());
        *self
            .wait_options
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = WaitOptions::from(config);
        tracing::info!(
            "[Orchestrator] Applied settings (max concurrent: {}, flush delay: {:?})",
            self.admission.max_concurrent(),
            self.aggregator.flush_delay()
        );
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn aggregator(&self) -> &SessionAggregator {
        &self.aggregator
    }

    /// Start an analysis in the background.
    pub fn spawn(&self, mut request: AnalysisRequest) -> AnalysisHandle {
        let request_id = request.ensure_request_id();
        let session_id = request.session_id.clone();
        let orchestrator = self.clone();
        let join = tokio::spawn(async move { orchestrator.run(request).await });
        AnalysisHandle {
            request_id,
            session_id,
            join,
        }
    }

    /// Admit, run, and finish one analysis.
    ///
    /// Admission failures (queue timeout, cancel while waiting) are returned
    /// as errors. Once admitted, every outcome is reported through
    /// [`AnalysisReport`].
    pub async fn run(&self, mut request: AnalysisRequest) -> AppResult<AnalysisReport> {
        let request_id = request.ensure_request_id();
        let session_id = request.session_id.clone();
        let message_id = request.message_id.clone();

        let wait_options = self.wait_options();
        let guard = match self.admission.enter(&session_id, &wait_options).await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!("[Orchestrator] Session {} not admitted: {}", session_id, e);
                self.aggregator.emit_error_with_code(
                    &session_id,
                    &request_id,
                    e.error_code(),
                    &e.to_string(),
                );
                return Err(e);
            }
        };

        let started = Instant::now();
        tracing::info!(
            "[Orchestrator] Starting analysis {} for session {}",
            request_id,
            session_id
        );
        self.emitter.emit_chat_loading(&session_id, true);
        self.aggregator.set_loading(&session_id, true, &request_id);

        let cancel = guard.cancel_probe();
        let ctx = RunContext {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
            request_id: request_id.clone(),
            input: request.input,
            cancel: cancel.clone(),
            progress: ProgressReporter::new(self.emitter.clone(), session_id.clone()),
            results: self
                .aggregator
                .emitter_for(&session_id, &message_id, &request_id),
        };
        let runner = self.runner.clone();
        let joined = tokio::spawn(async move { runner.run(ctx).await }).await;

        let result = match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) if cancel.is_cancelled() || e.is_cancellation() => {
                tracing::info!("[Orchestrator] Analysis {} cancelled: {}", request_id, e);
                Err(AppError::RunCancelled)
            }
            Ok(Err(AppError::RunFailed(msg))) => Err(AppError::RunFailed(msg)),
            Ok(Err(e)) => Err(AppError::run_failed(e.to_string())),
            Err(join_err) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                tracing::error!("[Orchestrator] Analysis {} panicked: {}", request_id, message);
                Err(AppError::RunPanic(message))
            }
            Err(join_err) => Err(AppError::run_failed(join_err.to_string())),
        };

        // Completion path, identical for every outcome.
        self.aggregator.flush_now(&session_id, true);
        let items = self.aggregator.get_all_flushed_items(&session_id);
        let persist_error = if items.is_empty() {
            None
        } else {
            match self.store.persist(&session_id, &message_id, &items).await {
                Ok(()) => {
                    tracing::debug!(
                        "[Orchestrator] Persisted {} item(s) for session {}",
                        items.len(),
                        session_id
                    );
                    None
                }
                Err(e) => {
                    let err = AppError::persist_failed(e.to_string());
                    tracing::error!("[Orchestrator] Session {}: {}", session_id, err);
                    Some(err.to_string())
                }
            }
        };
        self.aggregator.clear_flushed_items(&session_id);

        let (outcome, output, error, error_code) = match result {
            Ok(output) => {
                self.emitter.emit_completed(&CompletedEvent {
                    thread_id: session_id.clone(),
                    user_message_id: message_id.clone(),
                    request_id: request_id.clone(),
                    item_count: items.len(),
                });
                (RunOutcome::Completed, Some(output), None, None)
            }
            Err(e) => {
                let code = e.error_code();
                let outcome = match &e {
                    AppError::RunCancelled => {
                        self.aggregator.emit_cancelled(&session_id, &request_id);
                        RunOutcome::Cancelled
                    }
                    AppError::RunPanic(_) => RunOutcome::Panicked,
                    _ => RunOutcome::Failed,
                };
                if outcome != RunOutcome::Cancelled {
                    tracing::warn!("[Orchestrator] Analysis {} failed ({}): {}", request_id, code, e);
                    self.aggregator
                        .emit_error_with_code(&session_id, &request_id, code, &e.to_string());
                }
                (outcome, None, Some(e.to_string()), Some(code))
            }
        };

        self.aggregator.set_loading(&session_id, false, &request_id);
        self.emitter.emit_chat_loading(&session_id, false);
        guard.release();

        let report = AnalysisReport {
            session_id,
            message_id,
            request_id,
            outcome,
            output,
            error,
            error_code,
            item_count: items.len(),
            persist_error,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            "[Orchestrator] Analysis {} finished: {:?}, {} item(s) in {}ms",
            report.request_id,
            report.outcome,
            report.item_count,
            report.duration_ms
        );
        Ok(report)
    }

    /// Cancel every running analysis.
    pub async fn cancel(&self) -> AppResult<()> {
        self.admission.request_cancel().await
    }

    /// Reset a session: cancel it if it is running, then drop its results.
    pub async fn clear_session(&self, session_id: &str) -> AppResult<()> {
        if self.admission.is_active(session_id) {
            tracing::info!("[Orchestrator] Cancelling running session {} before clearing", session_id);
            match self.admission.request_cancel().await {
                Ok(()) | Err(AppError::NothingRunning) => {}
                Err(e) => return Err(e),
            }
        }
        self.aggregator.clear(session_id);
        Ok(())
    }

    /// Reset every session.
    pub async fn clear_all_sessions(&self) -> AppResult<()> {
        if self.admission.has_active() {
            match self.admission.request_cancel().await {
                Ok(()) | Err(AppError::NothingRunning) => {}
                Err(e) => return Err(e),
            }
        }
        self.aggregator.clear_all();
        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
