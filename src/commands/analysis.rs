//! Analysis Commands
//!
//! Entry points the UI calls to submit, observe, and cancel analyses.

use insight_core::ResultItem;

use crate::models::response::{CommandResponse, SubmitResponse};
use crate::services::analysis::{AnalysisReport, AnalysisRequest, CapacityCheck};
use crate::state::AppState;

/// Submit an analysis and return immediately with its request ID.
///
/// Queueing, progress, results, and the final outcome are reported through
/// UI events.
pub async fn submit_analysis(
    state: &AppState,
    request: AnalysisRequest,
) -> Result<CommandResponse<SubmitResponse>, String> {
    let orchestrator = match state.orchestrator().await {
        Ok(orchestrator) => orchestrator,
        Err(e) => return Ok(CommandResponse::from(Err::<SubmitResponse, _>(e))),
    };
    let handle = orchestrator.spawn(request);
    Ok(CommandResponse::ok(SubmitResponse {
        request_id: handle.request_id,
        session_id: handle.session_id,
    }))
}

/// Run an analysis to completion and return its report.
pub async fn run_analysis(
    state: &AppState,
    request: AnalysisRequest,
) -> Result<CommandResponse<AnalysisReport>, String> {
    let result = match state.orchestrator().await {
        Ok(orchestrator) => orchestrator.run(request).await,
        Err(e) => Err(e),
    };
    Ok(result.into())
}

/// Cancel every running analysis
pub async fn cancel_analysis(state: &AppState) -> Result<CommandResponse<()>, String> {
    let result = match state.orchestrator().await {
        Ok(orchestrator) => orchestrator.cancel().await,
        Err(e) => Err(e),
    };
    Ok(result.into())
}

/// Number of analyses currently holding a slot
pub async fn get_active_analysis_count(
    state: &AppState,
) -> Result<CommandResponse<usize>, String> {
    Ok(state
        .orchestrator()
        .await
        .map(|o| o.admission().active_count())
        .into())
}

/// Whether a new analysis would start without queueing
pub async fn can_start_new_analysis(
    state: &AppState,
) -> Result<CommandResponse<CapacityCheck>, String> {
    Ok(state
        .orchestrator()
        .await
        .map(|o| o.admission().can_admit())
        .into())
}

pub async fn is_cancel_requested(state: &AppState) -> Result<CommandResponse<bool>, String> {
    Ok(state
        .orchestrator()
        .await
        .map(|o| o.admission().is_cancel_requested())
        .into())
}

/// Items flushed so far for a session's current run
pub async fn get_session_results(
    state: &AppState,
    session_id: String,
) -> Result<CommandResponse<Vec<ResultItem>>, String> {
    Ok(state
        .orchestrator()
        .await
        .map(|o| o.aggregator().get_all_flushed_items(&session_id))
        .into())
}

/// Clear one session's results, or every session's when `session_id` is None.
/// A running analysis in the cleared session is cancelled first.
pub async fn clear_session_results(
    state: &AppState,
    session_id: Option<String>,
) -> Result<CommandResponse<()>, String> {
    let result = match state.orchestrator().await {
        Ok(orchestrator) => match session_id {
            Some(session_id) => orchestrator.clear_session(&session_id).await,
            None => orchestrator.clear_all_sessions().await,
        },
        Err(e) => Err(e),
    };
    Ok(result.into())
}
