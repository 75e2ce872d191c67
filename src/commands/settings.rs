//! Settings Commands
//!
//! Commands for reading and updating analysis settings.

use crate::models::response::CommandResponse;
use crate::models::settings::{AnalysisConfig, AnalysisConfigUpdate};
use crate::state::AppState;

/// Get current analysis settings
pub async fn get_settings(state: &AppState) -> Result<CommandResponse<AnalysisConfig>, String> {
    match state.get_config().await {
        Ok(config) => Ok(CommandResponse::ok(config)),
        Err(e) => Ok(CommandResponse::from(Err::<AnalysisConfig, _>(e))),
    }
}

/// Update analysis settings with a partial update
pub async fn update_settings(
    state: &AppState,
    update: AnalysisConfigUpdate,
) -> Result<CommandResponse<AnalysisConfig>, String> {
    Ok(state.update_config(update).await.into())
}
