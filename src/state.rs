//! Application State
//!
//! Global state shared by the command layer: the configuration service and the
//! analysis orchestrator built from it.

use std::sync::Arc;
use tokio::sync::RwLock;

use insight_core::EventEmitter;

use crate::models::settings::{AnalysisConfig, AnalysisConfigUpdate};
use crate::services::analysis::{AnalysisOrchestrator, AnalysisRunner, ResultStore};
use crate::storage::ConfigService;
use crate::utils::error::{AppError, AppResult};

/// Application state handed to every command
pub struct AppState {
    /// Event channel to the UI layer
    emitter: EventEmitter,
    /// Unit of work run for each analysis
    runner: Arc<dyn AnalysisRunner>,
    /// Sink for finished results
    store: Arc<dyn ResultStore>,
    /// Configuration service for analysis settings
    config: Arc<RwLock<Option<ConfigService>>>,
    /// Admission, aggregation and cancellation for analyses
    orchestrator: Arc<RwLock<Option<AnalysisOrchestrator>>>,
    /// Whether the state has been initialized
    initialized: Arc<RwLock<bool>>,
}

impl AppState {
    /// Create a new uninitialized app state
    pub fn new(
        emitter: EventEmitter,
        runner: Arc<dyn AnalysisRunner>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            emitter,
            runner,
            store,
            config: Arc::new(RwLock::new(None)),
            orchestrator: Arc::new(RwLock::new(None)),
            initialized: Arc::new(RwLock::new(false)),
        }
    }

    /// Initialize from ~/.insight-desktop/config.json
    pub async fn initialize(&self) -> AppResult<()> {
        if *self.initialized.read().await {
            return Ok(());
        }
        self.initialize_with(ConfigService::new()?).await
    }

    /// Initialize from an explicit config service
    pub async fn initialize_with(&self, config_service: ConfigService) -> AppResult<()> {
        let mut initialized = self.initialized.write().await;
        if *initialized {
            return Ok(());
        }

        let orchestrator = self.build_orchestrator(config_service.get_config());
        tracing::info!(
            "[State] Initialized (max concurrent analyses: {}, config: {})",
            orchestrator.admission().max_concurrent(),
            config_service.path().display()
        );

        *self.config.write().await = Some(config_service);
        *self.orchestrator.write().await = Some(orchestrator);
        *initialized = true;
        Ok(())
    }

    fn build_orchestrator(&self, config: &AnalysisConfig) -> AnalysisOrchestrator {
        AnalysisOrchestrator::from_config(
            config,
            self.emitter.clone(),
            self.runner.clone(),
            self.store.clone(),
        )
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.read().await
    }

    /// Get a handle to the orchestrator
    pub async fn orchestrator(&self) -> AppResult<AnalysisOrchestrator> {
        self.orchestrator
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::internal("Analysis services not initialized"))
    }

    /// Get the current configuration
    pub async fn get_config(&self) -> AppResult<AnalysisConfig> {
        let guard = self.config.read().await;
        match &*guard {
            Some(config) => Ok(config.get_config().clone()),
            None => Err(AppError::config("Config service not initialized")),
        }
    }

    /// Update the configuration.
    ///
    /// The new settings are applied to the live orchestrator, so handles
    /// taken earlier keep sharing one admission controller. Running analyses
    /// keep their slots; a lower limit only holds back new grants.
    pub async fn update_config(&self, update: AnalysisConfigUpdate) -> AppResult<AnalysisConfig> {
        let updated = {
            let mut guard = self.config.write().await;
            match &mut *guard {
                Some(config) => config.update_config(update)?,
                None => return Err(AppError::config("Config service not initialized")),
            }
        };

        if let Some(orchestrator) = &*self.orchestrator.read().await {
            orchestrator.apply_config(&updated);
            tracing::info!(
                "[State] Applied updated analysis settings ({} running, {} queued)",
                orchestrator.admission().active_count(),
                orchestrator.admission().waiting_count()
            );
        }
        Ok(updated)
    }
}
