//! Service container for dependency injection.
//!
//! Owns the database pool, the receiver busy flag and the refresh signal,
//! and runs the scheduler and the HTTP server as background tasks that stop
//! together on one cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::acquisition::AcquisitionEngine;
use crate::api::{ApiServer, ApiServerConfig, AppState};
use crate::config::AppConfig;
use crate::database::repositories::{RecordingRepository, SqlxRecordingRepository};
use crate::database::{self, DbPool};
use crate::device::backend_from_config;
use crate::domain::{OutputLayout, RecordingIdGenerator};
use crate::logging::LoggingConfig;
use crate::scheduler::{BusyFlag, RefreshSignal, Scheduler};

/// Default shutdown timeout. An in-flight sweep longer than this is
/// abandoned and recovered as interrupted on the next start.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Service container holding all application services.
pub struct ServiceContainer {
    pub pool: DbPool,
    pub repo: Arc<SqlxRecordingRepository>,
    pub busy: BusyFlag,
    pub refresh: RefreshSignal,
    pub ids: Arc<RecordingIdGenerator>,
    config: AppConfig,
    logging_config: Option<Arc<LoggingConfig>>,
    cancellation_token: CancellationToken,
    scheduler_task: Option<JoinHandle<()>>,
    api_task: Option<JoinHandle<Result<()>>>,
}

impl ServiceContainer {
    /// Open the configured database and prepare all services.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let pool = database::init_pool(&config.database_url).await?;
        Self::with_pool(pool, config).await
    }

    /// Use an existing pool. Migrations are applied here.
    pub async fn with_pool(pool: DbPool, config: AppConfig) -> Result<Self> {
        database::run_migrations(&pool).await?;
        tokio::fs::create_dir_all(&config.record_path).await?;

        let repo = Arc::new(SqlxRecordingRepository::new(pool.clone()));
        let ids = match repo.max_id().await? {
            Some(last) => RecordingIdGenerator::starting_after(last),
            None => RecordingIdGenerator::new(),
        };

        Ok(Self {
            pool,
            repo,
            busy: BusyFlag::new(),
            refresh: RefreshSignal::new(),
            ids: Arc::new(ids),
            config,
            logging_config: None,
            cancellation_token: CancellationToken::new(),
            scheduler_task: None,
            api_task: None,
        })
    }

    pub fn with_logging_config(mut self, logging_config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(logging_config);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn layout(&self) -> OutputLayout {
        OutputLayout::new(&self.config.record_path)
    }

    /// A scheduler wired to this container's store, flag and signal.
    pub fn build_scheduler(&self) -> Scheduler {
        let backend = backend_from_config(&self.config.device);
        let engine = Arc::new(AcquisitionEngine::new(
            backend,
            self.layout(),
            self.config.acquisition_config(),
        ));
        Scheduler::new(
            self.repo.clone(),
            engine,
            self.busy.clone(),
            self.refresh.clone(),
            self.config.scheduler_config(),
        )
    }

    pub fn app_state(&self) -> AppState {
        let mut state = AppState::new(
            self.repo.clone(),
            self.busy.observer(),
            self.refresh.clone(),
            self.ids.clone(),
            self.layout(),
        )
        .with_poll_interval(self.config.scheduler_config().poll_interval);
        if let Some(logging_config) = &self.logging_config {
            state = state.with_logging_config(logging_config.clone());
        }
        state
    }

    /// Spawn the scheduler, the HTTP server and log retention.
    pub fn start(&mut self) {
        let scheduler = self.build_scheduler();
        let token = self.cancellation_token.clone();
        self.scheduler_task = Some(tokio::spawn(async move { scheduler.run(token).await }));

        if let Some(logging_config) = &self.logging_config {
            logging_config.start_retention_cleanup(self.cancellation_token.child_token());
        }

        let server = ApiServer::new(ApiServerConfig::from(&self.config), self.app_state())
            .with_cancel_token(self.cancellation_token.child_token());
        self.api_task = Some(tokio::spawn(async move { server.run().await }));

        info!(
            device_backend = self.config.device.backend.as_str(),
            record_path = %self.config.record_path.display(),
            "Services started"
        );
    }

    /// Start, then run until `shutdown` resolves or the HTTP server fails.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start();

        let server_result = match self.api_task.take() {
            Some(mut api_task) => {
                let joined = tokio::select! {
                    _ = shutdown => {
                        info!("Shutdown requested");
                        None
                    }
                    joined = &mut api_task => Some(joined),
                };
                if joined.is_none() {
                    self.api_task = Some(api_task);
                }
                joined
            }
            None => {
                shutdown.await;
                None
            }
        };

        self.shutdown().await;

        match server_result {
            Some(Ok(Err(e))) => Err(e),
            Some(Err(e)) => Err(crate::Error::Other(format!("API server task failed: {}", e))),
            _ => Ok(()),
        }
    }

    /// Stop everything and close the pool.
    pub async fn shutdown(&mut self) {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    pub async fn shutdown_with_timeout(&mut self, timeout: Duration) {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        if let Some(api_task) = self.api_task.take() {
            match api_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("API server stopped with error: {}", e),
                Err(e) => error!("API server task failed: {}", e),
            }
        }

        if let Some(mut scheduler_task) = self.scheduler_task.take() {
            match tokio::time::timeout(timeout, &mut scheduler_task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Scheduler task failed: {}", e),
                Err(_) => {
                    warn!("Shutdown timeout reached, abandoning the in-flight recording");
                    scheduler_task.abort();
                }
            }
        }

        self.pool.close().await;
        info!("Services shut down");
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
