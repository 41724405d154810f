//! # Bridge Bootstrap
//!
//! Wires configuration, the instance store, the orchestrator, the shadow
//! reconciler and the background tasks into one running system.
//!
//! ## Startup order
//!
//! 1. Install structured logging and load configuration (environment-aware)
//! 2. Open the instance store: Postgres when `database.url` or `DATABASE_URL`
//!    is set, in-memory otherwise
//! 3. Build the orchestrator and reconciler around the caller's clients
//! 4. Start the completion listener, then resume persisted instances so no
//!    re-emitted completion is missed
//! 5. Start the garbage collector when enabled

use crate::config::{BridgeConfig, ConfigManager};
use crate::database::{DatabaseConnection, DatabaseMigrations, PgInstanceStore};
use crate::error::{BridgeError, BridgeResult};
use crate::events::EventPublisher;
use crate::orchestration::{
    CommandDispatcher, CommandOrchestrator, CommandSubmitter, GarbageCollector, ResumeReport,
};
use crate::reconciler::{DeviceRegistry, ShadowClient, ShadowReconciler};
use crate::state_machine::{InMemoryInstanceStore, InstanceStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Bootstrap options
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Custom configuration directory (None = auto-detect)
    pub config_directory: Option<PathBuf>,
    /// Environment override (None = auto-detect)
    pub environment_override: Option<String>,
    /// Resume persisted instances during bootstrap
    pub resume_on_start: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            config_directory: None,
            environment_override: None,
            resume_on_start: true,
        }
    }
}

/// Snapshot of a running system
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub running: bool,
    pub environment: String,
    pub durable_store: bool,
    pub active_runners: usize,
    pub registered_devices: usize,
}

/// Handle for a bootstrapped bridge
pub struct BridgeSystemHandle {
    pub orchestrator: CommandOrchestrator,
    pub reconciler: Arc<ShadowReconciler>,
    pub config_manager: Arc<ConfigManager>,
    pub resume_report: ResumeReport,
    durable_store: bool,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeSystemHandle {
    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow()
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            running: self.is_running(),
            environment: self.config_manager.environment().to_string(),
            durable_store: self.durable_store,
            active_runners: self.orchestrator.active_runner_count(),
            registered_devices: self.reconciler.registry().len(),
        }
    }

    /// Stop background tasks and wait for them to exit. Instance runners are
    /// left alone; their state is persisted and resumes on the next start.
    pub async fn stop(&mut self) -> BridgeResult<()> {
        if !self.is_running() {
            warn!("Bridge system already stopped");
            return Ok(());
        }
        self.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            task.await.map_err(|e| {
                BridgeError::Internal(format!("Background task failed during shutdown: {e}"))
            })?;
        }
        info!("🛑 Bridge system stopped");
        Ok(())
    }
}

pub struct BridgeBootstrap;

impl BridgeBootstrap {
    /// Load configuration and bootstrap around the given network and twin clients
    pub async fn bootstrap(
        options: BootstrapConfig,
        submitter: Arc<dyn CommandSubmitter>,
        shadows: Arc<dyn ShadowClient>,
    ) -> BridgeResult<BridgeSystemHandle> {
        crate::logging::init_structured_logging();
        info!("🚀 BOOTSTRAP: Starting satellite bridge");

        let config_manager = match (&options.environment_override, &options.config_directory) {
            (Some(env), dir) => ConfigManager::load_from_directory_with_env(dir.clone(), env)?,
            (None, Some(dir)) => ConfigManager::load_from_directory(Some(dir.clone()))?,
            (None, None) => ConfigManager::load()?,
        };
        info!(
            environment = config_manager.environment(),
            "✅ BOOTSTRAP: Configuration loaded"
        );

        let (store, durable_store) = Self::open_store(config_manager.config()).await?;
        Self::start(config_manager, store, durable_store, submitter, shadows, options.resume_on_start)
            .await
    }

    /// Bootstrap with an already loaded configuration and store
    pub async fn bootstrap_with(
        config_manager: Arc<ConfigManager>,
        store: Arc<dyn InstanceStore>,
        submitter: Arc<dyn CommandSubmitter>,
        shadows: Arc<dyn ShadowClient>,
    ) -> BridgeResult<BridgeSystemHandle> {
        Self::start(config_manager, store, false, submitter, shadows, true).await
    }

    async fn open_store(config: &BridgeConfig) -> BridgeResult<(Arc<dyn InstanceStore>, bool)> {
        let has_database = config.database.url.is_some() || std::env::var("DATABASE_URL").is_ok();
        if !has_database {
            info!("🗄️ BOOTSTRAP: No database configured, using in-memory instance store");
            return Ok((Arc::new(InMemoryInstanceStore::new()), false));
        }

        let connection = DatabaseConnection::connect(&config.database).await?;
        let applied = DatabaseMigrations::run_all(connection.pool()).await?;
        info!(applied, "🗄️ BOOTSTRAP: Postgres instance store ready");
        Ok((Arc::new(PgInstanceStore::new(connection.pool().clone())), true))
    }

    async fn start(
        config_manager: Arc<ConfigManager>,
        store: Arc<dyn InstanceStore>,
        durable_store: bool,
        submitter: Arc<dyn CommandSubmitter>,
        shadows: Arc<dyn ShadowClient>,
        resume_on_start: bool,
    ) -> BridgeResult<BridgeSystemHandle> {
        let config = config_manager.config();
        let publisher = EventPublisher::new(config.events.channel_capacity);
        let orchestrator = CommandOrchestrator::from_config(config, store, submitter, publisher);

        let registry = Arc::new(DeviceRegistry::new(config.reconciler.clone()));
        let dispatcher: Arc<dyn CommandDispatcher> = Arc::new(orchestrator.clone());
        let reconciler = Arc::new(ShadowReconciler::new(shadows, dispatcher, registry));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![Arc::clone(&reconciler)
            .spawn_completion_listener(orchestrator.subscribe(), shutdown_rx.clone())];

        let resume_report = if resume_on_start {
            orchestrator.resume_all().await?
        } else {
            ResumeReport::default()
        };

        if config.cleanup.enabled {
            let collector = GarbageCollector::new(orchestrator.clone(), config.cleanup.clone());
            tasks.push(collector.spawn(shutdown_rx));
            info!(
                interval_seconds = config.cleanup.sweep_interval_seconds,
                "🧹 BOOTSTRAP: Garbage collector started"
            );
        }

        info!("✅ BOOTSTRAP: Satellite bridge running");
        Ok(BridgeSystemHandle {
            orchestrator,
            reconciler,
            config_manager,
            resume_report,
            durable_store,
            shutdown,
            tasks,
        })
    }
}
