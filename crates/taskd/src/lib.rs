//! taskd - autonomous task orchestration daemon.
//!
//! Library components for the daemon process.

pub mod collaborator;
pub mod coordinator;
pub mod gate;
pub mod iteration;
pub mod queue;
pub mod server;
pub mod storage;
pub mod verifier;

use std::path::PathBuf;
use std::sync::Arc;

use collaborator::CommandCollaborator;
use coordinator::Coordinator;
use gate::GovernanceGate;
use iteration::IterationLoop;
use queue::TaskQueue;
use server::AppState;
use storage::Storage;
use task_core::{AutonomyPolicy, Config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use verifier::TierRunner;

/// Interval between scheduling passes.
const TICK_INTERVAL_MS: u64 = 500;

/// Daemon state.
pub struct Daemon {
    config: Config,
    auth_token: Option<String>,
    storage: Arc<Storage>,
    queue: Arc<TaskQueue>,
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create a new daemon from configuration.
    ///
    /// Fails when the database cannot be opened or holds unreadable state,
    /// or when the configured policy file does not parse.
    pub async fn new(
        config: Config,
        working_dir: PathBuf,
        auth_token: Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        // Force a full read of the authoritative table so corrupt persisted
        // state fails startup with a clear diagnostic instead of surfacing
        // mid-dispatch.
        storage.list_tasks(None).await?;

        let policy = match &config.policy_path {
            Some(path) => AutonomyPolicy::from_file(path)?,
            None => AutonomyPolicy::default(),
        };
        info!(role = %policy.role, "autonomy policy loaded");

        let queue = Arc::new(TaskQueue::new(Arc::clone(&storage)));
        let gate = Arc::new(GovernanceGate::new(policy, Arc::clone(&storage)));
        let verifier = TierRunner::new(config.verify_tiers.clone(), config.verify_timeout_sec);
        let collaborator = Arc::new(CommandCollaborator::new(
            config.collaborator_cmd.clone(),
            config.collaborator_timeout_sec,
        ));
        let iteration = Arc::new(IterationLoop::new(
            Arc::clone(&storage),
            Arc::clone(&queue),
            Arc::clone(&gate),
            verifier,
            collaborator,
            working_dir,
        ));
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&storage),
            Arc::clone(&queue),
            gate,
            iteration,
            config.max_concurrent_tasks,
        ));

        Ok(Self {
            config,
            auth_token,
            storage,
            queue,
            coordinator,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Run the daemon main loop.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("taskd starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!(
            "max concurrent tasks: {}",
            self.config.max_concurrent_tasks
        );
        if self.auth_token.is_some() {
            info!("auth token: enabled");
        }

        // Hand back tasks interrupted by a previous crash.
        match self.coordinator.resume().await {
            Ok(0) => {}
            Ok(n) => info!("requeued {} interrupted task(s)", n),
            Err(e) => warn!("failed to requeue interrupted tasks: {}", e),
        }

        // Start HTTP server in a background task.
        let state = Arc::new(AppState {
            storage: Arc::clone(&self.storage),
            queue: Arc::clone(&self.queue),
            coordinator: Arc::clone(&self.coordinator),
            config: self.config.clone(),
            auth_token: self.auth_token.clone(),
        });
        let port = self.config.port;
        let http_handle = tokio::spawn(async move {
            if let Err(e) = server::start_server(state, port).await {
                error!("HTTP server error: {}", e);
            }
        });

        // Main scheduling loop.
        loop {
            if self.shutdown.is_cancelled() {
                info!("shutdown signal received, exiting");
                break;
            }

            if let Err(e) = self.coordinator.tick().await {
                error!("scheduling pass failed: {}", e);
            }

            tokio::select! {
                () = self.shutdown.cancelled() => {}
                () = tokio::time::sleep(tokio::time::Duration::from_millis(TICK_INTERVAL_MS)) => {}
            }
        }

        http_handle.abort();
        Ok(())
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}
