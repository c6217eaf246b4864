//! Notebook execution on top of a Jupyter server.
//!
//! [`NotebookApp`] is the application root: it owns the
//! [`ServerController`], one [`KernelSession`] per kernel in use, and the
//! collaborators documents are run with. Each open document gets its own
//! coordinator (see [`coordinator`]).

pub mod coordinator;
pub mod execution_queue;
pub mod settings;
pub mod shell;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Context, Result};
use jupyter_server::{KernelModel, KernelSpecs, RunningKernel, ServerConfig, ServerController};
use kernel_session::{KernelConnector, KernelSession, SessionConfig, ZmqConnector};
use log::{info, warn};
use notebook_doc::Document;
use tokio::task::JoinHandle;

pub use coordinator::{
    spawn_coordinator, CoordinatorCommand, CoordinatorConfig, CoordinatorEvent, CoordinatorHandle,
    CoordinatorState, SharedDocument,
};
pub use execution_queue::{CellQueueStatus, ExecutionQueue, ExecutionQueueState, QueuedCell};
pub use settings::AppSettings;
pub use shell::{CommandRunner, ProcessRunner};

/// A document bound to a kernel session.
#[derive(Clone)]
pub struct OpenNotebook {
    pub document: SharedDocument,
    pub coordinator: CoordinatorHandle,
}

struct AttachedSession {
    session: KernelSession,
    /// Started by this app, so shut down on teardown.
    owned: bool,
    status_task: JoinHandle<()>,
}

pub struct NotebookApp {
    settings: AppSettings,
    controller: ServerController,
    connector: Arc<dyn KernelConnector>,
    session_config: SessionConfig,
    runner: Arc<dyn CommandRunner>,
    sessions: HashMap<String, AttachedSession>,
}

impl NotebookApp {
    pub fn new(settings: AppSettings) -> Self {
        let server_config = settings.to_server_config();
        Self::with_parts(
            settings,
            server_config,
            Arc::new(ZmqConnector),
            Arc::new(ProcessRunner::default()),
        )
    }

    /// Build with explicit server configuration and collaborators.
    pub fn with_parts(
        settings: AppSettings,
        server_config: ServerConfig,
        connector: Arc<dyn KernelConnector>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        NotebookApp {
            settings,
            controller: ServerController::new(server_config),
            connector,
            session_config: SessionConfig::default(),
            runner,
            sessions: HashMap::new(),
        }
    }

    pub fn with_session_config(mut self, session_config: SessionConfig) -> Self {
        self.session_config = session_config;
        self
    }

    /// Find or launch the server.
    pub async fn init(&mut self) -> Result<()> {
        self.controller
            .start()
            .await
            .context("Failed to start Jupyter server")
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn controller(&self) -> &ServerController {
        &self.controller
    }

    pub async fn kernel_specs(&self) -> Result<KernelSpecs> {
        Ok(self.controller.kernel_specs().await?)
    }

    /// Kernels the server is running right now, including ones this app has
    /// not adopted.
    pub async fn running_kernels(&self) -> Result<Vec<KernelModel>> {
        Ok(self.controller.list_server_kernels().await?)
    }

    /// Start a kernel from spec `name` (the configured default when `None`)
    /// and return its session.
    pub async fn start_kernel(&mut self, name: Option<&str>) -> Result<KernelSession> {
        let name = name.unwrap_or(&self.settings.default_kernel).to_string();
        let kernel = self.controller.start_kernel(&name).await?;
        Ok(self.attach(kernel, true))
    }

    /// The shared session for a kernel the controller knows about.
    pub fn session(&mut self, kernel_id: &str) -> Result<KernelSession> {
        if let Some(attached) = self.sessions.get(kernel_id) {
            return Ok(attached.session.clone());
        }
        let kernel = self
            .controller
            .kernel(kernel_id)
            .ok_or_else(|| anyhow!("No running kernel {}", kernel_id))?;
        Ok(self.attach(kernel, false))
    }

    fn attach(&mut self, kernel: RunningKernel, owned: bool) -> KernelSession {
        let kernel_id = kernel.kernel_id.clone();
        let session = KernelSession::new(
            kernel,
            self.connector.clone(),
            self.session_config.clone(),
        );

        // Mirror the session's view of the kernel into the registry.
        let mut status = session.watch_status();
        let sink = self.controller.status_sink();
        let forwarded_id = kernel_id.clone();
        let status_task = tokio::spawn(async move {
            loop {
                let current = *status.borrow_and_update();
                sink.set(&forwarded_id, current);
                if status.changed().await.is_err() {
                    break;
                }
            }
        });

        info!("[notebook] Attached session to kernel {}", kernel_id);
        self.sessions.insert(
            kernel_id,
            AttachedSession {
                session: session.clone(),
                owned,
                status_task,
            },
        );
        session
    }

    /// Bind `document` to `session` and start its coordinator.
    pub fn open_document(&self, document: Document, session: &KernelSession) -> OpenNotebook {
        let document: SharedDocument = Arc::new(StdMutex::new(document));
        let coordinator = spawn_coordinator(
            document.clone(),
            session.clone(),
            self.runner.clone(),
            CoordinatorConfig::from(&self.settings),
        );
        OpenNotebook {
            document,
            coordinator,
        }
    }

    pub async fn interrupt(&self, kernel_id: &str) -> Result<()> {
        Ok(self.controller.interrupt_kernel(kernel_id).await?)
    }

    pub async fn restart(&self, kernel_id: &str) -> Result<()> {
        Ok(self.controller.restart_kernel(kernel_id).await?)
    }

    pub async fn shutdown_kernel(&mut self, kernel_id: &str) -> Result<()> {
        if let Some(attached) = self.sessions.remove(kernel_id) {
            attached.status_task.abort();
        }
        Ok(self.controller.shutdown_kernel(kernel_id).await?)
    }

    /// Shut down the kernels this app started and stop the server. Adopted
    /// kernels and an adopted server are left running.
    pub async fn teardown(&mut self) {
        let sessions: Vec<(String, AttachedSession)> = self.sessions.drain().collect();
        for (kernel_id, attached) in sessions {
            attached.status_task.abort();
            if attached.owned {
                if let Err(e) = self.controller.shutdown_kernel(&kernel_id).await {
                    warn!("[notebook] Failed to shut down kernel {}: {}", kernel_id, e);
                }
            }
        }
        self.controller.stop().await;
        info!("[notebook] Torn down");
    }
}
