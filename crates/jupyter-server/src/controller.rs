//! Server lifecycle: `Stopped → Probing → Running → Stopping → Stopped`.
//!
//! `start()` adopts a server that is already running or launches one. While
//! running, one background task periodically reconciles the kernel registry
//! with the server's listing; it is aborted on `stop()`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::process::Child;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::{
    ContentsModel, KernelModel, KernelSpecs, KernelStatus, RunningKernel, ServerAddress,
    SessionModel,
};
use crate::config::ServerConfig;
use crate::control_plane::ControlPlane;
use crate::discovery;
use crate::error::ServerError;
use crate::launch;
use crate::registry::{KernelRegistry, ReconcileOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Probing,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Started { base_url: String, adopted: bool },
    StartFailed { reason: String },
    Stopped,
    KernelAdded { kernel_id: String },
    KernelRemoved { kernel_id: String },
    KernelStatusChanged { kernel_id: String, status: KernelStatus },
}

type SharedRegistry = Arc<StdMutex<KernelRegistry>>;

struct RunningServer {
    control: ControlPlane,
    /// Present only when this controller launched the server.
    child: Option<Child>,
    process_group_id: Option<i32>,
    reconcile_task: JoinHandle<()>,
}

/// Writes kernel status observed elsewhere (a kernel session's status
/// channel) into the registry.
#[derive(Clone)]
pub struct KernelStatusSink {
    registry: SharedRegistry,
    events: broadcast::Sender<ServerEvent>,
}

impl KernelStatusSink {
    pub fn set(&self, kernel_id: &str, status: KernelStatus) {
        let changed = self.registry.lock().unwrap().set_status(kernel_id, status);
        if changed {
            let _ = self.events.send(ServerEvent::KernelStatusChanged {
                kernel_id: kernel_id.to_string(),
                status,
            });
        }
    }
}

pub struct ServerController {
    config: ServerConfig,
    state: watch::Sender<ServerState>,
    events: broadcast::Sender<ServerEvent>,
    registry: SharedRegistry,
    running: Option<RunningServer>,
}

impl ServerController {
    pub fn new(config: ServerConfig) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        let (events, _) = broadcast::channel(256);
        ServerController {
            config,
            state,
            events,
            registry: Arc::new(StdMutex::new(KernelRegistry::new())),
            running: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn status_sink(&self) -> KernelStatusSink {
        KernelStatusSink {
            registry: self.registry.clone(),
            events: self.events.clone(),
        }
    }

    fn set_state(&self, state: ServerState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub fn address(&self) -> Option<&ServerAddress> {
        self.running.as_ref().map(|r| r.control.address())
    }

    /// Control plane of the running server, or `ServerUnavailable`.
    pub fn control_plane(&self) -> Result<&ControlPlane, ServerError> {
        self.running
            .as_ref()
            .map(|r| &r.control)
            .ok_or_else(|| ServerError::ServerUnavailable("server is not running".into()))
    }

    /// Discover or launch a server. On failure the controller is left
    /// `Stopped` and the error returned; nothing is retried.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.running.is_some() {
            return Ok(());
        }
        self.set_state(ServerState::Probing);

        match self.bring_up().await {
            Ok(running) => {
                let base_url = running.control.address().base_url().to_string();
                let adopted = running.child.is_none();
                self.running = Some(running);
                self.set_state(ServerState::Running);
                self.emit(ServerEvent::Started { base_url, adopted });
                self.refresh_specs().await;
                Ok(())
            }
            Err(e) => {
                error!("[server] Failed to start: {}", e);
                self.set_state(ServerState::Stopped);
                self.emit(ServerEvent::StartFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<RunningServer, ServerError> {
        let (address, child, process_group_id) =
            match discovery::discover(&self.config.runtime_dir, self.config.request_timeout).await {
                Some(address) => {
                    info!("[server] Adopting running server at {}", address);
                    (address, None, None)
                }
                None => {
                    let launched = launch::launch(&self.config).await?;
                    (
                        launched.address,
                        Some(launched.child),
                        launched.process_group_id,
                    )
                }
            };

        let control = ControlPlane::new(address, self.config.request_timeout)?;
        let reconcile_task = spawn_reconcile_loop(
            control.clone(),
            self.registry.clone(),
            self.events.clone(),
            self.config.runtime_dir.clone(),
            self.config.reconcile_interval(),
        );
        Ok(RunningServer {
            control,
            child,
            process_group_id,
            reconcile_task,
        })
    }

    /// Cancel reconciliation, forget local kernel handles and, if this
    /// controller launched the server, terminate it. Adopted servers are
    /// left running.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        self.set_state(ServerState::Stopping);
        running.reconcile_task.abort();

        if let Some(mut child) = running.child.take() {
            info!("[server] Stopping launched server");
            terminate(&mut child, running.process_group_id).await;
        }

        self.registry.lock().unwrap().clear();
        self.set_state(ServerState::Stopped);
        self.emit(ServerEvent::Stopped);
        info!("[server] Stopped");
    }

    async fn refresh_specs(&self) {
        if let Err(e) = self.kernel_specs().await {
            warn!("[server] Could not load kernel specs: {}", e);
        }
    }

    /// Kernel specs offered by the server. Listing a spec only records its
    /// language; running kernels become adoptable once this controller has
    /// started a kernel of that spec.
    pub async fn kernel_specs(&self) -> Result<KernelSpecs, ServerError> {
        let specs = self.control_plane()?.kernel_specs().await?;
        self.registry.lock().unwrap().remember_specs(&specs.specs);
        Ok(specs)
    }

    /// Start a kernel and register it with status `Starting`.
    pub async fn start_kernel(&self, name: &str) -> Result<RunningKernel, ServerError> {
        let control = self.control_plane()?;
        let model = control.start_kernel(name).await?;
        info!("[server] Started kernel {} ({})", model.id, name);

        let kernel = {
            let mut registry = self.registry.lock().unwrap();
            registry.insert_started(&model, control.address(), &self.config.runtime_dir);
            registry.get(&model.id).cloned()
        };
        self.emit(ServerEvent::KernelAdded {
            kernel_id: model.id.clone(),
        });
        kernel.ok_or_else(|| ServerError::call_failed("start_kernel", "kernel vanished"))
    }

    pub async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), ServerError> {
        self.control_plane()?.shutdown_kernel(kernel_id).await?;
        if self.registry.lock().unwrap().remove(kernel_id).is_some() {
            self.emit(ServerEvent::KernelRemoved {
                kernel_id: kernel_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), ServerError> {
        self.control_plane()?.interrupt_kernel(kernel_id).await
    }

    pub async fn restart_kernel(&self, kernel_id: &str) -> Result<(), ServerError> {
        self.control_plane()?.restart_kernel(kernel_id).await?;
        self.status_sink().set(kernel_id, KernelStatus::Starting);
        Ok(())
    }

    /// Every kernel the server reports right now, adopted or not.
    pub async fn list_server_kernels(&self) -> Result<Vec<KernelModel>, ServerError> {
        self.control_plane()?.list_kernels().await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionModel>, ServerError> {
        self.control_plane()?.list_sessions().await
    }

    pub async fn create_session(
        &self,
        path: &str,
        kernel_name: &str,
    ) -> Result<SessionModel, ServerError> {
        self.control_plane()?.create_session(path, kernel_name).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), ServerError> {
        self.control_plane()?.delete_session(session_id).await
    }

    pub async fn get_contents(&self, path: &str) -> Result<ContentsModel, ServerError> {
        self.control_plane()?.get_contents(path).await
    }

    pub async fn save_contents(
        &self,
        path: &str,
        model: &ContentsModel,
    ) -> Result<ContentsModel, ServerError> {
        self.control_plane()?.save_contents(path, model).await
    }

    pub fn kernels(&self) -> Vec<RunningKernel> {
        self.registry.lock().unwrap().kernels()
    }

    pub fn kernel(&self, kernel_id: &str) -> Option<RunningKernel> {
        self.registry.lock().unwrap().get(kernel_id).cloned()
    }

    pub fn sessions(&self) -> Vec<SessionModel> {
        self.registry.lock().unwrap().sessions().to_vec()
    }

    /// Run one reconciliation pass now instead of waiting for the timer.
    pub async fn reconcile_now(&self) -> Result<ReconcileOutcome, ServerError> {
        reconcile_once(
            self.control_plane()?,
            &self.registry,
            &self.events,
            &self.config.runtime_dir,
        )
        .await
    }
}

impl Drop for ServerController {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.reconcile_task.abort();
            #[cfg(unix)]
            if let Some(pgid) = running.process_group_id {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;
                let _ = killpg(Pid::from_raw(pgid), Signal::SIGTERM);
            }
        }
    }
}

async fn terminate(child: &mut Child, process_group_id: Option<i32>) {
    #[cfg(unix)]
    if let Some(pgid) = process_group_id {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
            if e != nix::errno::Errno::ESRCH {
                error!("[server] Failed to signal process group {}: {}", pgid, e);
            }
        }
        if tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .is_ok()
        {
            return;
        }
        warn!("[server] Server ignored SIGTERM, killing");
    }
    #[cfg(not(unix))]
    let _ = process_group_id;

    if let Err(e) = child.kill().await {
        error!("[server] Failed to kill server: {}", e);
    }
}

async fn reconcile_once(
    control: &ControlPlane,
    registry: &SharedRegistry,
    events: &broadcast::Sender<ServerEvent>,
    runtime_dir: &std::path::Path,
) -> Result<ReconcileOutcome, ServerError> {
    let since = registry.lock().unwrap().generation();
    let kernels = control.list_kernels().await?;
    let sessions = control.list_sessions().await?;

    let outcome = registry
        .lock()
        .unwrap()
        .reconcile(&kernels, &sessions, control.address(), runtime_dir, since);

    for kernel_id in &outcome.removed {
        info!("[server] Kernel {} no longer on server, removing", kernel_id);
        let _ = events.send(ServerEvent::KernelRemoved {
            kernel_id: kernel_id.clone(),
        });
    }
    for kernel_id in &outcome.adopted {
        info!("[server] Adopting kernel {}", kernel_id);
        let _ = events.send(ServerEvent::KernelAdded {
            kernel_id: kernel_id.clone(),
        });
    }
    for (kernel_id, status) in &outcome.status_changed {
        let _ = events.send(ServerEvent::KernelStatusChanged {
            kernel_id: kernel_id.clone(),
            status: *status,
        });
    }
    Ok(outcome)
}

fn spawn_reconcile_loop(
    control: ControlPlane,
    registry: SharedRegistry,
    events: broadcast::Sender<ServerEvent>,
    runtime_dir: PathBuf,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // Failures are reported and the next tick tries again.
            if let Err(e) = reconcile_once(&control, &registry, &events, &runtime_dir).await {
                warn!("[server] Reconciliation skipped: {}", e);
            }
        }
    })
}
