//! Runs a document's cells against its kernel, one at a time.
//!
//! The coordinator is an actor: [`spawn_coordinator`] starts a task that owns
//! the [`ExecutionQueue`] and the in-flight execution, takes
//! [`CoordinatorCommand`]s from a [`CoordinatorHandle`] and publishes
//! [`CoordinatorEvent`]s. Kernel replies are written into the shared
//! [`Document`] as they arrive; the cell finishes on the `idle` status that
//! answers its own request.

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, bail, Result};
use kernel_session::{ExecutionStream, KernelSession, ProtocolContent, ProtocolMessage, ReplyStatus};
use log::{debug, info, warn};
use notebook_doc::{Document, Output};
use tokio::sync::{broadcast, mpsc, watch};

use crate::execution_queue::{ExecutionQueue, ExecutionQueueState};
use crate::settings::AppSettings;
use crate::shell::{split_command, CommandRunner};

pub type SharedDocument = Arc<StdMutex<Document>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorCommand {
    Select { cell_id: String },
    /// Run the selected cell, after whatever is already queued.
    RunSelected,
    /// Queue every code cell in document order.
    RunAll,
    RunCell { cell_id: String },
    /// Drop pending cells. The executing cell runs to completion.
    ClearQueue,
    /// Detach from the document. An in-flight execution keeps running on
    /// the kernel; its remaining replies are discarded.
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    QueueChanged(ExecutionQueueState),
    CellStarted {
        cell_id: String,
    },
    CellFinished {
        cell_id: String,
        execution_count: Option<i64>,
        success: bool,
    },
    Selected {
        cell_id: Option<String>,
    },
    CellsCancelled {
        cell_ids: Vec<String>,
    },
    /// Queue drained, nothing executing.
    Idle,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub stop_on_error: bool,
    pub shell_escape_sigil: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            shell_escape_sigil: "!".to_string(),
        }
    }
}

impl From<&AppSettings> for CoordinatorConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            stop_on_error: settings.stop_on_error,
            shell_escape_sigil: settings.shell_escape_sigil.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<CoordinatorCommand>,
    events: broadcast::Sender<CoordinatorEvent>,
    state: watch::Receiver<CoordinatorState>,
}

impl CoordinatorHandle {
    pub async fn send(&self, command: CoordinatorCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("coordinator is closed"))
    }

    pub async fn select(&self, cell_id: &str) -> Result<()> {
        self.send(CoordinatorCommand::Select {
            cell_id: cell_id.to_string(),
        })
        .await
    }

    pub async fn run_selected(&self) -> Result<()> {
        self.send(CoordinatorCommand::RunSelected).await
    }

    pub async fn run_all(&self) -> Result<()> {
        self.send(CoordinatorCommand::RunAll).await
    }

    pub async fn run_cell(&self, cell_id: &str) -> Result<()> {
        self.send(CoordinatorCommand::RunCell {
            cell_id: cell_id.to_string(),
        })
        .await
    }

    pub async fn clear_queue(&self) -> Result<()> {
        self.send(CoordinatorCommand::ClearQueue).await
    }

    pub async fn close(&self) -> Result<()> {
        self.send(CoordinatorCommand::Close).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.clone()
    }

    /// Queue every code cell and wait until the queue drains.
    pub async fn run_all_to_completion(&self) -> Result<()> {
        let mut events = self.subscribe();
        self.run_all().await?;
        loop {
            match events.recv().await {
                Ok(CoordinatorEvent::Idle) => return Ok(()),
                Ok(CoordinatorEvent::Closed) => bail!("coordinator closed during run"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("[coordinator] Skipped {} events while waiting", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => bail!("coordinator is closed"),
            }
        }
    }
}

pub fn spawn_coordinator(
    document: SharedDocument,
    session: KernelSession,
    runner: Arc<dyn CommandRunner>,
    config: CoordinatorConfig,
) -> CoordinatorHandle {
    let (commands_tx, commands_rx) = mpsc::channel(100);
    let (events, _) = broadcast::channel(256);
    let (state_tx, state_rx) = watch::channel(CoordinatorState::Idle);

    let selected = document
        .lock()
        .unwrap()
        .cells()
        .first()
        .map(|c| c.id.clone());

    let coordinator = Coordinator {
        document,
        session,
        runner,
        config,
        queue: ExecutionQueue::new(),
        selected,
        current: None,
        last_finished: None,
        events: events.clone(),
        state: state_tx,
    };
    tokio::spawn(coordinator.run(commands_rx));

    CoordinatorHandle {
        commands: commands_tx,
        events,
        state: state_rx,
    }
}

enum ShellEvent {
    Line(String),
    Exited(std::result::Result<i32, String>),
}

enum CellSource {
    Kernel(ExecutionStream),
    Shell(mpsc::UnboundedReceiver<ShellEvent>),
}

struct ActiveCell {
    cell_id: String,
    source: CellSource,
    failed: bool,
    /// `clear_output(wait=true)` seen: clear before the next output lands.
    clear_on_next_output: bool,
}

enum Progress {
    Kernel(Option<ProtocolMessage>),
    Shell(Option<ShellEvent>),
}

/// Next reply from the executing cell. Never resolves when nothing executes.
async fn next_progress(current: &mut Option<ActiveCell>) -> Progress {
    match current {
        Some(ActiveCell {
            source: CellSource::Kernel(stream),
            ..
        }) => Progress::Kernel(stream.recv().await),
        Some(ActiveCell {
            source: CellSource::Shell(lines),
            ..
        }) => Progress::Shell(lines.recv().await),
        None => futures::future::pending().await,
    }
}

struct Coordinator {
    document: SharedDocument,
    session: KernelSession,
    runner: Arc<dyn CommandRunner>,
    config: CoordinatorConfig,
    queue: ExecutionQueue,
    selected: Option<String>,
    current: Option<ActiveCell>,
    last_finished: Option<String>,
    events: broadcast::Sender<CoordinatorEvent>,
    state: watch::Sender<CoordinatorState>,
}

impl Coordinator {
    async fn run(mut self, mut commands: mpsc::Receiver<CoordinatorCommand>) {
        info!(
            "[coordinator] Started for kernel {}",
            self.session.kernel_id()
        );
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(CoordinatorCommand::Close) | None => {
                        self.close();
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                progress = next_progress(&mut self.current) => match progress {
                    Progress::Kernel(Some(message)) => self.handle_message(message).await,
                    Progress::Kernel(None) => {
                        warn!("[coordinator] Reply stream ended before idle");
                        self.mark_failed();
                        self.finish_current().await;
                    }
                    Progress::Shell(Some(event)) => self.handle_shell_event(event).await,
                    Progress::Shell(None) => {
                        warn!("[coordinator] Shell command vanished");
                        self.mark_failed();
                        self.finish_current().await;
                    }
                },
            }
        }
        info!("[coordinator] Stopped");
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    fn emit_queue_state(&self) {
        self.emit(CoordinatorEvent::QueueChanged(self.queue.get_state()));
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state.send_replace(state);
    }

    async fn handle_command(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::Select { cell_id } => {
                self.selected = Some(cell_id.clone());
                self.emit(CoordinatorEvent::Selected {
                    cell_id: Some(cell_id),
                });
            }
            CoordinatorCommand::RunSelected => {
                let cells: Vec<String> = self.selected.iter().cloned().collect();
                self.enqueue(cells).await;
            }
            CoordinatorCommand::RunAll => {
                let cells = self.document.lock().unwrap().code_cell_ids();
                self.enqueue(cells).await;
            }
            CoordinatorCommand::RunCell { cell_id } => self.enqueue(vec![cell_id]).await,
            CoordinatorCommand::ClearQueue => self.cancel_pending(),
            CoordinatorCommand::Close => self.close(),
        }
    }

    async fn enqueue(&mut self, cell_ids: Vec<String>) {
        let mut added = 0;
        for cell_id in cell_ids {
            if self.queue.enqueue(cell_id) {
                added += 1;
            }
        }
        if added > 0 {
            info!(
                "[queue] Enqueued {} cell(s), {} pending",
                added,
                self.queue.pending_len()
            );
            self.emit_queue_state();
        }
        self.advance().await;
    }

    /// Dispatch queued cells until one is executing or the queue is empty.
    async fn advance(&mut self) {
        while self.current.is_none() {
            let Some(cell_id) = self.queue.dequeue() else {
                self.settle();
                return;
            };
            self.set_state(CoordinatorState::Running);
            self.emit_queue_state();

            match self.dispatch(&cell_id).await {
                Ok(Some(active)) => {
                    info!("[queue] Executing cell {}", cell_id);
                    self.current = Some(active);
                    self.emit(CoordinatorEvent::CellStarted { cell_id });
                }
                Ok(None) => {
                    debug!("[queue] Skipping cell {} (missing or not code)", cell_id);
                    self.queue.complete(&cell_id);
                    self.emit_queue_state();
                }
                Err(e) => {
                    warn!("[queue] Failed to execute cell {}: {}", cell_id, e);
                    self.queue.complete(&cell_id);
                    self.emit(CoordinatorEvent::CellFinished {
                        cell_id: cell_id.clone(),
                        execution_count: None,
                        success: false,
                    });
                    self.last_finished = Some(cell_id);
                    if self.config.stop_on_error {
                        self.cancel_pending();
                    }
                    self.emit_queue_state();
                }
            }
        }
    }

    /// Nothing left to run: back to idle and move the selection past the
    /// last cell that ran.
    fn settle(&mut self) {
        if *self.state.borrow() == CoordinatorState::Running {
            self.set_state(CoordinatorState::Idle);
            if let Some(last) = &self.last_finished {
                let next = self.document.lock().unwrap().next_cell_id(last);
                self.selected = next.or_else(|| Some(last.clone()));
                self.emit(CoordinatorEvent::Selected {
                    cell_id: self.selected.clone(),
                });
            }
            info!("[queue] Drained");
        }
        self.emit(CoordinatorEvent::Idle);
    }

    /// Start `cell_id`. `Ok(None)` when the cell is gone or is not code.
    async fn dispatch(&self, cell_id: &str) -> Result<Option<ActiveCell>> {
        let source = {
            let mut doc = self.document.lock().unwrap();
            match doc.cell(cell_id) {
                Some(cell) if cell.is_code() => {
                    let source = cell.source_text();
                    doc.clear_cell_outputs(cell_id);
                    source
                }
                _ => return Ok(None),
            }
        };

        let sigil = self.config.shell_escape_sigil.as_str();
        if !sigil.is_empty() {
            if let Some(command) = source.strip_prefix(sigil) {
                return self.dispatch_shell(cell_id, command).map(Some);
            }
        }

        let stream = self.session.execute(&source).await?;
        Ok(Some(ActiveCell {
            cell_id: cell_id.to_string(),
            source: CellSource::Kernel(stream),
            failed: false,
            clear_on_next_output: false,
        }))
    }

    fn dispatch_shell(&self, cell_id: &str, command: &str) -> Result<ActiveCell> {
        let argv = split_command(command.trim())?;
        if argv.is_empty() {
            bail!("empty shell command");
        }
        info!("[coordinator] Cell {} runs shell command {:?}", cell_id, argv);

        let (tx, rx) = mpsc::unbounded_channel();
        let runner = self.runner.clone();
        tokio::spawn(async move {
            let line_tx = tx.clone();
            let mut on_line = move |line: String| {
                let _ = line_tx.send(ShellEvent::Line(line));
            };
            let result = runner.run(&argv, &mut on_line).await;
            let _ = tx.send(ShellEvent::Exited(result.map_err(|e| e.to_string())));
        });

        Ok(ActiveCell {
            cell_id: cell_id.to_string(),
            source: CellSource::Shell(rx),
            failed: false,
            clear_on_next_output: false,
        })
    }

    fn mark_failed(&mut self) {
        if let Some(active) = self.current.as_mut() {
            active.failed = true;
        }
    }

    async fn handle_message(&mut self, message: ProtocolMessage) {
        let finished = message.is_idle();
        let Some(active) = self.current.as_mut() else {
            return;
        };
        let cell_id = active.cell_id.clone();

        {
            let mut doc = self.document.lock().unwrap();
            match message.content {
                ProtocolContent::ExecuteInput {
                    execution_count, ..
                } => {
                    doc.reset_cell_outputs(&cell_id);
                    doc.set_cell_execution_count(&cell_id, execution_count);
                }
                ProtocolContent::Output(output) => {
                    if std::mem::take(&mut active.clear_on_next_output) {
                        doc.clear_cell_output_list(&cell_id);
                    }
                    if output.is_error() {
                        active.failed = true;
                    }
                    match output {
                        Output::Stream { name, text, .. } => {
                            doc.append_cell_stream(&cell_id, &name, &text.text())
                        }
                        output => doc.append_cell_output(&cell_id, output),
                    }
                }
                ProtocolContent::UpdateDisplayData {
                    display_id,
                    data,
                    metadata,
                } => {
                    doc.update_output_by_display_id(&display_id, &data, &metadata);
                }
                ProtocolContent::ClearOutput { wait: true } => {
                    active.clear_on_next_output = true;
                }
                ProtocolContent::ClearOutput { wait: false } => {
                    doc.clear_cell_output_list(&cell_id);
                }
                ProtocolContent::ExecuteReply { status, .. } => {
                    if status != ReplyStatus::Ok {
                        active.failed = true;
                    }
                }
                ProtocolContent::Status(_) | ProtocolContent::Other => {}
            }
        }

        if finished {
            self.finish_current().await;
        }
    }

    async fn handle_shell_event(&mut self, event: ShellEvent) {
        let Some(active) = self.current.as_mut() else {
            return;
        };
        let cell_id = active.cell_id.clone();
        match event {
            ShellEvent::Line(line) => {
                let mut doc = self.document.lock().unwrap();
                doc.append_cell_stream(&cell_id, "stdout", &format!("{}\n", line));
            }
            ShellEvent::Exited(result) => {
                let failure = match result {
                    Ok(0) => None,
                    Ok(code) => Some(format!("command exited with status {}\n", code)),
                    Err(e) => Some(format!("{}\n", e)),
                };
                if let Some(message) = failure {
                    active.failed = true;
                    self.document
                        .lock()
                        .unwrap()
                        .append_cell_stream(&cell_id, "stderr", &message);
                }
                self.finish_current().await;
            }
        }
    }

    async fn finish_current(&mut self) {
        let Some(active) = self.current.take() else {
            return;
        };
        self.queue.complete(&active.cell_id);
        let execution_count = self
            .document
            .lock()
            .unwrap()
            .cell(&active.cell_id)
            .and_then(|c| c.execution_count);
        let success = !active.failed;
        info!(
            "[queue] Cell {} finished (count {:?}, success {})",
            active.cell_id, execution_count, success
        );
        self.emit(CoordinatorEvent::CellFinished {
            cell_id: active.cell_id.clone(),
            execution_count,
            success,
        });
        self.last_finished = Some(active.cell_id);

        if !success && self.config.stop_on_error {
            self.cancel_pending();
        }
        self.emit_queue_state();
        self.advance().await;
    }

    fn cancel_pending(&mut self) {
        let cancelled = self.queue.clear_pending();
        if cancelled.is_empty() {
            return;
        }
        info!("[queue] Cancelled {} pending cell(s)", cancelled.len());
        self.emit(CoordinatorEvent::CellsCancelled {
            cell_ids: cancelled,
        });
        self.emit_queue_state();
    }

    fn close(&mut self) {
        if let Some(active) = self.current.take() {
            // Dropping the stream stops delivery only; the kernel finishes
            // the request on its own.
            info!(
                "[coordinator] Detaching from executing cell {}",
                active.cell_id
            );
            self.queue.complete(&active.cell_id);
        }
        self.cancel_pending();
        self.set_state(CoordinatorState::Idle);
        self.emit(CoordinatorEvent::Closed);
    }
}
