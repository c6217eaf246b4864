//! In-memory kernel for tests.
//!
//! Answers execute requests the way an IPython kernel orders its messages:
//! `busy`, `execute_input`, whatever the code produces, `execute_reply`,
//! `idle`. Code can be scripted with [`FakeKernel::script`]; otherwise
//! `a+b` on integers yields an `execute_result` and anything else yields
//! nothing.
//!
//! Like a real connection it runs two tasks: `execute_reply` travels on the
//! shell task, everything else on the iopub task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use jupyter_server::RunningKernel;
use log::warn;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::error::SessionError;
use crate::message::ProtocolMessage;
use crate::session::SessionConfig;
use crate::transport::{KernelChannels, KernelConnector, KernelRequest};

/// One scripted reaction to executed code.
#[derive(Debug, Clone)]
pub enum FakeReply {
    Stream { name: String, text: String },
    Display { text: String, display_id: Option<String> },
    UpdateDisplay { display_id: String, text: String },
    ClearOutput { wait: bool },
    Result { text: String },
    Error { ename: String, evalue: String },
    /// An `idle` from another client's request on the same kernel.
    ForeignIdle,
    /// A raw envelope, delivered as-is (may be malformed).
    Raw(Value),
    Delay(Duration),
    /// End the reply without the closing `idle`.
    Hang,
    /// Lose the iopub channel. Shell keeps running.
    DropIopub,
}

impl FakeReply {
    pub fn stdout(text: &str) -> Self {
        FakeReply::Stream {
            name: "stdout".into(),
            text: text.into(),
        }
    }

    pub fn error(ename: &str, evalue: &str) -> Self {
        FakeReply::Error {
            ename: ename.into(),
            evalue: evalue.into(),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    scripts: HashMap<String, Vec<FakeReply>>,
    executed: Vec<String>,
    execution_count: i64,
    connects: usize,
    unresponsive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeKernel {
    state: Arc<StdMutex<FakeState>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, code: &str, replies: Vec<FakeReply>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(code.to_string(), replies);
    }

    /// Never finish connecting.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state.lock().unwrap().unresponsive = unresponsive;
    }

    /// Code in the order the kernel received it.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    async fn serve(
        self,
        mut requests: mpsc::Receiver<KernelRequest>,
        shell: mpsc::Sender<ProtocolMessage>,
        iopub: mpsc::Sender<IopubItem>,
    ) {
        let mut out = Outbox {
            shell,
            iopub: Some(iopub),
        };
        // The handshake's own busy/idle pair.
        out.send("status", Some("kernel-info"), json!({"execution_state": "busy"})).await;
        out.send("status", Some("kernel-info"), json!({"execution_state": "idle"})).await;

        while let Some(request) = requests.recv().await {
            let KernelRequest::Execute { msg_id, code } = request;
            let (count, script) = {
                let mut state = self.state.lock().unwrap();
                state.executed.push(code.clone());
                state.execution_count += 1;
                (state.execution_count, state.scripts.get(&code).cloned())
            };
            let parent = Some(msg_id.as_str());
            let replies = script.unwrap_or_else(|| evaluate(&code));

            out.send("status", parent, json!({"execution_state": "busy"})).await;
            out.send("execute_input", parent, json!({"code": code, "execution_count": count}))
                .await;

            let mut failed = false;
            let mut hang = false;
            for reply in replies {
                match reply {
                    FakeReply::Stream { name, text } => {
                        out.send("stream", parent, json!({"name": name, "text": text})).await
                    }
                    FakeReply::Display { text, display_id } => {
                        let mut content = json!({"data": {"text/plain": text}, "metadata": {}});
                        if let Some(id) = display_id {
                            content["transient"] = json!({"display_id": id});
                        }
                        out.send("display_data", parent, content).await
                    }
                    FakeReply::UpdateDisplay { display_id, text } => {
                        out.send(
                            "update_display_data",
                            parent,
                            json!({
                                "data": {"text/plain": text},
                                "metadata": {},
                                "transient": {"display_id": display_id}
                            }),
                        )
                        .await
                    }
                    FakeReply::ClearOutput { wait } => {
                        out.send("clear_output", parent, json!({"wait": wait})).await
                    }
                    FakeReply::Result { text } => {
                        out.send(
                            "execute_result",
                            parent,
                            json!({
                                "data": {"text/plain": text},
                                "metadata": {},
                                "execution_count": count
                            }),
                        )
                        .await
                    }
                    FakeReply::Error { ename, evalue } => {
                        failed = true;
                        out.send(
                            "error",
                            parent,
                            json!({
                                "ename": ename,
                                "evalue": evalue,
                                "traceback": [format!("{}: {}", ename, evalue)]
                            }),
                        )
                        .await
                    }
                    FakeReply::ForeignIdle => {
                        out.send("status", Some("other-console"), json!({"execution_state": "idle"}))
                            .await
                    }
                    FakeReply::Raw(envelope) => out.deliver(&envelope).await,
                    FakeReply::Delay(duration) => tokio::time::sleep(duration).await,
                    FakeReply::Hang => hang = true,
                    FakeReply::DropIopub => out.iopub = None,
                }
            }
            if hang {
                continue;
            }

            let status = if failed { "error" } else { "ok" };
            out.send("execute_reply", parent, json!({"status": status, "execution_count": count}))
                .await;
            out.send("status", parent, json!({"execution_state": "idle"})).await;
        }
    }
}

/// Integer `a+b`, so `1+1` answers `2` without a script.
fn evaluate(code: &str) -> Vec<FakeReply> {
    let sum = code
        .split_once('+')
        .and_then(|(a, b)| Some(a.trim().parse::<i64>().ok()? + b.trim().parse::<i64>().ok()?));
    match sum {
        Some(sum) => vec![FakeReply::Result {
            text: sum.to_string(),
        }],
        None => Vec::new(),
    }
}

enum IopubItem {
    Message(ProtocolMessage),
    /// Acknowledged once everything queued before it has been forwarded.
    Flush(oneshot::Sender<()>),
}

struct Outbox {
    shell: mpsc::Sender<ProtocolMessage>,
    iopub: Option<mpsc::Sender<IopubItem>>,
}

impl Outbox {
    async fn send(&self, msg_type: &str, parent: Option<&str>, content: Value) {
        let envelope = json!({
            "header": {"msg_id": uuid::Uuid::new_v4().to_string(), "msg_type": msg_type},
            "parent_header": parent.map(|p| json!({"msg_id": p})).unwrap_or_else(|| json!({})),
            "content": content,
        });
        self.deliver(&envelope).await;
    }

    async fn deliver(&self, envelope: &Value) {
        let message = match ProtocolMessage::from_envelope(envelope) {
            Ok(message) => message,
            Err(e) => {
                warn!("[kernel-session] Dropping message: {}", e);
                return;
            }
        };
        if message.msg_type == "execute_reply" {
            // Keep the kernel's publish order: iopub output first.
            if let Some(iopub) = &self.iopub {
                let (ack, flushed) = oneshot::channel();
                if iopub.send(IopubItem::Flush(ack)).await.is_ok() {
                    let _ = flushed.await;
                }
            }
            let _ = self.shell.send(message).await;
        } else if let Some(iopub) = &self.iopub {
            let _ = iopub.send(IopubItem::Message(message)).await;
        }
    }
}

impl KernelConnector for FakeKernel {
    fn connect<'a>(
        &'a self,
        _kernel: &'a RunningKernel,
        _config: &'a SessionConfig,
    ) -> BoxFuture<'a, Result<KernelChannels, SessionError>> {
        Box::pin(async move {
            let unresponsive = {
                let mut state = self.state.lock().unwrap();
                state.connects += 1;
                state.unresponsive
            };
            if unresponsive {
                futures::future::pending::<()>().await;
            }

            let (request_tx, request_rx) = mpsc::channel(100);
            let (reply_tx, reply_rx) = mpsc::channel(256);
            let (iopub_tx, mut iopub_rx) = mpsc::channel::<IopubItem>(256);

            let iopub_out = reply_tx.clone();
            let iopub_task = tokio::spawn(async move {
                while let Some(item) = iopub_rx.recv().await {
                    match item {
                        IopubItem::Message(message) => {
                            if iopub_out.send(message).await.is_err() {
                                break;
                            }
                        }
                        IopubItem::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            });
            let shell_task = tokio::spawn(self.clone().serve(request_rx, reply_tx, iopub_tx));
            Ok(KernelChannels {
                requests: request_tx,
                replies: reply_rx,
                tasks: vec![shell_task, iopub_task],
            })
        })
    }
}
