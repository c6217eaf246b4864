//! Client for one running kernel.
//!
//! Channels are opened lazily by the first request (or [`KernelSession::ready`]).
//! A pump task reads every decoded message, tracks kernel status, and routes
//! messages to the [`ExecutionStream`] whose request they answer. A stream
//! ends on the `status: idle` whose parent is its own request; idle states
//! caused by other clients of the same kernel do not end it.
//!
//! When any transport task exits, the rest are aborted, the pump drains and
//! the session is marked `Dead`. A dead session refuses new executions.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use jupyter_server::{KernelStatus, RunningKernel};
use log::{debug, info, warn};
use notebook_doc::Output;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::error::SessionError;
use crate::message::{ProtocolContent, ProtocolMessage};
use crate::transport::{KernelChannels, KernelConnector, KernelRequest};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on waiting for the kernel's channels to become ready.
    pub readiness_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct RouteTable {
    streams: HashMap<String, mpsc::UnboundedSender<ProtocolMessage>>,
    /// Set once the channels are gone. Nothing is routed after that.
    closed: bool,
}

type Routes = Arc<StdMutex<RouteTable>>;

struct OpenChannels {
    requests: mpsc::Sender<KernelRequest>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    kernel: RunningKernel,
    connector: Arc<dyn KernelConnector>,
    config: SessionConfig,
    status: Arc<watch::Sender<KernelStatus>>,
    routes: Routes,
    channels: OnceCell<OpenChannels>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(open) = self.channels.get() {
            for task in &open.tasks {
                task.abort();
            }
        }
    }
}

/// Shared handle to one kernel. Clones talk to the same channels.
#[derive(Clone)]
pub struct KernelSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSession")
            .field("kernel_id", &self.inner.kernel.kernel_id)
            .field("status", &self.status())
            .finish()
    }
}

impl KernelSession {
    pub fn new(
        kernel: RunningKernel,
        connector: Arc<dyn KernelConnector>,
        config: SessionConfig,
    ) -> Self {
        let (status, _) = watch::channel(kernel.status);
        KernelSession {
            inner: Arc::new(Inner {
                kernel,
                connector,
                config,
                status: Arc::new(status),
                routes: Arc::new(StdMutex::new(RouteTable::default())),
                channels: OnceCell::new(),
            }),
        }
    }

    pub fn kernel_id(&self) -> &str {
        &self.inner.kernel.kernel_id
    }

    pub fn kernel(&self) -> &RunningKernel {
        &self.inner.kernel
    }

    pub fn status(&self) -> KernelStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<KernelStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.inner.channels.initialized()
    }

    /// Executions whose idle has not arrived yet.
    pub fn in_flight(&self) -> usize {
        self.inner.routes.lock().unwrap().streams.len()
    }

    /// Open the kernel's channels if they are not open yet.
    pub async fn ready(&self) -> Result<(), SessionError> {
        self.open().await.map(|_| ())
    }

    async fn open(&self) -> Result<&OpenChannels, SessionError> {
        self.inner
            .channels
            .get_or_try_init(|| async {
                let kernel = &self.inner.kernel;
                check_address(kernel)?;

                let timeout = self.inner.config.readiness_timeout;
                let channels = tokio::time::timeout(
                    timeout,
                    self.inner.connector.connect(kernel, &self.inner.config),
                )
                .await
                .map_err(|_| {
                    warn!(
                        "[kernel-session] Kernel {} not ready within {:?}",
                        kernel.kernel_id, timeout
                    );
                    SessionError::KernelUnavailable(format!(
                        "kernel {} not ready within {:?}",
                        kernel.kernel_id, timeout
                    ))
                })??;

                info!("[kernel-session] Connected to kernel {}", kernel.kernel_id);
                Ok::<_, SessionError>(self.start_pump(channels))
            })
            .await
    }

    fn start_pump(&self, channels: KernelChannels) -> OpenChannels {
        let KernelChannels {
            requests,
            replies,
            tasks: transport,
        } = channels;
        let mut tasks = Vec::new();
        if !transport.is_empty() {
            tasks.push(supervise(self.inner.kernel.kernel_id.clone(), transport));
        }
        tasks.push(tokio::spawn(pump(
            self.inner.kernel.kernel_id.clone(),
            replies,
            self.inner.routes.clone(),
            self.inner.status.clone(),
        )));
        OpenChannels { requests, tasks }
    }

    /// Submit `code` and return the stream of messages answering it.
    ///
    /// The route for the request is registered before the request is sent,
    /// so no reply can arrive unrouted.
    pub async fn execute(&self, code: &str) -> Result<ExecutionStream, SessionError> {
        let open = self.open().await?;
        let kernel_id = &self.inner.kernel.kernel_id;
        if self.status() == KernelStatus::Dead {
            return Err(SessionError::KernelUnavailable(format!(
                "kernel {} is dead",
                kernel_id
            )));
        }

        let msg_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.inner.routes.lock().unwrap();
            if routes.closed {
                return Err(SessionError::KernelUnavailable(format!(
                    "channels to kernel {} are closed",
                    kernel_id
                )));
            }
            routes.streams.insert(msg_id.clone(), tx);
        }

        let request = KernelRequest::Execute {
            msg_id: msg_id.clone(),
            code: code.to_string(),
        };
        if open.requests.send(request).await.is_err() {
            self.inner.routes.lock().unwrap().streams.remove(&msg_id);
            return Err(SessionError::ChannelClosed);
        }
        debug!(
            "[kernel-session] execute msg_id={} on kernel {}",
            msg_id, kernel_id
        );

        Ok(ExecutionStream {
            msg_id,
            rx,
            routes: self.inner.routes.clone(),
        })
    }
}

/// A request needs a server address with a token and a connection file.
fn check_address(kernel: &RunningKernel) -> Result<(), SessionError> {
    if kernel.connection.server.token().is_empty() {
        return Err(SessionError::KernelUnavailable(format!(
            "no token for kernel {}",
            kernel.kernel_id
        )));
    }
    if kernel.connection.connection_file.as_os_str().is_empty() {
        return Err(SessionError::KernelUnavailable(format!(
            "no connection for kernel {}",
            kernel.kernel_id
        )));
    }
    Ok(())
}

/// Aborts the tasks it holds when dropped.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Wait for the first transport task to exit, then abort the others. Their
/// reply senders go with them, which ends the pump.
fn supervise(kernel_id: String, tasks: Vec<JoinHandle<()>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _abort = AbortOnDrop(tasks.iter().map(JoinHandle::abort_handle).collect());
        let (_, index, _) = futures::future::select_all(tasks).await;
        warn!(
            "[kernel-session] Transport task {} for kernel {} exited, closing channels",
            index, kernel_id
        );
    })
}

async fn pump(
    kernel_id: String,
    mut replies: mpsc::Receiver<ProtocolMessage>,
    routes: Routes,
    status: Arc<watch::Sender<KernelStatus>>,
) {
    while let Some(message) = replies.recv().await {
        if let Some(state) = message.status() {
            if state != KernelStatus::Unknown {
                status.send_if_modified(|current| {
                    let changed = *current != state;
                    *current = state;
                    changed
                });
            }
        }

        let Some(parent) = message.parent_msg_id.clone() else {
            continue;
        };
        let is_idle = message.is_idle();

        let mut routes = routes.lock().unwrap();
        let Some(route) = routes.streams.get(&parent) else {
            continue;
        };
        if route.send(message).is_err() {
            debug!("[kernel-session] Stream for {} dropped, unrouting", parent);
            routes.streams.remove(&parent);
        } else if is_idle {
            routes.streams.remove(&parent);
        }
    }

    warn!("[kernel-session] Channels to kernel {} closed", kernel_id);
    {
        let mut routes = routes.lock().unwrap();
        routes.closed = true;
        // Dropping the senders ends every open stream.
        routes.streams.clear();
    }
    status.send_replace(KernelStatus::Dead);
}

/// Messages answering one execute request, ending with its `status: idle`.
///
/// Dropping the stream stops delivery; the kernel still finishes the request.
pub struct ExecutionStream {
    msg_id: String,
    rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    routes: Routes,
}

impl std::fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStream")
            .field("msg_id", &self.msg_id)
            .finish_non_exhaustive()
    }
}

impl ExecutionStream {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        self.rx.recv().await
    }

    /// Drain the stream, keeping only outputs.
    pub async fn outputs(mut self) -> Vec<Output> {
        let mut outputs = Vec::new();
        while let Some(message) = self.recv().await {
            if let ProtocolContent::Output(output) = message.content {
                outputs.push(output);
            }
        }
        outputs
    }
}

impl Stream for ExecutionStream {
    type Item = ProtocolMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ExecutionStream {
    fn drop(&mut self) {
        self.routes.lock().unwrap().streams.remove(&self.msg_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeKernel, FakeReply};
    use futures::future::BoxFuture;
    use futures::StreamExt;
    use jupyter_server::{KernelConnection, ServerAddress};
    use serde_json::json;

    fn kernel_with_token(token: &str) -> RunningKernel {
        RunningKernel {
            kernel_id: "k1".into(),
            name: "python3".into(),
            language: "python".into(),
            status: KernelStatus::Starting,
            connection: KernelConnection {
                server: ServerAddress::new("http://127.0.0.1:8888/", token).unwrap(),
                connection_file: "/tmp/kernel-k1.json".into(),
            },
        }
    }

    fn session(fake: &FakeKernel) -> KernelSession {
        KernelSession::new(
            kernel_with_token("tok"),
            Arc::new(fake.clone()),
            SessionConfig::default(),
        )
    }

    async fn collect(stream: ExecutionStream) -> Vec<ProtocolMessage> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_status_starting_then_idle_after_first_status() {
        let fake = FakeKernel::new();
        let session = session(&fake);
        assert_eq!(session.status(), KernelStatus::Starting);

        let mut status = session.watch_status();
        session.ready().await.unwrap();
        status
            .wait_for(|s| *s == KernelStatus::Idle)
            .await
            .unwrap();
        assert_eq!(session.status(), KernelStatus::Idle);
    }

    #[tokio::test]
    async fn test_execute_one_plus_one() {
        let fake = FakeKernel::new();
        let session = session(&fake);

        let stream = session.execute("1+1").await.unwrap();
        let msg_id = stream.msg_id().to_string();
        let messages = collect(stream).await;

        let types: Vec<&str> = messages.iter().map(|m| m.msg_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["status", "execute_input", "execute_result", "execute_reply", "status"]
        );
        assert!(messages.iter().all(|m| m.is_reply_to(&msg_id)));
        assert!(messages.last().unwrap().is_idle());

        let result = messages
            .iter()
            .find_map(|m| match &m.content {
                ProtocolContent::Output(output @ Output::ExecuteResult { .. }) => Some(output),
                _ => None,
            })
            .unwrap();
        match result {
            Output::ExecuteResult {
                data,
                execution_count,
                ..
            } => {
                assert_eq!(*execution_count, Some(1));
                assert_eq!(data.get("text/plain"), Some(&json!("2")));
            }
            _ => unreachable!(),
        }
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_foreign_idle_does_not_end_stream() {
        let fake = FakeKernel::new();
        fake.script(
            "work()",
            vec![
                FakeReply::stdout("before\n"),
                FakeReply::ForeignIdle,
                FakeReply::stdout("after\n"),
            ],
        );
        let session = session(&fake);

        let outputs = session.execute("work()").await.unwrap().outputs().await;
        assert_eq!(
            outputs,
            vec![Output::stream("stdout", "before\n"), Output::stream("stdout", "after\n")]
        );
    }

    #[tokio::test]
    async fn test_execution_counts_increase_and_channels_open_once() {
        let fake = FakeKernel::new();
        let session = session(&fake);

        for expected in 1..=3 {
            let mut stream = session.execute("x = 1").await.unwrap();
            let mut count = None;
            while let Some(message) = stream.recv().await {
                if let ProtocolContent::ExecuteInput {
                    execution_count, ..
                } = message.content
                {
                    count = Some(execution_count);
                }
            }
            assert_eq!(count, Some(expected));
        }
        assert_eq!(fake.connects(), 1);
        assert_eq!(fake.executed(), vec!["x = 1"; 3]);
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected_locally() {
        let fake = FakeKernel::new();
        let session = KernelSession::new(
            kernel_with_token(""),
            Arc::new(fake.clone()),
            SessionConfig::default(),
        );
        let err = session.execute("1+1").await.unwrap_err();
        assert!(matches!(err, SessionError::KernelUnavailable(_)));
        assert_eq!(fake.connects(), 0);
    }

    #[tokio::test]
    async fn test_readiness_wait_is_bounded() {
        let fake = FakeKernel::new();
        fake.set_unresponsive(true);
        let session = KernelSession::new(
            kernel_with_token("tok"),
            Arc::new(fake.clone()),
            SessionConfig {
                readiness_timeout: Duration::from_millis(100),
            },
        );
        let err = session.execute("1+1").await.unwrap_err();
        assert!(matches!(err, SessionError::KernelUnavailable(_)));
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_malformed_messages_are_dropped() {
        let fake = FakeKernel::new();
        fake.script(
            "show()",
            vec![
                FakeReply::Raw(json!({
                    "header": {"msg_id": "bad", "msg_type": "display_data"},
                    "parent_header": {},
                    "content": {"metadata": {}}
                })),
                FakeReply::Result { text: "'ok'".into() },
            ],
        );
        let session = session(&fake);
        let outputs = session.execute("show()").await.unwrap().outputs().await;
        assert_eq!(outputs.len(), 1);
        assert!(matches!(outputs[0], Output::ExecuteResult { .. }));
    }

    #[tokio::test]
    async fn test_dropping_stream_unroutes() {
        let fake = FakeKernel::new();
        fake.script("forever()", vec![FakeReply::Hang]);
        let session = session(&fake);

        let stream = session.execute("forever()").await.unwrap();
        assert_eq!(session.in_flight(), 1);
        drop(stream);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_lost_iopub_ends_stream_and_kernel_is_dead() {
        let fake = FakeKernel::new();
        fake.script(
            "work()",
            vec![FakeReply::stdout("partial\n"), FakeReply::DropIopub],
        );
        let session = session(&fake);

        let stream = session.execute("work()").await.unwrap();
        let outputs = tokio::time::timeout(Duration::from_secs(5), stream.outputs())
            .await
            .expect("stream should end when iopub is lost");
        assert_eq!(outputs, vec![Output::stream("stdout", "partial\n")]);

        let mut status = session.watch_status();
        status.wait_for(|s| *s == KernelStatus::Dead).await.unwrap();
        assert_eq!(session.in_flight(), 0);

        let err = session.execute("1+1").await.unwrap_err();
        assert!(matches!(err, SessionError::KernelUnavailable(_)));
        assert_eq!(fake.executed(), vec!["work()"]);
    }

    /// Hands the test both ends of the kernel's channels.
    #[derive(Default)]
    struct ManualConnector {
        ends: StdMutex<Option<(mpsc::Receiver<KernelRequest>, mpsc::Sender<ProtocolMessage>)>>,
    }

    impl KernelConnector for ManualConnector {
        fn connect<'a>(
            &'a self,
            _kernel: &'a RunningKernel,
            _config: &'a SessionConfig,
        ) -> BoxFuture<'a, Result<KernelChannels, SessionError>> {
            Box::pin(async move {
                let (request_tx, request_rx) = mpsc::channel(8);
                let (reply_tx, reply_rx) = mpsc::channel(8);
                *self.ends.lock().unwrap() = Some((request_rx, reply_tx));
                Ok(KernelChannels {
                    requests: request_tx,
                    replies: reply_rx,
                    tasks: Vec::new(),
                })
            })
        }
    }

    fn reply(msg_type: &str, parent: &str, content: serde_json::Value) -> ProtocolMessage {
        ProtocolMessage::decode("m", msg_type, Some(parent.to_string()), &content).unwrap()
    }

    #[tokio::test]
    async fn test_interleaved_executions_are_routed_by_parent() {
        let connector = Arc::new(ManualConnector::default());
        let session = KernelSession::new(
            kernel_with_token("tok"),
            connector.clone(),
            SessionConfig::default(),
        );

        let mut first = session.execute("a").await.unwrap();
        let mut second = session.execute("b").await.unwrap();
        let (mut requests, replies) = connector.ends.lock().unwrap().take().unwrap();

        let KernelRequest::Execute { msg_id: a, .. } = requests.recv().await.unwrap();
        let KernelRequest::Execute { msg_id: b, .. } = requests.recv().await.unwrap();
        assert_eq!(a, first.msg_id());
        assert_eq!(b, second.msg_id());

        replies
            .send(reply("stream", &b, json!({"name": "stdout", "text": "from b"})))
            .await
            .unwrap();
        replies
            .send(reply("status", &b, json!({"execution_state": "idle"})))
            .await
            .unwrap();
        replies
            .send(reply("stream", &a, json!({"name": "stdout", "text": "from a"})))
            .await
            .unwrap();

        let msg = second.recv().await.unwrap();
        assert!(matches!(msg.content, ProtocolContent::Output(_)));
        assert!(second.recv().await.unwrap().is_idle());
        assert!(second.recv().await.is_none());

        let msg = first.recv().await.unwrap();
        assert!(msg.is_reply_to(&a));
        assert_eq!(session.in_flight(), 1);

        // Channel loss ends the open stream and marks the kernel dead.
        drop(replies);
        assert!(first.recv().await.is_none());
        let mut status = session.watch_status();
        status.wait_for(|s| *s == KernelStatus::Dead).await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_after_channels_close_is_refused() {
        let connector = Arc::new(ManualConnector::default());
        let session = KernelSession::new(
            kernel_with_token("tok"),
            connector.clone(),
            SessionConfig::default(),
        );
        session.ready().await.unwrap();
        let (_requests, replies) = connector.ends.lock().unwrap().take().unwrap();

        drop(replies);
        let mut status = session.watch_status();
        status.wait_for(|s| *s == KernelStatus::Dead).await.unwrap();

        let err = session.execute("1+1").await.unwrap_err();
        assert!(matches!(err, SessionError::KernelUnavailable(_)));
        assert!(session.is_open());
        assert_eq!(session.in_flight(), 0);
    }
}
