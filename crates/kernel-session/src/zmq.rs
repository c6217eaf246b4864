//! ZeroMQ transport: the kernel's own shell and iopub sockets, reached
//! through the connection file the server wrote for it.

use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use jupyter_protocol::{ConnectionInfo, ExecuteRequest, JupyterMessage, KernelInfoRequest};
use jupyter_server::RunningKernel;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::SessionError;
use crate::message::ProtocolMessage;
use crate::session::SessionConfig;
use crate::transport::{KernelChannels, KernelConnector, KernelRequest};

const CONNECTION_FILE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default)]
pub struct ZmqConnector;

impl KernelConnector for ZmqConnector {
    fn connect<'a>(
        &'a self,
        kernel: &'a RunningKernel,
        config: &'a SessionConfig,
    ) -> BoxFuture<'a, Result<KernelChannels, SessionError>> {
        Box::pin(connect_zmq(kernel, config))
    }
}

/// Wait for the server to write the kernel's connection file, then read it.
async fn read_connection_info(
    path: &Path,
    deadline: Instant,
) -> Result<ConnectionInfo, SessionError> {
    loop {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                return serde_json::from_str::<ConnectionInfo>(&content).map_err(|e| {
                    SessionError::KernelUnavailable(format!(
                        "unreadable connection file {}: {}",
                        path.display(),
                        e
                    ))
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && Instant::now() < deadline => {
                tokio::time::sleep(CONNECTION_FILE_POLL).await;
            }
            Err(e) => {
                return Err(SessionError::KernelUnavailable(format!(
                    "connection file {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}

async fn check_heartbeat(connection_info: &ConnectionInfo, timeout: Duration) -> bool {
    let result = tokio::time::timeout(timeout, async {
        let mut hb = runtimelib::create_client_heartbeat_connection(connection_info).await?;
        hb.single_heartbeat().await
    })
    .await;
    matches!(result, Ok(Ok(())))
}

/// Connect iopub first so nothing the kernel publishes in reply to our
/// requests is missed, then shell, then confirm the kernel answers a
/// `kernel_info_request`.
pub async fn connect_zmq(
    kernel: &RunningKernel,
    config: &SessionConfig,
) -> Result<KernelChannels, SessionError> {
    let deadline = Instant::now() + config.readiness_timeout;
    let connection_info = read_connection_info(&kernel.connection.connection_file, deadline).await?;

    let remaining = deadline.saturating_duration_since(Instant::now());
    if !check_heartbeat(&connection_info, remaining).await {
        return Err(SessionError::KernelUnavailable(format!(
            "kernel {} did not answer heartbeat",
            kernel.kernel_id
        )));
    }

    let session_id = Uuid::new_v4().to_string();
    let mut iopub =
        runtimelib::create_client_iopub_connection(&connection_info, "", &session_id)
            .await
            .map_err(SessionError::connection)?;

    let identity =
        runtimelib::peer_identity_for_session(&session_id).map_err(SessionError::connection)?;
    let mut shell =
        runtimelib::create_client_shell_connection_with_identity(&connection_info, &session_id, identity)
            .await
            .map_err(SessionError::connection)?;

    let request: JupyterMessage = KernelInfoRequest::default().into();
    shell.send(request).await.map_err(SessionError::connection)?;

    let remaining = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout(remaining, shell.read()).await {
        Ok(Ok(msg)) => {
            info!(
                "[kernel-session] Kernel {} alive: got {}",
                kernel.kernel_id, msg.header.msg_type
            );
        }
        Ok(Err(e)) => {
            error!("[kernel-session] Error reading kernel_info_reply: {}", e);
            return Err(SessionError::KernelUnavailable(format!(
                "kernel did not respond: {}",
                e
            )));
        }
        Err(_) => {
            error!("[kernel-session] Timeout waiting for kernel_info_reply");
            return Err(SessionError::KernelUnavailable(format!(
                "kernel did not respond within {:?}",
                config.readiness_timeout
            )));
        }
    }

    let (mut shell_writer, mut shell_reader) = shell.split();
    let (request_tx, mut request_rx) = mpsc::channel::<KernelRequest>(100);
    let (reply_tx, reply_rx) = mpsc::channel::<ProtocolMessage>(256);

    let kernel_id = kernel.kernel_id.clone();
    let iopub_tx = reply_tx.clone();
    let iopub_task = tokio::spawn(async move {
        loop {
            match iopub.read().await {
                Ok(message) => {
                    debug!(
                        "[kernel-session] iopub: type={} parent_msg_id={:?}",
                        message.header.msg_type,
                        message.parent_header.as_ref().map(|h| &h.msg_id)
                    );
                    if !forward(&iopub_tx, &message).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("[kernel-session] iopub read failed for {}: {}", kernel_id, e);
                    break;
                }
            }
        }
    });

    let shell_reader_task = tokio::spawn(async move {
        while let Ok(message) = shell_reader.read().await {
            if !forward(&reply_tx, &message).await {
                break;
            }
        }
    });

    let shell_writer_task = tokio::spawn(async move {
        while let Some(request) = request_rx.recv().await {
            match request {
                KernelRequest::Execute { msg_id, code } => {
                    let mut message: JupyterMessage = ExecuteRequest::new(code).into();
                    message.header.msg_id = msg_id.clone();
                    if let Err(e) = shell_writer.send(message).await {
                        error!("[kernel-session] Failed to send execute_request {}: {}", msg_id, e);
                    } else {
                        debug!("[kernel-session] Sent execute_request: msg_id={}", msg_id);
                    }
                }
            }
        }
    });

    Ok(KernelChannels {
        requests: request_tx,
        replies: reply_rx,
        tasks: vec![iopub_task, shell_reader_task, shell_writer_task],
    })
}

/// Decode and pass on one message. Malformed messages are dropped. Returns
/// false once the session side has gone away.
async fn forward(tx: &mpsc::Sender<ProtocolMessage>, message: &JupyterMessage) -> bool {
    match ProtocolMessage::from_jupyter(message) {
        Ok(decoded) => tx.send(decoded).await.is_ok(),
        Err(e) => {
            warn!("[kernel-session] Dropping message: {}", e);
            true
        }
    }
}
