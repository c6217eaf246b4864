//! The seam between a session and whatever carries its messages.

use futures::future::BoxFuture;
use jupyter_server::RunningKernel;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SessionError;
use crate::message::ProtocolMessage;
use crate::session::SessionConfig;

/// Requests a session sends to its kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelRequest {
    /// `msg_id` becomes the header id of the execute request, so every reply
    /// names it as parent.
    Execute { msg_id: String, code: String },
}

/// Open channels to one kernel. `replies` merges everything the kernel sends
/// (shell replies and iopub traffic), already decoded. Undecodable messages
/// never reach it.
pub struct KernelChannels {
    pub requests: mpsc::Sender<KernelRequest>,
    pub replies: mpsc::Receiver<ProtocolMessage>,
    /// Transport tasks, aborted when the session goes away.
    pub tasks: Vec<JoinHandle<()>>,
}

pub trait KernelConnector: Send + Sync {
    /// Open channels to `kernel` and return once they are ready for requests.
    fn connect<'a>(
        &'a self,
        kernel: &'a RunningKernel,
        config: &'a SessionConfig,
    ) -> BoxFuture<'a, Result<KernelChannels, SessionError>>;
}
