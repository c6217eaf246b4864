//! Client side of one running Jupyter kernel.
//!
//! [`KernelSession`] turns code into an [`ExecutionStream`] of decoded
//! [`ProtocolMessage`]s and tracks the kernel's status. The transport behind
//! it is a [`KernelConnector`]: [`ZmqConnector`] for real kernels, or the
//! in-memory fake under the `fake-kernel` feature.

pub mod error;
#[cfg(any(test, feature = "fake-kernel"))]
pub mod fake;
pub mod message;
pub mod session;
pub mod transport;
pub mod zmq;

pub use error::SessionError;
pub use message::{ProtocolContent, ProtocolMessage, ReplyStatus};
pub use session::{ExecutionStream, KernelSession, SessionConfig};
pub use transport::{KernelChannels, KernelConnector, KernelRequest};
pub use zmq::{connect_zmq, ZmqConnector};
