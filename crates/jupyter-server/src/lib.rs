//! Jupyter server discovery, launch and REST control plane.
//!
//! [`ServerController`] owns the server's lifetime and the local registry of
//! [`RunningKernel`] handles; [`ControlPlane`] is the plain REST client it
//! drives.

pub mod api;
pub mod config;
pub mod control_plane;
pub mod controller;
pub mod discovery;
pub mod error;
#[cfg(any(test, feature = "fake-server"))]
pub mod fake;
pub mod launch;
pub mod registry;

pub use api::{
    ContentsModel, InterruptMode, KernelConnection, KernelModel, KernelSpec, KernelSpecs,
    KernelStatus, RunningKernel, ServerAddress, SessionModel,
};
pub use config::ServerConfig;
pub use control_plane::ControlPlane;
pub use controller::{KernelStatusSink, ServerController, ServerEvent, ServerState};
pub use error::ServerError;
pub use registry::{connection_file_path, KernelRegistry, ReconcileOutcome};
