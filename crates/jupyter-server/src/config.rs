use std::path::PathBuf;
use std::time::Duration;

pub const MIN_RECONCILE_INTERVAL: Duration = Duration::from_millis(500);
pub const MAX_RECONCILE_INTERVAL: Duration = Duration::from_secs(3);

/// Settings for finding, launching and talking to a Jupyter server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Program used to launch a server when none is running.
    pub command: String,
    pub args: Vec<String>,
    /// Working directory for a launched server (its contents root).
    pub working_dir: Option<PathBuf>,
    /// Jupyter runtime directory holding server-info and kernel connection files.
    pub runtime_dir: PathBuf,
    /// Deadline applied to every control-plane request.
    pub request_timeout: Duration,
    /// Period of the kernel reconciliation sweep.
    pub reconcile_interval: Duration,
    /// How long a launched server may take to print its URL.
    pub startup_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "jupyter".to_string(),
            args: vec!["server".to_string(), "--no-browser".to_string()],
            working_dir: None,
            runtime_dir: runtimelib::dirs::runtime_dir(),
            request_timeout: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        self.reconcile_interval
            .clamp(MIN_RECONCILE_INTERVAL, MAX_RECONCILE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_interval_is_clamped() {
        let mut config = ServerConfig {
            reconcile_interval: Duration::from_millis(10),
            ..Default::default()
        };
        assert_eq!(config.reconcile_interval(), MIN_RECONCILE_INTERVAL);

        config.reconcile_interval = Duration::from_secs(60);
        assert_eq!(config.reconcile_interval(), MAX_RECONCILE_INTERVAL);

        config.reconcile_interval = Duration::from_secs(2);
        assert_eq!(config.reconcile_interval(), Duration::from_secs(2));
    }
}
