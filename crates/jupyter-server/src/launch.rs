//! Launching a Jupyter server process and reading its address from output.

use std::process::Stdio;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::api::ServerAddress;
use crate::config::ServerConfig;
use crate::discovery::parse_server_url;
use crate::error::ServerError;

/// A server process this controller started and therefore owns.
#[derive(Debug)]
pub struct LaunchedServer {
    pub address: ServerAddress,
    pub child: Child,
    pub process_group_id: Option<i32>,
}

/// Forward every line of `stream` to `tx`, and keep draining after the
/// receiver is gone so the child never blocks on a full pipe.
fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !tx.is_closed() {
                let _ = tx.send(line).await;
            } else {
                debug!("[server] {}", line);
            }
        }
    });
}

/// Spawn the configured server command and wait for the first output line
/// carrying a URL with a token.
///
/// If the output ends or the startup deadline passes first, the process is
/// killed and `ServerUnavailable` is returned. No retry.
pub async fn launch(config: &ServerConfig) -> Result<LaunchedServer, ServerError> {
    info!(
        "[server] Launching {} {}",
        config.command,
        config.args.join(" ")
    );

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| ServerError::ServerUnavailable(format!("failed to spawn {}: {}", config.command, e)))?;

    #[cfg(unix)]
    let process_group_id = child.id().map(|pid| pid as i32);
    #[cfg(not(unix))]
    let process_group_id = None;

    let (tx, mut rx) = mpsc::channel::<String>(64);
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx.clone());
    }
    drop(tx);

    let found = tokio::time::timeout(config.startup_timeout, async {
        while let Some(line) = rx.recv().await {
            debug!("[server] launch output: {}", line);
            if let Some(address) = parse_server_url(&line) {
                return Some(address);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(address)) => {
            info!("[server] Server listening at {}", address);
            Ok(LaunchedServer {
                address,
                child,
                process_group_id,
            })
        }
        Ok(None) => {
            warn!("[server] Server output ended without an address");
            let _ = child.kill().await;
            Err(ServerError::ServerUnavailable(
                "server exited without reporting its URL".into(),
            ))
        }
        Err(_) => {
            warn!(
                "[server] No server address within {:?}",
                config.startup_timeout
            );
            let _ = child.kill().await;
            Err(ServerError::ServerUnavailable(format!(
                "no server URL within {:?}",
                config.startup_timeout
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> ServerConfig {
        ServerConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            startup_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_launch_reads_address_from_stderr() {
        let config = sh("echo 'starting' ; echo '    http://127.0.0.1:8899/lab?token=abc' 1>&2 ; sleep 5");
        let mut server = launch(&config).await.unwrap();
        assert_eq!(server.address.base_url().as_str(), "http://127.0.0.1:8899/");
        assert_eq!(server.address.token(), "abc");
        let _ = server.child.kill().await;
    }

    #[tokio::test]
    async fn test_launch_fails_when_output_ends() {
        let err = launch(&sh("echo 'no url here'")).await.unwrap_err();
        assert!(matches!(err, ServerError::ServerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_launch_fails_for_missing_command() {
        let config = ServerConfig {
            command: "definitely-not-a-jupyter-binary".into(),
            ..Default::default()
        };
        let err = launch(&config).await.unwrap_err();
        assert!(matches!(err, ServerError::ServerUnavailable(_)));
    }
}
