//! Shell-escaped cells: `!ls -la` runs `ls -la` as a local process.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Runs an external command, handing each line of its output to `on_line`
/// as it arrives. Resolves to the exit code.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        argv: &'a [String],
        on_line: &'a mut (dyn FnMut(String) + Send),
    ) -> BoxFuture<'a, Result<i32>>;
}

/// Runs commands as child processes. stdout and stderr are interleaved in
/// arrival order.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    pub working_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self { working_dir }
    }
}

fn pipe_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

impl CommandRunner for ProcessRunner {
    fn run<'a>(
        &'a self,
        argv: &'a [String],
        on_line: &'a mut (dyn FnMut(String) + Send),
    ) -> BoxFuture<'a, Result<i32>> {
        Box::pin(async move {
            let (program, args) = argv
                .split_first()
                .ok_or_else(|| anyhow!("empty command"))?;

            let mut command = tokio::process::Command::new(program);
            command
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = &self.working_dir {
                command.current_dir(dir);
            }

            info!("[shell] Running {:?}", argv);
            let mut child = command
                .spawn()
                .map_err(|e| anyhow!("Failed to spawn {}: {}", program, e))?;

            let (tx, mut rx) = mpsc::unbounded_channel();
            if let Some(stdout) = child.stdout.take() {
                pipe_lines(stdout, tx.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                pipe_lines(stderr, tx);
            }
            while let Some(line) = rx.recv().await {
                on_line(line);
            }

            let status = child
                .wait()
                .await
                .map_err(|e| anyhow!("Failed to wait for {}: {}", program, e))?;
            debug!("[shell] {} exited with {}", program, status);
            // Killed by a signal: no code.
            Ok(status.code().unwrap_or(-1))
        })
    }
}

/// Split a command line into argv with POSIX shell quoting rules.
pub fn split_command(line: &str) -> Result<Vec<String>> {
    shlex::split(line).ok_or_else(|| anyhow!("unbalanced quotes in {:?}", line))
}
