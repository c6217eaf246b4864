//! Finding a server that is already running.
//!
//! Running Jupyter servers drop a `jpserver-<pid>.json` (or, for classic
//! notebook servers, `nbserver-<pid>.json`) file into the runtime directory.
//! Each file names a URL and token; a server is adopted only if it answers
//! `GET /api/status`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use log::{debug, info};
use regex::Regex;
use serde::Deserialize;

use crate::api::ServerAddress;
use crate::control_plane::ControlPlane;

/// Contents of a server-info file. Only the fields used here.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub root_dir: Option<PathBuf>,
}

fn is_server_info_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    (name.starts_with("jpserver-") || name.starts_with("nbserver-")) && name.ends_with(".json")
}

/// Server-info files in `runtime_dir`, newest first.
pub fn server_info_files(runtime_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(runtime_dir) else {
        return Vec::new();
    };
    let mut files: Vec<(SystemTime, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_server_info_file(p))
        .map(|p| {
            let modified = std::fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, p)
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));
    files.into_iter().map(|(_, p)| p).collect()
}

pub fn read_server_info(path: &Path) -> Option<ServerInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(info) => Some(info),
        Err(e) => {
            debug!("[server] Ignoring unreadable server info {:?}: {}", path, e);
            None
        }
    }
}

/// Return the address of the first listed server that answers.
pub async fn discover(runtime_dir: &Path, check_timeout: Duration) -> Option<ServerAddress> {
    for path in server_info_files(runtime_dir) {
        let Some(info) = read_server_info(&path) else {
            continue;
        };
        let Ok(address) = ServerAddress::new(&info.url, info.token.clone()) else {
            continue;
        };
        let Ok(control) = ControlPlane::new(address.clone(), check_timeout) else {
            continue;
        };
        match control.status().await {
            Ok(_) => {
                info!(
                    "[server] Found running server at {} (pid {:?})",
                    address, info.pid
                );
                return Some(address);
            }
            Err(e) => debug!("[server] Stale server info {:?}: {}", path, e),
        }
    }
    None
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(https?://[^\s?]+)\?token=([A-Za-z0-9]+)").expect("server URL pattern is valid")
    })
}

/// Extract address and token from one line of server launch output, e.g.
/// `    http://127.0.0.1:8888/lab?token=abc123`. A trailing `lab` or `tree`
/// UI segment is not part of the base URL.
pub fn parse_server_url(line: &str) -> Option<ServerAddress> {
    let captures = url_pattern().captures(line)?;
    let url = captures.get(1)?.as_str();
    let token = captures.get(2)?.as_str();

    let trimmed = url.trim_end_matches('/');
    let base = ["/lab", "/tree"]
        .iter()
        .find_map(|suffix| trimmed.strip_suffix(suffix))
        .unwrap_or(trimmed);

    ServerAddress::new(base, token).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_url_lab() {
        let address =
            parse_server_url("[I 2024-05-01 ServerApp]     http://127.0.0.1:8888/lab?token=abc123def")
                .unwrap();
        assert_eq!(address.base_url().as_str(), "http://127.0.0.1:8888/");
        assert_eq!(address.token(), "abc123def");
    }

    #[test]
    fn test_parse_server_url_tree_with_prefix() {
        let address = parse_server_url("    http://localhost:9000/user/x/tree?token=ff00").unwrap();
        assert_eq!(address.base_url().as_str(), "http://localhost:9000/user/x/");
    }

    #[test]
    fn test_parse_server_url_plain_root() {
        let address = parse_server_url("http://localhost:8888/?token=0a1b").unwrap();
        assert_eq!(address.base_url().as_str(), "http://localhost:8888/");
    }

    #[test]
    fn test_parse_server_url_ignores_lines_without_token() {
        assert!(parse_server_url("Serving notebooks from local directory: /home").is_none());
        assert!(parse_server_url("http://localhost:8888/lab").is_none());
    }

    #[test]
    fn test_server_info_files_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kernel-abc.json"), "{}").unwrap();
        std::fs::write(dir.path().join("jpserver-1.json"), "{}").unwrap();
        std::fs::write(dir.path().join("nbserver-2.json"), "{}").unwrap();
        std::fs::write(dir.path().join("jpserver-1-open.html"), "").unwrap();

        let files = server_info_files(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| is_server_info_file(p)));
    }

    #[test]
    fn test_read_server_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jpserver-42.json");
        std::fs::write(
            &path,
            r#"{"base_url": "/", "pid": 42, "port": 8888, "token": "t0k", "url": "http://localhost:8888/", "version": "2.14.0"}"#,
        )
        .unwrap();
        let info = read_server_info(&path).unwrap();
        assert_eq!(info.pid, Some(42));
        assert_eq!(info.token, "t0k");
    }

    #[tokio::test]
    async fn test_discover_skips_dead_servers() {
        let dir = tempfile::tempdir().unwrap();
        // Port 9 (discard) is not serving HTTP.
        std::fs::write(
            dir.path().join("jpserver-1.json"),
            r#"{"url": "http://127.0.0.1:9/", "token": "x"}"#,
        )
        .unwrap();
        assert!(discover(dir.path(), Duration::from_millis(300)).await.is_none());
    }
}
