//! Wire types for the Jupyter server REST API and the local kernel handles
//! built from them.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ServerError;

/// Base URL plus auth token of a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    base_url: Url,
    token: String,
}

impl ServerAddress {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, ServerError> {
        let mut url =
            Url::parse(base_url).map_err(|e| ServerError::InvalidAddress(format!("{base_url}: {e}")))?;
        if url.cannot_be_a_base() {
            return Err(ServerError::InvalidAddress(base_url.to_string()));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url.set_query(None);
        Ok(ServerAddress {
            base_url: url,
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// URL for `segments` under the base, with `?token=` appended.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.query_pairs_mut().append_pair("token", &self.token);
        url
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the token.
        write!(f, "{}", self.base_url)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMode {
    #[default]
    Signal,
    Message,
}

/// Immutable kernel spec descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    pub display_name: String,
    pub language: String,
    pub interrupt_mode: InterruptMode,
}

/// `GET /api/kernelspecs`
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KernelSpecsResponse {
    #[serde(default)]
    pub default: Option<String>,
    pub kernelspecs: HashMap<String, KernelSpecEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KernelSpecEntry {
    pub name: String,
    pub spec: KernelSpecFile,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KernelSpecFile {
    pub display_name: String,
    pub language: String,
    #[serde(default)]
    pub interrupt_mode: InterruptMode,
}

impl From<KernelSpecEntry> for KernelSpec {
    fn from(entry: KernelSpecEntry) -> Self {
        KernelSpec {
            name: entry.name,
            display_name: entry.spec.display_name,
            language: entry.spec.language,
            interrupt_mode: entry.spec.interrupt_mode,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelSpecs {
    pub default: Option<String>,
    /// Sorted by name.
    pub specs: Vec<KernelSpec>,
}

impl KernelSpecs {
    pub fn get(&self, name: &str) -> Option<&KernelSpec> {
        self.specs.iter().find(|s| s.name == name)
    }
}

impl From<KernelSpecsResponse> for KernelSpecs {
    fn from(response: KernelSpecsResponse) -> Self {
        let mut specs: Vec<KernelSpec> = response
            .kernelspecs
            .into_values()
            .map(KernelSpec::from)
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        KernelSpecs {
            default: response.default,
            specs,
        }
    }
}

/// A kernel as the server reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_state: Option<String>,
    #[serde(default)]
    pub connections: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionModel {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub kernel: Option<KernelModel>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CreateSessionRequest<'a> {
    pub path: &'a str,
    pub name: &'a str,
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub kernel: KernelNameRef<'a>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct KernelNameRef<'a> {
    pub name: &'a str,
}

/// `GET|PUT /api/contents/{path}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentsModel {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

impl ContentsModel {
    /// A notebook model for `PUT`, with the document as parsed JSON content.
    pub fn notebook(path: &str, content: serde_json::Value) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        ContentsModel {
            name,
            path: path.to_string(),
            kind: "notebook".into(),
            format: Some("json".into()),
            mimetype: None,
            content: Some(content),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    #[default]
    Unknown,
    Starting,
    Idle,
    Busy,
    Dead,
}

impl KernelStatus {
    /// Map a server/protocol `execution_state` string.
    pub fn from_execution_state(state: &str) -> Self {
        match state {
            "starting" | "restarting" => KernelStatus::Starting,
            "idle" => KernelStatus::Idle,
            "busy" => KernelStatus::Busy,
            "dead" | "terminating" => KernelStatus::Dead,
            _ => KernelStatus::Unknown,
        }
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelStatus::Unknown => write!(f, "unknown"),
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Dead => write!(f, "dead"),
        }
    }
}

/// How to reach a kernel: the hosting server, and the connection file the
/// server wrote for the kernel's message channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConnection {
    pub server: ServerAddress,
    pub connection_file: PathBuf,
}

/// Local handle for a kernel running on the server. At most one exists per
/// `kernel_id`; the controller's registry enforces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningKernel {
    pub kernel_id: String,
    pub name: String,
    pub language: String,
    pub status: KernelStatus,
    pub connection: KernelConnection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_token_and_encodes_segments() {
        let address = ServerAddress::new("http://127.0.0.1:8888", "secret").unwrap();
        assert_eq!(
            address.endpoint(&["api", "kernels"]).as_str(),
            "http://127.0.0.1:8888/api/kernels?token=secret"
        );
        assert_eq!(
            address.endpoint(&["api", "contents", "my dir", "a.ipynb"]).as_str(),
            "http://127.0.0.1:8888/api/contents/my%20dir/a.ipynb?token=secret"
        );
    }

    #[test]
    fn test_base_url_with_prefix_keeps_prefix() {
        let address = ServerAddress::new("http://host:9999/user/me?token=x", "t").unwrap();
        assert_eq!(address.base_url().as_str(), "http://host:9999/user/me/");
        assert_eq!(
            address.endpoint(&["api", "status"]).as_str(),
            "http://host:9999/user/me/api/status?token=t"
        );
    }

    #[test]
    fn test_unusable_base_url_is_rejected() {
        for bad in ["not a url", "mailto:someone@example.com"] {
            let err = ServerAddress::new(bad, "t").unwrap_err();
            assert!(matches!(err, ServerError::InvalidAddress(_)), "{}", bad);
        }
    }

    #[test]
    fn test_display_hides_token() {
        let address = ServerAddress::new("http://localhost:8888/", "secret").unwrap();
        assert!(!address.to_string().contains("secret"));
    }

    #[test]
    fn test_kernelspecs_response_parses() {
        let raw = serde_json::json!({
            "default": "python3",
            "kernelspecs": {
                "python3": {
                    "name": "python3",
                    "resources": {},
                    "spec": {
                        "argv": ["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"],
                        "display_name": "Python 3 (ipykernel)",
                        "language": "python",
                        "metadata": {"debugger": true}
                    }
                },
                "deno": {
                    "name": "deno",
                    "spec": {"display_name": "Deno", "language": "typescript", "interrupt_mode": "message"}
                }
            }
        });
        let response: KernelSpecsResponse = serde_json::from_value(raw).unwrap();
        let specs = KernelSpecs::from(response);
        assert_eq!(specs.default.as_deref(), Some("python3"));
        assert_eq!(specs.specs[0].name, "deno");
        assert_eq!(specs.specs[0].interrupt_mode, InterruptMode::Message);
        assert_eq!(specs.get("python3").unwrap().interrupt_mode, InterruptMode::Signal);
    }

    #[test]
    fn test_kernel_model_parses_server_timestamp() {
        let model: KernelModel = serde_json::from_value(serde_json::json!({
            "id": "k1",
            "name": "python3",
            "last_activity": "2024-05-01T12:00:00.123456Z",
            "execution_state": "idle",
            "connections": 0
        }))
        .unwrap();
        assert!(model.last_activity.is_some());
        assert_eq!(
            KernelStatus::from_execution_state(model.execution_state.as_deref().unwrap()),
            KernelStatus::Idle
        );
    }
}
