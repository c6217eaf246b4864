//! REST control plane of a Jupyter server.
//!
//! Every call is a single request with a deadline. Success is one specific
//! status code per call; anything else, including transport failure, comes
//! back as `Err`. Nothing here retries.

use std::time::Duration;

use log::{debug, warn};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::{
    ContentsModel, CreateSessionRequest, KernelModel, KernelNameRef, KernelSpecs,
    KernelSpecsResponse, ServerAddress, SessionModel,
};
use crate::error::ServerError;

#[derive(Debug, Clone)]
pub struct ControlPlane {
    client: reqwest::Client,
    address: ServerAddress,
}

impl ControlPlane {
    pub fn new(address: ServerAddress, request_timeout: Duration) -> Result<Self, ServerError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ServerError::call_failed("client", e))?;
        Ok(ControlPlane { client, address })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    async fn send(
        &self,
        call: &'static str,
        method: Method,
        segments: &[&str],
        body: Option<serde_json::Value>,
        expected: &[StatusCode],
    ) -> Result<reqwest::Response, ServerError> {
        let url = self.address.endpoint(segments);
        debug!("[server] {} {} ({})", method, url.path(), call);

        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            warn!("[server] {} failed: {}", call, e);
            ServerError::call_failed(call, e)
        })?;

        if expected.contains(&response.status()) {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("[server] {} returned HTTP {}", call, status);
            Err(ServerError::call_failed(
                call,
                format!("unexpected status {}: {}", status, body),
            ))
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        call: &'static str,
        method: Method,
        segments: &[&str],
        body: Option<serde_json::Value>,
        expected: &[StatusCode],
    ) -> Result<T, ServerError> {
        self.send(call, method, segments, body, expected)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ServerError::call_failed(call, e))
    }

    /// `GET /api/status`. Used to check whether a server answers.
    pub async fn status(&self) -> Result<serde_json::Value, ServerError> {
        self.send_json("status", Method::GET, &["api", "status"], None, &[StatusCode::OK])
            .await
    }

    pub async fn kernel_specs(&self) -> Result<KernelSpecs, ServerError> {
        let response: KernelSpecsResponse = self
            .send_json(
                "kernel_specs",
                Method::GET,
                &["api", "kernelspecs"],
                None,
                &[StatusCode::OK],
            )
            .await?;
        Ok(response.into())
    }

    pub async fn list_kernels(&self) -> Result<Vec<KernelModel>, ServerError> {
        self.send_json("list_kernels", Method::GET, &["api", "kernels"], None, &[StatusCode::OK])
            .await
    }

    pub async fn get_kernel(&self, kernel_id: &str) -> Result<KernelModel, ServerError> {
        self.send_json(
            "get_kernel",
            Method::GET,
            &["api", "kernels", kernel_id],
            None,
            &[StatusCode::OK],
        )
        .await
    }

    /// `POST /api/kernels`. Anything other than 201 is `KernelStartFailed`.
    pub async fn start_kernel(&self, name: &str) -> Result<KernelModel, ServerError> {
        let url = self.address.endpoint(&["api", "kernels"]);
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .map_err(|e| ServerError::call_failed("start_kernel", e))?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            warn!("[server] Kernel {} failed to start: HTTP {}", name, status);
            return Err(ServerError::KernelStartFailed {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| ServerError::call_failed("start_kernel", e))
    }

    pub async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), ServerError> {
        self.send(
            "shutdown_kernel",
            Method::DELETE,
            &["api", "kernels", kernel_id],
            None,
            &[StatusCode::NO_CONTENT],
        )
        .await
        .map(drop)
    }

    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), ServerError> {
        self.send(
            "interrupt_kernel",
            Method::POST,
            &["api", "kernels", kernel_id, "interrupt"],
            None,
            &[StatusCode::NO_CONTENT],
        )
        .await
        .map(drop)
    }

    pub async fn restart_kernel(&self, kernel_id: &str) -> Result<KernelModel, ServerError> {
        self.send_json(
            "restart_kernel",
            Method::POST,
            &["api", "kernels", kernel_id, "restart"],
            None,
            &[StatusCode::OK],
        )
        .await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionModel>, ServerError> {
        self.send_json("list_sessions", Method::GET, &["api", "sessions"], None, &[StatusCode::OK])
            .await
    }

    /// `POST /api/sessions`, binding `path` to a kernel of spec `kernel_name`.
    pub async fn create_session(
        &self,
        path: &str,
        kernel_name: &str,
    ) -> Result<SessionModel, ServerError> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let request = CreateSessionRequest {
            path,
            name,
            kind: "notebook",
            kernel: KernelNameRef { name: kernel_name },
        };
        self.send_json(
            "create_session",
            Method::POST,
            &["api", "sessions"],
            Some(to_body("create_session", &request)?),
            &[StatusCode::CREATED],
        )
        .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), ServerError> {
        self.send(
            "delete_session",
            Method::DELETE,
            &["api", "sessions", session_id],
            None,
            &[StatusCode::NO_CONTENT],
        )
        .await
        .map(drop)
    }

    pub async fn get_contents(&self, path: &str) -> Result<ContentsModel, ServerError> {
        let mut segments = vec!["api", "contents"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        self.send_json("get_contents", Method::GET, &segments, None, &[StatusCode::OK])
            .await
    }

    /// `PUT /api/contents/{path}`; 200 when overwriting, 201 when created.
    pub async fn save_contents(
        &self,
        path: &str,
        model: &ContentsModel,
    ) -> Result<ContentsModel, ServerError> {
        let mut segments = vec!["api", "contents"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        self.send_json(
            "save_contents",
            Method::PUT,
            &segments,
            Some(to_body("save_contents", model)?),
            &[StatusCode::OK, StatusCode::CREATED],
        )
        .await
    }
}

fn to_body<T: Serialize>(call: &'static str, body: &T) -> Result<serde_json::Value, ServerError> {
    serde_json::to_value(body).map_err(|e| ServerError::call_failed(call, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeJupyterServer;

    async fn fake() -> (FakeJupyterServer, ControlPlane) {
        let server = FakeJupyterServer::spawn("s3cret").await.unwrap();
        let address = ServerAddress::new(&server.url(), server.token()).unwrap();
        let control = ControlPlane::new(address, Duration::from_secs(5)).unwrap();
        (server, control)
    }

    #[tokio::test]
    async fn test_status_requires_token() {
        let (server, control) = fake().await;
        assert!(control.status().await.is_ok());

        let wrong = ServerAddress::new(&server.url(), "nope").unwrap();
        let denied = ControlPlane::new(wrong, Duration::from_secs(5)).unwrap();
        let err = denied.status().await.unwrap_err();
        assert!(matches!(err, ServerError::ControlPlaneCallFailed { call: "status", .. }));
    }

    #[tokio::test]
    async fn test_kernel_lifecycle_status_codes() {
        let (server, control) = fake().await;

        let specs = control.kernel_specs().await.unwrap();
        assert_eq!(specs.default.as_deref(), Some("python3"));

        let kernel = control.start_kernel("python3").await.unwrap();
        assert_eq!(kernel.execution_state.as_deref(), Some("starting"));
        assert_eq!(control.list_kernels().await.unwrap().len(), 1);
        assert_eq!(control.get_kernel(&kernel.id).await.unwrap().id, kernel.id);

        control.interrupt_kernel(&kernel.id).await.unwrap();
        assert_eq!(server.interrupts(), vec![kernel.id.clone()]);

        let restarted = control.restart_kernel(&kernel.id).await.unwrap();
        assert_eq!(restarted.execution_state.as_deref(), Some("restarting"));

        control.shutdown_kernel(&kernel.id).await.unwrap();
        assert!(control.list_kernels().await.unwrap().is_empty());

        // Deleting again is a 404, which is not the expected 204.
        let err = control.shutdown_kernel(&kernel.id).await.unwrap_err();
        assert!(matches!(err, ServerError::ControlPlaneCallFailed { .. }));
    }

    #[tokio::test]
    async fn test_start_kernel_non_201_is_start_failure() {
        let (server, control) = fake().await;
        server.fail_kernel_starts(true);
        let err = control.start_kernel("python3").await.unwrap_err();
        assert!(matches!(err, ServerError::KernelStartFailed { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_sessions() {
        let (_server, control) = fake().await;
        let session = control.create_session("work/a.ipynb", "python3").await.unwrap();
        assert_eq!(session.path, "work/a.ipynb");
        assert_eq!(session.name, "a.ipynb");
        assert!(session.kernel.is_some());

        assert_eq!(control.list_sessions().await.unwrap().len(), 1);
        control.delete_session(&session.id).await.unwrap();
        assert!(control.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_contents_read_write() {
        let (server, control) = fake().await;
        server.put_file("docs/existing.ipynb", serde_json::json!({"cells": []}));

        let model = control.get_contents("docs/existing.ipynb").await.unwrap();
        assert_eq!(model.name, "existing.ipynb");
        assert_eq!(model.content, Some(serde_json::json!({"cells": []})));

        let new = ContentsModel::notebook("docs/new.ipynb", serde_json::json!({"cells": [1]}));
        let saved = control.save_contents("docs/new.ipynb", &new).await.unwrap();
        assert_eq!(saved.path, "docs/new.ipynb");

        assert!(control.get_contents("missing.ipynb").await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_call_failure() {
        let address = ServerAddress::new("http://127.0.0.1:9/", "t").unwrap();
        let control = ControlPlane::new(address, Duration::from_millis(300)).unwrap();
        let err = control.list_kernels().await.unwrap_err();
        assert!(matches!(err, ServerError::ControlPlaneCallFailed { call: "list_kernels", .. }));
    }
}
