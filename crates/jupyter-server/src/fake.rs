//! In-process stand-in for a Jupyter server's REST API, for tests.
//!
//! Serves the kernel, session, kernelspec and contents endpoints from memory
//! on an ephemeral localhost port and enforces the `?token=` parameter.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

#[derive(Debug, Default)]
struct FakeState {
    token: String,
    kernels: Vec<Value>,
    sessions: Vec<Value>,
    contents: HashMap<String, Value>,
    next_id: u32,
    fail_kernel_starts: bool,
    interrupts: Vec<String>,
    list_delay: Option<Duration>,
}

type Shared = Arc<StdMutex<FakeState>>;

pub struct FakeJupyterServer {
    addr: SocketAddr,
    state: Shared,
    task: tokio::task::JoinHandle<()>,
}

impl FakeJupyterServer {
    pub async fn spawn(token: &str) -> std::io::Result<Self> {
        let state: Shared = Arc::new(StdMutex::new(FakeState {
            token: token.to_string(),
            ..Default::default()
        }));

        let app = Router::new()
            .route("/api/status", get(status))
            .route("/api/kernelspecs", get(kernelspecs))
            .route("/api/kernels", get(list_kernels).post(start_kernel))
            .route("/api/kernels/{id}", get(get_kernel).delete(delete_kernel))
            .route("/api/kernels/{id}/interrupt", post(interrupt_kernel))
            .route("/api/kernels/{id}/restart", post(restart_kernel))
            .route("/api/sessions", get(list_sessions).post(create_session))
            .route("/api/sessions/{id}", delete(delete_session))
            .route("/api/contents/{*path}", get(get_contents).put(put_contents))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(FakeJupyterServer { addr, state, task })
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn token(&self) -> String {
        self.state.lock().unwrap().token.clone()
    }

    /// Write a `jpserver-*.json` file so discovery finds this server.
    pub fn write_server_info(&self, runtime_dir: &Path) -> std::io::Result<()> {
        let info = json!({
            "base_url": "/",
            "pid": std::process::id(),
            "port": self.addr.port(),
            "token": self.token(),
            "url": self.url(),
        });
        std::fs::create_dir_all(runtime_dir)?;
        std::fs::write(
            runtime_dir.join(format!("jpserver-{}.json", self.addr.port())),
            info.to_string(),
        )
    }

    /// A kernel started by someone else (another client of the server).
    pub fn add_external_kernel(&self, id: &str, name: &str) {
        self.state.lock().unwrap().kernels.push(kernel_json(id, name, "idle"));
    }

    pub fn remove_kernel(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .kernels
            .retain(|k| k["id"] != id);
    }

    pub fn set_execution_state(&self, id: &str, state: &str) {
        let mut s = self.state.lock().unwrap();
        if let Some(kernel) = s.kernels.iter_mut().find(|k| k["id"] == id) {
            kernel["execution_state"] = json!(state);
        }
    }

    /// Answer `GET /api/kernels` late, with the listing as it was when the
    /// request arrived.
    pub fn delay_kernel_listing(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().list_delay = delay;
    }

    pub fn fail_kernel_starts(&self, fail: bool) {
        self.state.lock().unwrap().fail_kernel_starts = fail;
    }

    pub fn kernel_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .kernels
            .iter()
            .filter_map(|k| k["id"].as_str().map(str::to_string))
            .collect()
    }

    pub fn interrupts(&self) -> Vec<String> {
        self.state.lock().unwrap().interrupts.clone()
    }

    pub fn put_file(&self, path: &str, content: Value) {
        self.state
            .lock()
            .unwrap()
            .contents
            .insert(path.to_string(), content);
    }
}

impl Drop for FakeJupyterServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn kernel_json(id: &str, name: &str, state: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "last_activity": "2024-05-01T12:00:00.000000Z",
        "execution_state": state,
        "connections": 0
    })
}

type Params = Query<HashMap<String, String>>;

fn authorized(state: &Shared, params: &HashMap<String, String>) -> bool {
    params.get("token") == Some(&state.lock().unwrap().token)
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, Json(json!({"message": "Forbidden"}))).into_response()
}

async fn status(State(state): State<Shared>, Query(params): Params) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    Json(json!({"connections": 0, "kernels": state.lock().unwrap().kernels.len()})).into_response()
}

async fn kernelspecs(State(state): State<Shared>, Query(params): Params) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    Json(json!({
        "default": "python3",
        "kernelspecs": {
            "python3": {
                "name": "python3",
                "resources": {},
                "spec": {
                    "argv": ["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"],
                    "display_name": "Python 3 (ipykernel)",
                    "language": "python",
                    "interrupt_mode": "signal",
                    "metadata": {}
                }
            }
        }
    }))
    .into_response()
}

async fn list_kernels(State(state): State<Shared>, Query(params): Params) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    let (kernels, delay) = {
        let s = state.lock().unwrap();
        (s.kernels.clone(), s.list_delay)
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    Json(Value::Array(kernels)).into_response()
}

async fn start_kernel(
    State(state): State<Shared>,
    Query(params): Params,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    let mut s = state.lock().unwrap();
    if s.fail_kernel_starts {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message": "No such kernel"})),
        )
            .into_response();
    }
    s.next_id += 1;
    let id = format!("kernel-{:04}", s.next_id);
    let name = body["name"].as_str().unwrap_or("python3").to_string();
    let kernel = kernel_json(&id, &name, "starting");
    s.kernels.push(kernel.clone());
    (StatusCode::CREATED, Json(kernel)).into_response()
}

async fn get_kernel(
    State(state): State<Shared>,
    UrlPath(id): UrlPath<String>,
    Query(params): Params,
) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    let s = state.lock().unwrap();
    match s.kernels.iter().find(|k| k["id"] == id.as_str()) {
        Some(kernel) => Json(kernel.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_kernel(
    State(state): State<Shared>,
    UrlPath(id): UrlPath<String>,
    Query(params): Params,
) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    let mut s = state.lock().unwrap();
    let before = s.kernels.len();
    s.kernels.retain(|k| k["id"] != id.as_str());
    if s.kernels.len() == before {
        StatusCode::NOT_FOUND.into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn interrupt_kernel(
    State(state): State<Shared>,
    UrlPath(id): UrlPath<String>,
    Query(params): Params,
) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    let mut s = state.lock().unwrap();
    if !s.kernels.iter().any(|k| k["id"] == id.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    s.interrupts.push(id);
    StatusCode::NO_CONTENT.into_response()
}

async fn restart_kernel(
    State(state): State<Shared>,
    UrlPath(id): UrlPath<String>,
    Query(params): Params,
) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    let mut s = state.lock().unwrap();
    match s.kernels.iter_mut().find(|k| k["id"] == id.as_str()) {
        Some(kernel) => {
            kernel["execution_state"] = json!("restarting");
            Json(kernel.clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_sessions(State(state): State<Shared>, Query(params): Params) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    Json(Value::Array(state.lock().unwrap().sessions.clone())).into_response()
}

async fn create_session(
    State(state): State<Shared>,
    Query(params): Params,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    let mut s = state.lock().unwrap();
    s.next_id += 1;
    let kernel_id = format!("kernel-{:04}", s.next_id);
    let kernel_name = body["kernel"]["name"].as_str().unwrap_or("python3").to_string();
    let kernel = kernel_json(&kernel_id, &kernel_name, "starting");
    s.kernels.push(kernel.clone());
    let session = json!({
        "id": format!("session-{:04}", s.next_id),
        "path": body["path"],
        "name": body["name"],
        "type": body["type"],
        "kernel": kernel,
    });
    s.sessions.push(session.clone());
    (StatusCode::CREATED, Json(session)).into_response()
}

async fn delete_session(
    State(state): State<Shared>,
    UrlPath(id): UrlPath<String>,
    Query(params): Params,
) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    let mut s = state.lock().unwrap();
    let before = s.sessions.len();
    s.sessions.retain(|session| session["id"] != id.as_str());
    if s.sessions.len() == before {
        StatusCode::NOT_FOUND.into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

fn contents_model(path: &str, content: Option<Value>) -> Value {
    let name = path.rsplit('/').next().unwrap_or(path);
    json!({
        "name": name,
        "path": path,
        "type": "notebook",
        "format": "json",
        "mimetype": null,
        "content": content,
    })
}

async fn get_contents(
    State(state): State<Shared>,
    UrlPath(path): UrlPath<String>,
    Query(params): Params,
) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    let s = state.lock().unwrap();
    match s.contents.get(&path) {
        Some(content) => Json(contents_model(&path, Some(content.clone()))).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_contents(
    State(state): State<Shared>,
    UrlPath(path): UrlPath<String>,
    Query(params): Params,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    let mut s = state.lock().unwrap();
    let existed = s
        .contents
        .insert(path.clone(), body["content"].clone())
        .is_some();
    let status = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(contents_model(&path, None))).into_response()
}
