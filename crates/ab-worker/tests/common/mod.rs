//! In-process stand-in for the AIBrush backend and its object storage.
//!
//! API routes live under `/api`, presigned storage under `/storage`. Every
//! request is recorded so tests can assert on order, headers and bodies.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ab_core::protocol::RankRequest;
use ab_core::{Job, Model};
use ab_worker::compute::{Launcher, Ranker};
use ab_worker::error::ComputeError;
use ab_worker::session::Session;
use ab_worker::transport::{RetryPolicy, Transport, TransportConfig};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

pub const TOKEN: &str = "worker-token";

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Recorded {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[derive(Default)]
pub struct BackendState {
    pub base: String,
    pub jobs: VecDeque<Job>,
    pub requests: Vec<Recorded>,
    pub fail_upload_urls: bool,
    pub reject_storage: bool,
    pub malformed_lease: bool,
    /// Token the API accepts; anything else gets 401
    pub valid_token: String,
}

#[derive(Clone)]
pub struct FakeBackend {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(BackendState {
            base: format!("http://{addr}"),
            valid_token: TOKEN.to_string(),
            ..Default::default()
        }));

        let app = Router::new().fallback(handle).with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn base(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn push_job(&self, job: Job) {
        self.state.lock().unwrap().jobs.push_back(job);
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut BackendState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }

    /// A transport with a fast retry schedule pointed at this backend.
    pub fn transport(&self, token: Option<&str>, login_code: Option<&str>) -> Arc<Transport> {
        let mut config = TransportConfig::new(self.base());
        config.retry = RetryPolicy {
            attempts: 5,
            initial_backoff: Duration::from_millis(5),
        };
        let session = Session::new(token.map(String::from), login_code.map(String::from));
        Arc::new(Transport::new(config, Arc::new(session)))
    }
}

/// A solid-colour PNG of the given size.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([40, 90, 200, 255]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

pub fn work_dir() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("ab-worker-test-{}", uuid::Uuid::new_v4()))
}

/// A transport aimed at a port nothing listens on, with a fast retry schedule.
pub fn unreachable_transport() -> Arc<Transport> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = TransportConfig::new(format!("http://{addr}"));
    config.retry = RetryPolicy {
        attempts: 5,
        initial_backoff: Duration::from_millis(1),
    };
    Arc::new(Transport::new(config, Arc::new(Session::new(Some(TOKEN.into()), None))))
}

pub fn job(id: &str, model: Model) -> Job {
    Job {
        id: id.to_string(),
        phrases: vec!["a red cube".to_string()],
        iterations: 50,
        model,
        ..Default::default()
    }
}

async fn handle(
    State(state): State<Arc<Mutex<BackendState>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(String::from);
    let authorization = header("authorization");

    let mut state = state.lock().unwrap();
    state.requests.push(Recorded {
        method: method.clone(),
        path: path.clone(),
        authorization: authorization.clone(),
        content_type: header("content-type"),
        body: body.clone(),
    });

    if let Some(object) = path.strip_prefix("/storage/") {
        if state.reject_storage {
            return StatusCode::FORBIDDEN.into_response();
        }
        return match method {
            Method::PUT => StatusCode::OK.into_response(),
            Method::GET if object.ends_with(".png") => {
                (StatusCode::OK, vec![0x89, b'P', b'N', b'G']).into_response()
            }
            _ => StatusCode::NOT_FOUND.into_response(),
        };
    }

    let Some(api_path) = path.strip_prefix("/api") else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if api_path == "/worker-login" {
        let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        if request["login_code"].is_string() {
            let tokens = json!({ "accessToken": state.valid_token, "refreshToken": "r" });
            return Json(tokens).into_response();
        }
        return StatusCode::BAD_REQUEST.into_response();
    }

    let expected = format!("Bearer {}", state.valid_token);
    if authorization.as_deref() != Some(expected.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let segments: Vec<&str> = api_path.trim_start_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        (Method::PUT, ["process-image"]) => {
            if state.malformed_lease {
                return (StatusCode::OK, "{not json").into_response();
            }
            let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            let peek = request["peek"].as_bool().unwrap_or(false);
            let include: Option<Vec<String>> = request["include_models"].as_array().map(|models| {
                models.iter().filter_map(|m| m.as_str().map(String::from)).collect()
            });
            let position = state.jobs.iter().position(|job| {
                job.status == ab_core::JobStatus::Pending
                    && include
                        .as_ref()
                        .is_none_or(|models| models.iter().any(|m| m == job.model.id()))
            });
            match position {
                None => Json(Value::Null).into_response(),
                Some(i) if peek => Json(state.jobs[i].clone()).into_response(),
                Some(i) => {
                    state.jobs[i].status = ab_core::JobStatus::Processing;
                    Json(state.jobs[i].clone()).into_response()
                }
            }
        }
        (Method::GET, ["images", id, "upload-urls"]) => {
            if state.fail_upload_urls {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            Json(json!({
                "image_url": format!("{}/storage/{id}.image.png", state.base),
                "thumbnail_url": format!("{}/storage/{id}.thumbnail.png", state.base),
            }))
            .into_response()
        }
        (Method::GET, ["images", id, "download-urls"]) => Json(json!({
            "image_url": format!("{}/storage/{id}.image.png", state.base),
            "thumbnail_url": format!("{}/storage/{id}.thumbnail.png", state.base),
        }))
        .into_response(),
        (Method::PUT, ["images", video]) if video.ends_with(".mp4") => {
            StatusCode::NO_CONTENT.into_response()
        }
        (Method::PATCH, ["images", id]) => {
            let update: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            let id = id.to_string();
            let job = state.jobs.iter_mut().find(|job| job.id == id);
            let Some(job) = job else {
                let echo = json!({
                    "id": id,
                    "status": update["status"],
                    "score": update["score"],
                });
                return Json(echo).into_response();
            };
            if let Ok(status) = serde_json::from_value(update["status"].clone()) {
                job.status = status;
            }
            job.score = update["score"].as_f64();
            job.negative_score = update["negative_score"].as_f64();
            Json(job.clone()).into_response()
        }
        (Method::GET, ["images", id]) => {
            let id = id.to_string();
            match state.jobs.iter().find(|job| job.id == id) {
                Some(job) => Json(job.clone()).into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }
        (Method::POST, ["worker-ping"]) => StatusCode::OK.into_response(),
        (Method::POST, ["metrics"]) => StatusCode::OK.into_response(),
        (Method::GET, ["workers", _, "config"]) => {
            Json(json!({ "model": "stable_diffusion", "num_gpus": 1 })).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Scripted compute backend for driving the worker loop without processes.
pub struct ScriptedRanker {
    pub model: Model,
    pub outcomes: Arc<Mutex<VecDeque<Result<f64, ComputeError>>>>,
    pub requests: Arc<Mutex<Vec<RankRequest>>>,
    pub shut_down: Arc<Mutex<bool>>,
    /// Written to the request's `output_path` on every call
    pub png: Option<Vec<u8>>,
}

#[async_trait]
impl Ranker for ScriptedRanker {
    fn model(&self) -> &Model {
        &self.model
    }

    async fn rank(&mut self, request: &RankRequest) -> Result<f64, ComputeError> {
        self.requests.lock().unwrap().push(request.clone());
        if let (Some(path), Some(png)) = (&request.output_path, &self.png) {
            std::fs::write(path, png).unwrap();
        }
        self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(0.5))
    }

    async fn shutdown(&mut self) {
        *self.shut_down.lock().unwrap() = true;
    }
}

/// Launcher handing out [`ScriptedRanker`]s that share one script.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    pub outcomes: Arc<Mutex<VecDeque<Result<f64, ComputeError>>>>,
    pub requests: Arc<Mutex<Vec<RankRequest>>>,
    pub launched: Arc<Mutex<Vec<Model>>>,
    pub shut_down: Arc<Mutex<bool>>,
    pub png: Option<Vec<u8>>,
}

impl ScriptedLauncher {
    pub fn script(&self, outcome: Result<f64, ComputeError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, model: &Model) -> Result<Box<dyn Ranker>, ComputeError> {
        self.launched.lock().unwrap().push(model.clone());
        Ok(Box::new(ScriptedRanker {
            model: model.clone(),
            outcomes: self.outcomes.clone(),
            requests: self.requests.clone(),
            shut_down: self.shut_down.clone(),
            png: self.png.clone(),
        }))
    }
}
