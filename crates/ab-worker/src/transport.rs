//! Authenticated HTTP access to the AIBrush backend and to presigned storage URLs.
//!
//! Every call goes through [`Transport::send`], which resolves the endpoint,
//! attaches credentials and content type, and retries transport-level
//! failures with exponential backoff. HTTP error statuses are handed back to
//! the caller untouched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::session::{LoginResponse, Session};

const DEFAULT_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_JSON_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BINARY_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry schedule for transport-level failures.
///
/// With the defaults a call is tried 5 times, sleeping 2, 4, 8 and 16 seconds
/// between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n + 2`, for each retry the policy allows.
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.attempts.saturating_sub(1))
            .map(|n| self.initial_backoff.saturating_mul(1u32 << n.min(31)))
            .collect()
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number. `sleep` is called between
    /// attempts, never after the last one.
    pub async fn run<T, E, Op, Fut, Sleep, SleepFut>(
        &self,
        mut op: Op,
        mut sleep: Sleep,
    ) -> Result<T, E>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Sleep: FnMut(Duration) -> SleepFut,
        SleepFut: Future<Output = ()>,
        E: std::fmt::Display,
    {
        let mut delays = self.delays().into_iter();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => match delays.next() {
                    Some(delay) => {
                        warn!(attempt, error = %e, retry_in = ?delay, "Request failed, retrying");
                        sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Scheme and host of the backend; API paths live under `{api_base}/api`
    pub api_base: String,
    pub retry: RetryPolicy,
    pub json_timeout: Duration,
    pub binary_timeout: Duration,
}

impl TransportConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            retry: RetryPolicy::default(),
            json_timeout: DEFAULT_JSON_TIMEOUT,
            binary_timeout: DEFAULT_BINARY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Body {
    None,
    Json(Value),
    /// Raw payload with an explicit MIME type, e.g. `image/png`
    Raw { bytes: Vec<u8>, mime: String },
}

impl Body {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self::Raw {
            bytes,
            mime: "image/png".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    Bearer,
    /// Presigned storage calls: no credentials and no implied content type
    None,
}

pub struct Transport {
    client: Client,
    config: TransportConfig,
    session: Arc<Session>,
}

impl Transport {
    pub fn new(config: TransportConfig, session: Arc<Session>) -> Self {
        Self {
            client: Client::new(),
            config,
            session,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Absolute URLs pass through; anything else is an API path.
    pub fn resolve(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}/api{}", self.config.api_base.trim_end_matches('/'), endpoint)
        }
    }

    /// Send one logical request, retrying transport failures.
    ///
    /// A 401 on an authenticated call triggers one re-login and one replay
    /// when the session holds a login code.
    pub async fn send(
        &self,
        endpoint: &str,
        method: Method,
        body: Body,
        auth: Auth,
    ) -> Result<Response, TransportError> {
        let response = self.send_with_retry(endpoint, &method, &body, auth).await?;

        let rejected = response.status() == StatusCode::UNAUTHORIZED && auth == Auth::Bearer;
        if rejected && self.session.can_login() {
            warn!(endpoint, "Backend rejected token, logging in again");
            self.login().await?;
            return self.send_with_retry(endpoint, &method, &body, auth).await;
        }

        Ok(response)
    }

    /// Exchange the session's login code for a bearer token.
    pub async fn login(&self) -> Result<(), TransportError> {
        let code = self
            .session
            .login_code()
            .ok_or_else(|| TransportError::Auth("no login code configured".into()))?;

        let body = Body::Json(json!({ "login_code": code }));
        let response = self
            .send_with_retry("/worker-login", &Method::POST, &body, Auth::None)
            .await?;
        let response = expect_success(response)
            .await
            .map_err(|e| TransportError::Auth(e.to_string()))?;
        let login: LoginResponse = parse_json(response).await?;

        self.session.set_token(login.access_token);
        info!("Logged in as worker");
        Ok(())
    }

    /// Log in if the session has no token yet.
    pub async fn ensure_authenticated(&self) -> Result<(), TransportError> {
        if self.session.is_authenticated() {
            return Ok(());
        }
        self.login().await
    }

    /// `send` plus a success check and typed decode of the body.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        method: Method,
        body: Body,
    ) -> Result<T, TransportError> {
        let response = self.send(endpoint, method, body, Auth::Bearer).await?;
        parse_json(expect_success(response).await?).await
    }

    async fn send_with_retry(
        &self,
        endpoint: &str,
        method: &Method,
        body: &Body,
        auth: Auth,
    ) -> Result<Response, TransportError> {
        let url = self.resolve(endpoint);
        let policy = self.config.retry;

        policy
            .run(
                |attempt| {
                    debug!(%method, url = %url, attempt, "Sending request");
                    self.build(&url, method, body, auth).send()
                },
                tokio::time::sleep,
            )
            .await
            .map_err(|e| TransportError::Unavailable {
                attempts: policy.attempts,
                last_error: e.to_string(),
            })
    }

    fn build(&self, url: &str, method: &Method, body: &Body, auth: Auth) -> RequestBuilder {
        let mut request = self.client.request(method.clone(), url);

        if auth == Auth::Bearer {
            if let Some(token) = self.session.token() {
                request = request.bearer_auth(token);
            }
        }

        match body {
            Body::Json(value) => request.json(value).timeout(self.config.json_timeout),
            Body::Raw { bytes, mime } => request
                .header(CONTENT_TYPE, mime.as_str())
                .body(bytes.clone())
                .timeout(self.config.binary_timeout),
            Body::None if auth == Auth::Bearer => request
                .header(CONTENT_TYPE, "application/json")
                .timeout(self.config.json_timeout),
            Body::None => request.timeout(self.config.json_timeout),
        }
    }
}

/// Turn a non-2xx response into [`TransportError::Status`].
pub async fn expect_success(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status { status, body })
}

pub async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let bytes = read_body(response).await?;
    serde_json::from_slice(&bytes).map_err(|e| TransportError::MalformedResponse(e.to_string()))
}

/// Like [`parse_json`], but an empty or `null` body is `None`.
pub async fn parse_json_opt<T: DeserializeOwned>(
    response: Response,
) -> Result<Option<T>, TransportError> {
    let bytes = read_body(response).await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice::<Option<T>>(&bytes)
        .map_err(|e| TransportError::MalformedResponse(e.to_string()))
}

async fn read_body(response: Response) -> Result<Vec<u8>, TransportError> {
    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| TransportError::Unavailable {
            attempts: 1,
            last_error: e.to_string(),
        })
}
