//! HTTP client for the taskd daemon.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use task_core::{Attempt, AuditEvent, Checkpoint, KillSwitchMode, Task, TaskState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: taskd\n  → or set TASKD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("kill switch forbids this action: {0}")]
    KillSwitchForbidden(String),

    #[error("unauthorized: check TASKD_TOKEN env var or --token flag")]
    Unauthorized,
}

impl ClientError {
    /// Process exit code for this failure: 2 when the kill switch forbade
    /// the action, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::KillSwitchForbidden(_) => 2,
            _ => 1,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for POST /tasks.
#[derive(Debug, Serialize)]
pub struct CreateTaskRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    task: Task,
}

#[derive(Debug, Deserialize)]
struct ListTasksResponse {
    tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct ListAuditResponse {
    events: Vec<AuditEvent>,
}

#[derive(Debug, Deserialize)]
struct ListAttemptsResponse {
    attempts: Vec<Attempt>,
}

#[derive(Debug, Deserialize)]
struct ListCheckpointsResponse {
    checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Deserialize)]
struct KillSwitchResponse {
    mode: KillSwitchMode,
}

/// Per-state task count from GET /summary.
#[derive(Debug, Deserialize)]
pub struct StateCount {
    pub state: TaskState,
    pub count: u64,
}

#[derive(Debug, Deserialize)]
pub struct Summary {
    pub counts: Vec<StateCount>,
    pub active_loops: usize,
    pub mode: KillSwitchMode,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    code: String,
    error: String,
}

/// HTTP client for taskd.
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Map an error response to the matching client error, driving the
    /// exit-code contract.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }

        let body = response
            .json::<ErrorResponse>()
            .await
            .unwrap_or_else(|_| ErrorResponse {
                code: String::new(),
                error: "unknown error".to_string(),
            });

        match (status, body.code.as_str()) {
            (404, _) => ClientError::TaskNotFound(body.error),
            (423, _) | (_, "kill_switch") => ClientError::KillSwitchForbidden(body.error),
            (_, "invalid_transition") => ClientError::InvalidTransition(body.error),
            _ => ClientError::HttpError {
                status,
                message: body.error,
            },
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn enqueue(&self, req: CreateTaskRequest) -> Result<Task, ClientError> {
        let url = format!("{}/tasks", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&req)
            .send()
            .await?;
        let body: TaskResponse = self.parse(response).await?;
        Ok(body.task)
    }

    pub async fn list_tasks(&self, state: Option<&str>) -> Result<Vec<Task>, ClientError> {
        let url = format!("{}/tasks", self.base_url);
        let mut request = self.http.get(&url).headers(self.headers());
        if let Some(state) = state {
            request = request.query(&[("state", state)]);
        }
        let body: ListTasksResponse = self.parse(request.send().await?).await?;
        Ok(body.tasks)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, ClientError> {
        let url = format!("{}/tasks/{}", self.base_url, id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: TaskResponse = self.parse(response).await?;
        Ok(body.task)
    }

    pub async fn list_audit(&self, id: &str) -> Result<Vec<AuditEvent>, ClientError> {
        let url = format!("{}/tasks/{}/audit", self.base_url, id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: ListAuditResponse = self.parse(response).await?;
        Ok(body.events)
    }

    pub async fn list_attempts(&self, id: &str) -> Result<Vec<Attempt>, ClientError> {
        let url = format!("{}/tasks/{}/attempts", self.base_url, id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: ListAttemptsResponse = self.parse(response).await?;
        Ok(body.attempts)
    }

    pub async fn list_checkpoints(&self, id: &str) -> Result<Vec<Checkpoint>, ClientError> {
        let url = format!("{}/tasks/{}/checkpoints", self.base_url, id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: ListCheckpointsResponse = self.parse(response).await?;
        Ok(body.checkpoints)
    }

    pub async fn resolve(&self, id: &str, note: Option<&str>) -> Result<Task, ClientError> {
        let url = format!("{}/tasks/{}/resolve", self.base_url, id);
        let body = serde_json::json!({ "note": note });
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;
        let body: TaskResponse = self.parse(response).await?;
        Ok(body.task)
    }

    pub async fn cancel(&self, id: &str) -> Result<Task, ClientError> {
        let url = format!("{}/tasks/{}/cancel", self.base_url, id);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let body: TaskResponse = self.parse(response).await?;
        Ok(body.task)
    }

    pub async fn kill_switch(&self) -> Result<KillSwitchMode, ClientError> {
        let url = format!("{}/killswitch", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: KillSwitchResponse = self.parse(response).await?;
        Ok(body.mode)
    }

    pub async fn set_kill_switch(&self, mode: KillSwitchMode) -> Result<KillSwitchMode, ClientError> {
        let url = format!("{}/killswitch", self.base_url);
        let response = self
            .http
            .put(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "mode": mode }))
            .send()
            .await?;
        let body: KillSwitchResponse = self.parse(response).await?;
        Ok(body.mode)
    }

    pub async fn summary(&self) -> Result<Summary, ClientError> {
        let url = format!("{}/summary", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        self.parse(response).await
    }
}
