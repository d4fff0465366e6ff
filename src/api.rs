// Client for the request-tracking API

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info};

use crate::error::{IibError, Result};
use crate::retry::{with_retry, RetryPolicy};
use crate::settings::WorkerSettings;

const RETRY_STATUSES: [u16; 5] = [408, 500, 502, 503, 504];
const HTTP_ATTEMPTS: u32 = 3;
const HTTP_BACKOFF_FACTOR: u64 = 3;

/// Externally visible request state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    InProgress,
    Complete,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Complete | RequestState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::InProgress => "in_progress",
            RequestState::Complete => "complete",
            RequestState::Failed => "failed",
        }
    }
}

/// PATCH body for `/builds/{id}`; unset fields are omitted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<RequestState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arches: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_image_resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_index_image_copy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_index_image_copy_resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_image_resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_index_resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_from_index_resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_index_resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_mapping: Option<BTreeMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_bundle_image_resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_bundle_image_resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbc_fragment_resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbc_fragments_resolved: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution_scope: Option<String>,
}

impl RequestUpdate {
    pub fn state(state: RequestState, reason: impl Into<String>) -> Self {
        Self {
            state: Some(state),
            state_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// The request-tracking API as seen by the worker
#[async_trait]
pub trait RequestTracker: Send + Sync {
    async fn get_request(&self, request_id: u64) -> Result<Value>;

    /// PATCH the request; `exc_msg` replaces the default error message
    async fn update_request(
        &self,
        request_id: u64,
        payload: &RequestUpdate,
        exc_msg: Option<&str>,
    ) -> Result<Value>;

    async fn set_request_state(
        &self,
        request_id: u64,
        state: RequestState,
        state_reason: &str,
    ) -> Result<Value> {
        info!(
            "Setting the state of request {} to \"{}\" with the reason \"{}\"",
            request_id,
            state.as_str(),
            state_reason
        );
        let exc_msg = format!(
            "Setting the state to \"{}\" on request {} failed",
            state.as_str(),
            request_id
        );
        self.update_request(
            request_id,
            &RequestUpdate::state(state, state_reason),
            Some(&exc_msg),
        )
        .await
    }
}

/// Current state of a request as returned by `GET /builds/{id}`
pub fn current_state(request: &Value) -> Option<RequestState> {
    request
        .get("state")
        .cloned()
        .and_then(|state| serde_json::from_value(state).ok())
}

/// Mark a request failed unless it already reached a terminal state
pub async fn mark_request_failed(
    tracker: &dyn RequestTracker,
    request_id: u64,
    reason: &str,
) -> Result<()> {
    let request = tracker.get_request(request_id).await?;
    if let Some(state) = current_state(&request).filter(RequestState::is_terminal) {
        return Err(IibError::FinalStateOverwrite(format!(
            "A {} request cannot change states",
            state.as_str()
        )));
    }
    tracker
        .set_request_state(request_id, RequestState::Failed, reason)
        .await?;
    Ok(())
}

/// `RequestTracker` backed by the IIB REST API
pub struct HttpRequestTracker {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRequestTracker {
    pub fn new(settings: &WorkerSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.api_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: settings.iib_api_url.trim_end_matches('/').to_string(),
            timeout: settings.api_timeout(),
        })
    }

    fn request_url(&self, request_id: u64) -> String {
        format!("{}/builds/{}", self.base_url, request_id)
    }

    /// Send with retries on connection errors and on retryable statuses
    ///
    /// The last response is returned even when its status was retryable.
    async fn send(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let policy = http_retry_policy();
        let result = with_retry(&policy, "the IIB API request", SendFailure::is_retryable, || async {
            match build().timeout(self.timeout).send().await {
                Ok(resp) if RETRY_STATUSES.contains(&resp.status().as_u16()) => Err(SendFailure::Status(resp)),
                Ok(resp) => Ok(resp),
                Err(e) => Err(SendFailure::Transport(e)),
            }
        })
        .await;
        match result {
            Ok(resp) | Err(SendFailure::Status(resp)) => Ok(resp),
            Err(SendFailure::Transport(e)) => Err(e),
        }
    }
}

/// 3 attempts, waiting 3 s then 6 s
fn http_retry_policy() -> RetryPolicy {
    RetryPolicy {
        attempts: HTTP_ATTEMPTS,
        delay: Duration::from_secs(HTTP_BACKOFF_FACTOR),
        multiplier: 2,
        jitter: Duration::ZERO,
    }
}

#[derive(Debug)]
enum SendFailure {
    Status(reqwest::Response),
    Transport(reqwest::Error),
}

impl SendFailure {
    fn is_retryable(&self) -> bool {
        match self {
            SendFailure::Status(_) => true,
            SendFailure::Transport(e) => e.is_connect() || e.is_timeout(),
        }
    }
}

#[async_trait]
impl RequestTracker for HttpRequestTracker {
    async fn get_request(&self, request_id: u64) -> Result<Value> {
        info!("Getting the request {}", request_id);
        let url = self.request_url(request_id);

        let resp = self.send(|| self.client.get(&url)).await.map_err(|e| {
            let msg = format!("The connection failed when getting the request {}", request_id);
            error!("{}: {}", msg, e);
            IibError::iib(msg)
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(
                "The worker failed to get the request {}. The status was {}. The text was:\n{}",
                request_id,
                status.as_u16(),
                text
            );
            return Err(IibError::iib(format!(
                "The worker failed to get the request {}",
                request_id
            )));
        }

        Ok(resp.json().await?)
    }

    async fn update_request(
        &self,
        request_id: u64,
        payload: &RequestUpdate,
        exc_msg: Option<&str>,
    ) -> Result<Value> {
        info!("Patching the request {} with {:?}", request_id, payload);
        let url = self.request_url(request_id);

        let resp = self
            .send(|| self.client.patch(&url).json(payload))
            .await
            .map_err(|e| {
                let msg = format!(
                    "The connection failed when updating the request {}",
                    request_id
                );
                error!("{}: {}", msg, e);
                IibError::iib(msg)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(
                "The worker failed to update the request {}. The status was {}. The text was:\n{}",
                request_id,
                status.as_u16(),
                text
            );
            if let Some(msg) = final_state_rejection(status.as_u16(), &text) {
                return Err(IibError::FinalStateOverwrite(msg));
            }
            return Err(IibError::iib(exc_msg.map(str::to_string).unwrap_or_else(|| {
                format!("The worker failed to update the request {}", request_id)
            })));
        }

        Ok(resp.json().await?)
    }
}

/// The API answers 400 with "A complete request cannot change states"
fn final_state_rejection(status: u16, body: &str) -> Option<String> {
    if status != 400 {
        return None;
    }
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))?;
    message.ends_with("request cannot change states").then_some(message)
}
