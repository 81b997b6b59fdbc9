//! Model inference client.
//!
//! [`ModelClient`] is a single blocking request/response call. The shipped
//! implementation talks to an OpenAI-compatible `/chat/completions` endpoint.
//! [`request_with_retry`] layers a small bounded retry with exponential
//! backoff over transient failures.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Chat message role on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    /// Ask the service for a JSON object response.
    pub json_mode: bool,
}

/// Failure of a model call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Worth retrying: network trouble, rate limiting, server errors.
    #[error("transient model error: {0}")]
    Transient(String),
    /// Retrying will not help: bad request, auth failure, unusable response.
    #[error("model error: {0}")]
    Fatal(String),
}

/// Abstraction over inference backends.
pub trait ModelClient {
    /// Return the raw text of the model's reply.
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError>;
}

/// Retry policy for transient model failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub backoff: Duration,
}

/// Call `client`, retrying transient failures with exponential backoff.
///
/// Fatal errors return immediately. Once retries are spent the last transient
/// error is returned.
#[instrument(skip_all, fields(model = %request.model, retries = policy.retries))]
pub fn request_with_retry<M: ModelClient + ?Sized>(
    client: &M,
    request: &ModelRequest,
    policy: RetryPolicy,
) -> Result<String, ModelError> {
    let mut attempt = 0u32;
    loop {
        match client.complete(request) {
            Ok(text) => return Ok(text),
            Err(ModelError::Transient(detail)) if attempt < policy.retries => {
                let delay = policy.backoff.saturating_mul(2u32.saturating_pow(attempt));
                warn!(attempt, delay_ms = delay.as_millis() as u64, detail = %detail, "transient model error, retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Client for OpenAI-compatible chat completion APIs.
pub struct OpenAiClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(api_base: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            api_key,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ModelClient for OpenAiClient {
    #[instrument(skip_all, fields(model = %request.model, messages = request.messages.len()))]
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": 0.0,
            "max_tokens": request.max_tokens,
        });
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let mut http_request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request.send().map_err(|err| {
            if err.is_timeout() || err.is_connect() || err.is_request() {
                ModelError::Transient(err.to_string())
            } else {
                ModelError::Fatal(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            let detail = format!("{status}: {}", detail.trim());
            return Err(if is_transient_status(status) {
                ModelError::Transient(detail)
            } else {
                ModelError::Fatal(detail)
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .map_err(|err| ModelError::Fatal(format!("decode completion response: {err}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::Fatal("completion response has no choices".to_string()))?
            .message
            .content
            .unwrap_or_default();
        debug!(chars = content.len(), "completion received");
        Ok(content.trim().to_string())
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    struct Flaky {
        replies: RefCell<VecDeque<Result<String, ModelError>>>,
        calls: RefCell<u32>,
    }

    impl Flaky {
        fn new(replies: Vec<Result<String, ModelError>>) -> Self {
            Self {
                replies: RefCell::new(replies.into()),
                calls: RefCell::new(0),
            }
        }
    }

    impl ModelClient for Flaky {
        fn complete(&self, _request: &ModelRequest) -> Result<String, ModelError> {
            *self.calls.borrow_mut() += 1;
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Fatal("no reply".to_string())))
        }
    }

    fn request() -> ModelRequest {
        ModelRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::user("hi")],
            max_tokens: 10,
            json_mode: true,
        }
    }

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn retries_transient_then_succeeds() {
        let client = Flaky::new(vec![
            Err(ModelError::Transient("503".to_string())),
            Ok("ok".to_string()),
        ]);
        assert_eq!(request_with_retry(&client, &request(), policy(2)), Ok("ok".to_string()));
        assert_eq!(*client.calls.borrow(), 2);
    }

    #[test]
    fn gives_up_after_retries() {
        let client = Flaky::new(vec![
            Err(ModelError::Transient("a".to_string())),
            Err(ModelError::Transient("b".to_string())),
            Err(ModelError::Transient("c".to_string())),
            Ok("late".to_string()),
        ]);
        let err = request_with_retry(&client, &request(), policy(2)).unwrap_err();
        assert_eq!(err, ModelError::Transient("c".to_string()));
        assert_eq!(*client.calls.borrow(), 3);
    }

    #[test]
    fn fatal_is_not_retried() {
        let client = Flaky::new(vec![
            Err(ModelError::Fatal("401".to_string())),
            Ok("never".to_string()),
        ]);
        assert!(request_with_retry(&client, &request(), policy(5)).is_err());
        assert_eq!(*client.calls.borrow(), 1);
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn messages_serialize_with_lowercase_roles() {
        let value = serde_json::to_value(ChatMessage::system("s")).expect("json");
        assert_eq!(value, json!({"role": "system", "content": "s"}));
    }

    #[test]
    fn endpoint_joins_base() {
        let client = OpenAiClient::new("http://localhost:1/v1/", None, Duration::from_secs(1))
            .expect("client");
        assert_eq!(client.endpoint, "http://localhost:1/v1/chat/completions");
    }
}
