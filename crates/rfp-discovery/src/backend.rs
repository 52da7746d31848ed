use std::time::Duration;

use async_trait::async_trait;
use rfp_common::openai::{
    ChatCompletionRequest, Message, OpenAiClient, OpenAiClientError, ResponseFormat,
};
use rfp_common::usage::UsageTracker;
use tracing::debug;

use crate::breaker::FailureKind;

#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Per-call limits handed to the backend.
#[derive(Debug, Clone, Copy)]
pub struct Constraints {
    pub max_output_tokens: u32,
    /// Ask for a JSON object response. Dropped on the relaxed retry.
    pub structured: bool,
    pub timeout: Duration,
}

impl Constraints {
    pub fn relaxed(self) -> Self {
        Self {
            structured: false,
            ..self
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("call timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("empty response")]
    EmptyResponse,
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_) | BackendError::RateLimited(_) | BackendError::Transient(_)
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, BackendError::RateLimited(_))
    }
}

impl FailureKind for BackendError {
    fn kind(&self) -> &'static str {
        match self {
            BackendError::Timeout(_) => "timeout",
            BackendError::RateLimited(_) => "rate_limited",
            BackendError::Transient(_) => "transient",
            BackendError::Permanent(_) => "permanent",
            BackendError::EmptyResponse => "empty_response",
        }
    }
}

/// One external text-completion service. Implementations must honor `constraints.timeout` and
/// keep transient failures distinguishable from permanent ones.
#[async_trait]
pub trait ScoringBackend: Send + Sync {
    async fn complete(
        &self,
        prompt: &Prompt,
        constraints: &Constraints,
    ) -> Result<String, BackendError>;

    fn model(&self) -> &str;
}

/// Chat-completions backend for one model.
pub struct OpenAiBackend {
    client: OpenAiClient,
    model: String,
    usage: UsageTracker,
}

impl OpenAiBackend {
    pub fn new(client: OpenAiClient, model: impl Into<String>, usage: UsageTracker) -> Self {
        Self {
            client,
            model: model.into(),
            usage,
        }
    }
}

#[async_trait]
impl ScoringBackend for OpenAiBackend {
    async fn complete(
        &self,
        prompt: &Prompt,
        constraints: &Constraints,
    ) -> Result<String, BackendError> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(prompt.system.clone()),
                Message::user(prompt.user.clone()),
            ],
            temperature: None,
            max_completion_tokens: Some(constraints.max_output_tokens),
            response_format: constraints.structured.then(ResponseFormat::json_object),
        };

        let response = match self
            .client
            .chat_completions(request, Some(constraints.timeout))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.usage.record_failure(&self.model).await;
                return Err(classify(&err, constraints.timeout));
            }
        };
        self.usage.record(&self.model, response.usage.as_ref()).await;

        let content = response.first_content().unwrap_or_default().trim();
        if content.is_empty() {
            debug!(model = %self.model, "completion returned no content");
            return Err(BackendError::EmptyResponse);
        }
        Ok(content.to_string())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn classify(err: &OpenAiClientError, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(timeout)
    } else if err.is_rate_limited() {
        BackendError::RateLimited(err.to_string())
    } else if err.is_transient() {
        BackendError::Transient(err.to_string())
    } else {
        BackendError::Permanent(err.to_string())
    }
}
