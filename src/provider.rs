//! External completion providers for the advice pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::advice::AdviceError;

/// Turns a system prompt and a user prompt into free text.
#[async_trait]
pub trait AdviceProvider: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String, AdviceError>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    system: &'a str,
    prompt: &'a str,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    text: String,
}

/// Completion relay reached over HTTP.
///
/// `POST {endpoint}` with `{"system", "prompt", "max_tokens"}`; the relay
/// answers `{"text": "..."}`. An API key, when set, is sent as a bearer
/// token.
pub struct HttpAdviceProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAdviceProvider {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, AdviceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdviceError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl AdviceProvider for HttpAdviceProvider {
    async fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String, AdviceError> {
        let mut request = self.client.post(&self.endpoint).json(&CompletionRequest {
            system,
            prompt,
            max_tokens,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AdviceError::Timeout
            } else {
                AdviceError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdviceError::Transport(format!("relay answered {status}")));
        }
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| AdviceError::Unusable(format!("bad relay response: {e}")))?;
        debug!(chars = body.text.len(), "relay completion received");
        Ok(body.text)
    }
}
