//! OpenAI-compatible chat-completions provider.
//!
//! Talks to `POST {api_url}/chat/completions` with bearer auth. Streaming
//! bodies are handed to the upstream decoder.

use super::{
    ChatProvider, CompletionRequest, ProviderError, ProviderStream, SamplingParams,
    UpstreamMessage,
};
use crate::services::credentials::ModelCredentials;
use crate::services::decoder::decode_stream;
use async_trait::async_trait;
use reqwest::{Client, Response};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [UpstreamMessage],
    stream: bool,
    #[serde(flatten)]
    params: &'a SamplingParams,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

pub struct OpenAiCompatibleProvider {
    client: Client,
    /// Upper bound for the upstream to start answering. Streams themselves
    /// are not time-limited.
    response_timeout: Duration,
}

impl OpenAiCompatibleProvider {
    pub fn new(response_timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(response_timeout)
            .build()
            .map_err(|e| ProviderError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            response_timeout,
        })
    }

    fn endpoint(model: &ModelCredentials) -> String {
        format!("{}/chat/completions", model.api_url.trim_end_matches('/'))
    }

    async fn send(
        &self,
        model: &ModelCredentials,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<Response, ProviderError> {
        let body = CompletionBody {
            model: &model.model,
            messages: &request.messages,
            stream,
            params: &request.params,
        };

        tracing::debug!(
            model_id = %model.id,
            model = %model.model,
            message_count = request.messages.len(),
            stream,
            "Sending request to upstream provider"
        );

        let pending = self
            .client
            .post(Self::endpoint(model))
            .bearer_auth(model.api_key.expose_secret())
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.response_timeout, pending)
            .await
            .map_err(|_| ProviderError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                model_id = %model.id,
                status = status.as_u16(),
                "Upstream provider rejected request"
            );
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    async fn stream_chat(
        &self,
        model: &ModelCredentials,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = self.send(model, request, true) => response?,
        };

        Ok(Box::pin(decode_stream(response.bytes_stream())))
    }

    async fn complete(
        &self,
        model: &ModelCredentials,
        request: &CompletionRequest,
    ) -> Result<String, ProviderError> {
        let response = self.send(model, request, false).await?;

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| ProviderError::InvalidResponse("completion has no content".to_string()))
    }
}
