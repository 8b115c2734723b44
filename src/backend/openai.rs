//! OpenAI-compatible backend implementation.
//!
//! Targets local servers speaking the OpenAI wire format (llama.cpp server,
//! LM Studio, vLLM) as well as the hosted API. Such servers manage model
//! residency themselves, so a listed model counts as downloaded and loading
//! only checks that the id is served.

use super::lines::{decode_lines, LineEvent};
use super::{GenerationOptions, LoadedModel, ModelHandle, TokenStream};
use crate::error::BackendError;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const NAME: &str = "openai";

/// Backend for servers exposing `/v1/models` and `/v1/chat/completions`.
pub struct OpenAIBackend {
    host: String,
    api_key: Option<String>,
    options: GenerationOptions,
    client: Client,
    loaded: LoadedModel,
}

impl OpenAIBackend {
    /// Create a new OpenAI-compatible backend.
    pub fn new(
        host: String,
        api_key: Option<String>,
        options: GenerationOptions,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(connection_error)?;

        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            api_key,
            options,
            client,
            loaded: LoadedModel::default(),
        })
    }

    /// Get the API key from config or environment. Local servers need none.
    fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.api_key() {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// List the models the server exposes.
    pub async fn list_models(&self) -> Result<Vec<ModelHandle>, BackendError> {
        let url = format!("{}/v1/models", self.host);
        let response = self
            .authorized(self.client.get(&url))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(connection_error)?;
        let response = check_status(response).await?;

        let models: ModelsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::decode(NAME, e.to_string()))?;

        Ok(models
            .data
            .into_iter()
            .map(|m| ModelHandle::new(m.id.clone(), m.id, true))
            .collect())
    }

    /// Select a served model for subsequent generations.
    pub async fn load_model(&self, id: &str) -> Result<bool, BackendError> {
        let served = self.list_models().await?;
        if !served.iter().any(|m| m.id == id) {
            debug!("{} is not served by {}", id, self.host);
            return Ok(false);
        }
        self.loaded.set(id);
        Ok(true)
    }

    /// Generate a whole response with the loaded model.
    pub async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let response = self.send_completion(prompt, false).await?;
        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::decode(NAME, e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| BackendError::decode(NAME, "empty response"))
    }

    /// Stream tokens from server-sent events.
    pub async fn generate_stream(&self, prompt: &str) -> Result<TokenStream, BackendError> {
        let response = self.send_completion(prompt, true).await?;
        let tokens = decode_lines(NAME, response.bytes_stream(), true, parse_sse_line);
        Ok(Box::pin(tokens))
    }

    async fn send_completion(&self, prompt: &str, stream: bool) -> Result<Response, BackendError> {
        let model = self.loaded.get()?;
        let url = format!("{}/v1/chat/completions", self.host);

        let request = CompletionRequest {
            model: &model,
            messages: vec![CompletionMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
            stream,
        };

        debug!("OpenAI completion (model={}, stream={})", model, stream);
        let response = self
            .authorized(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(connection_error)?;
        check_status(response).await
    }
}

fn connection_error(source: reqwest::Error) -> BackendError {
    BackendError::Connection {
        backend: NAME,
        source,
    }
}

async fn check_status(response: Response) -> Result<Response, BackendError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body);
    Err(BackendError::Status {
        backend: NAME,
        status,
        body,
    })
}

/// Decode one SSE line of a streamed chat completion.
fn parse_sse_line(line: &str) -> Result<LineEvent<String>, BackendError> {
    // Comments, `event:` and `id:` fields carry nothing we use.
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(LineEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(LineEvent::Done(None));
    }

    if let Ok(error) = serde_json::from_str::<ErrorBody>(data) {
        return Err(BackendError::Remote(error.error.message));
    }

    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| BackendError::decode(NAME, e.to_string()))?;

    let token = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty());

    Ok(match token {
        Some(token) => LineEvent::Item(token),
        None => LineEvent::Skip,
    })
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<CompletionMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct CompletionMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionContent,
}

#[derive(Debug, Deserialize)]
struct CompletionContent {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_token() {
        let line = r#"data: {"id":"c1","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), LineEvent::Item("Hel".to_string()));
    }

    #[test]
    fn test_sse_role_only_delta_is_skipped() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), LineEvent::Skip);
    }

    #[test]
    fn test_sse_done_marker() {
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), LineEvent::Done(None));
    }

    #[test]
    fn test_sse_non_data_lines_skipped() {
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), LineEvent::Skip);
        assert_eq!(parse_sse_line("event: message").unwrap(), LineEvent::Skip);
    }

    #[test]
    fn test_sse_error_payload() {
        let line = r#"data: {"error":{"message":"context length exceeded"}}"#;
        let err = parse_sse_line(line).unwrap_err();
        assert_eq!(err.to_string(), "context length exceeded");
    }

    #[test]
    fn test_models_response_decodes() {
        let models: ModelsResponse = serde_json::from_str(
            r#"{"object":"list","data":[{"id":"smollm2-360m","object":"model"}]}"#,
        )
        .unwrap();
        assert_eq!(models.data[0].id, "smollm2-360m");
    }
}
