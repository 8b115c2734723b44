//! Ollama backend implementation.
//!
//! Ollama serves locally downloaded models, so everything it lists is
//! already on disk. Loading uses the preload idiom: a generate request with
//! no prompt, which makes the server pull the weights into memory.

use super::lines::{decode_lines, LineEvent};
use super::{GenerationOptions, LoadedModel, ModelHandle, TokenStream};
use crate::error::BackendError;
use futures::stream::Stream;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const NAME: &str = "ollama";

/// How long Ollama keeps a preloaded model resident.
const KEEP_ALIVE: &str = "30m";

/// Ollama backend for local LLM inference.
pub struct OllamaBackend {
    host: String,
    options: GenerationOptions,
    client: Client,
    loaded: LoadedModel,
}

impl OllamaBackend {
    /// Create a new Ollama backend.
    pub fn new(host: String, options: GenerationOptions) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|source| BackendError::Connection {
                backend: NAME,
                source,
            })?;

        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            options,
            client,
            loaded: LoadedModel::default(),
        })
    }

    /// List locally available models.
    pub async fn list_models(&self) -> Result<Vec<ModelHandle>, BackendError> {
        let url = format!("{}/api/tags", self.host);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(connection_error)?;
        let response = check_status(response).await?;

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::decode(NAME, e.to_string()))?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelHandle {
                id: m.name.clone(),
                name: m.name,
                is_downloaded: true,
                size_bytes: m.size,
            })
            .collect())
    }

    /// Ask Ollama to load the model into memory.
    pub async fn load_model(&self, id: &str) -> Result<bool, BackendError> {
        let url = format!("{}/api/generate", self.host);
        let request = LoadRequest {
            model: id,
            keep_alive: KEEP_ALIVE,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(Duration::from_secs(120))
            .send()
            .await
            .map_err(connection_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Ollama does not know model {}", id);
            return Ok(false);
        }
        check_status(response).await?;

        self.loaded.set(id);
        Ok(true)
    }

    /// Generate a whole response with the loaded model.
    pub async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let response = self.send_generate(prompt, false).await?;
        let chunk: GenerateChunk = response
            .json()
            .await
            .map_err(|e| BackendError::decode(NAME, e.to_string()))?;

        match chunk.error {
            Some(error) => Err(BackendError::Remote(error)),
            None => Ok(chunk.response),
        }
    }

    /// Stream tokens from `/api/generate`.
    pub async fn generate_stream(&self, prompt: &str) -> Result<TokenStream, BackendError> {
        let response = self.send_generate(prompt, true).await?;
        let tokens = decode_lines(NAME, response.bytes_stream(), true, parse_stream_line);
        Ok(Box::pin(tokens))
    }

    /// Pull a model from the Ollama registry, reporting progress as it goes.
    pub async fn pull(
        &self,
        model: &str,
    ) -> Result<impl Stream<Item = Result<PullProgress, BackendError>>, BackendError> {
        let url = format!("{}/api/pull", self.host);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "name": model, "stream": true }))
            .timeout(Duration::from_secs(3600)) // 1 hour timeout for large models
            .send()
            .await
            .map_err(connection_error)?;
        let response = check_status(response).await?;

        Ok(decode_lines(NAME, response.bytes_stream(), false, parse_pull_line))
    }

    async fn send_generate(&self, prompt: &str, stream: bool) -> Result<Response, BackendError> {
        let model = self.loaded.get()?;
        let url = format!("{}/api/generate", self.host);

        let request = GenerateRequest {
            model: &model,
            prompt,
            stream,
            keep_alive: KEEP_ALIVE,
            options: OllamaOptions {
                temperature: self.options.temperature,
                num_predict: self.options.max_tokens,
            },
        };

        debug!("Ollama generate (model={}, stream={})", model, stream);
        let response = self
            .client
            .post(&url)
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
        .map(|e| e.error)
        .unwrap_or(body);
    Err(BackendError::Status {
        backend: NAME,
        status,
        body,
    })
}

/// Decode one NDJSON line of a generate stream.
fn parse_stream_line(line: &str) -> Result<LineEvent<String>, BackendError> {
    let chunk: GenerateChunk =
        serde_json::from_str(line).map_err(|e| BackendError::decode(NAME, e.to_string()))?;

    if let Some(error) = chunk.error {
        return Err(BackendError::Remote(error));
    }

    let token = (!chunk.response.is_empty()).then_some(chunk.response);
    Ok(match (token, chunk.done) {
        (last, true) => LineEvent::Done(last),
        (Some(token), false) => LineEvent::Item(token),
        (None, false) => LineEvent::Skip,
    })
}

fn parse_pull_line(line: &str) -> Result<LineEvent<PullProgress>, BackendError> {
    let progress: PullProgress =
        serde_json::from_str(line).map_err(|e| BackendError::decode(NAME, e.to_string()))?;
    match progress.error {
        Some(ref error) => Err(BackendError::Remote(error.clone())),
        None => Ok(LineEvent::Item(progress)),
    }
}

#[derive(Debug, Serialize)]
struct LoadRequest<'a> {
    model: &'a str,
    keep_alive: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    keep_alive: &'a str,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// One progress report from `/api/pull`.
#[derive(Debug, Clone, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_token() {
        let event = parse_stream_line(r#"{"model":"m","response":"Hel","done":false}"#).unwrap();
        assert_eq!(event, LineEvent::Item("Hel".to_string()));
    }

    #[test]
    fn test_parse_stream_final_chunk() {
        let line = r#"{"model":"m","response":"","done":true,"done_reason":"stop"}"#;
        assert_eq!(parse_stream_line(line).unwrap(), LineEvent::Done(None));
    }

    #[test]
    fn test_parse_stream_empty_delta_skipped() {
        let line = r#"{"model":"m","response":"","done":false}"#;
        assert_eq!(parse_stream_line(line).unwrap(), LineEvent::Skip);
    }

    #[test]
    fn test_parse_stream_error() {
        let err = parse_stream_line(r#"{"error":"model crashed"}"#).unwrap_err();
        assert_eq!(err.to_string(), "model crashed");
    }

    #[test]
    fn test_parse_stream_garbage() {
        assert!(matches!(
            parse_stream_line("not json"),
            Err(BackendError::Decode { .. })
        ));
    }

    #[test]
    fn test_parse_pull_progress() {
        let event =
            parse_pull_line(r#"{"status":"pulling abc","completed":10,"total":100}"#).unwrap();
        let LineEvent::Item(progress) = event else {
            panic!("expected progress item");
        };
        assert_eq!(progress.status, "pulling abc");
        assert_eq!(progress.completed, Some(10));
        assert_eq!(progress.total, Some(100));
    }

    #[test]
    fn test_tags_response_decodes() {
        let tags: TagsResponse = serde_json::from_str(
            r#"{"models":[{"name":"smollm2:360m","size":725000000,"modified_at":"2024-01-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        assert_eq!(tags.models.len(), 1);
        assert_eq!(tags.models[0].name, "smollm2:360m");
        assert_eq!(tags.models[0].size, Some(725000000));
    }

    #[test]
    fn test_host_trailing_slash_trimmed() {
        let backend = OllamaBackend::new(
            "http://localhost:11434/".to_string(),
            GenerationOptions {
                temperature: 0.7,
                max_tokens: 128,
            },
        )
        .unwrap();
        assert_eq!(backend.host, "http://localhost:11434");
    }

    #[tokio::test]
    async fn test_generate_without_load_fails() {
        let backend = OllamaBackend::new(
            "http://localhost:11434".to_string(),
            GenerationOptions {
                temperature: 0.7,
                max_tokens: 128,
            },
        )
        .unwrap();
        assert!(matches!(
            backend.generate("hi").await,
            Err(BackendError::Config(_))
        ));
    }
}
