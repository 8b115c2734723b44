//! Inference backend implementations.
//!
//! The chat controller only talks to an [`InferenceBackend`]; concrete
//! servers (Ollama, OpenAI-compatible) sit behind it so tests can swap in a
//! scripted double.

pub mod lines;
pub mod ollama;
pub mod openai;

#[cfg(test)]
pub mod scripted;

use crate::config::{BackendConfig, ChatConfig};
use crate::error::BackendError;
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// Lazily produced generation tokens. Finite and not restartable.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// A model as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHandle {
    pub id: String,
    pub name: String,
    pub is_downloaded: bool,
    /// On-disk size, when the backend reports it.
    pub size_bytes: Option<u64>,
}

impl ModelHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>, is_downloaded: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_downloaded,
            size_bytes: None,
        }
    }
}

/// Sampling parameters applied to every generation request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl From<&ChatConfig> for GenerationOptions {
    fn from(chat: &ChatConfig) -> Self {
        Self {
            temperature: chat.temperature,
            max_tokens: chat.max_tokens,
        }
    }
}

/// Capabilities the chat controller needs from an inference server.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// List the models the backend knows about.
    async fn list_models(&self) -> Result<Vec<ModelHandle>, BackendError>;

    /// Load a model by id. `Ok(false)` means the backend declined.
    async fn load_model(&self, id: &str) -> Result<bool, BackendError>;

    /// Generate a whole response with the loaded model.
    async fn generate(&self, prompt: &str) -> Result<String, BackendError>;

    /// Open a token stream for the prompt with the loaded model.
    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream, BackendError>;
}

/// Enum-based backend for the supported servers.
pub enum Backend {
    Ollama(ollama::OllamaBackend),
    OpenAI(openai::OpenAIBackend),
}

#[async_trait]
impl InferenceBackend for Backend {
    fn name(&self) -> &'static str {
        match self {
            Backend::Ollama(_) => ollama::NAME,
            Backend::OpenAI(_) => openai::NAME,
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelHandle>, BackendError> {
        match self {
            Backend::Ollama(b) => b.list_models().await,
            Backend::OpenAI(b) => b.list_models().await,
        }
    }

    async fn load_model(&self, id: &str) -> Result<bool, BackendError> {
        match self {
            Backend::Ollama(b) => b.load_model(id).await,
            Backend::OpenAI(b) => b.load_model(id).await,
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        match self {
            Backend::Ollama(b) => b.generate(prompt).await,
            Backend::OpenAI(b) => b.generate(prompt).await,
        }
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream, BackendError> {
        match self {
            Backend::Ollama(b) => b.generate_stream(prompt).await,
            Backend::OpenAI(b) => b.generate_stream(prompt).await,
        }
    }
}

/// Create a backend from configuration.
pub fn create_backend(
    config: &BackendConfig,
    options: GenerationOptions,
) -> Result<Arc<Backend>, BackendError> {
    let backend = match config {
        BackendConfig::Ollama { host } => {
            Backend::Ollama(ollama::OllamaBackend::new(host.clone(), options)?)
        }
        BackendConfig::OpenAI { host, api_key } => Backend::OpenAI(openai::OpenAIBackend::new(
            host.clone(),
            api_key.clone(),
            options,
        )?),
    };
    Ok(Arc::new(backend))
}

/// The model id a backend generates with, set by a successful load.
#[derive(Debug, Default)]
pub(crate) struct LoadedModel(RwLock<Option<String>>);

impl LoadedModel {
    pub(crate) fn set(&self, id: &str) {
        if let Ok(mut slot) = self.0.write() {
            *slot = Some(id.to_string());
        }
    }

    pub(crate) fn get(&self) -> Result<String, BackendError> {
        self.0
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| BackendError::Config("no model loaded".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_model_starts_empty() {
        let loaded = LoadedModel::default();
        assert!(matches!(loaded.get(), Err(BackendError::Config(_))));
        loaded.set("smollm2:360m");
        assert_eq!(loaded.get().unwrap(), "smollm2:360m");
    }

    #[test]
    fn test_create_backend_from_default_config() {
        let config = BackendConfig::default();
        let options = GenerationOptions {
            temperature: 0.7,
            max_tokens: 256,
        };
        let backend = create_backend(&config, options).unwrap();
        assert_eq!(backend.name(), "ollama");
    }
}
