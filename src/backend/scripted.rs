//! In-memory backend for controller tests.

use super::{InferenceBackend, ModelHandle, TokenStream};
use crate::error::BackendError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

type Scripted<T> = Result<T, String>;

/// What the next `generate_stream` call produces.
enum StreamScript {
    Tokens(Vec<Scripted<String>>),
    FailToOpen(String),
    Channel(mpsc::UnboundedReceiver<Scripted<String>>),
}

/// Backend whose answers are queued up front by the test.
pub struct ScriptedBackend {
    list_results: Mutex<VecDeque<Scripted<Vec<ModelHandle>>>>,
    list_gate: Mutex<Option<Arc<Notify>>>,
    load_result: Scripted<bool>,
    streams: Mutex<VecDeque<StreamScript>>,
    loads: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            list_results: Mutex::new(VecDeque::from([Ok(Vec::new())])),
            list_gate: Mutex::new(None),
            load_result: Ok(true),
            streams: Mutex::new(VecDeque::new()),
            loads: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A backend that lists one downloaded model and loads it.
    pub fn ready(name: &str) -> Self {
        Self::new().with_models(vec![ModelHandle::new("1", name, true)])
    }

    pub fn with_models(self, models: Vec<ModelHandle>) -> Self {
        self.with_list_results(vec![Ok(models)])
    }

    /// Successive `list_models` answers; the last one repeats.
    pub fn with_list_results(self, results: Vec<Scripted<Vec<ModelHandle>>>) -> Self {
        *self.list_results.lock().unwrap() = results.into();
        self
    }

    /// Hold the next `list_models` call until the returned gate is notified.
    pub fn gate_listing(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.list_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn with_load_result(mut self, result: Scripted<bool>) -> Self {
        self.load_result = result;
        self
    }

    pub fn push_tokens(&self, tokens: &[&str]) {
        let tokens = tokens.iter().map(|t| Ok(t.to_string())).collect();
        self.push(StreamScript::Tokens(tokens));
    }

    /// Tokens followed by a mid-stream failure.
    pub fn push_tokens_then_error(&self, tokens: &[&str], error: &str) {
        let mut script: Vec<Scripted<String>> = tokens.iter().map(|t| Ok(t.to_string())).collect();
        script.push(Err(error.to_string()));
        self.push(StreamScript::Tokens(script));
    }

    pub fn push_open_error(&self, error: &str) {
        self.push(StreamScript::FailToOpen(error.to_string()));
    }

    /// A stream fed by the test, one token at a time.
    pub fn push_channel(&self) -> mpsc::UnboundedSender<Scripted<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(StreamScript::Channel(rx));
        tx
    }

    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn push(&self, script: StreamScript) {
        self.streams.lock().unwrap().push_back(script);
    }

    fn next_stream(&self, prompt: &str) -> Option<StreamScript> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.streams.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn list_models(&self) -> Result<Vec<ModelHandle>, BackendError> {
        let gate = self.list_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut results = self.list_results.lock().unwrap();
        let result = if results.len() > 1 {
            results.pop_front()
        } else {
            results.front().cloned()
        };
        result
            .unwrap_or_else(|| Ok(Vec::new()))
            .map_err(BackendError::Remote)
    }

    async fn load_model(&self, id: &str) -> Result<bool, BackendError> {
        self.loads.lock().unwrap().push(id.to_string());
        self.load_result.clone().map_err(BackendError::Remote)
    }

    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let mut stream = self.generate_stream(prompt).await?;
        let mut text = String::new();
        while let Some(token) = stream.next().await {
            text.push_str(&token?);
        }
        Ok(text)
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream, BackendError> {
        match self.next_stream(prompt) {
            None => Ok(Box::pin(stream::empty::<Result<String, BackendError>>())),
            Some(StreamScript::FailToOpen(error)) => Err(BackendError::Remote(error)),
            Some(StreamScript::Tokens(tokens)) => Ok(Box::pin(stream::iter(
                tokens
                    .into_iter()
                    .map(|t| t.map_err(BackendError::Remote)),
            ))),
            Some(StreamScript::Channel(rx)) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                let token = rx.recv().await?;
                Some((token.map_err(BackendError::Remote), rx))
            }))),
        }
    }
}
