//! Chat controller: model readiness plus streamed replies.
//!
//! All state lives in one `watch` channel. Every change publishes a whole new
//! [`ChatState`], so observers never see a half-applied update.

use super::message::{ChatMessage, Transcript};
use super::state::ChatState;
use crate::backend::InferenceBackend;
use crate::error::{BackendError, ChatError, ChatErrorKind};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

pub const LOADING_MESSAGE: &str = "Loading AI model...";
pub const READY_MESSAGE: &str = "Model ready! How can I help?";
pub const WAIT_MESSAGE: &str = "Please wait for the model to finish loading.";
const LOAD_DECLINED: &str = "Failed to load model from backend.";

/// Coordinates model setup and chat turns against an inference backend.
pub struct ChatController {
    backend: Arc<dyn InferenceBackend>,
    state: watch::Sender<ChatState>,
    /// Model name of the last `initialize`; the lock serializes setup runs.
    target: Mutex<Option<String>>,
    /// One chat turn at a time.
    turn: Mutex<()>,
}

impl ChatController {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        let (state, _) = watch::channel(ChatState::default());
        Self {
            backend,
            state,
            target: Mutex::new(None),
            turn: Mutex::new(()),
        }
    }

    /// Observe every published state.
    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ChatState {
        self.state.borrow().clone()
    }

    pub fn transcript(&self) -> Transcript {
        self.state.borrow().transcript.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.borrow().ready
    }

    #[cfg(test)]
    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    /// Find `model_name` on the backend and load it.
    ///
    /// Outcomes are written to the transcript as a single status message;
    /// the returned error carries the same failure in typed form. Does
    /// nothing once a model is ready.
    pub async fn initialize(&self, model_name: &str) -> Result<(), ChatError> {
        let mut target = self.target.lock().await;
        if self.is_ready() {
            debug!("Model already ready, skipping initialization");
            return Ok(());
        }
        *target = Some(model_name.to_string());
        self.setup(model_name).await
    }

    /// Run initialization again for the last requested model.
    ///
    /// Does nothing when a model is already ready or `initialize` was never
    /// called.
    pub async fn retry(&self) -> Result<(), ChatError> {
        let target = self.target.lock().await;
        if self.is_ready() {
            return Ok(());
        }
        match target.as_deref() {
            Some(model_name) => {
                info!("Retrying setup of '{}'", model_name);
                self.setup(model_name).await
            }
            None => {
                debug!("Nothing to retry, no model requested yet");
                Ok(())
            }
        }
    }

    async fn setup(&self, model_name: &str) -> Result<(), ChatError> {
        info!(
            "Setting up chat model '{}' via {}",
            model_name,
            self.backend.name()
        );
        let _busy = BusyGuard::acquire(&self.state, |state| {
            state.transcript = Transcript::status(LOADING_MESSAGE);
            state.last_error = None;
        });

        match self.find_and_load(model_name).await {
            Ok(()) => {
                info!("Model '{}' loaded", model_name);
                publish(&self.state, |state| {
                    state.ready = true;
                    state.transcript = Transcript::status(READY_MESSAGE);
                });
                Ok(())
            }
            Err(err) => {
                match err.kind {
                    ChatErrorKind::ModelUnavailable => warn!("{}", err),
                    _ => error!("Error during model setup: {}", err),
                }
                publish(&self.state, |state| {
                    state.transcript = Transcript::status(status_text(&err));
                    state.last_error = Some(err.clone());
                });
                Err(err)
            }
        }
    }

    async fn find_and_load(&self, model_name: &str) -> Result<(), ChatError> {
        let models = self
            .backend
            .list_models()
            .await
            .map_err(|e| ChatError::new(ChatErrorKind::ModelDiscovery, e.to_string()))?;

        let model = models
            .iter()
            .find(|m| m.name == model_name)
            .filter(|m| m.is_downloaded)
            .ok_or_else(|| {
                ChatError::new(
                    ChatErrorKind::ModelUnavailable,
                    format!("Model '{}' is not downloaded.", model_name),
                )
            })?;

        debug!("Loading model id {}", model.id);
        match self.backend.load_model(&model.id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ChatError::new(ChatErrorKind::ModelLoad, LOAD_DECLINED)),
            Err(e) => Err(ChatError::new(ChatErrorKind::ModelLoad, e.to_string())),
        }
    }

    /// Send a user message and stream the reply into the transcript.
    ///
    /// Before a model is ready this only appends a "please wait" notice and
    /// returns `Ok`. Concurrent calls run one after another.
    pub async fn send_message(&self, text: &str) -> Result<(), ChatError> {
        if !self.is_ready() {
            debug!("Message received before model was ready");
            publish(&self.state, |state| {
                state.transcript = state.transcript.appended(ChatMessage::assistant(WAIT_MESSAGE));
            });
            return Ok(());
        }

        let _turn = self.turn.lock().await;
        publish(&self.state, |state| {
            state.transcript = state.transcript.appended(ChatMessage::user(text));
        });
        let _busy = BusyGuard::acquire(&self.state, |_| {});

        match self.stream_reply(text).await {
            Ok(tokens) => {
                debug!("Reply complete ({} tokens)", tokens);
                Ok(())
            }
            Err(err) => {
                error!("Generation failed: {}", err);
                publish(&self.state, |state| {
                    state.transcript = state
                        .transcript
                        .appended(ChatMessage::assistant(status_text(&err)));
                    state.last_error = Some(err.clone());
                });
                Err(err)
            }
        }
    }

    /// Consume the token stream, republishing the transcript after each token.
    async fn stream_reply(&self, prompt: &str) -> Result<usize, ChatError> {
        let mut tokens = self
            .backend
            .generate_stream(prompt)
            .await
            .map_err(generation_error)?;

        let mut reply = String::new();
        let mut count = 0;
        while let Some(token) = tokens.next().await {
            reply.push_str(&token.map_err(generation_error)?);
            count += 1;
            publish(&self.state, |state| {
                state.transcript = state.transcript.with_assistant_reply(&reply);
            });
        }
        Ok(count)
    }

    /// Generate a whole reply without touching the transcript.
    pub async fn generate(&self, prompt: &str) -> Result<String, ChatError> {
        if !self.is_ready() {
            return Err(ChatError::new(
                ChatErrorKind::ModelUnavailable,
                "Model is not ready.",
            ));
        }
        let _turn = self.turn.lock().await;
        let _busy = BusyGuard::acquire(&self.state, |_| {});
        self.backend.generate(prompt).await.map_err(generation_error)
    }
}

fn generation_error(e: BackendError) -> ChatError {
    ChatError::new(ChatErrorKind::Generation, e.to_string())
}

/// Transcript wording for a failure.
fn status_text(err: &ChatError) -> String {
    match err.kind {
        ChatErrorKind::ModelDiscovery | ChatErrorKind::ModelLoad => {
            format!("Error setting up chat model: {}", err.message)
        }
        ChatErrorKind::ModelUnavailable | ChatErrorKind::Generation => {
            format!("Error: {}", err.message)
        }
    }
}

/// Apply `update` and notify observers only if the state actually changed.
fn publish(state: &watch::Sender<ChatState>, update: impl FnOnce(&mut ChatState)) {
    state.send_if_modified(|current| {
        let before = current.clone();
        update(current);
        *current != before
    });
}

/// Holds the loading flag for its lifetime, including when the owning future
/// is dropped mid-await.
struct BusyGuard<'a> {
    state: &'a watch::Sender<ChatState>,
}

impl<'a> BusyGuard<'a> {
    fn acquire(state: &'a watch::Sender<ChatState>, update: impl FnOnce(&mut ChatState)) -> Self {
        publish(state, |current| {
            current.loading = true;
            update(current);
        });
        Self { state }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        publish(self.state, |current| current.loading = false);
    }
}
