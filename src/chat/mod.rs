//! Chat session: transcript, published state and the controller driving them.
//!
//! The controller:
//! - Looks up the configured model on the backend and loads it
//! - Gates user messages on that model being ready
//! - Streams each reply into the transcript token by token

pub mod controller;
pub mod message;
pub mod state;

pub use controller::ChatController;
pub use message::ChatMessage;
pub use state::ChatState;
