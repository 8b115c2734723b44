//! Chat messages and the transcript that holds them.

use std::sync::Arc;

/// One entry in the conversation. Never edited in place; a changed message is
/// a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: String,
    pub is_user: bool,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_user: true,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_user: false,
        }
    }
}

/// Ordered, immutable snapshot of the conversation.
///
/// Every update builds a new transcript, so a clone handed to a reader never
/// changes underneath it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript(Arc<[ChatMessage]>);

impl Transcript {
    /// A transcript holding a single status message.
    pub fn status(text: impl Into<String>) -> Self {
        Self::from(vec![ChatMessage::assistant(text)])
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub fn last(&self) -> Option<&ChatMessage> {
        self.0.last()
    }

    /// A new transcript with `message` appended.
    pub fn appended(&self, message: ChatMessage) -> Self {
        let mut messages = self.0.to_vec();
        messages.push(message);
        Self::from(messages)
    }

    /// A new transcript showing `partial` as the assistant's reply so far.
    ///
    /// An assistant message at the end is the reply being streamed and gets
    /// replaced; after a user message the reply starts a new entry.
    pub fn with_assistant_reply(&self, partial: &str) -> Self {
        let mut messages = self.0.to_vec();
        let reply = ChatMessage::assistant(partial);
        match messages.last_mut() {
            Some(last) if !last.is_user => *last = reply,
            _ => messages.push(reply),
        }
        Self::from(messages)
    }
}

impl From<Vec<ChatMessage>> for Transcript {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Self(messages.into())
    }
}
