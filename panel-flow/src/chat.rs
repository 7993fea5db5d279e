//! Chat transcript accumulation over streamed response events.
//!
//! The transcript is updated chunk by chunk so a caller can render
//! partial output. A mid-stream failure keeps everything up to the last
//! fully received chunk and appends exactly one terminal error message.

use crate::client::ChatEvent;
use serde::{Deserialize, Serialize};

/// Fixed greeting the assistant opens every session with.
pub const CHAT_GREETING: &str = "Hello! I'm your Health Insights assistant. \
I've reviewed the case files. How can I help you understand the diagnosis?";

/// Message shown when a response stream fails mid-flight.
pub const CHAT_STREAM_FAILURE: &str = "I'm sorry, I encountered an error while \
processing your request. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            text: text.into(),
        }
    }
}

/// Ordered transcript of one chat session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatTranscript {
    pub messages: Vec<ChatMessage>,
}

impl ChatTranscript {
    /// A fresh transcript opening with the assistant greeting.
    pub fn with_greeting() -> Self {
        Self {
            messages: vec![ChatMessage::assistant(CHAT_GREETING)],
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::user(text));
    }

    /// Open an empty assistant message that subsequent deltas append to.
    pub fn begin_assistant(&mut self) {
        self.messages.push(ChatMessage::assistant(""));
    }

    /// Fold one streamed event into the transcript.
    pub fn apply(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::Delta(chunk) => {
                match self.messages.last_mut() {
                    Some(msg) if msg.role == ChatRole::Assistant => msg.text.push_str(chunk),
                    _ => self.messages.push(ChatMessage::assistant(chunk.clone())),
                }
            }
            ChatEvent::Done => {}
            ChatEvent::Error(_) => {
                // An in-progress message that never received a chunk is
                // dropped; a partial one stays as received.
                let empty_in_progress = self
                    .messages
                    .last()
                    .is_some_and(|m| m.role == ChatRole::Assistant && m.text.is_empty());
                if empty_in_progress {
                    self.messages.pop();
                }
                self.messages.push(ChatMessage::assistant(CHAT_STREAM_FAILURE));
            }
        }
    }
}
