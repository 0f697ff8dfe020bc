//! Conversation model: an append-only log of turns owned by one agent run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, ContentBlock, Role};

/// A single entry in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConversationEntry {
    #[serde(rename = "user")]
    User {
        content: Vec<ContentBlock>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "assistant")]
    Assistant {
        content: Vec<ContentBlock>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        tool: String,
        content: String,
        is_error: bool,
        timestamp: DateTime<Utc>,
    },
}

impl ConversationEntry {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self::User {
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self::Assistant {
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        tool: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            tool: tool.into(),
            content: content.into(),
            is_error,
            timestamp: Utc::now(),
        }
    }
}

/// Ordered conversation state. Entries can only be appended.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    entries: Vec<ConversationEntry>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a conversation from caller-supplied chat messages.
    ///
    /// System messages are not turns; their text is returned separately so the
    /// caller can fold it into the system prompt.
    pub fn from_chat_messages(messages: &[ChatMessage]) -> (Self, Option<String>) {
        let mut conversation = Self::new();
        let mut system_parts = Vec::new();

        for message in messages {
            match message.role {
                Role::System => system_parts.push(message.text()),
                Role::User => conversation.append(ConversationEntry::user(message.to_blocks())),
                Role::Assistant => {
                    conversation.append(ConversationEntry::assistant(message.to_blocks()))
                }
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (conversation, system)
    }

    pub fn append(&mut self, entry: ConversationEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of tool-result entries recorded so far.
    pub fn tool_result_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, ConversationEntry::ToolResult { .. }))
            .count()
    }
}
