use serde::{Deserialize, Serialize};

use super::ids::ConversationId;

/// Storage-local message role, intentionally decoupled from wire-level roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: MessageRole,
    pub content: String,
}

/// One prompt/response pair. `message.content` only ever grows while a stream writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadEntry {
    pub input: String,
    pub message: ThreadMessage,
}

impl ThreadEntry {
    pub fn new(input: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            message: ThreadMessage {
                role,
                content: content.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub thread: Vec<ThreadEntry>,
    /// Prompt template that replaces history when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            thread: Vec::new(),
            template: None,
        }
    }

    pub fn last_input(&self) -> Option<&str> {
        self.thread.last().map(|entry| entry.input.as_str())
    }

    pub fn active_template(&self) -> Option<&str> {
        self.template
            .as_deref()
            .map(str::trim)
            .filter(|template| !template.is_empty())
    }
}

/// Serializable image of the whole store, handed to the persistence hook.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub conversations: Vec<Conversation>,
}

/// Change notifications for store subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    ConversationCreated {
        conversation_id: ConversationId,
    },
    ConversationDeleted {
        conversation_id: ConversationId,
    },
    EntryOpened {
        conversation_id: ConversationId,
        thread_index: usize,
    },
    ChunkAppended {
        conversation_id: ConversationId,
        thread_index: usize,
        chunk: String,
    },
    PairDropped {
        conversation_id: ConversationId,
        thread_index: usize,
    },
    EntryDeleted {
        conversation_id: ConversationId,
        thread_index: usize,
    },
    TemplateChanged {
        conversation_id: ConversationId,
    },
    Rehydrated {
        conversation_count: usize,
    },
}

impl StoreEvent {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::ConversationCreated { conversation_id }
            | Self::ConversationDeleted { conversation_id }
            | Self::EntryOpened {
                conversation_id, ..
            }
            | Self::ChunkAppended {
                conversation_id, ..
            }
            | Self::PairDropped {
                conversation_id, ..
            }
            | Self::EntryDeleted {
                conversation_id, ..
            }
            | Self::TemplateChanged { conversation_id } => Some(conversation_id),
            Self::Rehydrated { .. } => None,
        }
    }
}
