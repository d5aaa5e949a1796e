//! Data models for context management

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of messages kept verbatim next to the summary
pub const MAX_RECENT_MESSAGES: usize = 6;

/// What the caller is asking the engine to do with the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    Chat,
    Summary,
    Explain,
    Analysis,
    Glossary,
}

impl UseCase {
    /// Interactive chat builds its prompt from known parts, so its overhead is
    /// measured rather than guessed.
    pub fn has_precise_overhead(&self) -> bool {
        matches!(self, UseCase::Chat)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UseCase::Chat => "chat",
            UseCase::Summary => "summary",
            UseCase::Explain => "explain",
            UseCase::Analysis => "analysis",
            UseCase::Glossary => "glossary",
        }
    }
}

/// Where a chunk lives in the source document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocator {
    pub page_number: Option<u32>,
    pub char_start: Option<usize>,
    pub char_end: Option<usize>,
}

/// A retrieval unit of document text. Immutable once retrieved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentChunk {
    pub id: String,
    pub content: String,
    pub token_count: usize,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub parent_section: Option<String>,
    #[serde(default)]
    pub paragraph_index: Option<usize>,
    #[serde(default)]
    pub sentence_group_index: Option<usize>,
    pub document_order_index: usize,
    #[serde(default)]
    pub locator: ChunkLocator,
}

impl ContentChunk {
    pub fn new(id: impl Into<String>, content: impl Into<String>, token_count: usize) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            token_count,
            section: None,
            parent_section: None,
            paragraph_index: None,
            sentence_group_index: None,
            document_order_index: 0,
            locator: ChunkLocator::default(),
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_order(mut self, document_order_index: usize) -> Self {
        self.document_order_index = document_order_index;
        self
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.locator.page_number = Some(page);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// A resolved citation attached to an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based label the chunk carried in the prompt
    pub index: usize,
    pub chunk_id: String,
    pub section: Option<String>,
    pub document_order_index: usize,
    pub locator: ChunkLocator,
    /// Short excerpt of the cited chunk
    pub excerpt: String,
}

/// One conversation message. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_info: Option<Vec<Citation>>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            sources: None,
            source_info: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.sources = Some(citations.iter().map(|c| c.chunk_id.clone()).collect());
        self.source_info = Some(citations);
        self
    }

    /// Render as a transcript line
    pub fn transcript_line(&self) -> String {
        format!("{}: {}", self.role.label(), self.content)
    }
}

/// Rolling summary plus a bounded window of recent messages.
///
/// Only [`ConversationStateManager`](super::conversation::ConversationStateManager)
/// mutates this; persistence is the caller's concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationState {
    pub summary: Option<String>,
    pub recent_messages: Vec<ChatMessage>,
    /// Index into the full history of the last message absorbed into `summary`
    pub last_summarized_index: Option<usize>,
    pub summary_count: u32,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_history(&self) -> bool {
        self.summary.is_some() || !self.recent_messages.is_empty()
    }

    /// Copy of this state keeping only the last `window` recent messages
    pub fn with_window(&self, window: usize) -> Self {
        let skip = self.recent_messages.len().saturating_sub(window);
        Self {
            summary: self.summary.clone(),
            recent_messages: self.recent_messages[skip..].to_vec(),
            last_summarized_index: self.last_summarized_index,
            summary_count: self.summary_count,
        }
    }
}
