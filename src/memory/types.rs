use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            _ => Err(anyhow::anyhow!("Invalid message role: {}", s)),
        }
    }
}

/// A role-tagged message, the unit exchanged with the completion gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// A message as stored in a session, with the time it was appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Open => write!(f, "open"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Whether closed-session summaries carry forward into new sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    #[default]
    On,
    Off,
}

impl MemoryMode {
    pub fn is_on(&self) -> bool {
        matches!(self, MemoryMode::On)
    }
}

impl From<bool> for MemoryMode {
    fn from(enabled: bool) -> Self {
        if enabled { MemoryMode::On } else { MemoryMode::Off }
    }
}

impl std::fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryMode::On => write!(f, "on"),
            MemoryMode::Off => write!(f, "off"),
        }
    }
}

impl std::str::FromStr for MemoryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" | "true" | "enabled" => Ok(MemoryMode::On),
            "off" | "false" | "disabled" => Ok(MemoryMode::Off),
            _ => Err(anyhow::anyhow!("Invalid memory mode: {}", s)),
        }
    }
}

/// Summary record of a closed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub summary: String,
    pub message_count: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// What closing a session did to the accumulated summary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryUpdate {
    /// First summary of a chain, stored as is.
    Stored,
    /// Folded into the previous accumulated summary.
    Merged,
    /// Memory was off when the session closed.
    SkippedMemoryOff,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseOutcome {
    pub session_id: String,
    pub summary: String,
    pub memory: MemoryUpdate,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub sessions_created: u64,
    pub active_session: Option<String>,
    pub closed_sessions: usize,
    pub pending_summaries: usize,
    pub total_messages: usize,
    pub memory_mode: MemoryMode,
    pub has_accumulated_summary: bool,
    pub summaries_folded: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Completion request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Completion request was cancelled")]
    Cancelled,

    #[error("Failed to reach the completion service: {0}")]
    Transport(String),

    #[error("Completion service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid completion response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SummaryError {
    #[error("Summarization failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Summarization failed: the model returned an empty summary")]
    EmptySummary,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Cannot {operation} session {id}: session is {status}")]
    InvalidState {
        id: String,
        status: SessionStatus,
        operation: &'static str,
    },

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Session {0} is still active")]
    AlreadyActive(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    SummaryFailure(#[from] SummaryError),
}

pub type SessionResult<T> = Result<T, SessionError>;
