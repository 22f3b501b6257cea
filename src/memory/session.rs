use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::memory::types::*;

/// Prefix of the system message that carries the accumulated summary into a new session.
pub const SEED_CONTEXT_PREFIX: &str = "Previous conversation context: ";

/// One bounded conversation.
///
/// Messages can only be appended while the session is open. Closing is a one-way
/// transition; after it the message list is frozen.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    id: String,
    status: SessionStatus,
    messages: Vec<SessionMessage>,
    seed_summary: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create an open session, optionally seeded with a summary of earlier sessions.
    ///
    /// A seed becomes the first message, tagged `system`, so the completion
    /// gateway sees it as prior context. Blank seeds are ignored.
    pub fn new(seed_summary: Option<String>) -> Self {
        let seed_summary = seed_summary.filter(|s| !s.trim().is_empty());

        let mut messages = Vec::new();
        if let Some(summary) = &seed_summary {
            messages.push(SessionMessage::new(
                MessageRole::System,
                format!("{SEED_CONTEXT_PREFIX}{summary}"),
            ));
        }

        Self {
            id: gen_session_id(),
            status: SessionStatus::Open,
            messages,
            seed_summary,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn messages(&self) -> &[SessionMessage] {
        &self.messages
    }

    pub fn seed_summary(&self) -> Option<&str> {
        self.seed_summary.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Number of user and assistant messages, the seed excluded.
    pub fn turn_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .count()
    }

    /// The message list in gateway form, seed included.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(|m| m.to_chat_message()).collect()
    }

    pub fn push(&mut self, role: MessageRole, content: impl Into<String>) -> SessionResult<()> {
        self.ensure_open("append to")?;
        self.messages.push(SessionMessage::new(role, content));
        Ok(())
    }

    pub fn close(&mut self) -> SessionResult<()> {
        self.ensure_open("close")?;
        self.status = SessionStatus::Closed;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn ensure_open(&self, operation: &'static str) -> SessionResult<()> {
        match self.status {
            SessionStatus::Open => Ok(()),
            status => Err(SessionError::InvalidState {
                id: self.id.clone(),
                status,
                operation,
            }),
        }
    }
}

fn gen_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
