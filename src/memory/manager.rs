use std::{collections::VecDeque, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    config::{MemoryConfig, SessionConfig},
    dual_info, dual_warn,
    gateway::{CompletionGateway, CompletionRequest},
    memory::{session::Session, store::MemoryStore, summarizer::SessionSummarizer, types::*},
};

/// Session manager
///
/// Drives the session lifecycle and is the only writer of the memory store.
///
/// # Memory mode
/// The mode is consulted at exactly two points:
/// * `create_session` - a new session is seeded with the accumulated summary only while memory is on
/// * `close_session` - the accumulated summary is only updated when memory was on at close time
///
/// # Locking
/// Session bookkeeping and the memory store sit behind two async locks, always taken
/// in that order. `close_session` keeps the memory lock from reading the accumulated
/// summary until the merged summary is written, so two closes can never lose an update,
/// and a failed merge leaves the store exactly as it was.
pub struct SessionManager {
    gateway: Arc<dyn CompletionGateway>,
    summarizer: SessionSummarizer,
    sessions: Mutex<SessionBook>,
    memory: Mutex<MemoryStore>,
    history_limit: usize,
}

#[derive(Default)]
struct SessionBook {
    active: Option<Session>,
    /// Closed sessions, newest first.
    closed: VecDeque<ClosedSession>,
    sessions_created: u64,
}

struct ClosedSession {
    session: Session,
    mode_at_close: MemoryMode,
    summary: Option<String>,
    /// `None` while the memory store still has to take this session into account.
    memory_update: Option<MemoryUpdate>,
}

impl ClosedSession {
    fn is_settled(&self) -> bool {
        self.summary.is_some() && self.memory_update.is_some()
    }

    fn to_summary(&self) -> Option<SessionSummary> {
        let summary = self.summary.as_ref()?;
        Some(SessionSummary {
            session_id: self.session.id().to_string(),
            summary: summary.clone(),
            message_count: self.session.turn_count(),
            started_at: self.session.started_at(),
            ended_at: self
                .session
                .ended_at()
                .unwrap_or_else(|| self.session.started_at()),
        })
    }
}

impl SessionBook {
    fn open_session_mut(&mut self, id: &str, operation: &'static str) -> SessionResult<&mut Session> {
        let is_active = self.active.as_ref().is_some_and(|s| s.id() == id);
        if !is_active {
            return Err(self.not_open(id, operation));
        }

        self.active.as_mut().ok_or(SessionError::NoActiveSession)
    }

    fn take_active(&mut self, id: &str, operation: &'static str) -> SessionResult<Session> {
        match self.active.take() {
            Some(session) if session.id() == id => Ok(session),
            other => {
                self.active = other;
                Err(self.not_open(id, operation))
            }
        }
    }

    fn closed_mut(&mut self, id: &str) -> Option<&mut ClosedSession> {
        self.closed.iter_mut().find(|c| c.session.id() == id)
    }

    fn not_open(&self, id: &str, operation: &'static str) -> SessionError {
        match self.closed.iter().find(|c| c.session.id() == id) {
            Some(closed) => SessionError::InvalidState {
                id: id.to_string(),
                status: closed.session.status(),
                operation,
            },
            None => SessionError::NotFound(id.to_string()),
        }
    }
}

impl SessionManager {
    pub fn new(
        gateway: Arc<dyn CompletionGateway>,
        memory_config: &MemoryConfig,
        session_config: &SessionConfig,
    ) -> Self {
        let summarizer = SessionSummarizer::new(
            gateway.clone(),
            memory_config.summary_model.clone(),
            memory_config.summary_max_tokens,
        );

        Self {
            gateway,
            summarizer,
            sessions: Mutex::new(SessionBook::default()),
            memory: Mutex::new(MemoryStore::new(MemoryMode::from(memory_config.enable))),
            history_limit: session_config.history_limit.max(1),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn CompletionGateway> {
        &self.gateway
    }

    /// Create a new open session and make it the active one.
    ///
    /// While memory is on and an accumulated summary exists, the session takes a
    /// snapshot of it as its seed. Later memory updates never reach an existing session.
    ///
    /// # Errors
    /// * `SessionError::AlreadyActive` - another session is still open
    pub async fn create_session(&self) -> SessionResult<Session> {
        let mut book = self.sessions.lock().await;
        if let Some(active) = &book.active {
            return Err(SessionError::AlreadyActive(active.id().to_string()));
        }

        let (mode, seed) = {
            let memory = self.memory.lock().await;
            (memory.get_mode(), memory.seed())
        };

        let session = Session::new(seed);
        book.active = Some(session.clone());
        book.sessions_created += 1;

        dual_info!(
            "Created new session {} with memory {} (seeded: {})",
            session.id(),
            mode,
            session.seed_summary().is_some()
        );

        Ok(session)
    }

    /// Append a message to an open session.
    ///
    /// A user message is answered right away: the whole session history, seed
    /// included, goes to the completion gateway and the reply is appended too.
    /// If the gateway fails, the user message stays and no reply is added.
    ///
    /// Returns the messages appended by this call.
    pub async fn submit_turn(
        &self,
        session_id: &str,
        role: MessageRole,
        content: impl Into<String>,
    ) -> SessionResult<Vec<SessionMessage>> {
        let mut book = self.sessions.lock().await;
        let session = book.open_session_mut(session_id, "append to")?;

        let first_new = session.messages().len();
        session.push(role, content)?;

        if role == MessageRole::User {
            let request = CompletionRequest::new(session.history());
            let reply = match self.gateway.complete(request).await {
                Ok(reply) => reply,
                Err(e) => {
                    dual_warn!(
                        "No reply appended to session {}, the completion failed: {}",
                        session_id,
                        e
                    );
                    return Err(SessionError::Gateway(e));
                }
            };
            session.push(MessageRole::Assistant, reply.content)?;
        }

        dual_info!(
            "Session {} now holds {} messages",
            session_id,
            session.messages().len()
        );

        Ok(session.messages()[first_new..].to_vec())
    }

    /// Close the active session and summarize it.
    ///
    /// The session is closed before summarization starts and stays closed when
    /// summarization fails; `retry_summary` can pick it up again. The summary is
    /// always produced and returned, while the memory store is only updated when
    /// memory is on: the first summary is stored as is, later ones are merged with
    /// the accumulated summary by a further summarization call.
    ///
    /// # Errors
    /// * `SessionError::InvalidState` - the session is already closed
    /// * `SessionError::NotFound` - no such session, or it has dropped out of the retained history
    /// * `SessionError::SummaryFailure` - summarizing or merging failed; the memory store is untouched
    pub async fn close_session(&self, session_id: &str) -> SessionResult<CloseOutcome> {
        let mut book = self.sessions.lock().await;
        let mut session = book.take_active(session_id, "close")?;
        session.close()?;

        let mut memory = self.memory.lock().await;
        book.closed.push_front(ClosedSession {
            session,
            mode_at_close: memory.get_mode(),
            summary: None,
            memory_update: None,
        });
        while book.closed.len() > self.history_limit {
            if let Some(evicted) = book.closed.pop_back() {
                if !evicted.is_settled() {
                    dual_warn!(
                        "Dropping session {} from history before its summary was settled",
                        evicted.session.id()
                    );
                }
            }
        }

        let Some(record) = book.closed.front_mut() else {
            return Err(SessionError::NotFound(session_id.to_string()));
        };

        dual_info!(
            "Closed session {} with {} messages (memory {})",
            session_id,
            record.session.messages().len(),
            record.mode_at_close
        );

        self.settle(&mut memory, record).await
    }

    /// Retry summarization for a closed session whose summary or memory update failed.
    ///
    /// The memory update follows the mode captured when the session closed and is
    /// applied at most once. Retrying a settled session just returns its outcome.
    pub async fn retry_summary(&self, session_id: &str) -> SessionResult<CloseOutcome> {
        let mut book = self.sessions.lock().await;
        if let Some(active) = &book.active
            && active.id() == session_id
        {
            return Err(SessionError::InvalidState {
                id: session_id.to_string(),
                status: active.status(),
                operation: "summarize",
            });
        }

        let record = book
            .closed_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let mut memory = self.memory.lock().await;
        self.settle(&mut memory, record).await
    }

    async fn settle(
        &self,
        memory: &mut MemoryStore,
        record: &mut ClosedSession,
    ) -> SessionResult<CloseOutcome> {
        let session_id = record.session.id().to_string();

        let summary = match record.summary.clone() {
            Some(summary) => summary,
            None => {
                let summary = self
                    .summarizer
                    .summarize_session(record.session.messages())
                    .await
                    .inspect_err(|e| {
                        dual_warn!("Session {} stays unsummarized: {}", session_id, e);
                    })?;
                record.summary = Some(summary.clone());
                summary
            }
        };

        let update = match record.memory_update {
            Some(update) => update,
            None => {
                let update = if !record.mode_at_close.is_on() {
                    MemoryUpdate::SkippedMemoryOff
                } else {
                    self.carry_forward(memory, &summary)
                        .await
                        .inspect_err(|e| {
                            dual_warn!(
                                "Accumulated summary left unchanged after session {}: {}",
                                session_id,
                                e
                            );
                        })?
                };
                record.memory_update = Some(update);
                update
            }
        };

        dual_info!("Session {} summarized, memory update: {:?}", session_id, update);

        Ok(CloseOutcome {
            session_id,
            summary,
            memory: update,
        })
    }

    // Caller holds the memory lock for the whole read-merge-write sequence.
    async fn carry_forward(
        &self,
        memory: &mut MemoryStore,
        summary: &str,
    ) -> Result<MemoryUpdate, SummaryError> {
        let previous = memory.get_summary().map(str::to_string);
        match previous {
            None => {
                memory.set_summary(summary);
                Ok(MemoryUpdate::Stored)
            }
            Some(previous) => {
                let merged = self.summarizer.merge_summaries(&previous, summary).await?;
                memory.set_summary(merged);
                Ok(MemoryUpdate::Merged)
            }
        }
    }

    pub async fn active_session(&self) -> Option<Session> {
        self.sessions.lock().await.active.clone()
    }

    /// Look up the active session or a retained closed one.
    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        let book = self.sessions.lock().await;
        book.active
            .iter()
            .chain(book.closed.iter().map(|c| &c.session))
            .find(|s| s.id() == session_id)
            .cloned()
    }

    /// Summaries of retained closed sessions, newest first.
    pub async fn list_summaries(&self) -> Vec<SessionSummary> {
        let book = self.sessions.lock().await;
        book.closed.iter().filter_map(|c| c.to_summary()).collect()
    }

    pub async fn memory_mode(&self) -> MemoryMode {
        self.memory.lock().await.get_mode()
    }

    pub async fn set_memory_mode(&self, mode: MemoryMode) {
        let mut memory = self.memory.lock().await;
        if memory.get_mode() != mode {
            dual_info!("Memory mode switched from {} to {}", memory.get_mode(), mode);
        }
        memory.set_mode(mode);
    }

    pub async fn memory_snapshot(&self) -> MemoryStore {
        self.memory.lock().await.clone()
    }

    pub async fn clear_memory(&self) {
        self.memory.lock().await.clear();
        dual_info!("Accumulated summary cleared");
    }

    pub async fn stats(&self) -> MemoryStats {
        let book = self.sessions.lock().await;
        let memory = self.memory.lock().await;

        let total_messages: usize = book
            .active
            .iter()
            .map(|s| s.messages().len())
            .chain(book.closed.iter().map(|c| c.session.messages().len()))
            .sum();

        MemoryStats {
            sessions_created: book.sessions_created,
            active_session: book.active.as_ref().map(|s| s.id().to_string()),
            closed_sessions: book.closed.len(),
            pending_summaries: book.closed.iter().filter(|c| !c.is_settled()).count(),
            total_messages,
            memory_mode: memory.get_mode(),
            has_accumulated_summary: memory.get_summary().is_some(),
            summaries_folded: memory.summaries_folded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gateway::scripted::ScriptedGateway,
        memory::{session::SEED_CONTEXT_PREFIX, summarizer::EMPTY_SESSION_SUMMARY},
    };

    fn manager_with(gateway: Arc<ScriptedGateway>, enable: bool, history_limit: usize) -> SessionManager {
        let memory_config = MemoryConfig {
            enable,
            ..Default::default()
        };
        let session_config = SessionConfig { history_limit };
        SessionManager::new(gateway, &memory_config, &session_config)
    }

    fn manager(gateway: Arc<ScriptedGateway>, enable: bool) -> SessionManager {
        manager_with(gateway, enable, 50)
    }

    #[tokio::test]
    async fn test_user_turn_gets_reply() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_text("Hi there!");
        let manager = manager(gateway.clone(), true);

        let session = manager.create_session().await.unwrap();
        let appended = manager
            .submit_turn(session.id(), MessageRole::User, "Hello")
            .await
            .unwrap();

        assert_eq!(appended.len(), 2);
        assert_eq!(appended[0].role, MessageRole::User);
        assert_eq!(appended[1].role, MessageRole::Assistant);
        assert_eq!(appended[1].content, "Hi there!");
        assert_eq!(gateway.requests()[0].messages, vec![ChatMessage::user("Hello")]);
    }

    #[tokio::test]
    async fn test_non_user_turn_does_not_call_gateway() {
        let gateway = Arc::new(ScriptedGateway::new());
        let manager = manager(gateway.clone(), true);

        let session = manager.create_session().await.unwrap();
        let appended = manager
            .submit_turn(session.id(), MessageRole::System, "Be brief")
            .await
            .unwrap();

        assert_eq!(appended.len(), 1);
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_user_message_only() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_error(GatewayError::Timeout(std::time::Duration::from_secs(1)));
        let manager = manager(gateway, true);

        let session = manager.create_session().await.unwrap();
        let err = manager
            .submit_turn(session.id(), MessageRole::User, "Hello")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Gateway(GatewayError::Timeout(_))));

        let session = manager.get_session(session.id()).await.unwrap();
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].content, "Hello");
    }

    #[tokio::test]
    async fn test_closed_session_rejects_turns_and_second_close() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_text("Hi").push_text("User said hi");
        let manager = manager(gateway.clone(), false);

        let session = manager.create_session().await.unwrap();
        manager
            .submit_turn(session.id(), MessageRole::User, "hi")
            .await
            .unwrap();
        manager.close_session(session.id()).await.unwrap();
        let calls = gateway.call_count();

        let err = manager
            .submit_turn(session.id(), MessageRole::User, "again")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                status: SessionStatus::Closed,
                ..
            }
        ));

        let err = manager.close_session(session.id()).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));

        let closed = manager.get_session(session.id()).await.unwrap();
        assert_eq!(closed.messages().len(), 2);
        assert_eq!(closed.status(), SessionStatus::Closed);
        assert_eq!(gateway.call_count(), calls);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let manager = manager(Arc::new(ScriptedGateway::new()), true);

        let err = manager
            .submit_turn("missing", MessageRole::User, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));

        let err = manager.close_session("missing").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_only_one_active_session() {
        let manager = manager(Arc::new(ScriptedGateway::new()), true);

        let first = manager.create_session().await.unwrap();
        let err = manager.create_session().await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive(id) if id == first.id()));
    }

    #[tokio::test]
    async fn test_memory_off_does_not_carry_forward() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_text("Hello!").push_text("S_A");
        let manager = manager(gateway, false);

        let a = manager.create_session().await.unwrap();
        manager.submit_turn(a.id(), MessageRole::User, "hi").await.unwrap();
        let outcome = manager.close_session(a.id()).await.unwrap();
        assert_eq!(outcome.summary, "S_A");
        assert_eq!(outcome.memory, MemoryUpdate::SkippedMemoryOff);
        assert!(manager.memory_snapshot().await.get_summary().is_none());

        let b = manager.create_session().await.unwrap();
        assert!(b.seed_summary().is_none());
        assert!(b.messages().is_empty());
    }

    #[tokio::test]
    async fn test_memory_on_first_close_stores_summary() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_text("Lovely").push_text("S_A");
        let manager = manager(gateway.clone(), true);

        let a = manager.create_session().await.unwrap();
        manager
            .submit_turn(a.id(), MessageRole::User, "I like tea")
            .await
            .unwrap();
        let outcome = manager.close_session(a.id()).await.unwrap();

        assert_eq!(outcome.memory, MemoryUpdate::Stored);
        assert_eq!(manager.memory_snapshot().await.get_summary(), Some("S_A"));
        // one reply plus one summary, no merge
        assert_eq!(gateway.call_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_on_chained_merge() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway
            .push_text("reply A")
            .push_text("S_A")
            .push_text("reply B")
            .push_text("S_B")
            .push_text("MERGED(S_A,S_B)");
        let manager = manager(gateway.clone(), true);

        let a = manager.create_session().await.unwrap();
        manager.submit_turn(a.id(), MessageRole::User, "a").await.unwrap();
        manager.close_session(a.id()).await.unwrap();

        let b = manager.create_session().await.unwrap();
        manager.submit_turn(b.id(), MessageRole::User, "b").await.unwrap();
        let outcome = manager.close_session(b.id()).await.unwrap();

        assert_eq!(outcome.summary, "S_B");
        assert_eq!(outcome.memory, MemoryUpdate::Merged);
        let memory = manager.memory_snapshot().await;
        assert_eq!(memory.get_summary(), Some("MERGED(S_A,S_B)"));
        assert_eq!(memory.summaries_folded(), 2);

        let requests = gateway.requests();
        assert_eq!(requests.len(), 5);
        let merge_prompt = &requests[4].messages[0].content;
        assert!(merge_prompt.contains("S_A"));
        assert!(merge_prompt.contains("S_B"));
    }

    #[tokio::test]
    async fn test_seed_is_first_message_and_reaches_gateway() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_text("reply").push_text("User likes tea");
        let manager = manager(gateway.clone(), true);

        let a = manager.create_session().await.unwrap();
        manager
            .submit_turn(a.id(), MessageRole::User, "I like tea")
            .await
            .unwrap();
        manager.close_session(a.id()).await.unwrap();

        let b = manager.create_session().await.unwrap();
        assert_eq!(b.seed_summary(), Some("User likes tea"));
        assert_eq!(b.messages()[0].role, MessageRole::System);
        assert_eq!(
            b.messages()[0].content,
            format!("{SEED_CONTEXT_PREFIX}User likes tea")
        );

        manager
            .submit_turn(b.id(), MessageRole::User, "My name is Sam")
            .await
            .unwrap();
        let sent = &gateway.requests()[2].messages;
        assert_eq!(sent[0].role, MessageRole::System);
        assert!(sent[0].content.contains("User likes tea"));
        assert_eq!(sent[1], ChatMessage::user("My name is Sam"));
    }

    #[tokio::test]
    async fn test_toggle_off_keeps_summary_inert() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway
            .push_text("reply A")
            .push_text("S_A")
            .push_text("reply B")
            .push_text("S_B");
        let manager = manager(gateway.clone(), true);

        let a = manager.create_session().await.unwrap();
        manager.submit_turn(a.id(), MessageRole::User, "a").await.unwrap();
        manager.close_session(a.id()).await.unwrap();

        manager.set_memory_mode(MemoryMode::Off).await;
        let b = manager.create_session().await.unwrap();
        assert!(b.seed_summary().is_none());
        manager.submit_turn(b.id(), MessageRole::User, "b").await.unwrap();
        let outcome = manager.close_session(b.id()).await.unwrap();

        assert_eq!(outcome.memory, MemoryUpdate::SkippedMemoryOff);
        assert_eq!(manager.memory_snapshot().await.get_summary(), Some("S_A"));
        assert_eq!(gateway.call_count(), 4);

        manager.set_memory_mode(MemoryMode::On).await;
        let c = manager.create_session().await.unwrap();
        assert_eq!(c.seed_summary(), Some("S_A"));

        manager.close_session(c.id()).await.unwrap();
        manager.clear_memory().await;
        let d = manager.create_session().await.unwrap();
        assert!(d.seed_summary().is_none());
    }

    #[tokio::test]
    async fn test_empty_session_is_carried_forward() {
        let gateway = Arc::new(ScriptedGateway::new());
        let manager = manager(gateway.clone(), true);

        let a = manager.create_session().await.unwrap();
        let outcome = manager.close_session(a.id()).await.unwrap();

        assert_eq!(outcome.summary, EMPTY_SESSION_SUMMARY);
        assert_eq!(outcome.memory, MemoryUpdate::Stored);
        assert_eq!(
            manager.memory_snapshot().await.get_summary(),
            Some(EMPTY_SESSION_SUMMARY)
        );
        assert_eq!(gateway.call_count(), 0);

        let b = manager.create_session().await.unwrap();
        assert_eq!(b.seed_summary(), Some(EMPTY_SESSION_SUMMARY));
    }

    #[tokio::test]
    async fn test_empty_session_merges_into_existing_summary() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway
            .push_text("Tea is great")
            .push_text("User likes tea")
            .push_text("User likes tea; a later session was empty");
        let manager = manager(gateway.clone(), true);

        let a = manager.create_session().await.unwrap();
        manager
            .submit_turn(a.id(), MessageRole::User, "I like tea")
            .await
            .unwrap();
        manager.close_session(a.id()).await.unwrap();

        let b = manager.create_session().await.unwrap();
        let outcome = manager.close_session(b.id()).await.unwrap();

        assert_eq!(outcome.memory, MemoryUpdate::Merged);
        assert_eq!(
            manager.memory_snapshot().await.get_summary(),
            Some("User likes tea; a later session was empty")
        );
        let merge = gateway.requests().pop().unwrap();
        assert!(merge.messages[0].content.contains(EMPTY_SESSION_SUMMARY));
    }

    #[tokio::test]
    async fn test_summary_failure_keeps_session_closed_and_memory_clean() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway
            .push_text("reply")
            .push_error(GatewayError::Transport("down".to_string()))
            .push_text("S_A");
        let manager = manager(gateway.clone(), true);

        let a = manager.create_session().await.unwrap();
        manager.submit_turn(a.id(), MessageRole::User, "hi").await.unwrap();

        let err = manager.close_session(a.id()).await.unwrap_err();
        assert!(matches!(err, SessionError::SummaryFailure(_)));
        assert!(manager.memory_snapshot().await.get_summary().is_none());
        assert!(manager.active_session().await.is_none());
        assert_eq!(
            manager.get_session(a.id()).await.unwrap().status(),
            SessionStatus::Closed
        );
        assert_eq!(manager.stats().await.pending_summaries, 1);
        assert!(manager.list_summaries().await.is_empty());

        let outcome = manager.retry_summary(a.id()).await.unwrap();
        assert_eq!(outcome.summary, "S_A");
        assert_eq!(outcome.memory, MemoryUpdate::Stored);
        assert_eq!(manager.memory_snapshot().await.get_summary(), Some("S_A"));
        assert_eq!(manager.stats().await.pending_summaries, 0);

        // settled sessions are not summarized again
        let again = manager.retry_summary(a.id()).await.unwrap();
        assert_eq!(again.summary, "S_A");
        assert_eq!(gateway.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_merge_is_atomic() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway
            .push_text("reply A")
            .push_text("S_A")
            .push_text("reply B")
            .push_text("S_B")
            .push_error(GatewayError::Status {
                status: 503,
                message: "busy".to_string(),
            })
            .push_text("MERGED");
        let manager = manager(gateway.clone(), true);

        let a = manager.create_session().await.unwrap();
        manager.submit_turn(a.id(), MessageRole::User, "a").await.unwrap();
        manager.close_session(a.id()).await.unwrap();

        let b = manager.create_session().await.unwrap();
        manager.submit_turn(b.id(), MessageRole::User, "b").await.unwrap();
        let err = manager.close_session(b.id()).await.unwrap_err();
        assert!(matches!(err, SessionError::SummaryFailure(_)));

        let memory = manager.memory_snapshot().await;
        assert_eq!(memory.get_summary(), Some("S_A"));
        assert_eq!(memory.summaries_folded(), 1);

        // the session summary survived, only the merge is redone
        let outcome = manager.retry_summary(b.id()).await.unwrap();
        assert_eq!(outcome.summary, "S_B");
        assert_eq!(outcome.memory, MemoryUpdate::Merged);
        assert_eq!(manager.memory_snapshot().await.get_summary(), Some("MERGED"));
        assert_eq!(gateway.call_count(), 6);
    }

    #[tokio::test]
    async fn test_retry_uses_mode_at_close() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway
            .push_text("reply")
            .push_error(GatewayError::Cancelled)
            .push_text("S_A");
        let manager = manager(gateway, false);

        let a = manager.create_session().await.unwrap();
        manager.submit_turn(a.id(), MessageRole::User, "hi").await.unwrap();
        manager.close_session(a.id()).await.unwrap_err();

        manager.set_memory_mode(MemoryMode::On).await;
        let outcome = manager.retry_summary(a.id()).await.unwrap();
        assert_eq!(outcome.memory, MemoryUpdate::SkippedMemoryOff);
        assert!(manager.memory_snapshot().await.get_summary().is_none());
    }

    #[tokio::test]
    async fn test_retry_rejects_open_and_unknown_sessions() {
        let manager = manager(Arc::new(ScriptedGateway::new()), true);
        let a = manager.create_session().await.unwrap();

        let err = manager.retry_summary(a.id()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                status: SessionStatus::Open,
                ..
            }
        ));

        let err = manager.retry_summary("missing").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let gateway = Arc::new(ScriptedGateway::new());
        let manager = manager_with(gateway, false, 2);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let s = manager.create_session().await.unwrap();
            manager.submit_turn(s.id(), MessageRole::User, "hi").await.unwrap();
            manager.close_session(s.id()).await.unwrap();
            ids.push(s.id().to_string());
        }

        let summaries = manager.list_summaries().await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].session_id, ids[2]);
        assert_eq!(summaries[1].session_id, ids[1]);
        assert_eq!(summaries[0].message_count, 2);
        assert!(manager.get_session(&ids[0]).await.is_none());

        // evicted sessions are unknown, retained ones report their state
        let err = manager.close_session(&ids[0]).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        let err = manager.close_session(&ids[1]).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                status: SessionStatus::Closed,
                ..
            }
        ));

        let stats = manager.stats().await;
        assert_eq!(stats.sessions_created, 3);
        assert_eq!(stats.closed_sessions, 2);
        assert_eq!(stats.total_messages, 4);
        assert!(stats.active_session.is_none());
    }

    #[tokio::test]
    async fn test_end_to_end_memory_chain() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway
            .push_text("Tea is great")
            .push_text("User likes tea")
            .push_text("Nice to meet you, Sam")
            .push_text("User's name is Sam")
            .push_text("User likes tea; user's name is Sam");
        let manager = manager(gateway, true);

        let a = manager.create_session().await.unwrap();
        manager
            .submit_turn(a.id(), MessageRole::User, "I like tea")
            .await
            .unwrap();
        manager.close_session(a.id()).await.unwrap();
        assert_eq!(
            manager.memory_snapshot().await.get_summary(),
            Some("User likes tea")
        );

        let b = manager.create_session().await.unwrap();
        assert!(b.seed_summary().unwrap().contains("User likes tea"));
        manager
            .submit_turn(b.id(), MessageRole::User, "My name is Sam")
            .await
            .unwrap();
        manager.close_session(b.id()).await.unwrap();

        let c = manager.create_session().await.unwrap();
        assert_eq!(c.seed_summary(), Some("User likes tea; user's name is Sam"));
        // B's seed is a snapshot, unaffected by the later merge
        assert_eq!(
            manager.get_session(b.id()).await.unwrap().seed_summary(),
            Some("User likes tea")
        );
    }
}
