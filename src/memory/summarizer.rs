use std::sync::Arc;

use crate::{
    dual_debug, dual_info,
    gateway::{CompletionGateway, CompletionRequest},
    memory::types::*,
};

/// Summary returned for a session in which nothing was said.
pub const EMPTY_SESSION_SUMMARY: &str = "Empty session with no messages.";

/// Session summarizer
///
/// Wraps the completion gateway with fixed instructions. It reduces a session
/// transcript to a short summary, and folds two summaries into one narrative so
/// the carried context stays bounded across many sessions.
///
/// Each call is a one-shot request, independent of any open session.
pub struct SessionSummarizer {
    gateway: Arc<dyn CompletionGateway>,
    /// Model used for summarization; `None` falls back to the gateway default.
    model_name: Option<String>,
    max_tokens: u32,
}

impl SessionSummarizer {
    pub fn new(
        gateway: Arc<dyn CompletionGateway>,
        model_name: Option<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            gateway,
            model_name,
            max_tokens,
        }
    }

    /// Summarize a session transcript.
    ///
    /// System messages (the carried-forward seed among them) are left out of the
    /// transcript. A transcript without user or assistant turns yields
    /// [`EMPTY_SESSION_SUMMARY`] without calling the gateway.
    ///
    /// # Errors
    /// * `SummaryError::Gateway` - the completion call failed
    /// * `SummaryError::EmptySummary` - the model answered with blank text
    pub async fn summarize_session(&self, messages: &[SessionMessage]) -> Result<String, SummaryError> {
        let conversation = format_conversation(messages);
        if conversation.is_empty() {
            return Ok(EMPTY_SESSION_SUMMARY.to_string());
        }

        dual_info!("Summarizing a session transcript of {} messages", messages.len());

        let prompt = build_session_prompt(&conversation);
        self.generate(prompt).await
    }

    /// Merge the accumulated summary with the summary of the session just closed.
    pub async fn merge_summaries(&self, previous: &str, latest: &str) -> Result<String, SummaryError> {
        dual_info!("Merging the accumulated summary with the latest session summary");

        let prompt = build_merge_prompt(previous, latest);
        self.generate(prompt).await
    }

    async fn generate(&self, prompt: String) -> Result<String, SummaryError> {
        dual_debug!("Prompt for summary generation:\n{}", prompt);

        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)])
            .with_model(self.model_name.clone())
            .with_max_tokens(self.max_tokens);

        let reply = self.gateway.complete(request).await?;
        let summary = reply.content.trim();
        if summary.is_empty() {
            return Err(SummaryError::EmptySummary);
        }

        Ok(summary.to_string())
    }
}

fn format_conversation(messages: &[SessionMessage]) -> String {
    messages
        .iter()
        .filter_map(|msg| match msg.role {
            MessageRole::System => None,
            MessageRole::User => Some(format!("User: {}", msg.content)),
            MessageRole::Assistant => Some(format!("Assistant: {}", msg.content)),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_session_prompt(conversation: &str) -> String {
    format!(
        "Please provide a concise summary of the following conversation.\n\
         Focus on the main topics discussed, key questions asked, and important information shared.\n\
         Keep the summary under 200 words.\n\n\
         Conversation:\n{conversation}\n\n\
         Summary:"
    )
}

fn build_merge_prompt(previous: &str, latest: &str) -> String {
    format!(
        "Please combine the following two conversation summaries into a single concise summary.\n\
         The first covers earlier sessions, the second covers the most recent session.\n\
         Keep every fact about the user that is still relevant, drop repetition, and prefer \
         the most recent information when the two disagree.\n\
         Keep the summary under 200 words.\n\n\
         Earlier sessions:\n{previous}\n\n\
         Most recent session:\n{latest}\n\n\
         Combined summary:"
    )
}
