use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use endpoints::chat::{
    ChatCompletionObject, ChatCompletionRequest, ChatCompletionRequestMessage,
    ChatCompletionUserMessageContent,
};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::{
    config::GatewayConfig,
    dual_debug, dual_error, dual_info,
    memory::types::{ChatMessage, GatewayError, MessageRole},
};

/// A one-shot completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Overrides the gateway's default model.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Messages in, one assistant message out. Stateless per call.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<ChatMessage, GatewayError>;

    /// Default model used when a request does not name one.
    fn model(&self) -> &str;

    /// Send a trivial prompt and report whether the backend answered.
    async fn check_connection(&self) -> bool {
        let probe = CompletionRequest::new(vec![ChatMessage::user("Hello")]).with_max_tokens(8);
        match self.complete(probe).await {
            Ok(_) => true,
            Err(e) => {
                dual_error!("Completion gateway probe failed: {}", e);
                false
            }
        }
    }
}

/// Gateway for any OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    max_tokens: u32,
    timeout: Duration,
    cancel_token: CancellationToken,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig, cancel_token: CancellationToken) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            cancel_token,
        }
    }

    fn build_request(&self, request: &CompletionRequest) -> ChatCompletionRequest {
        let messages = request
            .messages
            .iter()
            .cloned()
            .map(ChatCompletionRequestMessage::from)
            .collect();

        ChatCompletionRequest {
            model: Some(request.model.clone().unwrap_or_else(|| self.model.clone())),
            messages,
            temperature: Some(self.temperature),
            max_completion_tokens: Some(request.max_tokens.unwrap_or(self.max_tokens) as i32),
            stream: Some(false),
            ..Default::default()
        }
    }

    async fn send(&self, chat_request: &ChatCompletionRequest) -> Result<String, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json");

        if let Some(api_key) = &self.api_key {
            let auth_info = if api_key.starts_with("Bearer ") {
                api_key.clone()
            } else {
                format!("Bearer {api_key}")
            };
            builder = builder.header(AUTHORIZATION, auth_info);
        }

        let response = builder
            .json(chat_request)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("Failed to forward request: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await.map_err(|e| {
            GatewayError::Transport(format!("Failed to get the full response as bytes: {e}"))
        })?;

        let chat_completion: ChatCompletionObject = serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::InvalidResponse(format!("Failed to parse the response: {e}")))?;

        chat_completion
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .filter(|content| !content.trim().is_empty())
            .map(|content| content.to_string())
            .ok_or_else(|| GatewayError::InvalidResponse("No response content".to_string()))
    }
}

#[async_trait]
impl CompletionGateway for HttpGateway {
    async fn complete(&self, request: CompletionRequest) -> Result<ChatMessage, GatewayError> {
        let chat_request = self.build_request(&request);
        let model = chat_request.model.clone().unwrap_or_default();

        dual_info!(
            "Sending {} messages to model {} at {}",
            request.messages.len(),
            model,
            self.base_url
        );

        let content = select! {
            result = tokio::time::timeout(self.timeout, self.send(&chat_request)) => {
                match result {
                    Ok(content) => content,
                    Err(_) => Err(GatewayError::Timeout(self.timeout)),
                }
            }
            _ = self.cancel_token.cancelled() => Err(GatewayError::Cancelled),
        };

        match content {
            Ok(content) => {
                dual_debug!("Completion received from model {}: {} chars", model, content.len());
                Ok(ChatMessage::assistant(content))
            }
            Err(e) => {
                dual_error!("Completion request to model {} failed: {}", model, e);
                Err(e)
            }
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}

impl From<ChatMessage> for ChatCompletionRequestMessage {
    fn from(msg: ChatMessage) -> Self {
        match msg.role {
            MessageRole::System => {
                ChatCompletionRequestMessage::new_system_message(&msg.content, None)
            }
            MessageRole::User => ChatCompletionRequestMessage::new_user_message(
                ChatCompletionUserMessageContent::Text(msg.content),
                None,
            ),
            MessageRole::Assistant => {
                ChatCompletionRequestMessage::new_assistant_message(Some(msg.content), None, None)
            }
        }
    }
}
